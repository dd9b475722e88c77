use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::certificate::CertificateIssuer;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::models::{CompletionRequirements, CourseProgress, VideoWatchRecord};

/// Watch percentage at which a video counts as completed.
pub const COMPLETION_THRESHOLD: i32 = 95;

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Percentage of a video watched, clamped to 0..=100. Zero-length videos
/// report 0 rather than dividing by zero.
pub fn watch_percentage(watched_seconds: i32, duration_seconds: i32) -> i32 {
    if duration_seconds <= 0 || watched_seconds <= 0 {
        return 0;
    }
    let pct = (watched_seconds as f64 / duration_seconds as f64) * 100.0;
    (pct as i32).clamp(0, 100)
}

/// Course progress as a percentage of completed videos.
pub fn course_percentage(completed: i64, total: i64) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    round2(completed as f64 / total as f64 * 100.0)
}

/// The slice of a quiz attempt the tracker is allowed to see.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct AttemptSummary {
    pub id: Uuid,
    pub user_id: String,
    pub course_id: Uuid,
    pub score: Option<f64>,
    pub passed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A passing attempt only counts toward completion when it was actually
/// submitted, actually passed, and belongs to the same user and course.
pub fn verify_passing_attempt(attempt: &AttemptSummary, user_id: &str, course_id: Uuid) -> bool {
    attempt.passed
        && attempt.completed_at.is_some()
        && attempt.user_id == user_id
        && attempt.course_id == course_id
}

/// Narrow read-only capability the tracker uses to verify attempts, so it
/// never depends on the full quiz model.
pub trait AttemptLookup {
    fn find_attempt(
        &self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<AttemptSummary>>> + Send;
}

#[derive(Clone)]
pub struct PgAttemptLookup {
    db: Db,
}

impl PgAttemptLookup {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

impl AttemptLookup for PgAttemptLookup {
    async fn find_attempt(&self, id: Uuid) -> Result<Option<AttemptSummary>> {
        let summary = sqlx::query_as::<_, AttemptSummary>(
            r#"
            SELECT a.id, a.user_id, q.course_id, a.score, a.passed, a.completed_at
            FROM quiz_attempts a
            JOIN quizzes q ON q.id = a.quiz_id
            WHERE a.id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(summary)
    }
}

/// Owns all reads and writes of `course_progress`.
#[derive(Clone)]
pub struct CourseProgressTracker<L = PgAttemptLookup> {
    db: Db,
    attempts: L,
    issuer: CertificateIssuer,
}

impl CourseProgressTracker<PgAttemptLookup> {
    pub fn new(db: Db, issuer: CertificateIssuer) -> Self {
        let attempts = PgAttemptLookup::new(db.clone());
        Self { db, attempts, issuer }
    }
}

impl<L> CourseProgressTracker<L>
where
    L: AttemptLookup + Send + Sync,
{
    /// Upsert a watch record for (user, video). The stored percentage never
    /// decreases and the completed flag never reverts, so stale or
    /// out-of-order reports converge instead of regressing.
    pub async fn record_video_watch(
        &self,
        user_id: &str,
        video_id: Uuid,
        watched_seconds: i32,
    ) -> Result<VideoWatchRecord> {
        let duration: Option<i32> =
            sqlx::query_scalar("SELECT duration_seconds FROM videos WHERE id = $1")
                .bind(video_id)
                .fetch_optional(&self.db)
                .await?;
        let duration = duration.ok_or(Error::NotFound("video"))?;

        let watched_seconds = watched_seconds.max(0);
        let pct = watch_percentage(watched_seconds, duration);
        let completed = pct >= COMPLETION_THRESHOLD;

        let record = sqlx::query_as::<_, VideoWatchRecord>(
            r#"
            INSERT INTO video_watch_records
                (id, user_id, video_id, watched_seconds, watched_percentage, completed)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (user_id, video_id) DO UPDATE SET
                watched_seconds = GREATEST(video_watch_records.watched_seconds, EXCLUDED.watched_seconds),
                watched_percentage = GREATEST(video_watch_records.watched_percentage, EXCLUDED.watched_percentage),
                completed = video_watch_records.completed OR EXCLUDED.completed,
                last_watched = now()
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(video_id)
        .bind(watched_seconds)
        .bind(pct)
        .bind(completed)
        .fetch_one(&self.db)
        .await?;

        Ok(record)
    }

    /// Recompute course progress from the watch records. Always derived from
    /// the source of truth, never incremented, so it cannot drift.
    pub async fn update_progress(&self, user_id: &str, course_id: Uuid) -> Result<f64> {
        let (total, done) = self.video_counts(&self.db, user_id, course_id).await?;
        let pct = course_percentage(done, total);

        sqlx::query(
            r#"
            INSERT INTO course_progress (user_id, course_id, progress_percentage)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, course_id) DO UPDATE SET
                progress_percentage = EXCLUDED.progress_percentage,
                updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .bind(pct)
        .execute(&self.db)
        .await?;

        Ok(pct)
    }

    /// Record a passing attempt on the progress row. Returns false (and
    /// writes nothing) when the attempt is missing, not passed, not
    /// submitted, or belongs to a different user or course.
    pub async fn mark_quiz_passed(
        &self,
        user_id: &str,
        course_id: Uuid,
        attempt_id: Uuid,
    ) -> Result<bool> {
        let Some(summary) = self.attempts.find_attempt(attempt_id).await? else {
            return Ok(false);
        };
        if !verify_passing_attempt(&summary, user_id, course_id) {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO course_progress (user_id, course_id, quiz_passed, last_passing_attempt_id)
            VALUES ($1, $2, TRUE, $3)
            ON CONFLICT (user_id, course_id) DO UPDATE SET
                quiz_passed = TRUE,
                last_passing_attempt_id = EXCLUDED.last_passing_attempt_id,
                updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .bind(attempt_id)
        .execute(&self.db)
        .await?;

        self.check_completion(user_id, course_id).await?;
        Ok(true)
    }

    /// The single authorization gate for certificate creation. Performs the
    /// completion transition at most once per (user, course): the progress
    /// row is locked and the transition update re-checks every condition, so
    /// concurrent triggers collapse to one effective transition.
    ///
    /// Every read, the transition and the certificate insert run on the one
    /// transaction connection, so the whole step commits or rolls back as a
    /// unit and no second pool connection is held under the row lock.
    pub async fn check_completion(&self, user_id: &str, course_id: Uuid) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        let progress = sqlx::query_as::<_, CourseProgress>(
            "SELECT * FROM course_progress WHERE user_id = $1 AND course_id = $2 FOR UPDATE",
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(progress) = progress else {
            return Ok(false);
        };
        if progress.is_completed {
            return Ok(false);
        }
        let Some(attempt_id) = progress.last_passing_attempt_id else {
            return Ok(false);
        };
        if !progress.quiz_passed {
            return Ok(false);
        }

        let (total, done) = self.video_counts(&mut *tx, user_id, course_id).await?;
        if total == 0 || done != total {
            return Ok(false);
        }

        // Re-verify the recorded attempt at the write boundary, inside the
        // same transaction as the transition it authorizes.
        let verified: Option<Option<f64>> = sqlx::query_scalar(
            r#"
            SELECT a.score
            FROM quiz_attempts a
            JOIN quizzes q ON q.id = a.quiz_id
            WHERE a.id = $1 AND a.user_id = $2 AND q.course_id = $3
              AND a.passed AND a.completed_at IS NOT NULL
            "#,
        )
        .bind(attempt_id)
        .bind(user_id)
        .bind(course_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(quiz_score) = verified else {
            return Ok(false);
        };

        let res = sqlx::query(
            r#"
            UPDATE course_progress
            SET is_completed = TRUE, completed_at = now(), updated_at = now()
            WHERE user_id = $1 AND course_id = $2
              AND is_completed = FALSE
              AND quiz_passed = TRUE
              AND last_passing_attempt_id IS NOT NULL
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            return Ok(false);
        }

        // Same transaction: if issuance fails the transition rolls back and
        // a later check re-runs the whole gate.
        self.issuer
            .issue_if_eligible(&mut tx, user_id, course_id, quiz_score)
            .await?;

        tx.commit().await?;
        tracing::info!(user_id, %course_id, "course completed, certificate issued");
        Ok(true)
    }

    /// Administrative retake reset. Clears the quiz and completion flags but
    /// leaves any already-issued certificate in place (see DESIGN.md).
    pub async fn reset_quiz_status(&self, user_id: &str, course_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE course_progress
            SET quiz_passed = FALSE,
                last_passing_attempt_id = NULL,
                is_completed = FALSE,
                completed_at = NULL,
                updated_at = now()
            WHERE user_id = $1 AND course_id = $2
            "#,
        )
        .bind(user_id)
        .bind(course_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn completion_requirements(
        &self,
        user_id: &str,
        course_id: Uuid,
    ) -> Result<CompletionRequirements> {
        let (total, done) = self.video_counts(&self.db, user_id, course_id).await?;
        let progress = self.find_progress(user_id, course_id).await?;

        Ok(CompletionRequirements {
            total_videos: total,
            completed_videos: done,
            videos_percentage: course_percentage(done, total),
            quiz_passed: progress.as_ref().map(|p| p.quiz_passed).unwrap_or(false),
            is_completed: progress.as_ref().map(|p| p.is_completed).unwrap_or(false),
            completed_at: progress.and_then(|p| p.completed_at),
        })
    }

    pub async fn find_progress(
        &self,
        user_id: &str,
        course_id: Uuid,
    ) -> Result<Option<CourseProgress>> {
        let progress = sqlx::query_as::<_, CourseProgress>(
            "SELECT * FROM course_progress WHERE user_id = $1 AND course_id = $2",
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(progress)
    }

    async fn video_counts<'e, E>(
        &self,
        exec: E,
        user_id: &str,
        course_id: Uuid,
    ) -> Result<(i64, i64)>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let counts = sqlx::query_as::<_, (i64, i64)>(
            r#"
            SELECT count(*), count(*) FILTER (WHERE w.completed)
            FROM videos v
            JOIN curriculum_days d ON d.id = v.curriculum_day_id
            LEFT JOIN video_watch_records w ON w.video_id = v.id AND w.user_id = $2
            WHERE d.course_id = $1
            "#,
        )
        .bind(course_id)
        .bind(user_id)
        .fetch_one(exec)
        .await?;
        Ok(counts)
    }
}
