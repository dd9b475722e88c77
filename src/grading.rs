use std::collections::{BTreeSet, HashMap};

use uuid::Uuid;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::models::{Quiz, QuizAttempt, ResponseReq};
use crate::progress::{round2, AttemptLookup, CourseProgressTracker};

/// Per-question facts needed to grade: point value, choice semantics and the
/// correct-answer set.
#[derive(Debug, Clone)]
pub struct QuestionKey {
    pub question_id: Uuid,
    pub question_type: String,
    pub points: i32,
    pub correct: BTreeSet<Uuid>,
}

/// Exact-match semantics, no partial credit. Single-choice (and true/false)
/// questions additionally require exactly one selection.
pub fn response_is_correct(question: &QuestionKey, selected: &BTreeSet<Uuid>) -> bool {
    match question.question_type.as_str() {
        "single" | "true_false" => selected.len() == 1 && *selected == question.correct,
        "multiple" => !selected.is_empty() && *selected == question.correct,
        _ => false,
    }
}

/// Score a set of responses against the quiz key. A quiz worth zero points
/// scores 0 and never passes.
pub fn score_responses(
    questions: &[QuestionKey],
    responses: &HashMap<Uuid, BTreeSet<Uuid>>,
    passing_score: i32,
) -> (f64, bool) {
    let total_points: i64 = questions.iter().map(|q| q.points as i64).sum();
    if total_points <= 0 {
        return (0.0, false);
    }

    let earned: i64 = questions
        .iter()
        .filter(|q| {
            responses
                .get(&q.question_id)
                .map(|sel| response_is_correct(q, sel))
                .unwrap_or(false)
        })
        .map(|q| q.points as i64)
        .sum();

    let score = round2(earned as f64 / total_points as f64 * 100.0);
    (score, score >= passing_score as f64)
}

/// Scores submitted attempts. The grader never writes `course_progress`; a
/// pass is reported to the tracker, which owns the completion transition.
#[derive(Clone)]
pub struct QuizGrader<L = crate::progress::PgAttemptLookup> {
    db: Db,
    tracker: CourseProgressTracker<L>,
}

impl<L> QuizGrader<L>
where
    L: AttemptLookup + Send + Sync,
{
    pub fn new(db: Db, tracker: CourseProgressTracker<L>) -> Self {
        Self { db, tracker }
    }

    /// Open a new attempt, honoring the quiz attempt limit (0 = unlimited).
    pub async fn start_attempt(&self, quiz: &Quiz, user_id: &str) -> Result<QuizAttempt> {
        if quiz.max_attempts > 0 {
            let used: i64 = sqlx::query_scalar(
                "SELECT count(*) FROM quiz_attempts WHERE user_id = $1 AND quiz_id = $2",
            )
            .bind(user_id)
            .bind(quiz.id)
            .fetch_one(&self.db)
            .await?;
            if used >= quiz.max_attempts as i64 {
                return Err(Error::QuizLocked(format!(
                    "all {} attempts have been used",
                    quiz.max_attempts
                )));
            }
        }

        let attempt = sqlx::query_as::<_, QuizAttempt>(
            "INSERT INTO quiz_attempts (id, user_id, quiz_id) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(quiz.id)
        .fetch_one(&self.db)
        .await?;

        Ok(attempt)
    }

    /// Close an open attempt: persist its responses, stamp `completed_at`,
    /// then grade. Fails with `InvalidState` if the attempt was already
    /// submitted.
    pub async fn submit(&self, attempt_id: Uuid, responses: &[ResponseReq]) -> Result<QuizAttempt> {
        let mut tx = self.db.begin().await?;

        let attempt = sqlx::query_as::<_, QuizAttempt>(
            "SELECT * FROM quiz_attempts WHERE id = $1 FOR UPDATE",
        )
        .bind(attempt_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(Error::NotFound("attempt"))?;

        if attempt.completed_at.is_some() {
            drop(tx);
            // A crash between closing and grading leaves a submitted,
            // ungraded attempt behind; finish that grade instead of
            // refusing the retry.
            if attempt.score.is_none() {
                return self.score_attempt(attempt_id).await;
            }
            if attempt.passed {
                self.notify_pass(&attempt).await?;
            }
            return Err(Error::InvalidState("attempt already submitted".into()));
        }

        // Answer ids that actually belong to this quiz, per question.
        let valid: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            SELECT a.question_id, a.id
            FROM answers a
            JOIN questions q ON q.id = a.question_id
            WHERE q.quiz_id = $1
            "#,
        )
        .bind(attempt.quiz_id)
        .fetch_all(&mut *tx)
        .await?;
        let mut answers_by_question: HashMap<Uuid, BTreeSet<Uuid>> = HashMap::new();
        for (question_id, answer_id) in valid {
            answers_by_question.entry(question_id).or_default().insert(answer_id);
        }

        for response in responses {
            let Some(known) = answers_by_question.get(&response.question_id) else {
                continue;
            };
            let selected: Vec<Uuid> = response
                .selected_answer_ids
                .iter()
                .copied()
                .filter(|id| known.contains(id))
                .collect();
            if selected.is_empty() {
                continue; // unanswered question
            }
            sqlx::query(
                r#"
                INSERT INTO quiz_responses (id, attempt_id, question_id, selected_answer_ids)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (attempt_id, question_id) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(attempt_id)
            .bind(response.question_id)
            .bind(&selected)
            .execute(&mut *tx)
            .await?;
        }

        let res = sqlx::query(
            "UPDATE quiz_attempts SET completed_at = now() WHERE id = $1 AND completed_at IS NULL",
        )
        .bind(attempt_id)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            return Err(Error::InvalidState("attempt already submitted".into()));
        }

        tx.commit().await?;

        self.score_attempt(attempt_id).await
    }

    /// Grade a submitted attempt exactly once. `InvalidState` when the
    /// attempt has no `completed_at`; `AlreadyGraded` when a score is
    /// already on record. Closed attempts are never overwritten.
    pub async fn score_attempt(&self, attempt_id: Uuid) -> Result<QuizAttempt> {
        let mut tx = self.db.begin().await?;

        let attempt = sqlx::query_as::<_, QuizAttempt>(
            "SELECT * FROM quiz_attempts WHERE id = $1 FOR UPDATE",
        )
        .bind(attempt_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(Error::NotFound("attempt"))?;

        if attempt.completed_at.is_none() {
            return Err(Error::InvalidState(
                "cannot grade an attempt that has not been submitted".into(),
            ));
        }
        if attempt.score.is_some() {
            drop(tx);
            // The grade may have committed while the pass notification was
            // lost to a crash; re-drive it before rejecting the re-grade.
            if attempt.passed {
                self.notify_pass(&attempt).await?;
            }
            return Err(Error::AlreadyGraded);
        }

        let (passing_score, course_id): (i32, Uuid) =
            sqlx::query_as("SELECT passing_score, course_id FROM quizzes WHERE id = $1")
                .bind(attempt.quiz_id)
                .fetch_one(&mut *tx)
                .await?;

        let questions = self.load_question_keys(&mut tx, attempt.quiz_id).await?;

        let stored: Vec<(Uuid, Vec<Uuid>)> = sqlx::query_as(
            "SELECT question_id, selected_answer_ids FROM quiz_responses WHERE attempt_id = $1",
        )
        .bind(attempt_id)
        .fetch_all(&mut *tx)
        .await?;
        let responses: HashMap<Uuid, BTreeSet<Uuid>> = stored
            .into_iter()
            .map(|(question_id, selected)| (question_id, selected.into_iter().collect()))
            .collect();

        let (score, passed) = score_responses(&questions, &responses, passing_score);

        let res = sqlx::query(
            "UPDATE quiz_attempts SET score = $2, passed = $3 WHERE id = $1 AND score IS NULL",
        )
        .bind(attempt_id)
        .bind(score)
        .bind(passed)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            return Err(Error::AlreadyGraded);
        }

        tx.commit().await?;
        tracing::info!(%attempt_id, score, passed, "attempt graded");

        if passed {
            self.tracker
                .mark_quiz_passed(&attempt.user_id, course_id, attempt_id)
                .await?;
        }

        let graded = sqlx::query_as::<_, QuizAttempt>("SELECT * FROM quiz_attempts WHERE id = $1")
            .bind(attempt_id)
            .fetch_one(&self.db)
            .await?;
        Ok(graded)
    }

    /// Report a graded pass to the tracker. Idempotent: the tracker
    /// re-verifies the attempt and the completion transition is guarded.
    async fn notify_pass(&self, attempt: &QuizAttempt) -> Result<()> {
        let course_id: Uuid = sqlx::query_scalar("SELECT course_id FROM quizzes WHERE id = $1")
            .bind(attempt.quiz_id)
            .fetch_one(&self.db)
            .await?;
        self.tracker
            .mark_quiz_passed(&attempt.user_id, course_id, attempt.id)
            .await?;
        Ok(())
    }

    async fn load_question_keys(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        quiz_id: Uuid,
    ) -> Result<Vec<QuestionKey>> {
        let questions: Vec<(Uuid, String, i32)> = sqlx::query_as(
            "SELECT id, question_type, points FROM questions WHERE quiz_id = $1",
        )
        .bind(quiz_id)
        .fetch_all(&mut **tx)
        .await?;

        let correct: Vec<(Uuid, Uuid)> = sqlx::query_as(
            r#"
            SELECT a.question_id, a.id
            FROM answers a
            JOIN questions q ON q.id = a.question_id
            WHERE q.quiz_id = $1 AND a.is_correct
            "#,
        )
        .bind(quiz_id)
        .fetch_all(&mut **tx)
        .await?;
        let mut correct_by_question: HashMap<Uuid, BTreeSet<Uuid>> = HashMap::new();
        for (question_id, answer_id) in correct {
            correct_by_question.entry(question_id).or_default().insert(answer_id);
        }

        Ok(questions
            .into_iter()
            .map(|(question_id, question_type, points)| QuestionKey {
                question_id,
                question_type,
                points,
                correct: correct_by_question.remove(&question_id).unwrap_or_default(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(points: i32, correct: Uuid) -> QuestionKey {
        QuestionKey {
            question_id: Uuid::new_v4(),
            question_type: "single".into(),
            points,
            correct: BTreeSet::from([correct]),
        }
    }

    fn answered(
        responses: &mut HashMap<Uuid, BTreeSet<Uuid>>,
        question: &QuestionKey,
        answers: impl IntoIterator<Item = Uuid>,
    ) {
        responses.insert(question.question_id, answers.into_iter().collect());
    }

    #[test]
    fn three_of_four_single_point_questions_score_75() {
        let keys: Vec<QuestionKey> = (0..4).map(|_| single(1, Uuid::new_v4())).collect();
        let mut responses = HashMap::new();
        for q in &keys[..3] {
            answered(&mut responses, q, q.correct.iter().copied());
        }
        answered(&mut responses, &keys[3], [Uuid::new_v4()]);

        let (score, passed) = score_responses(&keys, &responses, 70);
        assert_eq!(score, 75.0);
        assert!(passed);
    }

    #[test]
    fn zero_point_quiz_scores_zero_and_never_passes() {
        let keys = vec![single(0, Uuid::new_v4())];
        let mut responses = HashMap::new();
        answered(&mut responses, &keys[0], keys[0].correct.iter().copied());

        let (score, passed) = score_responses(&keys, &responses, 0);
        assert_eq!(score, 0.0);
        assert!(!passed);

        let (score, passed) = score_responses(&[], &HashMap::new(), 70);
        assert_eq!(score, 0.0);
        assert!(!passed);
    }

    #[test]
    fn score_equal_to_passing_threshold_passes() {
        let keys: Vec<QuestionKey> = (0..10).map(|_| single(1, Uuid::new_v4())).collect();
        let mut responses = HashMap::new();
        for q in &keys[..7] {
            answered(&mut responses, q, q.correct.iter().copied());
        }

        let (score, passed) = score_responses(&keys, &responses, 70);
        assert_eq!(score, 70.0);
        assert!(passed);
    }

    #[test]
    fn unanswered_questions_earn_nothing() {
        let keys: Vec<QuestionKey> = (0..2).map(|_| single(1, Uuid::new_v4())).collect();
        let (score, passed) = score_responses(&keys, &HashMap::new(), 50);
        assert_eq!(score, 0.0);
        assert!(!passed);
    }

    #[test]
    fn multiple_choice_requires_exact_answer_set() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let q = QuestionKey {
            question_id: Uuid::new_v4(),
            question_type: "multiple".into(),
            points: 2,
            correct: BTreeSet::from([a, b]),
        };

        assert!(response_is_correct(&q, &BTreeSet::from([a, b])));
        // subset and superset are both wrong: no partial credit
        assert!(!response_is_correct(&q, &BTreeSet::from([a])));
        assert!(!response_is_correct(&q, &BTreeSet::from([a, b, c])));
        assert!(!response_is_correct(&q, &BTreeSet::new()));
    }

    #[test]
    fn single_choice_rejects_multiple_selections() {
        let q = single(1, Uuid::new_v4());
        let correct = *q.correct.iter().next().unwrap();
        assert!(response_is_correct(&q, &BTreeSet::from([correct])));
        assert!(!response_is_correct(&q, &BTreeSet::from([correct, Uuid::new_v4()])));
    }

    #[test]
    fn fractional_scores_round_to_two_decimals() {
        let keys: Vec<QuestionKey> = (0..3).map(|_| single(1, Uuid::new_v4())).collect();
        let mut responses = HashMap::new();
        answered(&mut responses, &keys[0], keys[0].correct.iter().copied());

        let (score, passed) = score_responses(&keys, &responses, 70);
        assert_eq!(score, 33.33);
        assert!(!passed);
    }
}
