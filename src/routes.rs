use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use uuid::Uuid;

use crate::certificate::CertificateIssuer;
use crate::db::Db;
use crate::error::{Error, Result};
use crate::grading::QuizGrader;
use crate::models::*;
use crate::progress::CourseProgressTracker;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub tracker: CourseProgressTracker,
    pub grader: QuizGrader,
    pub issuer: CertificateIssuer,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // catalog ingest + lookup
        .route("/api/courses", post(create_course))
        .route("/api/courses/:course_id", get(get_course))
        // progress tracking
        .route("/api/videos/:video_id/watch", post(record_watch))
        .route("/api/courses/:course_id/progress/:user_id", get(get_progress))
        .route(
            "/api/courses/:course_id/progress/:user_id/reset-quiz",
            post(reset_quiz),
        )
        // quiz attempts
        .route("/api/quizzes/:quiz_id", get(get_quiz))
        .route("/api/quizzes/:quiz_id/attempts", post(create_attempt))
        .route("/api/attempts/:attempt_id", get(get_attempt))
        .route("/api/attempts/:attempt_id/submit", post(submit_attempt))
        // certificates
        .route("/api/certificates/:certificate_id", get(get_certificate))
        .with_state(state)
}

async fn create_course(
    State(state): State<AppState>,
    Json(req): Json<CreateCourseReq>,
) -> Result<Json<Course>> {
    if req.title.trim().is_empty() || req.slug.trim().is_empty() {
        return Err(Error::BadRequest("title and slug are required".into()));
    }

    let mut tx = state.db.begin().await?;

    let course = sqlx::query_as::<_, Course>(
        "INSERT INTO courses (id, title, slug) VALUES ($1, $2, $3) RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(req.title.trim())
    .bind(req.slug.trim())
    .fetch_one(&mut *tx)
    .await?;

    for day in &req.days {
        let day_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO curriculum_days (id, course_id, day_number, title) VALUES ($1, $2, $3, $4)",
        )
        .bind(day_id)
        .bind(course.id)
        .bind(day.day_number)
        .bind(&day.title)
        .execute(&mut *tx)
        .await?;

        for (position, video) in day.videos.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO videos (id, curriculum_day_id, title, duration_seconds, position)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(day_id)
            .bind(&video.title)
            .bind(video.duration_seconds.max(0))
            .bind(position as i32)
            .execute(&mut *tx)
            .await?;
        }
    }

    if let Some(quiz) = &req.quiz {
        let quiz_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO quizzes (id, course_id, title, passing_score, max_attempts)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(quiz_id)
        .bind(course.id)
        .bind(&quiz.title)
        .bind(quiz.passing_score)
        .bind(quiz.max_attempts)
        .execute(&mut *tx)
        .await?;

        for (position, question) in quiz.questions.iter().enumerate() {
            let question_id = Uuid::new_v4();
            sqlx::query(
                r#"
                INSERT INTO questions (id, quiz_id, question_text, question_type, points, position)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(question_id)
            .bind(quiz_id)
            .bind(&question.question_text)
            .bind(&question.question_type)
            .bind(question.points)
            .bind(position as i32)
            .execute(&mut *tx)
            .await?;

            for (position, answer) in question.answers.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO answers (id, question_id, answer_text, is_correct, position)
                    VALUES ($1, $2, $3, $4, $5)
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(question_id)
                .bind(&answer.answer_text)
                .bind(answer.is_correct)
                .bind(position as i32)
                .execute(&mut *tx)
                .await?;
            }
        }
    }

    tx.commit().await?;
    Ok(Json(course))
}

async fn get_course(
    State(state): State<AppState>,
    Path(course_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    let course = sqlx::query_as::<_, Course>("SELECT * FROM courses WHERE id = $1")
        .bind(course_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(Error::NotFound("course"))?;

    let days = sqlx::query_as::<_, CurriculumDay>(
        "SELECT * FROM curriculum_days WHERE course_id = $1 ORDER BY day_number",
    )
    .bind(course_id)
    .fetch_all(&state.db)
    .await?;

    let videos = sqlx::query_as::<_, Video>(
        r#"
        SELECT v.* FROM videos v
        JOIN curriculum_days d ON d.id = v.curriculum_day_id
        WHERE d.course_id = $1
        ORDER BY d.day_number, v.position
        "#,
    )
    .bind(course_id)
    .fetch_all(&state.db)
    .await?;

    let quiz = sqlx::query_as::<_, Quiz>("SELECT * FROM quizzes WHERE course_id = $1")
        .bind(course_id)
        .fetch_optional(&state.db)
        .await?;

    let days: Vec<serde_json::Value> = days
        .into_iter()
        .map(|day| {
            let day_videos: Vec<&Video> = videos
                .iter()
                .filter(|v| v.curriculum_day_id == day.id)
                .collect();
            json!({ "day": day, "videos": day_videos })
        })
        .collect();

    Ok(Json(json!({ "course": course, "days": days, "quiz": quiz })))
}

async fn record_watch(
    State(state): State<AppState>,
    Path(video_id): Path<Uuid>,
    Json(req): Json<WatchReq>,
) -> Result<Json<serde_json::Value>> {
    let course_id: Option<Uuid> = sqlx::query_scalar(
        r#"
        SELECT d.course_id FROM videos v
        JOIN curriculum_days d ON d.id = v.curriculum_day_id
        WHERE v.id = $1
        "#,
    )
    .bind(video_id)
    .fetch_optional(&state.db)
    .await?;
    let course_id = course_id.ok_or(Error::NotFound("video"))?;

    let record = state
        .tracker
        .record_video_watch(&req.user_id, video_id, req.watched_seconds)
        .await?;
    let progress_percentage = state.tracker.update_progress(&req.user_id, course_id).await?;

    // A watch event can be the last missing piece when the quiz is already
    // passed, so re-run the completion gate here.
    state.tracker.check_completion(&req.user_id, course_id).await?;

    let requirements = state
        .tracker
        .completion_requirements(&req.user_id, course_id)
        .await?;
    let certificate = if requirements.is_completed {
        state.issuer.find(&req.user_id, course_id).await?
    } else {
        None
    };

    Ok(Json(json!({
        "record": record,
        "progress_percentage": progress_percentage,
        "all_videos_completed": requirements.completed_videos == requirements.total_videos
            && requirements.total_videos > 0,
        "course_completed": requirements.is_completed,
        "certificate_id": certificate.map(|c| c.certificate_id),
    })))
}

async fn get_progress(
    State(state): State<AppState>,
    Path((course_id, user_id)): Path<(Uuid, String)>,
) -> Result<Json<CompletionRequirements>> {
    sqlx::query_scalar::<_, Uuid>("SELECT id FROM courses WHERE id = $1")
        .bind(course_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(Error::NotFound("course"))?;

    let requirements = state
        .tracker
        .completion_requirements(&user_id, course_id)
        .await?;
    Ok(Json(requirements))
}

async fn reset_quiz(
    State(state): State<AppState>,
    Path((course_id, user_id)): Path<(Uuid, String)>,
) -> Result<Json<serde_json::Value>> {
    state.tracker.reset_quiz_status(&user_id, course_id).await?;
    Ok(Json(json!({ "ok": true })))
}

/// Quiz with its questions and answer options, for rendering the quiz form.
/// Answer keys (`is_correct`) are stripped from the reply.
async fn get_quiz(
    State(state): State<AppState>,
    Path(quiz_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>> {
    let quiz = sqlx::query_as::<_, Quiz>("SELECT * FROM quizzes WHERE id = $1")
        .bind(quiz_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(Error::NotFound("quiz"))?;

    let questions = sqlx::query_as::<_, Question>(
        "SELECT * FROM questions WHERE quiz_id = $1 ORDER BY position, id",
    )
    .bind(quiz_id)
    .fetch_all(&state.db)
    .await?;

    let answers = sqlx::query_as::<_, Answer>(
        r#"
        SELECT a.* FROM answers a
        JOIN questions q ON q.id = a.question_id
        WHERE q.quiz_id = $1
        ORDER BY a.position, a.id
        "#,
    )
    .bind(quiz_id)
    .fetch_all(&state.db)
    .await?;

    let questions: Vec<serde_json::Value> = questions
        .into_iter()
        .map(|q| {
            let options: Vec<serde_json::Value> = answers
                .iter()
                .filter(|a| a.question_id == q.id)
                .map(|a| json!({ "id": a.id, "answer_text": a.answer_text, "position": a.position }))
                .collect();
            json!({ "question": q, "answers": options })
        })
        .collect();

    Ok(Json(json!({ "quiz": quiz, "questions": questions })))
}

async fn create_attempt(
    State(state): State<AppState>,
    Path(quiz_id): Path<Uuid>,
    Json(req): Json<CreateAttemptReq>,
) -> Result<Json<QuizAttempt>> {
    let quiz = sqlx::query_as::<_, Quiz>("SELECT * FROM quizzes WHERE id = $1")
        .bind(quiz_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(Error::NotFound("quiz"))?;

    // The quiz unlocks only once every video is watched to completion.
    let progress = state
        .tracker
        .update_progress(&req.user_id, quiz.course_id)
        .await?;
    if progress < 100.0 {
        return Err(Error::QuizLocked(
            "all course videos must be completed before taking the quiz".into(),
        ));
    }

    let attempt = state.grader.start_attempt(&quiz, &req.user_id).await?;
    Ok(Json(attempt))
}

async fn get_attempt(
    State(state): State<AppState>,
    Path(attempt_id): Path<Uuid>,
) -> Result<Json<QuizAttempt>> {
    let attempt = sqlx::query_as::<_, QuizAttempt>("SELECT * FROM quiz_attempts WHERE id = $1")
        .bind(attempt_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or(Error::NotFound("attempt"))?;
    Ok(Json(attempt))
}

async fn submit_attempt(
    State(state): State<AppState>,
    Path(attempt_id): Path<Uuid>,
    Json(req): Json<SubmitAttemptReq>,
) -> Result<Json<serde_json::Value>> {
    let attempt = state.grader.submit(attempt_id, &req.responses).await?;

    let certificate = if attempt.passed {
        let course_id: Uuid = sqlx::query_scalar("SELECT course_id FROM quizzes WHERE id = $1")
            .bind(attempt.quiz_id)
            .fetch_one(&state.db)
            .await?;
        state.issuer.find(&attempt.user_id, course_id).await?
    } else {
        None
    };

    Ok(Json(json!({ "attempt": attempt, "certificate": certificate })))
}

async fn get_certificate(
    State(state): State<AppState>,
    Path(certificate_id): Path<String>,
) -> Result<Json<Certificate>> {
    let certificate = state
        .issuer
        .find_by_token(&certificate_id)
        .await?
        .ok_or(Error::NotFound("certificate"))?;
    Ok(Json(certificate))
}
