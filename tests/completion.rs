//! End-to-end checks against a live Postgres database, one fresh database
//! per test via `#[sqlx::test]`.

use sqlx::PgPool;
use uuid::Uuid;

use lms_completion_runtime::certificate::CertificateIssuer;
use lms_completion_runtime::error::Error;
use lms_completion_runtime::grading::QuizGrader;
use lms_completion_runtime::models::{Quiz, ResponseReq};
use lms_completion_runtime::progress::CourseProgressTracker;

const USER: &str = "learner-1";

struct Fixture {
    course_id: Uuid,
    video_id: Uuid,
    quiz: Quiz,
    question_id: Uuid,
    right: Uuid,
    wrong: Uuid,
}

/// One course with a single 600-second video and a one-question quiz
/// (passing score 70, single choice, 1 point).
async fn seed(pool: &PgPool) -> Fixture {
    let course_id = Uuid::new_v4();
    sqlx::query("INSERT INTO courses (id, title, slug) VALUES ($1, 'Rust Basics', $2)")
        .bind(course_id)
        .bind(format!("rust-basics-{}", Uuid::new_v4()))
        .execute(pool)
        .await
        .unwrap();

    let day_id = Uuid::new_v4();
    sqlx::query("INSERT INTO curriculum_days (id, course_id, day_number, title) VALUES ($1, $2, 1, 'Day 1')")
        .bind(day_id)
        .bind(course_id)
        .execute(pool)
        .await
        .unwrap();

    let video_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO videos (id, curriculum_day_id, title, duration_seconds, position) VALUES ($1, $2, 'Ownership', 600, 0)",
    )
    .bind(video_id)
    .bind(day_id)
    .execute(pool)
    .await
    .unwrap();

    let quiz_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO quizzes (id, course_id, title, passing_score, max_attempts) VALUES ($1, $2, 'Final Quiz', 70, 3)",
    )
    .bind(quiz_id)
    .bind(course_id)
    .execute(pool)
    .await
    .unwrap();

    let question_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO questions (id, quiz_id, question_text, question_type, points, position) VALUES ($1, $2, 'What moves?', 'single', 1, 0)",
    )
    .bind(question_id)
    .bind(quiz_id)
    .execute(pool)
    .await
    .unwrap();

    let right = Uuid::new_v4();
    let wrong = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO answers (id, question_id, answer_text, is_correct, position) VALUES ($1, $3, 'Values', TRUE, 0), ($2, $3, 'References', FALSE, 1)",
    )
    .bind(right)
    .bind(wrong)
    .bind(question_id)
    .execute(pool)
    .await
    .unwrap();

    let quiz: Quiz = sqlx::query_as("SELECT * FROM quizzes WHERE id = $1")
        .bind(quiz_id)
        .fetch_one(pool)
        .await
        .unwrap();

    Fixture { course_id, video_id, quiz, question_id, right, wrong }
}

fn services(pool: &PgPool) -> (CourseProgressTracker, QuizGrader) {
    let issuer = CertificateIssuer::new(pool.clone());
    let tracker = CourseProgressTracker::new(pool.clone(), issuer);
    let grader = QuizGrader::new(pool.clone(), tracker.clone());
    (tracker, grader)
}

async fn certificate_count(pool: &PgPool, course_id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT count(*) FROM certificates WHERE user_id = $1 AND course_id = $2")
        .bind(USER)
        .bind(course_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[sqlx::test(migrations = "./migrations")]
async fn completion_fires_once_and_issues_one_certificate(pool: PgPool) {
    let f = seed(&pool).await;
    let (tracker, grader) = services(&pool);

    let record = tracker.record_video_watch(USER, f.video_id, 600).await.unwrap();
    assert!(record.completed);
    assert_eq!(tracker.update_progress(USER, f.course_id).await.unwrap(), 100.0);

    let attempt = grader.start_attempt(&f.quiz, USER).await.unwrap();
    let graded = grader
        .submit(
            attempt.id,
            &[ResponseReq { question_id: f.question_id, selected_answer_ids: vec![f.right] }],
        )
        .await
        .unwrap();
    assert_eq!(graded.score, Some(100.0));
    assert!(graded.passed);

    let progress = tracker.find_progress(USER, f.course_id).await.unwrap().unwrap();
    assert!(progress.is_completed);
    let completed_at = progress.completed_at.unwrap();
    assert_eq!(certificate_count(&pool, f.course_id).await, 1);

    // a second pass through the gate is a no-op
    assert!(!tracker.check_completion(USER, f.course_id).await.unwrap());
    let progress = tracker.find_progress(USER, f.course_id).await.unwrap().unwrap();
    assert_eq!(progress.completed_at, Some(completed_at));
    assert_eq!(certificate_count(&pool, f.course_id).await, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn failed_attempt_does_not_unlock_completion(pool: PgPool) {
    let f = seed(&pool).await;
    let (tracker, grader) = services(&pool);

    tracker.record_video_watch(USER, f.video_id, 600).await.unwrap();
    tracker.update_progress(USER, f.course_id).await.unwrap();

    let attempt = grader.start_attempt(&f.quiz, USER).await.unwrap();
    let graded = grader
        .submit(
            attempt.id,
            &[ResponseReq { question_id: f.question_id, selected_answer_ids: vec![f.wrong] }],
        )
        .await
        .unwrap();
    assert_eq!(graded.score, Some(0.0));
    assert!(!graded.passed);

    let progress = tracker.find_progress(USER, f.course_id).await.unwrap().unwrap();
    assert!(!progress.quiz_passed);
    assert!(!progress.is_completed);
    assert_eq!(certificate_count(&pool, f.course_id).await, 0);
}

#[sqlx::test(migrations = "./migrations")]
async fn second_grading_call_is_rejected(pool: PgPool) {
    let f = seed(&pool).await;
    let (tracker, grader) = services(&pool);

    tracker.record_video_watch(USER, f.video_id, 600).await.unwrap();
    tracker.update_progress(USER, f.course_id).await.unwrap();

    let attempt = grader.start_attempt(&f.quiz, USER).await.unwrap();
    grader
        .submit(
            attempt.id,
            &[ResponseReq { question_id: f.question_id, selected_answer_ids: vec![f.right] }],
        )
        .await
        .unwrap();

    let err = grader.score_attempt(attempt.id).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyGraded));

    let score: Option<f64> = sqlx::query_scalar("SELECT score FROM quiz_attempts WHERE id = $1")
        .bind(attempt.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(score, Some(100.0));
    assert_eq!(certificate_count(&pool, f.course_id).await, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn concurrent_issue_yields_single_certificate(pool: PgPool) {
    let f = seed(&pool).await;
    let issuer = CertificateIssuer::new(pool.clone());

    let mut c1 = pool.acquire().await.unwrap();
    let mut c2 = pool.acquire().await.unwrap();
    let (a, b) = tokio::join!(
        issuer.issue_if_eligible(&mut c1, USER, f.course_id, Some(92.5)),
        issuer.issue_if_eligible(&mut c2, USER, f.course_id, Some(92.5)),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a.certificate_id, b.certificate_id);
    assert_eq!(certificate_count(&pool, f.course_id).await, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn pass_on_another_course_does_not_count(pool: PgPool) {
    let f = seed(&pool).await;
    let other = seed(&pool).await;
    let (tracker, _grader) = services(&pool);

    // graded passing attempt, but on the other course's quiz
    let attempt_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO quiz_attempts (id, user_id, quiz_id, completed_at, score, passed) VALUES ($1, $2, $3, now(), 100, TRUE)",
    )
    .bind(attempt_id)
    .bind(USER)
    .bind(other.quiz.id)
    .execute(&pool)
    .await
    .unwrap();

    assert!(!tracker.mark_quiz_passed(USER, f.course_id, attempt_id).await.unwrap());
    let progress = tracker.find_progress(USER, f.course_id).await.unwrap();
    assert!(progress.map(|p| !p.quiz_passed).unwrap_or(true));
}

#[sqlx::test(migrations = "./migrations")]
async fn watch_records_never_regress(pool: PgPool) {
    let f = seed(&pool).await;
    let (tracker, _grader) = services(&pool);

    let first = tracker.record_video_watch(USER, f.video_id, 600).await.unwrap();
    assert_eq!(first.watched_percentage, 100);
    assert!(first.completed);

    // a stale report must not roll anything back
    let second = tracker.record_video_watch(USER, f.video_id, 60).await.unwrap();
    assert_eq!(second.watched_seconds, 600);
    assert_eq!(second.watched_percentage, 100);
    assert!(second.completed);
}

#[sqlx::test(migrations = "./migrations")]
async fn regraded_pass_still_reaches_the_tracker(pool: PgPool) {
    let f = seed(&pool).await;
    let (tracker, grader) = services(&pool);

    tracker.record_video_watch(USER, f.video_id, 600).await.unwrap();
    tracker.update_progress(USER, f.course_id).await.unwrap();

    // graded passing attempt whose pass never made it to the progress row
    let attempt_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO quiz_attempts (id, user_id, quiz_id, completed_at, score, passed) VALUES ($1, $2, $3, now(), 100, TRUE)",
    )
    .bind(attempt_id)
    .bind(USER)
    .bind(f.quiz.id)
    .execute(&pool)
    .await
    .unwrap();

    let err = grader.score_attempt(attempt_id).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyGraded));

    let progress = tracker.find_progress(USER, f.course_id).await.unwrap().unwrap();
    assert!(progress.quiz_passed);
    assert!(progress.is_completed);
    assert_eq!(certificate_count(&pool, f.course_id).await, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn interrupted_submission_is_graded_on_retry(pool: PgPool) {
    let f = seed(&pool).await;
    let (tracker, grader) = services(&pool);

    tracker.record_video_watch(USER, f.video_id, 600).await.unwrap();
    tracker.update_progress(USER, f.course_id).await.unwrap();

    // submitted attempt with stored responses but no grade on record
    let attempt_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO quiz_attempts (id, user_id, quiz_id, completed_at) VALUES ($1, $2, $3, now())",
    )
    .bind(attempt_id)
    .bind(USER)
    .bind(f.quiz.id)
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO quiz_responses (id, attempt_id, question_id, selected_answer_ids) VALUES ($1, $2, $3, $4)",
    )
    .bind(Uuid::new_v4())
    .bind(attempt_id)
    .bind(f.question_id)
    .bind(vec![f.right])
    .execute(&pool)
    .await
    .unwrap();

    let graded = grader.submit(attempt_id, &[]).await.unwrap();
    assert_eq!(graded.score, Some(100.0));
    assert!(graded.passed);
}
