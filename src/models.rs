use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct CurriculumDay {
    pub id: Uuid,
    pub course_id: Uuid,
    pub day_number: i32,
    pub title: String,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Video {
    pub id: Uuid,
    pub curriculum_day_id: Uuid,
    pub title: String,
    pub duration_seconds: i32,
    pub position: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct VideoWatchRecord {
    pub id: Uuid,
    pub user_id: String,
    pub video_id: Uuid,
    pub watched_seconds: i32,
    pub watched_percentage: i32,
    pub completed: bool,
    pub last_watched: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Quiz {
    pub id: Uuid,
    pub course_id: Uuid,
    pub title: String,
    pub passing_score: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Question {
    pub id: Uuid,
    pub quiz_id: Uuid,
    pub question_text: String,
    pub question_type: String,
    pub points: i32,
    pub position: i32,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Answer {
    pub id: Uuid,
    pub question_id: Uuid,
    pub answer_text: String,
    pub is_correct: bool,
    pub position: i32,
}

/// Open until `completed_at` is set; graded (and immutable) once `score` is set.
#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct QuizAttempt {
    pub id: Uuid,
    pub user_id: String,
    pub quiz_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub score: Option<f64>,
    pub passed: bool,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct CourseProgress {
    pub user_id: String,
    pub course_id: Uuid,
    pub progress_percentage: f64,
    pub quiz_passed: bool,
    pub last_passing_attempt_id: Option<Uuid>,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow, Serialize, Deserialize, Debug, Clone)]
pub struct Certificate {
    pub id: Uuid,
    pub certificate_id: String,
    pub user_id: String,
    pub course_id: Uuid,
    pub issue_date: DateTime<Utc>,
    pub quiz_score: Option<f64>,
}

// --- request / response payloads ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateCourseReq {
    pub title: String,
    pub slug: String,
    #[serde(default)]
    pub days: Vec<CreateDayReq>,
    #[serde(default)]
    pub quiz: Option<CreateQuizReq>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateDayReq {
    pub day_number: i32,
    pub title: String,
    #[serde(default)]
    pub videos: Vec<CreateVideoReq>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateVideoReq {
    pub title: String,
    pub duration_seconds: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateQuizReq {
    pub title: String,
    #[serde(default = "default_passing_score")]
    pub passing_score: i32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    pub questions: Vec<CreateQuestionReq>,
}

fn default_passing_score() -> i32 {
    70
}

fn default_max_attempts() -> i32 {
    3
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateQuestionReq {
    pub question_text: String,
    #[serde(default = "default_question_type")]
    pub question_type: String,
    #[serde(default = "default_points")]
    pub points: i32,
    pub answers: Vec<CreateAnswerReq>,
}

fn default_question_type() -> String {
    "single".into()
}

fn default_points() -> i32 {
    1
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateAnswerReq {
    pub answer_text: String,
    #[serde(default)]
    pub is_correct: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WatchReq {
    pub user_id: String,
    pub watched_seconds: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateAttemptReq {
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitAttemptReq {
    #[serde(default)]
    pub responses: Vec<ResponseReq>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResponseReq {
    pub question_id: Uuid,
    pub selected_answer_ids: Vec<Uuid>,
}

/// Completion-requirements report for one (user, course) pair.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CompletionRequirements {
    pub total_videos: i64,
    pub completed_videos: i64,
    pub videos_percentage: f64,
    pub quiz_passed: bool,
    pub is_completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}
