use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    InvalidState(String),
    #[error("attempt has already been graded")]
    AlreadyGraded,
    #[error("{0}")]
    QuizLocked(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Invariant(String),
    // Froms
    #[error("{0}")]
    Db(#[from] sqlx::Error),
}

impl From<Error> for StatusCode {
    fn from(error: Error) -> Self {
        match error {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidState(_) | Error::AlreadyGraded => StatusCode::CONFLICT,
            Error::QuizLocked(_) => StatusCode::FORBIDDEN,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Invariant(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        if let Error::Db(ref e) = self {
            tracing::error!(error=%e, "database error");
        }
        let msg = self.to_string();
        let status: StatusCode = self.into();

        (status, Json(serde_json::json!({ "error": msg }))).into_response()
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
