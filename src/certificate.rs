use sqlx::PgConnection;
use uuid::Uuid;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::models::Certificate;

/// Opaque certificate token: 12 uppercase hex characters drawn from a v4
/// UUID, e.g. "9F2C41A07B3D".
pub fn certificate_token() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_uppercase()
}

const TOKEN_RETRIES: usize = 3;

/// Owns `certificates`. Rows are write-once; there is no update path.
#[derive(Clone)]
pub struct CertificateIssuer {
    db: Db,
}

impl CertificateIssuer {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Get-or-create keyed on (user, course). If a certificate already
    /// exists it is returned untouched; concurrent callers ride the unique
    /// constraint, so at most one row ever exists per pair. A token
    /// collision gets a fresh token and another try.
    ///
    /// Runs on the caller's connection so the tracker can issue inside the
    /// same transaction as the completion transition.
    pub async fn issue_if_eligible(
        &self,
        conn: &mut PgConnection,
        user_id: &str,
        course_id: Uuid,
        quiz_score: Option<f64>,
    ) -> Result<Certificate> {
        for _ in 0..TOKEN_RETRIES {
            let inserted = sqlx::query_as::<_, Certificate>(
                r#"
                INSERT INTO certificates (id, certificate_id, user_id, course_id, quiz_score)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (user_id, course_id) DO NOTHING
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(certificate_token())
            .bind(user_id)
            .bind(course_id)
            .bind(quiz_score)
            .fetch_optional(&mut *conn)
            .await;

            match inserted {
                Ok(Some(certificate)) => {
                    tracing::info!(
                        user_id,
                        %course_id,
                        certificate_id = %certificate.certificate_id,
                        "certificate issued"
                    );
                    return Ok(certificate);
                }
                // No row returned: the (user, course) pair already holds one.
                Ok(None) => {
                    let existing = sqlx::query_as::<_, Certificate>(
                        "SELECT * FROM certificates WHERE user_id = $1 AND course_id = $2",
                    )
                    .bind(user_id)
                    .bind(course_id)
                    .fetch_optional(&mut *conn)
                    .await?;
                    if let Some(existing) = existing {
                        return Ok(existing);
                    }
                    // Pair row vanished between insert and fetch; retry.
                }
                Err(e) => {
                    // Unique violation here can only be the token column.
                    let token_collision = e
                        .as_database_error()
                        .map(|db| db.is_unique_violation())
                        .unwrap_or(false);
                    if !token_collision {
                        return Err(e.into());
                    }
                }
            }
        }
        Err(Error::Invariant("could not allocate a unique certificate token".into()))
    }

    pub async fn find(&self, user_id: &str, course_id: Uuid) -> Result<Option<Certificate>> {
        let certificate = sqlx::query_as::<_, Certificate>(
            "SELECT * FROM certificates WHERE user_id = $1 AND course_id = $2",
        )
        .bind(user_id)
        .bind(course_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(certificate)
    }

    pub async fn find_by_token(&self, certificate_id: &str) -> Result<Option<Certificate>> {
        let certificate = sqlx::query_as::<_, Certificate>(
            "SELECT * FROM certificates WHERE certificate_id = $1",
        )
        .bind(certificate_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(certificate)
    }
}
