use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row};

use leadline_core::domain::chat_log::{LeadSubmission, SubmissionStatus};

use super::{parse_timestamp, LeadSubmissionRepository, RepositoryError};
use crate::DbPool;

pub struct SqlLeadSubmissionRepository {
    pool: DbPool,
}

impl SqlLeadSubmissionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeadSubmissionRepository for SqlLeadSubmissionRepository {
    async fn record(&self, submission: &LeadSubmission) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO lead_submission (
                id, topic, session_id, status, crm_reference, error, fields_json, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&submission.id)
        .bind(&submission.topic)
        .bind(&submission.session_id)
        .bind(submission.status.as_str())
        .bind(&submission.crm_reference)
        .bind(&submission.error)
        .bind(&submission.fields_json)
        .bind(submission.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<LeadSubmission>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, session_id, status, crm_reference, error, fields_json, created_at
            FROM lead_submission
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(lead_submission_from_row).collect()
    }
}

fn lead_submission_from_row(row: &SqliteRow) -> Result<LeadSubmission, RepositoryError> {
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(LeadSubmission {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        session_id: row.try_get("session_id")?,
        status: SubmissionStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("invalid status: {status}")))?,
        crm_reference: row.try_get("crm_reference")?,
        error: row.try_get("error")?,
        fields_json: row.try_get("fields_json")?,
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}
