use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use leadline_core::domain::chat_log::{ChatLogEntry, LeadSubmission};

pub mod chat_log;
pub mod lead_submission;
pub mod memory;

pub use chat_log::SqlChatLogRepository;
pub use lead_submission::SqlLeadSubmissionRepository;
pub use memory::{InMemoryChatLogRepository, InMemoryLeadSubmissionRepository};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid log table: {0}")]
    InvalidTable(String),
}

/// Append-only chat log, one table per topic.
#[async_trait]
pub trait ChatLogRepository: Send + Sync {
    async fn append(&self, table: &str, entry: &ChatLogEntry) -> Result<(), RepositoryError>;

    /// Newest first.
    async fn list_recent(
        &self,
        table: &str,
        limit: u32,
    ) -> Result<Vec<ChatLogEntry>, RepositoryError>;
}

#[async_trait]
pub trait LeadSubmissionRepository: Send + Sync {
    async fn record(&self, submission: &LeadSubmission) -> Result<(), RepositoryError>;

    /// Newest first.
    async fn list_recent(&self, limit: u32) -> Result<Vec<LeadSubmission>, RepositoryError>;
}

pub(crate) fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("invalid timestamp in `{column}`: {e}")))
}
