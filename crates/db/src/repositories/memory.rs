use std::collections::HashMap;

use tokio::sync::RwLock;

use leadline_core::domain::chat_log::{ChatLogEntry, LeadSubmission};
use leadline_core::domain::topic::validate_table_name;

use super::{ChatLogRepository, LeadSubmissionRepository, RepositoryError};

#[derive(Default)]
pub struct InMemoryChatLogRepository {
    tables: RwLock<HashMap<String, Vec<ChatLogEntry>>>,
}

#[async_trait::async_trait]
impl ChatLogRepository for InMemoryChatLogRepository {
    async fn append(&self, table: &str, entry: &ChatLogEntry) -> Result<(), RepositoryError> {
        validate_table_name(table)
            .map_err(|error| RepositoryError::InvalidTable(error.to_string()))?;
        let mut tables = self.tables.write().await;
        tables.entry(table.to_string()).or_default().push(entry.clone());
        Ok(())
    }

    async fn list_recent(
        &self,
        table: &str,
        limit: u32,
    ) -> Result<Vec<ChatLogEntry>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|entries| entries.iter().rev().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryLeadSubmissionRepository {
    submissions: RwLock<Vec<LeadSubmission>>,
}

#[async_trait::async_trait]
impl LeadSubmissionRepository for InMemoryLeadSubmissionRepository {
    async fn record(&self, submission: &LeadSubmission) -> Result<(), RepositoryError> {
        let mut submissions = self.submissions.write().await;
        if submissions.iter().any(|existing| existing.id == submission.id) {
            return Err(RepositoryError::Decode(format!(
                "duplicate lead submission id `{}`",
                submission.id
            )));
        }
        submissions.push(submission.clone());
        Ok(())
    }

    async fn list_recent(&self, limit: u32) -> Result<Vec<LeadSubmission>, RepositoryError> {
        let submissions = self.submissions.read().await;
        Ok(submissions.iter().rev().take(limit as usize).cloned().collect())
    }
}
