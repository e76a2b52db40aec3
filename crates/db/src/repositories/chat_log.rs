use async_trait::async_trait;
use sqlx::{sqlite::SqliteRow, Row};

use leadline_core::domain::chat_log::{ChatEvent, ChatLogEntry, VisitorContext};
use leadline_core::domain::topic::validate_table_name;

use super::{parse_timestamp, ChatLogRepository, RepositoryError};
use crate::DbPool;

pub struct SqlChatLogRepository {
    pool: DbPool,
}

impl SqlChatLogRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn checked_table(table: &str) -> Result<&str, RepositoryError> {
    validate_table_name(table).map_err(|error| RepositoryError::InvalidTable(error.to_string()))?;
    Ok(table)
}

#[async_trait]
impl ChatLogRepository for SqlChatLogRepository {
    async fn append(&self, table: &str, entry: &ChatLogEntry) -> Result<(), RepositoryError> {
        let table = checked_table(table)?;
        let statement = format!(
            r#"
            INSERT INTO "{table}" (
                id, session_id, thread_id, user_message, assistant_reply, event,
                ip_address, region, city, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#
        );

        sqlx::query(&statement)
            .bind(&entry.id)
            .bind(&entry.session_id)
            .bind(&entry.thread_id)
            .bind(&entry.user_message)
            .bind(&entry.assistant_reply)
            .bind(entry.event.as_str())
            .bind(&entry.visitor.ip_address)
            .bind(&entry.visitor.region)
            .bind(&entry.visitor.city)
            .bind(entry.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_recent(
        &self,
        table: &str,
        limit: u32,
    ) -> Result<Vec<ChatLogEntry>, RepositoryError> {
        let table = checked_table(table)?;
        let statement = format!(
            r#"
            SELECT
                id, session_id, thread_id, user_message, assistant_reply, event,
                ip_address, region, city, created_at
            FROM "{table}"
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#
        );

        let rows = sqlx::query(&statement).bind(i64::from(limit)).fetch_all(&self.pool).await?;
        rows.iter().map(chat_log_entry_from_row).collect()
    }
}

fn chat_log_entry_from_row(row: &SqliteRow) -> Result<ChatLogEntry, RepositoryError> {
    let event: String = row.try_get("event")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(ChatLogEntry {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        thread_id: row.try_get("thread_id")?,
        user_message: row.try_get("user_message")?,
        assistant_reply: row.try_get("assistant_reply")?,
        event: ChatEvent::parse(&event)
            .ok_or_else(|| RepositoryError::Decode(format!("invalid event: {event}")))?,
        visitor: VisitorContext {
            ip_address: row.try_get("ip_address")?,
            region: row.try_get("region")?,
            city: row.try_get("city")?,
        },
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use leadline_core::domain::chat_log::{ChatEvent, ChatLogEntry, VisitorContext};
    use leadline_core::domain::topic::Topic;

    use super::SqlChatLogRepository;
    use crate::repositories::{ChatLogRepository, RepositoryError};
    use crate::{connect_with_settings, ensure_topic_table, DbPool};

    async fn setup_pool(table: &str) -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect test pool");
        let topic = Topic::new("berater", "asst_1", table).expect("topic");
        ensure_topic_table(&pool, &topic).await.expect("create topic table");
        pool
    }

    #[tokio::test]
    async fn appended_entries_are_listed_newest_first() {
        let pool = setup_pool("chat_berater").await;
        let repo = SqlChatLogRepository::new(pool.clone());

        let mut first = ChatLogEntry::new("Hallo", ChatEvent::Exchange);
        first.session_id = Some("session-1".to_string());
        first.thread_id = Some("thread_1".to_string());
        first.assistant_reply = Some("Guten Tag!".to_string());
        first.visitor = VisitorContext {
            ip_address: Some("203.0.113.7".to_string()),
            region: Some("Bayern".to_string()),
            city: Some("München".to_string()),
        };
        let mut second = ChatLogEntry::new("Ja", ChatEvent::LeadSubmitted);
        second.created_at = first.created_at + chrono::Duration::seconds(1);

        repo.append("chat_berater", &first).await.expect("append first");
        repo.append("chat_berater", &second).await.expect("append second");

        let entries = repo.list_recent("chat_berater", 10).await.expect("list");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, ChatEvent::LeadSubmitted);
        assert_eq!(entries[1], first);

        pool.close().await;
    }

    #[tokio::test]
    async fn unsafe_table_name_is_rejected_before_touching_the_database() {
        let pool = setup_pool("chat_berater").await;
        let repo = SqlChatLogRepository::new(pool);

        let entry = ChatLogEntry::new("Hallo", ChatEvent::Exchange);
        let error = repo
            .append("chat_berater; DROP TABLE chat_berater", &entry)
            .await
            .expect_err("unsafe table");
        assert!(matches!(error, RepositoryError::InvalidTable(_)));
    }

    #[tokio::test]
    async fn missing_table_surfaces_database_error() {
        let pool = setup_pool("chat_berater").await;
        let repo = SqlChatLogRepository::new(pool);

        let entry = ChatLogEntry::new("Hallo", ChatEvent::Exchange);
        let error = repo.append("chat_unknown", &entry).await.expect_err("missing table");
        assert!(matches!(error, RepositoryError::Database(_)));
    }
}
