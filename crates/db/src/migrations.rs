use sqlx::migrate::{MigrateError, Migrator};
use tracing::debug;

use leadline_core::domain::topic::{validate_table_name, Topic};

use crate::repositories::RepositoryError;
use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

/// Creates the append-only log table of one topic if it does not exist yet.
pub async fn ensure_topic_table(pool: &DbPool, topic: &Topic) -> Result<(), RepositoryError> {
    validate_table_name(&topic.log_table)
        .map_err(|error| RepositoryError::InvalidTable(error.to_string()))?;

    let table = &topic.log_table;
    let ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            id TEXT PRIMARY KEY,
            session_id TEXT,
            thread_id TEXT,
            user_message TEXT NOT NULL,
            assistant_reply TEXT,
            event TEXT NOT NULL,
            ip_address TEXT,
            region TEXT,
            city TEXT,
            created_at TEXT NOT NULL
        )
        "#
    );
    sqlx::query(&ddl).execute(pool).await?;

    let index = format!(
        r#"CREATE INDEX IF NOT EXISTS "idx_{table}_session_id" ON "{table}" (session_id)"#
    );
    sqlx::query(&index).execute(pool).await?;

    debug!(
        event_name = "db.topic_table.ready",
        topic = %topic.slug,
        table = %table,
        "topic log table ready"
    );
    Ok(())
}

pub async fn ensure_topic_tables(pool: &DbPool, topics: &[Topic]) -> Result<(), RepositoryError> {
    for topic in topics {
        ensure_topic_table(pool, topic).await?;
    }
    Ok(())
}
