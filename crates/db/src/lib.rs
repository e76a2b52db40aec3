pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_settings, ping, DbPool};
pub use migrations::{ensure_topic_table, ensure_topic_tables};
pub use repositories::{
    ChatLogRepository, InMemoryChatLogRepository, InMemoryLeadSubmissionRepository,
    LeadSubmissionRepository, RepositoryError, SqlChatLogRepository, SqlLeadSubmissionRepository,
};
