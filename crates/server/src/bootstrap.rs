use std::sync::Arc;

use leadline_agent::{
    assistant::{AssistantError, OpenAiAssistantClient},
    runtime::{ChatRuntime, LeadSink, NoopLeadSink},
    session::SessionStore,
};
use leadline_core::config::{AppConfig, ConfigError, LoadOptions};
use leadline_db::{
    connect, ensure_topic_tables, migrations, DbPool, RepositoryError,
    SqlChatLogRepository, SqlLeadSubmissionRepository,
};
use thiserror::Error;
use tracing::{info, warn};

use crate::chat::{ChatState, CookieSettings};
use crate::crm::{CrmClient, CrmError};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub chat_state: ChatState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("topic log table setup failed: {0}")]
    Repository(#[source] RepositoryError),
    #[error("assistant client setup failed: {0}")]
    Assistant(#[source] AssistantError),
    #[error("crm client setup failed: {0}")]
    Crm(#[source] CrmError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    let topics = config.active_topics();
    ensure_topic_tables(&db_pool, &topics).await.map_err(BootstrapError::Repository)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        topic_count = topics.len(),
        "database migrations applied and topic log tables ready"
    );

    for skipped in config.topics.iter().filter(|topic| {
        !topics.iter().any(|active| active.slug == topic.slug)
    }) {
        warn!(
            event_name = "system.bootstrap.topic_disabled",
            correlation_id = "bootstrap",
            topic = %skipped.slug,
            "topic has no assistant id and will not be served"
        );
    }

    let assistant =
        OpenAiAssistantClient::from_config(&config.assistant).map_err(BootstrapError::Assistant)?;
    let lead_sink: Arc<dyn LeadSink> = if config.crm.enabled {
        Arc::new(CrmClient::from_config(&config.crm).map_err(BootstrapError::Crm)?)
    } else {
        info!(
            event_name = "system.bootstrap.crm_disabled",
            correlation_id = "bootstrap",
            "crm submission disabled; confirmed leads are only audited"
        );
        Arc::new(NoopLeadSink)
    };

    let runtime = Arc::new(
        ChatRuntime::new(Arc::new(assistant), Arc::new(SessionStore::new()), lead_sink)
            .with_surface_submission_failure(config.crm.surface_submission_failure),
    );
    let chat_state = ChatState::new(
        runtime,
        topics,
        Arc::new(SqlChatLogRepository::new(db_pool.clone())),
        Arc::new(SqlLeadSubmissionRepository::new(db_pool.clone())),
        CookieSettings::from(&config.server),
    );

    Ok(Application { config, db_pool, chat_state })
}
