use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::topic::{validate_table_name, Topic};

/// Topics served by the first deployment, in route order.
pub const DEFAULT_TOPIC_SLUGS: [&str; 6] = [
    "berater",
    "kreislaufwirtschaftsgesetz",
    "bundesbodenschutzverordnung",
    "laga_pn_98",
    "Ersatzbaustoffverordnung",
    "Deponieverordnung",
];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub assistant: AssistantConfig,
    pub topics: Vec<TopicConfig>,
    pub server: ServerConfig,
    pub crm: CrmConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct AssistantConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub poll_interval_ms: u64,
    pub run_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicConfig {
    pub slug: String,
    pub assistant_id: Option<String>,
    pub log_table: String,
}

impl TopicConfig {
    fn with_defaults(slug: &str) -> Self {
        Self {
            slug: slug.to_string(),
            assistant_id: None,
            log_table: default_log_table(slug),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub health_check_port: u16,
    pub graceful_shutdown_secs: u64,
    pub cors_allowed_origins: Vec<String>,
    pub cross_site_cookies: bool,
    pub session_cookie_max_age_secs: u64,
}

#[derive(Clone, Debug)]
pub struct CrmConfig {
    pub enabled: bool,
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub access_token: Option<SecretString>,
    pub token_url: String,
    pub api_base_url: String,
    pub deal_module: String,
    pub default_token_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub lead_source: String,
    pub surface_submission_failure: bool,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub assistant_api_key: Option<String>,
    pub assistant_base_url: Option<String>,
    /// `(slug, assistant_id)` pairs; unknown slugs add a topic.
    pub topic_assistant_ids: Vec<(String, String)>,
    pub server_port: Option<u16>,
    pub crm_enabled: Option<bool>,
    pub crm_client_id: Option<String>,
    pub crm_client_secret: Option<String>,
    pub crm_refresh_token: Option<String>,
    pub crm_token_url: Option<String>,
    pub crm_api_base_url: Option<String>,
    pub crm_surface_submission_failure: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://leadline.db?mode=rwc".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            assistant: AssistantConfig {
                api_key: None,
                base_url: "https://api.openai.com/v1".to_string(),
                poll_interval_ms: 500,
                run_timeout_secs: 90,
                request_timeout_secs: 30,
            },
            topics: DEFAULT_TOPIC_SLUGS.iter().map(|slug| TopicConfig::with_defaults(slug)).collect(),
            server: ServerConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 5000,
                health_check_port: 8080,
                graceful_shutdown_secs: 15,
                cors_allowed_origins: vec!["http://localhost:3000".to_string()],
                cross_site_cookies: true,
                session_cookie_max_age_secs: 60 * 60 * 24 * 30,
            },
            crm: CrmConfig {
                enabled: false,
                client_id: None,
                client_secret: None,
                refresh_token: None,
                access_token: None,
                token_url: "https://accounts.zoho.eu/oauth/v2/token".to_string(),
                api_base_url: "https://www.zohoapis.eu/crm/v2".to_string(),
                deal_module: "Deals".to_string(),
                default_token_ttl_secs: 3600,
                request_timeout_secs: 20,
                lead_source: "Chatbot".to_string(),
                surface_submission_failure: false,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

fn default_log_table(slug: &str) -> String {
    format!("chat_{}", slug.to_ascii_lowercase())
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("leadline.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    /// Topics that have an assistant configured, in declaration order.
    pub fn active_topics(&self) -> Vec<Topic> {
        self.topics
            .iter()
            .filter_map(|topic| {
                let assistant_id = topic.assistant_id.as_deref()?.trim();
                (!assistant_id.is_empty()).then(|| Topic {
                    slug: topic.slug.clone(),
                    assistant_id: assistant_id.to_string(),
                    log_table: topic.log_table.clone(),
                })
            })
            .collect()
    }

    fn topic_mut(&mut self, slug: &str) -> &mut TopicConfig {
        let index = match self.topics.iter().position(|topic| topic.slug == slug) {
            Some(index) => index,
            None => {
                self.topics.push(TopicConfig::with_defaults(slug));
                self.topics.len() - 1
            }
        };
        &mut self.topics[index]
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(assistant) = patch.assistant {
            if let Some(api_key) = assistant.api_key {
                self.assistant.api_key = Some(secret_value(api_key));
            }
            if let Some(base_url) = assistant.base_url {
                self.assistant.base_url = base_url;
            }
            if let Some(poll_interval_ms) = assistant.poll_interval_ms {
                self.assistant.poll_interval_ms = poll_interval_ms;
            }
            if let Some(run_timeout_secs) = assistant.run_timeout_secs {
                self.assistant.run_timeout_secs = run_timeout_secs;
            }
            if let Some(request_timeout_secs) = assistant.request_timeout_secs {
                self.assistant.request_timeout_secs = request_timeout_secs;
            }
        }

        for topic_patch in patch.topics.unwrap_or_default() {
            let topic = self.topic_mut(&topic_patch.slug);
            if let Some(assistant_id) = topic_patch.assistant_id {
                topic.assistant_id = Some(assistant_id);
            }
            if let Some(log_table) = topic_patch.log_table {
                topic.log_table = log_table;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
            if let Some(cors_allowed_origins) = server.cors_allowed_origins {
                self.server.cors_allowed_origins = cors_allowed_origins;
            }
            if let Some(cross_site_cookies) = server.cross_site_cookies {
                self.server.cross_site_cookies = cross_site_cookies;
            }
            if let Some(max_age) = server.session_cookie_max_age_secs {
                self.server.session_cookie_max_age_secs = max_age;
            }
        }

        if let Some(crm) = patch.crm {
            if let Some(enabled) = crm.enabled {
                self.crm.enabled = enabled;
            }
            if let Some(client_id) = crm.client_id {
                self.crm.client_id = Some(client_id);
            }
            if let Some(client_secret) = crm.client_secret {
                self.crm.client_secret = Some(secret_value(client_secret));
            }
            if let Some(refresh_token) = crm.refresh_token {
                self.crm.refresh_token = Some(secret_value(refresh_token));
            }
            if let Some(access_token) = crm.access_token {
                self.crm.access_token = Some(secret_value(access_token));
            }
            if let Some(token_url) = crm.token_url {
                self.crm.token_url = token_url;
            }
            if let Some(api_base_url) = crm.api_base_url {
                self.crm.api_base_url = api_base_url;
            }
            if let Some(deal_module) = crm.deal_module {
                self.crm.deal_module = deal_module;
            }
            if let Some(default_token_ttl_secs) = crm.default_token_ttl_secs {
                self.crm.default_token_ttl_secs = default_token_ttl_secs;
            }
            if let Some(request_timeout_secs) = crm.request_timeout_secs {
                self.crm.request_timeout_secs = request_timeout_secs;
            }
            if let Some(lead_source) = crm.lead_source {
                self.crm.lead_source = lead_source;
            }
            if let Some(surface) = crm.surface_submission_failure {
                self.crm.surface_submission_failure = surface;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("LEADLINE_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("LEADLINE_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("LEADLINE_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("LEADLINE_DATABASE_TIMEOUT_SECS", &value)?;
        }

        let api_key =
            read_env("LEADLINE_ASSISTANT_API_KEY").or_else(|| read_env("OPENAI_API_KEY"));
        if let Some(value) = api_key {
            self.assistant.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("LEADLINE_ASSISTANT_BASE_URL") {
            self.assistant.base_url = value;
        }
        if let Some(value) = read_env("LEADLINE_ASSISTANT_POLL_INTERVAL_MS") {
            self.assistant.poll_interval_ms =
                parse_u64("LEADLINE_ASSISTANT_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_ASSISTANT_RUN_TIMEOUT_SECS") {
            self.assistant.run_timeout_secs =
                parse_u64("LEADLINE_ASSISTANT_RUN_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_ASSISTANT_REQUEST_TIMEOUT_SECS") {
            self.assistant.request_timeout_secs =
                parse_u64("LEADLINE_ASSISTANT_REQUEST_TIMEOUT_SECS", &value)?;
        }

        // Deployments still export the per-topic ids as `ASSISTANT_ID_<slug>`.
        for topic in &mut self.topics {
            let assistant_id = read_env(&format!(
                "LEADLINE_ASSISTANT_ID_{}",
                topic.slug.to_ascii_uppercase()
            ))
            .or_else(|| read_env(&format!("ASSISTANT_ID_{}", topic.slug)));
            if let Some(value) = assistant_id {
                topic.assistant_id = Some(value);
            }
        }

        if let Some(value) = read_env("LEADLINE_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("LEADLINE_SERVER_PORT") {
            self.server.port = parse_u16("LEADLINE_SERVER_PORT", &value)?;
        } else if let Some(value) = read_env("PORT") {
            self.server.port = parse_u16("PORT", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port =
                parse_u16("LEADLINE_SERVER_HEALTH_CHECK_PORT", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("LEADLINE_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_SERVER_CORS_ALLOWED_ORIGINS") {
            self.server.cors_allowed_origins = split_list(&value);
        }
        if let Some(value) = read_env("LEADLINE_SERVER_CROSS_SITE_COOKIES") {
            self.server.cross_site_cookies =
                parse_bool("LEADLINE_SERVER_CROSS_SITE_COOKIES", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_SERVER_SESSION_COOKIE_MAX_AGE_SECS") {
            self.server.session_cookie_max_age_secs =
                parse_u64("LEADLINE_SERVER_SESSION_COOKIE_MAX_AGE_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADLINE_CRM_ENABLED") {
            self.crm.enabled = parse_bool("LEADLINE_CRM_ENABLED", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_CRM_CLIENT_ID") {
            self.crm.client_id = Some(value);
        }
        if let Some(value) = read_env("LEADLINE_CRM_CLIENT_SECRET") {
            self.crm.client_secret = Some(secret_value(value));
        }
        if let Some(value) = read_env("LEADLINE_CRM_REFRESH_TOKEN") {
            self.crm.refresh_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("LEADLINE_CRM_ACCESS_TOKEN") {
            self.crm.access_token = Some(secret_value(value));
        }
        if let Some(value) = read_env("LEADLINE_CRM_TOKEN_URL") {
            self.crm.token_url = value;
        }
        if let Some(value) = read_env("LEADLINE_CRM_API_BASE_URL") {
            self.crm.api_base_url = value;
        }
        if let Some(value) = read_env("LEADLINE_CRM_DEAL_MODULE") {
            self.crm.deal_module = value;
        }
        if let Some(value) = read_env("LEADLINE_CRM_DEFAULT_TOKEN_TTL_SECS") {
            self.crm.default_token_ttl_secs =
                parse_u64("LEADLINE_CRM_DEFAULT_TOKEN_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_CRM_REQUEST_TIMEOUT_SECS") {
            self.crm.request_timeout_secs =
                parse_u64("LEADLINE_CRM_REQUEST_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADLINE_CRM_LEAD_SOURCE") {
            self.crm.lead_source = value;
        }
        if let Some(value) = read_env("LEADLINE_CRM_SURFACE_SUBMISSION_FAILURE") {
            self.crm.surface_submission_failure =
                parse_bool("LEADLINE_CRM_SURFACE_SUBMISSION_FAILURE", &value)?;
        }

        let log_level =
            read_env("LEADLINE_LOGGING_LEVEL").or_else(|| read_env("LEADLINE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("LEADLINE_LOGGING_FORMAT").or_else(|| read_env("LEADLINE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(api_key) = overrides.assistant_api_key {
            self.assistant.api_key = Some(secret_value(api_key));
        }
        if let Some(base_url) = overrides.assistant_base_url {
            self.assistant.base_url = base_url;
        }
        for (slug, assistant_id) in overrides.topic_assistant_ids {
            self.topic_mut(&slug).assistant_id = Some(assistant_id);
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }

        if let Some(enabled) = overrides.crm_enabled {
            self.crm.enabled = enabled;
        }
        if let Some(client_id) = overrides.crm_client_id {
            self.crm.client_id = Some(client_id);
        }
        if let Some(client_secret) = overrides.crm_client_secret {
            self.crm.client_secret = Some(secret_value(client_secret));
        }
        if let Some(refresh_token) = overrides.crm_refresh_token {
            self.crm.refresh_token = Some(secret_value(refresh_token));
        }
        if let Some(token_url) = overrides.crm_token_url {
            self.crm.token_url = token_url;
        }
        if let Some(api_base_url) = overrides.crm_api_base_url {
            self.crm.api_base_url = api_base_url;
        }
        if let Some(surface) = overrides.crm_surface_submission_failure {
            self.crm.surface_submission_failure = surface;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_assistant(&self.assistant)?;
        validate_topics(&self.topics)?;
        validate_server(&self.server)?;
        validate_crm(&self.crm)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("leadline.toml"), PathBuf::from("config/leadline.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_assistant(assistant: &AssistantConfig) -> Result<(), ConfigError> {
    let missing_key = assistant
        .api_key
        .as_ref()
        .map(|value| value.expose_secret().trim().is_empty())
        .unwrap_or(true);
    if missing_key {
        return Err(ConfigError::Validation(
            "assistant.api_key is required (set LEADLINE_ASSISTANT_API_KEY or OPENAI_API_KEY)"
                .to_string(),
        ));
    }

    if !is_http_url(&assistant.base_url) {
        return Err(ConfigError::Validation(
            "assistant.base_url must start with http:// or https://".to_string(),
        ));
    }

    if assistant.poll_interval_ms == 0 || assistant.poll_interval_ms > 60_000 {
        return Err(ConfigError::Validation(
            "assistant.poll_interval_ms must be in range 1..=60000".to_string(),
        ));
    }

    if assistant.run_timeout_secs == 0 || assistant.run_timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "assistant.run_timeout_secs must be in range 1..=600".to_string(),
        ));
    }

    if assistant.request_timeout_secs == 0 || assistant.request_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "assistant.request_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_topics(topics: &[TopicConfig]) -> Result<(), ConfigError> {
    let mut seen_slugs = Vec::with_capacity(topics.len());
    for topic in topics {
        let slug_ok = !topic.slug.is_empty()
            && topic.slug.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
        if !slug_ok {
            return Err(ConfigError::Validation(format!(
                "topics.slug `{}` must be non-empty and contain only letters, digits or `_`",
                topic.slug
            )));
        }
        if seen_slugs.contains(&topic.slug.as_str()) {
            return Err(ConfigError::Validation(format!(
                "topics.slug `{}` is configured more than once",
                topic.slug
            )));
        }
        seen_slugs.push(topic.slug.as_str());

        validate_table_name(&topic.log_table).map_err(|_| {
            ConfigError::Validation(format!(
                "topics.log_table `{}` for topic `{}` must be a plain SQL identifier",
                topic.log_table, topic.slug
            ))
        })?;
    }

    let any_active = topics
        .iter()
        .any(|topic| topic.assistant_id.as_deref().is_some_and(|id| !id.trim().is_empty()));
    if !any_active {
        return Err(ConfigError::Validation(
            "at least one topic needs an assistant id (set ASSISTANT_ID_<topic> or topics.assistant_id)"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    if server.health_check_port == server.port {
        return Err(ConfigError::Validation(
            "server.health_check_port must differ from server.port".to_string(),
        ));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_crm(crm: &CrmConfig) -> Result<(), ConfigError> {
    if crm.enabled {
        if crm.client_id.as_deref().map(str::trim).unwrap_or_default().is_empty() {
            return Err(ConfigError::Validation(
                "crm.enabled is true but crm.client_id is missing".to_string(),
            ));
        }
        if !has_secret(crm.client_secret.as_ref()) {
            return Err(ConfigError::Validation(
                "crm.enabled is true but crm.client_secret is missing".to_string(),
            ));
        }
        if !has_secret(crm.refresh_token.as_ref()) {
            return Err(ConfigError::Validation(
                "crm.enabled is true but crm.refresh_token is missing".to_string(),
            ));
        }
    }

    if !is_http_url(&crm.token_url) {
        return Err(ConfigError::Validation(
            "crm.token_url must start with http:// or https://".to_string(),
        ));
    }
    if !is_http_url(&crm.api_base_url) {
        return Err(ConfigError::Validation(
            "crm.api_base_url must start with http:// or https://".to_string(),
        ));
    }
    if crm.deal_module.trim().is_empty() {
        return Err(ConfigError::Validation("crm.deal_module must not be empty".to_string()));
    }
    if crm.default_token_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "crm.default_token_ttl_secs must be greater than zero".to_string(),
        ));
    }
    if crm.request_timeout_secs == 0 || crm.request_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "crm.request_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn has_secret(value: Option<&SecretString>) -> bool {
    value.is_some_and(|secret| !secret.expose_secret().trim().is_empty())
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    assistant: Option<AssistantPatch>,
    topics: Option<Vec<TopicPatch>>,
    server: Option<ServerPatch>,
    crm: Option<CrmPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct AssistantPatch {
    api_key: Option<String>,
    base_url: Option<String>,
    poll_interval_ms: Option<u64>,
    run_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TopicPatch {
    slug: String,
    assistant_id: Option<String>,
    log_table: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    health_check_port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
    cors_allowed_origins: Option<Vec<String>>,
    cross_site_cookies: Option<bool>,
    session_cookie_max_age_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CrmPatch {
    enabled: Option<bool>,
    client_id: Option<String>,
    client_secret: Option<String>,
    refresh_token: Option<String>,
    access_token: Option<String>,
    token_url: Option<String>,
    api_base_url: Option<String>,
    deal_module: Option<String>,
    default_token_ttl_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    lead_source: Option<String>,
    surface_submission_failure: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
