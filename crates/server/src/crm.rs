//! CRM hand-off for confirmed leads.
//!
//! - OAuth refresh-token grant with a cached bearer token and TTL
//! - deal creation with exactly one refresh-and-retry on 401
//! - fixed deal payload built from a `LeadRecord`

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use leadline_agent::runtime::{LeadReceipt, LeadSink, LeadSinkError};
use leadline_core::config::CrmConfig;
use leadline_core::domain::lead::{LeadField, LeadRecord};
use leadline_core::domain::topic::Topic;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

const MAX_TOKEN_TTL_SECS: i64 = 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("crm is not configured: {0}")]
    Configuration(String),
    #[error("crm request failed: {0}")]
    Transport(String),
    #[error("crm rejected the access token")]
    Unauthorized,
    #[error("crm returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("crm token refresh failed: {0}")]
    TokenRefresh(String),
    #[error("could not decode crm response: {0}")]
    Decode(String),
}

/// Access token handed out by the token endpoint.
pub struct IssuedToken {
    pub access_token: SecretString,
    pub ttl: Duration,
}

#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<IssuedToken, CrmError>;
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
}

/// Refresh-token grant against the CRM's OAuth endpoint.
pub struct OAuthRefresher {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
    refresh_token: SecretString,
    default_ttl: Duration,
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self) -> Result<IssuedToken, CrmError> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.refresh_token.expose_secret()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
            ])
            .send()
            .await
            .map_err(|error| CrmError::TokenRefresh(format!("token request failed: {error}")))?;

        if !response.status().is_success() {
            return Err(CrmError::TokenRefresh(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let token: OAuthTokenResponse = response.json().await.map_err(|error| {
            CrmError::TokenRefresh(format!("failed to decode token response: {error}"))
        })?;
        if let Some(reason) = token.error {
            return Err(CrmError::TokenRefresh(format!("token endpoint reported `{reason}`")));
        }
        let access_token = token
            .access_token
            .filter(|value| !value.is_empty())
            .ok_or_else(|| CrmError::TokenRefresh("token endpoint returned no access token".into()))?;

        Ok(IssuedToken {
            access_token: access_token.into(),
            ttl: token
                .expires_in
                .filter(|secs| *secs > 0)
                .map(|secs| Duration::seconds(secs.min(MAX_TOKEN_TTL_SECS)))
                .unwrap_or(self.default_ttl),
        })
    }
}

struct CachedToken {
    value: SecretString,
    issued_at: DateTime<Utc>,
    ttl: Duration,
}

impl CachedToken {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now - self.issued_at >= self.ttl
    }
}

/// Bearer token with time-based expiry.
///
/// The lock is held through a refresh, so concurrent callers wait for one
/// refresh instead of each starting their own.
pub struct TokenManager {
    refresher: Arc<dyn TokenRefresher>,
    current: Mutex<Option<CachedToken>>,
}

impl TokenManager {
    pub fn new(refresher: Arc<dyn TokenRefresher>) -> Self {
        Self { refresher, current: Mutex::new(None) }
    }

    /// Starts from an already issued token instead of refreshing on first use.
    pub fn with_seed(self, value: SecretString, issued_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            refresher: self.refresher,
            current: Mutex::new(Some(CachedToken { value, issued_at, ttl })),
        }
    }

    pub async fn bearer(&self) -> Result<SecretString, CrmError> {
        self.bearer_at(Utc::now()).await
    }

    pub async fn bearer_at(&self, now: DateTime<Utc>) -> Result<SecretString, CrmError> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref().filter(|token| !token.is_expired_at(now)) {
            return Ok(token.value.clone());
        }
        self.refresh_locked(&mut current, now).await
    }

    /// Replaces a token the CRM refused. If another caller already replaced
    /// it, that newer token is returned without a second refresh.
    pub async fn refresh_rejected_at(
        &self,
        rejected: &SecretString,
        now: DateTime<Utc>,
    ) -> Result<SecretString, CrmError> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref() {
            if token.value.expose_secret() != rejected.expose_secret() && !token.is_expired_at(now)
            {
                return Ok(token.value.clone());
            }
        }
        self.refresh_locked(&mut current, now).await
    }

    async fn refresh_locked(
        &self,
        current: &mut Option<CachedToken>,
        now: DateTime<Utc>,
    ) -> Result<SecretString, CrmError> {
        let issued = self.refresher.refresh().await.map_err(|refresh_error| {
            error!(
                event_name = "crm.token.refresh_failed",
                error = %refresh_error,
                "crm token refresh failed"
            );
            refresh_error
        })?;

        info!(
            event_name = "crm.token.refreshed",
            ttl_secs = issued.ttl.num_seconds(),
            "crm access token refreshed"
        );
        let value = issued.access_token.clone();
        *current = Some(CachedToken { value: issued.access_token, issued_at: now, ttl: issued.ttl });
        Ok(value)
    }
}

#[async_trait]
pub trait DealApi: Send + Sync {
    /// Creates one deal, returning the CRM's record id when it reports one.
    async fn create_deal(
        &self,
        bearer: &SecretString,
        payload: &Value,
    ) -> Result<Option<String>, CrmError>;
}

pub struct HttpDealApi {
    client: Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct DealResponse {
    #[serde(default)]
    data: Vec<DealResult>,
}

#[derive(Debug, Deserialize)]
struct DealResult {
    status: Option<String>,
    message: Option<String>,
    details: Option<DealDetails>,
}

#[derive(Debug, Deserialize)]
struct DealDetails {
    id: Option<String>,
}

#[async_trait]
impl DealApi for HttpDealApi {
    async fn create_deal(
        &self,
        bearer: &SecretString,
        payload: &Value,
    ) -> Result<Option<String>, CrmError> {
        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Zoho-oauthtoken {}", bearer.expose_secret()))
            .json(payload)
            .send()
            .await
            .map_err(|error| CrmError::Transport(error.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(CrmError::Unauthorized);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CrmError::Api { status: status.as_u16(), body });
        }

        let parsed: DealResponse =
            response.json().await.map_err(|error| CrmError::Decode(error.to_string()))?;
        let Some(result) = parsed.data.into_iter().next() else {
            return Ok(None);
        };
        if result.status.as_deref() == Some("error") {
            return Err(CrmError::Api {
                status: status.as_u16(),
                body: result.message.unwrap_or_else(|| "record rejected".to_string()),
            });
        }
        Ok(result.details.and_then(|details| details.id))
    }
}

const DEAL_FIELDS: [(LeadField, &str); 9] = [
    (LeadField::FirstName, "Vorname"),
    (LeadField::LastName, "Nachname"),
    (LeadField::Email, "Email"),
    (LeadField::Phone, "Telefon"),
    (LeadField::ZipCode, "Postleitzahl"),
    (LeadField::Quantity, "Menge"),
    (LeadField::Description, "Beschreibung"),
    (LeadField::Salutation, "Anrede"),
    (LeadField::PlannedStart, "Geplanter_Start"),
];

/// Fixed-shape deal body. Absent optional fields are left out.
pub fn build_deal_payload(lead: &LeadRecord, lead_source: &str) -> Value {
    let mut record = Map::new();
    for (field, crm_field) in DEAL_FIELDS {
        if let Some(value) = lead.get(field) {
            record.insert(crm_field.to_string(), Value::String(value.to_string()));
        }
    }

    let deal_name = match lead.get(LeadField::Subject) {
        Some(subject) => subject.to_string(),
        None => format!(
            "Anfrage {} {}",
            lead.get(LeadField::FirstName).unwrap_or_default(),
            lead.get(LeadField::LastName).unwrap_or_default()
        )
        .trim()
        .to_string(),
    };
    record.insert("Deal_Name".to_string(), Value::String(deal_name));
    if !lead_source.is_empty() {
        record.insert("Lead_Source".to_string(), Value::String(lead_source.to_string()));
    }

    json!({ "data": [Value::Object(record)] })
}

pub struct CrmClient {
    tokens: TokenManager,
    deals: Arc<dyn DealApi>,
    lead_source: String,
}

impl CrmClient {
    pub fn new(tokens: TokenManager, deals: Arc<dyn DealApi>, lead_source: impl Into<String>) -> Self {
        Self { tokens, deals, lead_source: lead_source.into() }
    }

    pub fn from_config(config: &CrmConfig) -> Result<Self, CrmError> {
        let client_id = config
            .client_id
            .clone()
            .ok_or_else(|| CrmError::Configuration("crm.client_id is missing".into()))?;
        let client_secret = config
            .client_secret
            .clone()
            .ok_or_else(|| CrmError::Configuration("crm.client_secret is missing".into()))?;
        let refresh_token = config
            .refresh_token
            .clone()
            .ok_or_else(|| CrmError::Configuration("crm.refresh_token is missing".into()))?;

        let client = Client::builder()
            .timeout(StdDuration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|error| CrmError::Transport(error.to_string()))?;
        let default_ttl = Duration::seconds(
            i64::try_from(config.default_token_ttl_secs)
                .unwrap_or(MAX_TOKEN_TTL_SECS)
                .min(MAX_TOKEN_TTL_SECS),
        );

        let refresher = OAuthRefresher {
            client: client.clone(),
            token_url: config.token_url.clone(),
            client_id,
            client_secret,
            refresh_token,
            default_ttl,
        };
        let mut tokens = TokenManager::new(Arc::new(refresher));
        if let Some(seed) = config.access_token.clone() {
            tokens = tokens.with_seed(seed, Utc::now(), default_ttl);
        }

        let deals = HttpDealApi {
            client,
            url: format!(
                "{}/{}",
                config.api_base_url.trim_end_matches('/'),
                config.deal_module.trim_matches('/')
            ),
        };

        Ok(Self::new(tokens, Arc::new(deals), config.lead_source.clone()))
    }

    /// Posts the lead as a deal; a 401 triggers one token refresh and one retry.
    pub async fn submit_lead(&self, lead: &LeadRecord) -> Result<Option<String>, CrmError> {
        let payload = build_deal_payload(lead, &self.lead_source);
        let bearer = self.tokens.bearer().await?;

        match self.deals.create_deal(&bearer, &payload).await {
            Err(CrmError::Unauthorized) => {
                warn!(
                    event_name = "crm.deal.unauthorized",
                    "crm rejected access token, refreshing once"
                );
                let fresh = self.tokens.refresh_rejected_at(&bearer, Utc::now()).await?;
                self.deals.create_deal(&fresh, &payload).await
            }
            other => other,
        }
    }
}

#[async_trait]
impl LeadSink for CrmClient {
    async fn submit(&self, topic: &Topic, lead: &LeadRecord) -> Result<LeadReceipt, LeadSinkError> {
        match self.submit_lead(lead).await {
            Ok(reference) => {
                info!(
                    event_name = "crm.deal.created",
                    topic = %topic.slug,
                    crm_reference = reference.as_deref().unwrap_or("-"),
                    "crm deal created"
                );
                Ok(LeadReceipt::Accepted { reference })
            }
            Err(crm_error) => {
                error!(
                    event_name = "crm.deal.failed",
                    topic = %topic.slug,
                    error = %crm_error,
                    "crm deal creation failed"
                );
                Err(LeadSinkError(crm_error.to_string()))
            }
        }
    }
}
