//! Chat endpoints: one handler shared by every topic.
//!
//! Each topic answers on its legacy path (`/askberater`) and on
//! `/api/v1/topics/{topic}/messages`. The session travels in an httpOnly
//! cookie; a client that cannot keep cookies may echo `threadId` instead.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use leadline_agent::runtime::{ChatRuntime, LeadOutcome, TurnOutcome, TurnRequest};
use leadline_core::config::ServerConfig;
use leadline_core::domain::chat_log::{
    ChatEvent, ChatLogEntry, LeadSubmission, SubmissionStatus, VisitorContext,
};
use leadline_core::domain::session::SessionId;
use leadline_core::domain::topic::Topic;
use leadline_core::errors::{ApplicationError, DomainError, InterfaceError};
use leadline_db::repositories::{ChatLogRepository, LeadSubmissionRepository};

pub const SESSION_COOKIE: &str = "leadline_session";

#[derive(Clone, Copy, Debug)]
pub struct CookieSettings {
    pub cross_site: bool,
    pub max_age_secs: u64,
}

impl From<&ServerConfig> for CookieSettings {
    fn from(server: &ServerConfig) -> Self {
        Self {
            cross_site: server.cross_site_cookies,
            max_age_secs: server.session_cookie_max_age_secs,
        }
    }
}

#[derive(Clone)]
pub struct ChatState {
    runtime: Arc<ChatRuntime>,
    topics: Arc<HashMap<String, Topic>>,
    chat_log: Arc<dyn ChatLogRepository>,
    submissions: Arc<dyn LeadSubmissionRepository>,
    cookies: CookieSettings,
}

impl ChatState {
    pub fn new(
        runtime: Arc<ChatRuntime>,
        topics: Vec<Topic>,
        chat_log: Arc<dyn ChatLogRepository>,
        submissions: Arc<dyn LeadSubmissionRepository>,
        cookies: CookieSettings,
    ) -> Self {
        let topics = topics.into_iter().map(|topic| (topic.slug.clone(), topic)).collect();
        Self { runtime, topics: Arc::new(topics), chat_log, submissions, cookies }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "threadId")]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub thread_id: String,
}

/// Error body; `response` carries the apology so widgets reading it show text.
#[derive(Clone, Debug, Serialize)]
struct ErrorBody<'a> {
    response: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<&'a str>,
    error: &'a str,
    correlation_id: &'a str,
}

/// Result of a best-effort write; failures are logged, never returned to the visitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogOutcome {
    Written,
    NotNeeded,
    Failed,
}

pub fn router(state: ChatState) -> Router {
    let mut topics: Vec<&Topic> = state.topics.values().collect();
    topics.sort_by(|left, right| left.slug.cmp(&right.slug));
    let legacy: Vec<(String, String)> =
        topics.into_iter().map(|topic| (topic.legacy_route(), topic.slug.clone())).collect();

    let mut router = Router::new().route("/api/v1/topics/{topic}/messages", post(ask_topic));
    for (path, slug) in legacy {
        router = router.route(
            &path,
            post(
                move |State(state): State<ChatState>,
                      headers: HeaderMap,
                      body: Result<Json<ChatRequest>, JsonRejection>| {
                    let slug = slug.clone();
                    async move { handle_chat(state, &slug, headers, body).await }
                },
            ),
        );
    }
    router.with_state(state)
}

async fn ask_topic(
    State(state): State<ChatState>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    handle_chat(state, &topic, headers, body).await
}

async fn handle_chat(
    state: ChatState,
    slug: &str,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let correlation_id = format!("req-{}", Uuid::new_v4().simple());

    let Some(topic) = state.topics.get(slug) else {
        let error = ApplicationError::from(DomainError::UnknownTopic(slug.to_string()));
        return error_response(error.into_interface(correlation_id), None);
    };

    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let error = ApplicationError::from(DomainError::InvalidRequest(rejection.body_text()));
            return error_response(error.into_interface(correlation_id), None);
        }
    };
    let Some(message) = request.message.clone().filter(|message| !message.trim().is_empty())
    else {
        let error = ApplicationError::from(DomainError::InvalidRequest(
            "message must not be empty".to_string(),
        ));
        return error_response(error.into_interface(correlation_id), None);
    };

    let visitor = VisitorContext {
        ip_address: request.ip_address.clone().or_else(|| forwarded_for(&headers)),
        region: request.region.clone(),
        city: request.city.clone(),
    };
    let turn = TurnRequest {
        message: message.clone(),
        session_cookie: session_cookie(&headers),
        thread_id: request.thread_id.clone(),
        visitor: visitor.clone(),
    };

    match state.runtime.handle_turn(topic, turn).await {
        Ok(outcome) => {
            let mut entry = ChatLogEntry::new(message, outcome.event());
            entry.session_id = Some(outcome.session_id.to_string());
            entry.thread_id = Some(outcome.thread_id.to_string());
            entry.assistant_reply = Some(outcome.assistant_reply.clone());
            entry.visitor = visitor;
            let logged = log_exchange(&state, topic, &entry, &correlation_id).await;
            let audited = record_submission(&state, topic, &outcome, &correlation_id).await;
            debug!(
                event_name = "chat.request.completed",
                correlation_id = %correlation_id,
                topic = %topic.slug,
                session_id = %outcome.session_id,
                event = outcome.event().as_str(),
                log_written = logged == LogOutcome::Written,
                audit = ?audited,
                "chat request completed"
            );

            let body = ChatResponse {
                response: outcome.reply,
                thread_id: outcome.thread_id.to_string(),
            };
            let response = (StatusCode::OK, Json(body)).into_response();
            with_session_cookie(response, &outcome.session_id, state.cookies)
        }
        Err(turn_error) => {
            error!(
                event_name = "chat.turn.failed",
                correlation_id = %correlation_id,
                topic = %topic.slug,
                session_id = turn_error.session_id.as_ref().map(SessionId::as_str).unwrap_or("-"),
                error = %turn_error,
                "assistant request failed"
            );
            let mut entry = ChatLogEntry::new(message, ChatEvent::AssistantFailed);
            entry.session_id = turn_error.session_id.as_ref().map(ToString::to_string);
            entry.thread_id = turn_error.thread_id.as_ref().map(ToString::to_string);
            entry.visitor = visitor;
            log_exchange(&state, topic, &entry, &correlation_id).await;

            let interface = ApplicationError::Assistant(turn_error.source.to_string())
                .into_interface(correlation_id);
            let thread_id = turn_error.thread_id.as_ref().map(|handle| handle.as_str());
            let response = error_response(interface, thread_id);
            match &turn_error.session_id {
                Some(session_id) => with_session_cookie(response, session_id, state.cookies),
                None => response,
            }
        }
    }
}

async fn log_exchange(
    state: &ChatState,
    topic: &Topic,
    entry: &ChatLogEntry,
    correlation_id: &str,
) -> LogOutcome {
    match state.chat_log.append(&topic.log_table, entry).await {
        Ok(()) => LogOutcome::Written,
        Err(log_error) => {
            warn!(
                event_name = "chat.log.write_failed",
                correlation_id = %correlation_id,
                topic = %topic.slug,
                table = %topic.log_table,
                error = %log_error,
                "chat log write failed"
            );
            LogOutcome::Failed
        }
    }
}

async fn record_submission(
    state: &ChatState,
    topic: &Topic,
    outcome: &TurnOutcome,
    correlation_id: &str,
) -> LogOutcome {
    let (status, crm_reference, failure) = match &outcome.lead {
        LeadOutcome::Submitted { reference } => (SubmissionStatus::Submitted, reference.clone(), None),
        LeadOutcome::Skipped => (SubmissionStatus::Skipped, None, None),
        LeadOutcome::SubmissionFailed { reason } => {
            (SubmissionStatus::Failed, None, Some(reason.clone()))
        }
        _ => return LogOutcome::NotNeeded,
    };
    let fields_json = outcome
        .lead_record
        .as_ref()
        .and_then(|record| serde_json::to_string(record).ok())
        .unwrap_or_else(|| "{}".to_string());

    let submission = LeadSubmission {
        id: format!("LEAD-{}", Uuid::new_v4().simple()),
        topic: topic.slug.clone(),
        session_id: outcome.session_id.to_string(),
        status,
        crm_reference,
        error: failure,
        fields_json,
        created_at: Utc::now(),
    };

    match state.submissions.record(&submission).await {
        Ok(()) => LogOutcome::Written,
        Err(audit_error) => {
            warn!(
                event_name = "lead.audit.write_failed",
                correlation_id = %correlation_id,
                topic = %topic.slug,
                error = %audit_error,
                "lead submission audit write failed"
            );
            LogOutcome::Failed
        }
    }
}

fn error_response(error: InterfaceError, thread_id: Option<&str>) -> Response {
    let status = match &error {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = ErrorBody {
        response: error.user_message(),
        thread_id,
        error: error.user_message(),
        correlation_id: error.correlation_id(),
    };
    (status, Json(body)).into_response()
}

/// Value of our session cookie, if the browser sent one.
pub fn session_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

pub fn session_cookie_value(session_id: &SessionId, cookies: CookieSettings) -> String {
    let same_site = if cookies.cross_site { "SameSite=None; Secure" } else { "SameSite=Lax" };
    format!(
        "{SESSION_COOKIE}={session_id}; Path=/; Max-Age={}; HttpOnly; {same_site}",
        cookies.max_age_secs
    )
}

fn with_session_cookie(
    mut response: Response,
    session_id: &SessionId,
    cookies: CookieSettings,
) -> Response {
    match HeaderValue::from_str(&session_cookie_value(session_id, cookies)) {
        Ok(value) => {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
        Err(cookie_error) => {
            warn!(
                event_name = "chat.session.cookie_invalid",
                session_id = %session_id,
                error = %cookie_error,
                "could not encode session cookie"
            );
        }
    }
    response
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
