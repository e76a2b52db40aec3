use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use leadline_core::config::AssistantConfig;
use leadline_core::domain::session::ConversationHandle;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunId(pub String);

#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("assistant is not configured: {0}")]
    Configuration(String),
    #[error("assistant request failed: {0}")]
    Transport(String),
    #[error("assistant api returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("assistant run `{run_id}` ended with status `{status}`")]
    RunFailed { run_id: String, status: String },
    #[error("assistant run `{run_id}` did not finish within {timeout_secs}s")]
    Timeout { run_id: String, timeout_secs: u64 },
    #[error("assistant run produced no text reply")]
    EmptyReply,
    #[error("could not decode assistant response: {0}")]
    Decode(String),
}

/// Thread/run style assistant service.
#[async_trait]
pub trait AssistantClient: Send + Sync {
    async fn create_conversation(&self) -> Result<ConversationHandle, AssistantError>;

    async fn append_message(
        &self,
        handle: &ConversationHandle,
        text: &str,
    ) -> Result<(), AssistantError>;

    /// Starts a run of `assistant_id` on the conversation and waits for a terminal status.
    async fn run_and_wait(
        &self,
        handle: &ConversationHandle,
        assistant_id: &str,
    ) -> Result<RunId, AssistantError>;

    /// Newest assistant message produced by `run`.
    async fn latest_reply(
        &self,
        handle: &ConversationHandle,
        run: &RunId,
    ) -> Result<String, AssistantError>;

    async fn ask(
        &self,
        handle: &ConversationHandle,
        assistant_id: &str,
        text: &str,
    ) -> Result<String, AssistantError> {
        self.append_message(handle, text).await?;
        let run = self.run_and_wait(handle, assistant_id).await?;
        self.latest_reply(handle, &run).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    InProgress,
    Cancelling,
    Completed,
    RequiresAction,
    Cancelled,
    Failed,
    Incomplete,
    Expired,
}

impl RunStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "cancelling" => Some(Self::Cancelling),
            "completed" => Some(Self::Completed),
            "requires_action" => Some(Self::RequiresAction),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            "incomplete" => Some(Self::Incomplete),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::RequiresAction => "requires_action",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Incomplete => "incomplete",
            Self::Expired => "expired",
        }
    }

    /// `requires_action` counts as terminal: no tools are registered, so nobody would answer it.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::InProgress | Self::Cancelling)
    }
}

/// Polls `fetch_status` until the run reaches a terminal status or `timeout` elapses.
pub async fn wait_for_terminal<F, Fut>(
    run_id: &str,
    interval: Duration,
    timeout: Duration,
    mut fetch_status: F,
) -> Result<RunStatus, AssistantError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RunStatus, AssistantError>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = fetch_status().await?;
        if status.is_terminal() {
            return Ok(status);
        }
        if tokio::time::Instant::now() + interval > deadline {
            return Err(AssistantError::Timeout {
                run_id: run_id.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
        debug!(
            event_name = "assistant.run.polling",
            run_id,
            status = status.as_str(),
            "assistant run still active"
        );
        tokio::time::sleep(interval).await;
    }
}

/// Like [`wait_for_terminal`], but a run that times out is cancelled so the
/// thread accepts new messages again. A failed cancel is only logged.
pub async fn wait_or_cancel<F, Fut, C, CFut>(
    run_id: &str,
    interval: Duration,
    timeout: Duration,
    fetch_status: F,
    cancel: C,
) -> Result<RunStatus, AssistantError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RunStatus, AssistantError>>,
    C: FnOnce() -> CFut,
    CFut: Future<Output = Result<(), AssistantError>>,
{
    match wait_for_terminal(run_id, interval, timeout, fetch_status).await {
        Err(timed_out @ AssistantError::Timeout { .. }) => {
            match cancel().await {
                Ok(()) => warn!(
                    event_name = "assistant.run.cancelled",
                    run_id,
                    "cancelled assistant run after timeout"
                ),
                Err(error) => warn!(
                    event_name = "assistant.run.cancel_failed",
                    run_id,
                    error = %error,
                    "could not cancel timed out assistant run"
                ),
            }
            Err(timed_out)
        }
        other => other,
    }
}

/// Client for the OpenAI assistants v2 API.
pub struct OpenAiAssistantClient {
    client: Client,
    base_url: String,
    api_key: SecretString,
    poll_interval: Duration,
    run_timeout: Duration,
}

impl OpenAiAssistantClient {
    pub fn from_config(config: &AssistantConfig) -> Result<Self, AssistantError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| AssistantError::Configuration("assistant.api_key is missing".into()))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|error| AssistantError::Transport(error.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            run_timeout: Duration::from_secs(config.run_timeout_secs),
        })
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(self.api_key.expose_secret()).header("OpenAI-Beta", "assistants=v2")
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, AssistantError> {
        let response = self
            .request(builder)
            .send()
            .await
            .map_err(|error| AssistantError::Transport(error.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            warn!(event_name = "assistant.api.error", status, "assistant api returned an error");
            return Err(AssistantError::Api { status, body });
        }
        Ok(response)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, AssistantError> {
        response.json::<T>().await.map_err(|error| AssistantError::Decode(error.to_string()))
    }

    async fn fetch_run_status(
        &self,
        handle: &ConversationHandle,
        run_id: &str,
    ) -> Result<RunStatus, AssistantError> {
        let response = self
            .send(self.client.get(self.url(&format!("threads/{}/runs/{run_id}", handle.as_str()))))
            .await?;
        let run: RunObject = Self::decode(response).await?;
        RunStatus::parse(&run.status)
            .ok_or_else(|| AssistantError::Decode(format!("unknown run status `{}`", run.status)))
    }

    async fn cancel_run(
        &self,
        handle: &ConversationHandle,
        run_id: &str,
    ) -> Result<(), AssistantError> {
        self.send(
            self.client
                .post(self.url(&format!("threads/{}/runs/{run_id}/cancel", handle.as_str())))
                .json(&json!({})),
        )
        .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ThreadObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<MessageObject>,
}

#[derive(Debug, Deserialize)]
struct MessageObject {
    role: String,
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(rename = "type")]
    kind: String,
    text: Option<MessageText>,
}

#[derive(Debug, Deserialize)]
struct MessageText {
    value: String,
    #[serde(default)]
    annotations: Vec<TextAnnotation>,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    text: String,
}

/// Text of the newest assistant message, with file-citation markers removed.
fn reply_text(messages: MessageList) -> Result<String, AssistantError> {
    let message = messages
        .data
        .into_iter()
        .find(|message| message.role == "assistant")
        .ok_or(AssistantError::EmptyReply)?;

    let text = message
        .content
        .into_iter()
        .filter(|content| content.kind == "text")
        .find_map(|content| content.text)
        .ok_or(AssistantError::EmptyReply)?;

    let mut value = text.value;
    for annotation in text.annotations {
        if !annotation.text.is_empty() {
            value = value.replace(&annotation.text, "");
        }
    }
    Ok(value)
}

#[async_trait]
impl AssistantClient for OpenAiAssistantClient {
    async fn create_conversation(&self) -> Result<ConversationHandle, AssistantError> {
        let response = self.send(self.client.post(self.url("threads")).json(&json!({}))).await?;
        let thread: ThreadObject = Self::decode(response).await?;
        debug!(event_name = "assistant.thread.created", thread_id = %thread.id, "created thread");
        Ok(ConversationHandle(thread.id))
    }

    async fn append_message(
        &self,
        handle: &ConversationHandle,
        text: &str,
    ) -> Result<(), AssistantError> {
        self.send(
            self.client
                .post(self.url(&format!("threads/{}/messages", handle.as_str())))
                .json(&json!({ "role": "user", "content": text })),
        )
        .await?;
        Ok(())
    }

    async fn run_and_wait(
        &self,
        handle: &ConversationHandle,
        assistant_id: &str,
    ) -> Result<RunId, AssistantError> {
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("threads/{}/runs", handle.as_str())))
                    .json(&json!({ "assistant_id": assistant_id })),
            )
            .await?;
        let run: RunObject = Self::decode(response).await?;

        let initial = RunStatus::parse(&run.status);
        let status = match initial {
            Some(status) if status.is_terminal() => status,
            _ => {
                let run_id = run.id.as_str();
                wait_or_cancel(
                    run_id,
                    self.poll_interval,
                    self.run_timeout,
                    move || self.fetch_run_status(handle, run_id),
                    move || self.cancel_run(handle, run_id),
                )
                .await?
            }
        };

        if status != RunStatus::Completed {
            return Err(AssistantError::RunFailed {
                run_id: run.id,
                status: status.as_str().to_string(),
            });
        }
        Ok(RunId(run.id))
    }

    async fn latest_reply(
        &self,
        handle: &ConversationHandle,
        run: &RunId,
    ) -> Result<String, AssistantError> {
        let response = self
            .send(
                self.client
                    .get(self.url(&format!("threads/{}/messages", handle.as_str())))
                    .query(&[("run_id", run.0.as_str()), ("order", "desc"), ("limit", "20")]),
            )
            .await?;
        let messages: MessageList = Self::decode(response).await?;
        reply_text(messages)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use secrecy::SecretString;

    use leadline_core::config::AssistantConfig;

    use super::{
        reply_text, wait_for_terminal, wait_or_cancel, AssistantError, MessageList,
        OpenAiAssistantClient, RunStatus,
    };

    #[test]
    fn only_active_statuses_keep_polling() {
        for status in ["queued", "in_progress", "cancelling"] {
            let parsed = RunStatus::parse(status).expect("known status");
            assert!(!parsed.is_terminal(), "{status} should not be terminal");
        }
        for status in ["completed", "failed", "expired", "requires_action", "incomplete"] {
            let parsed = RunStatus::parse(status).expect("known status");
            assert!(parsed.is_terminal(), "{status} should be terminal");
        }
        assert_eq!(RunStatus::parse("paused"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_stops_at_first_terminal_status() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let status = wait_for_terminal(
            "run_1",
            Duration::from_millis(500),
            Duration::from_secs(30),
            move || {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    Ok(if call < 2 { RunStatus::InProgress } else { RunStatus::Completed })
                }
            },
        )
        .await
        .expect("run completes");

        assert_eq!(status, RunStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_times_out_for_stuck_runs() {
        let error = wait_for_terminal(
            "run_stuck",
            Duration::from_secs(1),
            Duration::from_secs(3),
            || async { Ok(RunStatus::Queued) },
        )
        .await
        .expect_err("run never finishes");

        assert!(matches!(
            error,
            AssistantError::Timeout { ref run_id, timeout_secs: 3 } if run_id == "run_stuck"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_run_is_cancelled_once() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cancels);

        let error = wait_or_cancel(
            "run_stuck",
            Duration::from_secs(1),
            Duration::from_secs(3),
            || async { Ok(RunStatus::InProgress) },
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await
        .expect_err("run never finishes");

        assert!(matches!(error, AssistantError::Timeout { .. }));
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_cancel_still_reports_the_timeout() {
        let error = wait_or_cancel(
            "run_stuck",
            Duration::from_secs(1),
            Duration::from_secs(2),
            || async { Ok(RunStatus::Queued) },
            || async { Err(AssistantError::Api { status: 400, body: "already done".to_string() }) },
        )
        .await
        .expect_err("run never finishes");

        assert!(matches!(error, AssistantError::Timeout { timeout_secs: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn finished_runs_are_not_cancelled() {
        let cancels = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cancels);

        let status = wait_or_cancel(
            "run_1",
            Duration::from_millis(500),
            Duration::from_secs(5),
            || async { Ok(RunStatus::Failed) },
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
        )
        .await
        .expect("terminal status");

        assert_eq!(status, RunStatus::Failed);
        assert_eq!(cancels.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reply_text_takes_newest_assistant_message_and_strips_citations() {
        let messages: MessageList = serde_json::from_value(serde_json::json!({
            "data": [
                {
                    "role": "assistant",
                    "content": [{
                        "type": "text",
                        "text": {
                            "value": "Laut LAGA PN 98 gilt dies【4:0†source】.",
                            "annotations": [{ "text": "【4:0†source】" }]
                        }
                    }]
                },
                {
                    "role": "user",
                    "content": [{ "type": "text", "text": { "value": "Frage", "annotations": [] } }]
                }
            ]
        }))
        .expect("valid message list");

        assert_eq!(reply_text(messages).expect("reply"), "Laut LAGA PN 98 gilt dies.");
    }

    #[test]
    fn reply_text_without_assistant_message_is_empty_reply() {
        let messages: MessageList = serde_json::from_value(serde_json::json!({
            "data": [{ "role": "user", "content": [] }]
        }))
        .expect("valid message list");

        assert!(matches!(reply_text(messages), Err(AssistantError::EmptyReply)));
    }

    #[test]
    fn client_requires_api_key() {
        let mut config = AssistantConfig {
            api_key: None,
            base_url: "https://api.openai.com/v1/".to_string(),
            poll_interval_ms: 500,
            run_timeout_secs: 60,
            request_timeout_secs: 30,
        };
        assert!(matches!(
            OpenAiAssistantClient::from_config(&config),
            Err(AssistantError::Configuration(_))
        ));

        config.api_key = Some(SecretString::from("sk-test".to_string()));
        let client = OpenAiAssistantClient::from_config(&config).expect("client");
        assert_eq!(client.url("threads"), "https://api.openai.com/v1/threads");
    }
}
