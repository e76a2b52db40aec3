use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use leadline_core::domain::chat_log::{ChatEvent, VisitorContext};
use leadline_core::domain::lead::{LeadField, LeadRecord};
use leadline_core::domain::session::{ConversationHandle, SessionId};
use leadline_core::domain::topic::Topic;

use crate::assistant::{AssistantClient, AssistantError};
use crate::conversation::{ExtractionError, FieldExtractor, ReplyClassifier};
use crate::session::SessionStore;

pub const MISSING_SUMMARY_REPLY: &str = "Entschuldigung, ich konnte keine Zusammenfassung Ihrer Anfrage finden. Könnten Sie mir Ihre Angaben bitte noch einmal nennen?";
pub const EXTRACTION_FAILED_REPLY: &str = "Entschuldigung, in der Zusammenfassung fehlen noch Angaben. Könnten Sie Ihre Kontaktdaten und Ihr Anliegen bitte noch einmal vollständig nennen?";
pub const SUBMISSION_FAILED_REPLY: &str = "Entschuldigung, Ihre Anfrage konnte gerade nicht weitergeleitet werden. Bitte versuchen Sie es später erneut.";

/// Where confirmed leads go.
#[async_trait]
pub trait LeadSink: Send + Sync {
    async fn submit(&self, topic: &Topic, lead: &LeadRecord) -> Result<LeadReceipt, LeadSinkError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeadReceipt {
    Accepted { reference: Option<String> },
    /// The sink is switched off; nothing left the process.
    Skipped,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct LeadSinkError(pub String);

/// Sink used when no CRM is configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLeadSink;

#[async_trait]
impl LeadSink for NoopLeadSink {
    async fn submit(
        &self,
        _topic: &Topic,
        _lead: &LeadRecord,
    ) -> Result<LeadReceipt, LeadSinkError> {
        Ok(LeadReceipt::Skipped)
    }
}

#[derive(Clone, Debug, Default)]
pub struct TurnRequest {
    pub message: String,
    pub session_cookie: Option<String>,
    pub thread_id: Option<String>,
    pub visitor: VisitorContext,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeadOutcome {
    NotTriggered,
    Submitted { reference: Option<String> },
    Skipped,
    SubmissionFailed { reason: String },
    ExtractionFailed { missing: Vec<LeadField> },
    MissingSummary,
}

#[derive(Clone, Debug)]
pub struct TurnOutcome {
    pub session_id: SessionId,
    pub session_created: bool,
    pub thread_id: ConversationHandle,
    /// Text returned to the visitor.
    pub reply: String,
    /// Text the assistant produced, kept for the log even when `reply` is an apology.
    pub assistant_reply: String,
    pub summary_stored: bool,
    pub lead: LeadOutcome,
    pub lead_record: Option<LeadRecord>,
}

impl TurnOutcome {
    pub fn event(&self) -> ChatEvent {
        match &self.lead {
            LeadOutcome::Submitted { .. } => ChatEvent::LeadSubmitted,
            LeadOutcome::Skipped => ChatEvent::LeadSkipped,
            LeadOutcome::SubmissionFailed { .. } => ChatEvent::LeadSubmissionFailed,
            LeadOutcome::ExtractionFailed { .. } => ChatEvent::ExtractionFailed,
            LeadOutcome::MissingSummary => ChatEvent::MissingSummary,
            LeadOutcome::NotTriggered if self.summary_stored => ChatEvent::SummaryStored,
            LeadOutcome::NotTriggered => ChatEvent::Exchange,
        }
    }
}

/// Assistant failure, with whatever session context existed when it happened.
#[derive(Debug, Error)]
#[error("chat turn failed: {source}")]
pub struct TurnError {
    pub session_id: Option<SessionId>,
    pub thread_id: Option<ConversationHandle>,
    #[source]
    pub source: AssistantError,
}

pub struct ChatRuntime {
    assistant: Arc<dyn AssistantClient>,
    sessions: Arc<SessionStore>,
    lead_sink: Arc<dyn LeadSink>,
    classifier: ReplyClassifier,
    extractor: FieldExtractor,
    surface_submission_failure: bool,
}

impl ChatRuntime {
    pub fn new(
        assistant: Arc<dyn AssistantClient>,
        sessions: Arc<SessionStore>,
        lead_sink: Arc<dyn LeadSink>,
    ) -> Self {
        Self {
            assistant,
            sessions,
            lead_sink,
            classifier: ReplyClassifier::default(),
            extractor: FieldExtractor::default(),
            surface_submission_failure: false,
        }
    }

    pub fn with_surface_submission_failure(mut self, surface: bool) -> Self {
        self.surface_submission_failure = surface;
        self
    }

    pub fn with_classifier(mut self, classifier: ReplyClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_extractor(mut self, extractor: FieldExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Runs one visitor message through the assistant and the lead pipeline.
    pub async fn handle_turn(
        &self,
        topic: &Topic,
        request: TurnRequest,
    ) -> Result<TurnOutcome, TurnError> {
        let resolved = self
            .sessions
            .resolve(
                request.session_cookie.as_deref(),
                request.thread_id.as_deref(),
                self.assistant.as_ref(),
            )
            .await
            .map_err(|source| TurnError { session_id: None, thread_id: None, source })?;

        let mut session = resolved.session.lock().await;
        let handle = session.conversation_handle().clone();

        let assistant_reply = self
            .assistant
            .ask(&handle, &topic.assistant_id, &request.message)
            .await
            .map_err(|source| TurnError {
                session_id: Some(resolved.id.clone()),
                thread_id: Some(handle.clone()),
                source,
            })?;

        let classification = self.classifier.classify(&assistant_reply);
        if classification.is_summary {
            session.remember_summary(assistant_reply.clone());
            info!(
                event_name = "chat.summary.stored",
                topic = %topic.slug,
                session_id = %resolved.id,
                "stored pending summary"
            );
        }

        let mut lead_record = None;
        let lead = if !classification.is_confirmation {
            LeadOutcome::NotTriggered
        } else if let Some(summary) = session.pending_summary.clone() {
            match self.extractor.extract(&summary) {
                Ok(record) => {
                    session.merge_extracted(&record);
                    let outcome = self.submit(topic, &resolved.id, &record).await;
                    lead_record = Some(record);
                    outcome
                }
                Err(ExtractionError::MissingFields { missing }) => {
                    warn!(
                        event_name = "chat.lead.extraction_failed",
                        topic = %topic.slug,
                        session_id = %resolved.id,
                        missing = ?missing,
                        "confirmed summary lacks required fields"
                    );
                    LeadOutcome::ExtractionFailed { missing }
                }
            }
        } else {
            warn!(
                event_name = "chat.lead.missing_summary",
                topic = %topic.slug,
                session_id = %resolved.id,
                "confirmation without a stored summary"
            );
            LeadOutcome::MissingSummary
        };
        session.touch();
        drop(session);

        let reply = match &lead {
            LeadOutcome::MissingSummary => MISSING_SUMMARY_REPLY.to_string(),
            LeadOutcome::ExtractionFailed { .. } => EXTRACTION_FAILED_REPLY.to_string(),
            LeadOutcome::SubmissionFailed { .. } if self.surface_submission_failure => {
                SUBMISSION_FAILED_REPLY.to_string()
            }
            _ => assistant_reply.clone(),
        };

        let outcome = TurnOutcome {
            session_id: resolved.id,
            session_created: resolved.created,
            thread_id: handle,
            reply,
            assistant_reply,
            summary_stored: classification.is_summary,
            lead,
            lead_record,
        };
        info!(
            event_name = "chat.turn.completed",
            topic = %topic.slug,
            session_id = %outcome.session_id,
            thread_id = %outcome.thread_id,
            outcome = outcome.event().as_str(),
            "chat turn completed"
        );
        Ok(outcome)
    }

    async fn submit(&self, topic: &Topic, session_id: &SessionId, record: &LeadRecord) -> LeadOutcome {
        match self.lead_sink.submit(topic, record).await {
            Ok(LeadReceipt::Accepted { reference }) => {
                info!(
                    event_name = "chat.lead.submitted",
                    topic = %topic.slug,
                    session_id = %session_id,
                    crm_reference = reference.as_deref().unwrap_or("-"),
                    "lead handed to crm"
                );
                LeadOutcome::Submitted { reference }
            }
            Ok(LeadReceipt::Skipped) => {
                info!(
                    event_name = "chat.lead.skipped",
                    topic = %topic.slug,
                    session_id = %session_id,
                    "crm disabled, lead only logged"
                );
                LeadOutcome::Skipped
            }
            Err(error) => {
                warn!(
                    event_name = "chat.lead.submission_failed",
                    topic = %topic.slug,
                    session_id = %session_id,
                    error = %error,
                    "lead submission failed"
                );
                LeadOutcome::SubmissionFailed { reason: error.to_string() }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use leadline_core::domain::chat_log::ChatEvent;
    use leadline_core::domain::lead::{LeadField, LeadRecord};
    use leadline_core::domain::session::ConversationHandle;
    use leadline_core::domain::topic::Topic;

    use super::{
        ChatRuntime, LeadOutcome, LeadReceipt, LeadSink, LeadSinkError, NoopLeadSink,
        TurnRequest, EXTRACTION_FAILED_REPLY, MISSING_SUMMARY_REPLY, SUBMISSION_FAILED_REPLY,
    };
    use crate::assistant::{AssistantClient, AssistantError, RunId};
    use crate::session::SessionStore;

    const SUMMARY: &str = "Hier ist die Zusammenfassung Ihrer Anfrage:\n- **Vorname**: Max\n- **Nachname**: Mustermann\n- **Email**: max@x.de\n- **Telefon**: 123\n- **Postleitzahl**: 12345\n- **Menge**: 5\n- **Beschreibung**: Erdaushub\nIst das so korrekt?";
    const CONFIRMATION: &str =
        "Vielen Dank! Dann werde ich die Anfrage so an meine Kollegen weiterleiten.";

    #[derive(Default)]
    struct ScriptedAssistant {
        replies: Mutex<VecDeque<Result<String, AssistantError>>>,
        asked: Mutex<Vec<(String, String, String)>>,
        threads: Mutex<usize>,
    }

    impl ScriptedAssistant {
        fn with_replies(replies: impl IntoIterator<Item = &'static str>) -> Self {
            let assistant = Self::default();
            assistant
                .replies
                .lock()
                .expect("lock")
                .extend(replies.into_iter().map(|reply| Ok(reply.to_string())));
            assistant
        }
    }

    #[async_trait]
    impl AssistantClient for ScriptedAssistant {
        async fn create_conversation(&self) -> Result<ConversationHandle, AssistantError> {
            let mut threads = self.threads.lock().expect("lock");
            *threads += 1;
            Ok(ConversationHandle(format!("thread_{}", *threads)))
        }

        async fn append_message(
            &self,
            handle: &ConversationHandle,
            text: &str,
        ) -> Result<(), AssistantError> {
            self.asked.lock().expect("lock").push((
                handle.0.clone(),
                String::new(),
                text.to_string(),
            ));
            Ok(())
        }

        async fn run_and_wait(
            &self,
            _handle: &ConversationHandle,
            assistant_id: &str,
        ) -> Result<RunId, AssistantError> {
            if let Some(last) = self.asked.lock().expect("lock").last_mut() {
                last.1 = assistant_id.to_string();
            }
            Ok(RunId("run_1".to_string()))
        }

        async fn latest_reply(
            &self,
            _handle: &ConversationHandle,
            _run: &RunId,
        ) -> Result<String, AssistantError> {
            self.replies.lock().expect("lock").pop_front().unwrap_or(Err(AssistantError::EmptyReply))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        fail: bool,
        received: Mutex<Vec<(String, LeadRecord)>>,
    }

    #[async_trait]
    impl LeadSink for RecordingSink {
        async fn submit(
            &self,
            topic: &Topic,
            lead: &LeadRecord,
        ) -> Result<LeadReceipt, LeadSinkError> {
            self.received.lock().expect("lock").push((topic.slug.clone(), lead.clone()));
            if self.fail {
                Err(LeadSinkError("crm returned 500".to_string()))
            } else {
                Ok(LeadReceipt::Accepted { reference: Some("deal-1".to_string()) })
            }
        }
    }

    fn topic(slug: &str) -> Topic {
        Topic::new(slug, format!("asst_{slug}"), format!("chat_{slug}")).expect("topic")
    }

    fn request(message: &str, cookie: Option<&str>) -> TurnRequest {
        TurnRequest {
            message: message.to_string(),
            session_cookie: cookie.map(str::to_string),
            ..TurnRequest::default()
        }
    }

    fn runtime(assistant: Arc<ScriptedAssistant>, sink: Arc<dyn LeadSink>) -> ChatRuntime {
        ChatRuntime::new(assistant, Arc::new(SessionStore::new()), sink)
    }

    #[tokio::test]
    async fn plain_exchange_relays_reply_and_keeps_the_thread() {
        let assistant = Arc::new(ScriptedAssistant::with_replies(["Guten Tag!", "Gern."]));
        let runtime = runtime(Arc::clone(&assistant), Arc::new(NoopLeadSink));
        let berater = topic("berater");

        let first = runtime.handle_turn(&berater, request("Hallo", None)).await.expect("turn");
        assert!(first.session_created);
        assert_eq!(first.reply, "Guten Tag!");
        assert_eq!(first.lead, LeadOutcome::NotTriggered);
        assert_eq!(first.event(), ChatEvent::Exchange);

        let second = runtime
            .handle_turn(&berater, request("Danke", Some(first.session_id.as_str())))
            .await
            .expect("turn");
        assert!(!second.session_created);
        assert_eq!(second.thread_id, first.thread_id);

        let asked = assistant.asked.lock().expect("lock").clone();
        assert_eq!(
            asked,
            vec![
                ("thread_1".to_string(), "asst_berater".to_string(), "Hallo".to_string()),
                ("thread_1".to_string(), "asst_berater".to_string(), "Danke".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn summary_then_confirmation_submits_the_lead() {
        let assistant = Arc::new(ScriptedAssistant::with_replies([SUMMARY, CONFIRMATION]));
        let sink = Arc::new(RecordingSink::default());
        let runtime = runtime(assistant, sink.clone());
        let berater = topic("berater");

        let summary_turn =
            runtime.handle_turn(&berater, request("Das war alles", None)).await.expect("turn");
        assert!(summary_turn.summary_stored);
        assert_eq!(summary_turn.event(), ChatEvent::SummaryStored);
        assert!(sink.received.lock().expect("lock").is_empty());

        let confirm_turn = runtime
            .handle_turn(&berater, request("Ja, passt", Some(summary_turn.session_id.as_str())))
            .await
            .expect("turn");
        assert_eq!(confirm_turn.lead, LeadOutcome::Submitted { reference: Some("deal-1".into()) });
        assert_eq!(confirm_turn.reply, CONFIRMATION);

        let received = sink.received.lock().expect("lock").clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, "berater");
        assert_eq!(received[0].1.get(LeadField::FirstName), Some("Max"));

        let session = runtime
            .sessions()
            .get(&confirm_turn.session_id)
            .await
            .expect("session stored");
        let session = session.lock().await;
        assert_eq!(session.extracted_fields.get("zip_code").map(String::as_str), Some("12345"));
        assert!(session.pending_summary.is_some(), "summary stays for later confirmations");
    }

    #[tokio::test]
    async fn confirmation_without_summary_apologises() {
        let assistant = Arc::new(ScriptedAssistant::with_replies([CONFIRMATION]));
        let sink = Arc::new(RecordingSink::default());
        let runtime = runtime(assistant, sink.clone());

        let outcome =
            runtime.handle_turn(&topic("berater"), request("Ja", None)).await.expect("turn");

        assert_eq!(outcome.lead, LeadOutcome::MissingSummary);
        assert_eq!(outcome.reply, MISSING_SUMMARY_REPLY);
        assert_eq!(outcome.assistant_reply, CONFIRMATION);
        assert!(sink.received.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn incomplete_summary_apologises_and_skips_the_crm() {
        let assistant = Arc::new(ScriptedAssistant::with_replies([
            "Zusammenfassung:\nVorname: Max\nNachname: Mustermann",
            CONFIRMATION,
        ]));
        let sink = Arc::new(RecordingSink::default());
        let runtime = runtime(assistant, sink.clone());
        let berater = topic("berater");

        let first = runtime.handle_turn(&berater, request("Fertig", None)).await.expect("turn");
        let second = runtime
            .handle_turn(&berater, request("Ja", Some(first.session_id.as_str())))
            .await
            .expect("turn");

        assert!(matches!(
            second.lead,
            LeadOutcome::ExtractionFailed { ref missing } if missing.contains(&LeadField::Email)
        ));
        assert_eq!(second.reply, EXTRACTION_FAILED_REPLY);
        assert!(sink.received.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn reply_that_is_summary_and_confirmation_submits_itself() {
        let combined: &'static str = Box::leak(format!("{SUMMARY}\n{CONFIRMATION}").into_boxed_str());
        let assistant = Arc::new(ScriptedAssistant::with_replies([combined]));
        let sink = Arc::new(RecordingSink::default());
        let runtime = runtime(assistant, sink.clone());

        let outcome =
            runtime.handle_turn(&topic("berater"), request("Ja", None)).await.expect("turn");

        assert!(outcome.summary_stored);
        assert!(matches!(outcome.lead, LeadOutcome::Submitted { .. }));
        assert_eq!(sink.received.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn submission_failure_keeps_reply_unless_configured() {
        for (surface, expected_reply) in [(false, CONFIRMATION), (true, SUBMISSION_FAILED_REPLY)] {
            let assistant = Arc::new(ScriptedAssistant::with_replies([SUMMARY, CONFIRMATION]));
            let sink = Arc::new(RecordingSink { fail: true, ..RecordingSink::default() });
            let runtime = runtime(assistant, sink).with_surface_submission_failure(surface);
            let berater = topic("berater");

            let first = runtime.handle_turn(&berater, request("x", None)).await.expect("turn");
            let second = runtime
                .handle_turn(&berater, request("Ja", Some(first.session_id.as_str())))
                .await
                .expect("turn");

            assert_eq!(
                second.lead,
                LeadOutcome::SubmissionFailed { reason: "crm returned 500".to_string() }
            );
            assert_eq!(second.event(), ChatEvent::LeadSubmissionFailed);
            assert_eq!(second.reply, expected_reply);
        }
    }

    #[tokio::test]
    async fn disabled_crm_marks_lead_skipped() {
        let assistant = Arc::new(ScriptedAssistant::with_replies([SUMMARY, CONFIRMATION]));
        let runtime = runtime(assistant, Arc::new(NoopLeadSink));
        let berater = topic("berater");

        let first = runtime.handle_turn(&berater, request("x", None)).await.expect("turn");
        let second = runtime
            .handle_turn(&berater, request("Ja", Some(first.session_id.as_str())))
            .await
            .expect("turn");

        assert_eq!(second.lead, LeadOutcome::Skipped);
        assert_eq!(second.event(), ChatEvent::LeadSkipped);
        assert!(second.lead_record.is_some());
    }

    #[tokio::test]
    async fn topics_share_the_session_thread_but_use_their_own_assistant() {
        let assistant = Arc::new(ScriptedAssistant::with_replies(["a", "b"]));
        let runtime = runtime(Arc::clone(&assistant), Arc::new(NoopLeadSink));

        let first =
            runtime.handle_turn(&topic("berater"), request("1", None)).await.expect("turn");
        runtime
            .handle_turn(&topic("laga_pn_98"), request("2", Some(first.session_id.as_str())))
            .await
            .expect("turn");

        let asked = assistant.asked.lock().expect("lock").clone();
        assert_eq!(asked[1].0, "thread_1");
        assert_eq!(asked[1].1, "asst_laga_pn_98");
    }

    #[tokio::test]
    async fn assistant_failure_carries_session_context() {
        let assistant = Arc::new(ScriptedAssistant::default());
        let runtime = runtime(assistant, Arc::new(NoopLeadSink));

        let error = runtime
            .handle_turn(&topic("berater"), request("Hallo", None))
            .await
            .expect_err("no scripted reply");

        assert!(error.session_id.is_some());
        assert_eq!(error.thread_id.as_ref().map(ConversationHandle::as_str), Some("thread_1"));
        assert!(matches!(error.source, AssistantError::EmptyReply));
    }

    /// Blocks the first append of `Fertig` until `gate` is notified and
    /// records every assistant call in order.
    #[derive(Default)]
    struct GatedAssistant {
        gate: Notify,
        events: Mutex<Vec<String>>,
        last_text: Mutex<String>,
    }

    impl GatedAssistant {
        fn push(&self, event: String) {
            self.events.lock().expect("lock").push(event);
        }
    }

    #[async_trait]
    impl AssistantClient for GatedAssistant {
        async fn create_conversation(&self) -> Result<ConversationHandle, AssistantError> {
            Ok(ConversationHandle("thread_1".to_string()))
        }

        async fn append_message(
            &self,
            _handle: &ConversationHandle,
            text: &str,
        ) -> Result<(), AssistantError> {
            self.push(format!("append:{text}"));
            if text == "Fertig" {
                self.gate.notified().await;
            }
            *self.last_text.lock().expect("lock") = text.to_string();
            Ok(())
        }

        async fn run_and_wait(
            &self,
            _handle: &ConversationHandle,
            _assistant_id: &str,
        ) -> Result<RunId, AssistantError> {
            let text = self.last_text.lock().expect("lock").clone();
            self.push(format!("run:{text}"));
            Ok(RunId(format!("run_{text}")))
        }

        async fn latest_reply(
            &self,
            _handle: &ConversationHandle,
            _run: &RunId,
        ) -> Result<String, AssistantError> {
            let text = self.last_text.lock().expect("lock").clone();
            self.push(format!("reply:{text}"));
            Ok(match text.as_str() {
                "Fertig" => SUMMARY,
                "Ja" => CONFIRMATION,
                _ => "Guten Tag!",
            }
            .to_string())
        }
    }

    #[tokio::test]
    async fn concurrent_turns_of_one_session_run_one_after_another() {
        let assistant = Arc::new(GatedAssistant::default());
        let sink = Arc::new(RecordingSink::default());
        let runtime = ChatRuntime::new(
            Arc::clone(&assistant) as Arc<dyn AssistantClient>,
            Arc::new(SessionStore::new()),
            Arc::clone(&sink) as Arc<dyn LeadSink>,
        );
        let berater = topic("berater");

        let first = runtime.handle_turn(&berater, request("Hallo", None)).await.expect("turn");
        let cookie = first.session_id.as_str();

        let release = async {
            for _ in 0..5 {
                tokio::task::yield_now().await;
            }
            assistant.gate.notify_one();
        };
        let (summary_turn, confirm_turn, ()) = tokio::join!(
            runtime.handle_turn(&berater, request("Fertig", Some(cookie))),
            runtime.handle_turn(&berater, request("Ja", Some(cookie))),
            release,
        );

        let summary_turn = summary_turn.expect("summary turn");
        let confirm_turn = confirm_turn.expect("confirm turn");
        assert!(summary_turn.summary_stored);
        assert_eq!(confirm_turn.session_id, summary_turn.session_id);
        assert_eq!(confirm_turn.lead, LeadOutcome::Submitted { reference: Some("deal-1".into()) });
        assert_eq!(sink.received.lock().expect("lock").len(), 1);

        let events = assistant.events.lock().expect("lock").clone();
        assert_eq!(
            events,
            [
                "append:Hallo",
                "run:Hallo",
                "reply:Hallo",
                "append:Fertig",
                "run:Fertig",
                "reply:Fertig",
                "append:Ja",
                "run:Ja",
                "reply:Ja",
            ]
        );
    }
}
