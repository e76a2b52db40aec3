use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a logged exchange ended with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatEvent {
    Exchange,
    SummaryStored,
    LeadSubmitted,
    LeadSkipped,
    LeadSubmissionFailed,
    ExtractionFailed,
    MissingSummary,
    AssistantFailed,
}

impl ChatEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exchange => "exchange",
            Self::SummaryStored => "summary_stored",
            Self::LeadSubmitted => "lead_submitted",
            Self::LeadSkipped => "lead_skipped",
            Self::LeadSubmissionFailed => "lead_submission_failed",
            Self::ExtractionFailed => "extraction_failed",
            Self::MissingSummary => "missing_summary",
            Self::AssistantFailed => "assistant_failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            Self::Exchange,
            Self::SummaryStored,
            Self::LeadSubmitted,
            Self::LeadSkipped,
            Self::LeadSubmissionFailed,
            Self::ExtractionFailed,
            Self::MissingSummary,
            Self::AssistantFailed,
        ]
        .into_iter()
        .find(|event| event.as_str() == raw)
    }
}

/// Visitor metadata the widget forwards with each message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitorContext {
    pub ip_address: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

/// One append-only row in a topic's log table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLogEntry {
    pub id: String,
    pub session_id: Option<String>,
    pub thread_id: Option<String>,
    pub user_message: String,
    pub assistant_reply: Option<String>,
    pub event: ChatEvent,
    pub visitor: VisitorContext,
    pub created_at: DateTime<Utc>,
}

impl ChatLogEntry {
    pub fn new(user_message: impl Into<String>, event: ChatEvent) -> Self {
        Self {
            id: format!("CHAT-{}", Uuid::new_v4().simple()),
            session_id: None,
            thread_id: None,
            user_message: user_message.into(),
            assistant_reply: None,
            event,
            visitor: VisitorContext::default(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Submitted,
    Failed,
    Skipped,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "submitted" => Some(Self::Submitted),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Audit row for one attempt to hand a lead to the CRM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadSubmission {
    pub id: String,
    pub topic: String,
    pub session_id: String,
    pub status: SubmissionStatus,
    pub crm_reference: Option<String>,
    pub error: Option<String>,
    pub fields_json: String,
    pub created_at: DateTime<Utc>,
}
