//! Chat runtime - assistant relay and lead detection
//!
//! This crate sits between the HTTP layer and the external assistant service:
//! - Relays visitor messages to a topic's assistant on the session's thread
//! - Keeps the session → conversation mapping (`session`)
//! - Spots summaries and confirmations in assistant replies (`conversation`)
//! - Extracts a lead from the confirmed summary and hands it to a `LeadSink`
//!
//! # Turn flow
//!
//! 1. **Resolve session** - cookie id, else known `threadId`, else new thread
//! 2. **Ask** - append message, run the topic assistant, read its reply
//! 3. **Classify** - store summaries, react to confirmations
//! 4. **Submit** - extracted `LeadRecord` goes to the configured sink
//!
//! The assistant never decides what is submitted. Only text it presented as a
//! summary, and that the visitor then confirmed, becomes a lead.

pub mod assistant;
pub mod conversation;
pub mod runtime;
pub mod session;

pub use assistant::{AssistantClient, AssistantError, OpenAiAssistantClient, RunId};
pub use conversation::{ExtractionError, FieldExtractor, ReplyClassification, ReplyClassifier};
pub use runtime::{
    ChatRuntime, LeadOutcome, LeadReceipt, LeadSink, LeadSinkError, NoopLeadSink, TurnError,
    TurnOutcome, TurnRequest,
};
pub use session::{ResolvedSession, SessionStore};
