pub mod config;
pub mod domain;
pub mod errors;

pub use domain::chat_log::{
    ChatEvent, ChatLogEntry, LeadSubmission, SubmissionStatus, VisitorContext,
};
pub use domain::lead::{LeadField, LeadRecord};
pub use domain::session::{ConversationHandle, Session, SessionId};
pub use domain::topic::Topic;
pub use errors::{ApplicationError, DomainError, InterfaceError};
