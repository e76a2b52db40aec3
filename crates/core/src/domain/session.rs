use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::lead::LeadRecord;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one conversation (thread) held by the assistant service.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationHandle(pub String);

impl ConversationHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: SessionId,
    conversation_handle: ConversationHandle,
    pub extracted_fields: BTreeMap<String, String>,
    pub pending_summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, conversation_handle: ConversationHandle) -> Self {
        let now = Utc::now();
        Self {
            id,
            conversation_handle,
            extracted_fields: BTreeMap::new(),
            pending_summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The handle is fixed at creation; there is no setter.
    pub fn conversation_handle(&self) -> &ConversationHandle {
        &self.conversation_handle
    }

    pub fn remember_summary(&mut self, summary: impl Into<String>) {
        self.pending_summary = Some(summary.into());
        self.touch();
    }

    pub fn merge_extracted(&mut self, record: &LeadRecord) {
        self.extracted_fields.extend(record.to_key_map());
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
