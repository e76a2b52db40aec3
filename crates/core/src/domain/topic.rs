use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// A subject-matter assistant exposed under its own route.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub slug: String,
    pub assistant_id: String,
    pub log_table: String,
}

impl Topic {
    pub fn new(
        slug: impl Into<String>,
        assistant_id: impl Into<String>,
        log_table: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let topic =
            Self { slug: slug.into(), assistant_id: assistant_id.into(), log_table: log_table.into() };
        validate_table_name(&topic.log_table)?;
        Ok(topic)
    }

    /// Path of the per-topic route kept from the first deployment (`/askberater`).
    pub fn legacy_route(&self) -> String {
        format!("/ask{}", self.slug)
    }
}

/// Log tables are interpolated into SQL, so only plain identifiers pass.
pub fn validate_table_name(name: &str) -> Result<(), DomainError> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|first| first.is_ascii_alphabetic() || first == '_');
    let valid_rest = chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');

    if valid_start && valid_rest && name.len() <= 63 {
        Ok(())
    } else {
        Err(DomainError::InvalidTableName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::{validate_table_name, Topic};
    use crate::errors::DomainError;

    #[test]
    fn accepts_plain_identifiers() {
        for name in ["chat_berater", "_log", "LagaPn98"] {
            assert!(validate_table_name(name).is_ok(), "{name} should be accepted");
        }
    }

    #[test]
    fn rejects_names_that_could_break_out_of_sql() {
        for name in ["", "1chat", "chat log", "chat;DROP TABLE x", "chat-log", "\"quoted\""] {
            assert_eq!(
                validate_table_name(name),
                Err(DomainError::InvalidTableName(name.to_string())),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn legacy_route_keeps_slug_casing() {
        let topic = Topic::new("Deponieverordnung", "asst_1", "chat_deponieverordnung")
            .expect("valid topic");
        assert_eq!(topic.legacy_route(), "/askDeponieverordnung");
    }
}
