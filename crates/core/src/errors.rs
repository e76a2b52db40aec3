use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid log table name `{0}`")]
    InvalidTableName(String),
    #[error("unknown topic `{0}`")]
    UnknownTopic(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("assistant failure: {0}")]
    Assistant(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    /// Text shown to the visitor in the chat widget.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "Ihre Nachricht konnte nicht verarbeitet werden. Bitte versuchen Sie es erneut."
            }
            Self::NotFound { .. } => "Dieser Assistent ist leider nicht verfügbar.",
            Self::Internal { .. } => {
                "Entschuldigung, es ist ein Fehler aufgetreten. Bitte versuchen Sie es später erneut."
            }
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        match self {
            Self::Domain(DomainError::UnknownTopic(topic)) => InterfaceError::NotFound {
                message: format!("unknown topic `{topic}`"),
                correlation_id,
            },
            Self::Domain(error) => {
                InterfaceError::BadRequest { message: error.to_string(), correlation_id }
            }
            // Upstream assistant failures surface as HTTP 500 with a generic apology.
            Self::Assistant(message) => InterfaceError::Internal { message, correlation_id },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::errors::{ApplicationError, DomainError, InterfaceError};

    #[test]
    fn unknown_topic_maps_to_not_found() {
        let interface = ApplicationError::from(DomainError::UnknownTopic("foo".to_owned()))
            .into_interface("req-1");

        assert!(matches!(
            interface,
            InterfaceError::NotFound { ref correlation_id, .. } if correlation_id == "req-1"
        ));
    }

    #[test]
    fn invalid_request_maps_to_bad_request_and_keeps_detail() {
        let interface = ApplicationError::from(DomainError::InvalidRequest(
            "message must not be empty".to_owned(),
        ))
        .into_interface("req-2");

        assert_eq!(
            interface,
            InterfaceError::BadRequest {
                message: "invalid request: message must not be empty".to_owned(),
                correlation_id: "req-2".to_owned(),
            }
        );
    }

    #[test]
    fn assistant_failure_maps_to_internal_with_apology() {
        let interface =
            ApplicationError::Assistant("run timed out".to_owned()).into_interface("req-3");

        assert!(matches!(interface, InterfaceError::Internal { .. }));
        assert!(interface.user_message().starts_with("Entschuldigung"));
        assert_eq!(interface.correlation_id(), "req-3");
    }
}
