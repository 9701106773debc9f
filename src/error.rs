//! Warband error types

use thiserror::Error;

use crate::transport::TransportErrorKind;

/// Errors that can occur while running a fleet
#[derive(Debug, Error)]
pub enum FleetError {
    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Fleet was already started
    #[error("Fleet already started")]
    AlreadyStarted,

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Schema error
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Channel error
    #[error("Channel error: {0}")]
    Channel(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Failure reported by the session transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Malformed payload for a message kind
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Unknown message kind: {0}")]
    UnknownKind(String),

    #[error("Malformed {kind} payload: {reason}")]
    Malformed { kind: String, reason: String },
}

impl SchemaError {
    pub fn malformed(kind: &str, reason: impl ToString) -> Self {
        Self::Malformed {
            kind: kind.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_converts() {
        let err: FleetError = TransportError::new(TransportErrorKind::Timeout, "no answer").into();
        assert!(matches!(err, FleetError::Transport(ref e) if e.kind == TransportErrorKind::Timeout));
        assert!(err.to_string().contains("no answer"));
    }

    #[test]
    fn test_schema_error_display() {
        let err = SchemaError::malformed("LobbyJoin", "missing lobby_id");
        assert_eq!(err.to_string(), "Malformed LobbyJoin payload: missing lobby_id");
    }
}
