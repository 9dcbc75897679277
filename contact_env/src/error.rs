//! Error types for the broker transport layer.

use thiserror::Error;

/// Errors that can occur talking to the broker.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// The session was severed; the caller should reconnect.
    #[error("Disconnected from broker: {0}")]
    Disconnected(String),

    /// The broker endpoint could not be reached at connect time.
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    /// Publish or bind against an exchange that was never declared.
    #[error("Unknown exchange: {0}")]
    UnknownExchange(String),

    /// Exchange already exists with a different kind.
    #[error("Exchange '{name}' already declared as {existing}")]
    PreconditionFailed { name: String, existing: String },
}

impl TransportError {
    /// Creates a disconnect error.
    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::Disconnected(msg.into())
    }

    /// Creates an unreachable error.
    pub fn unreachable(endpoint: impl std::fmt::Display) -> Self {
        Self::Unreachable(endpoint.to_string())
    }

    /// Whether this error means the session is gone and a reconnect is due.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, Self::Disconnected(_) | Self::Unreachable(_))
    }
}
