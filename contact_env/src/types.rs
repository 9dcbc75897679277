//! Common types for the broker abstraction.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for one broker connection.
///
/// Uses UUID v4 so that server-named queues never collide without
/// coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Creates a new random ConnectionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Name of the exclusive queue the broker generates for this connection.
    pub fn queue_name(&self, prefix: &str) -> String {
        format!("{}.{}", prefix, self.0.simple())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    /// Every bound queue receives every message; routing keys are ignored.
    Fanout,
    /// A message reaches only the queues bound with an identical routing key.
    Direct,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Fanout => write!(f, "fanout"),
            ExchangeKind::Direct => write!(f, "direct"),
        }
    }
}

/// A message as it travels through the broker.
///
/// The payload is opaque bytes; the properties mirror the AMQP basic
/// properties the request/response pattern relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Encoded message body
    pub payload: Vec<u8>,

    /// MIME type of the payload (e.g. `application/json`)
    pub content_type: String,

    /// Binds a response to the request that caused it
    pub correlation_id: Option<String>,

    /// Routing key the response should be published with
    pub reply_to: Option<String>,

    /// Sender's wall clock in Unix milliseconds
    pub timestamp_ms: u64,
}

impl Envelope {
    /// Creates a new envelope from payload bytes.
    pub fn new(payload: Vec<u8>, content_type: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            payload,
            content_type: content_type.into(),
            correlation_id: None,
            reply_to: None,
            timestamp_ms,
        }
    }

    /// Sets the correlation id property.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the reply-to property.
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Returns the payload size in bytes.
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
