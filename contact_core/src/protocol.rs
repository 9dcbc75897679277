//! Wire protocol: exchange topology and JSON message bodies.
//!
//! Every body carries a `version` field. Decoders accept any version up to
//! `PROTOCOL_VERSION` (missing means 1) and reject newer ones, so a newer
//! publisher cannot be half-understood by an older tracker.

use contact_env::{Envelope, ExchangeKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::event::{EntityId, PositionEvent};
use crate::history::Contact;

pub const PROTOCOL_VERSION: u8 = 1;
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Fanout exchange carrying position reports.
pub const POSITION_EXCHANGE: &str = "position";
/// Direct exchange carrying contact queries.
pub const QUERY_EXCHANGE: &str = "query";
/// Direct exchange carrying query responses, routed by reply queue name.
pub const RESPONSE_EXCHANGE: &str = "query_response";
/// Routing key the tracker consumes queries on.
pub const QUERY_ROUTING_KEY: &str = "tracker_query";

/// Exchanges every participant declares before use.
pub const TOPOLOGY: [(&str, ExchangeKind); 3] = [
    (POSITION_EXCHANGE, ExchangeKind::Fanout),
    (QUERY_EXCHANGE, ExchangeKind::Direct),
    (RESPONSE_EXCHANGE, ExchangeKind::Direct),
];

fn default_version() -> u8 {
    1
}

// ============================================================================
// MESSAGE BODIES
// ============================================================================

/// Body of a message on the position exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionMessage {
    #[serde(default = "default_version")]
    pub version: u8,
    pub entity_id: String,
    pub x: f64,
    pub y: f64,
    pub timestamp: f64,
}

/// Body of a query; correlation id and reply queue travel as envelope properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequestBody {
    #[serde(default = "default_version")]
    pub version: u8,
    pub entity_id: String,
}

/// A decoded query with its routing properties.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub correlation_id: String,
    pub entity_id: EntityId,
    pub reply_to: String,
}

/// One contact as reported to a caller: the detection snapshot, not a live position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub other_entity_id: String,
    /// Other party's position at detection
    pub x: f64,
    pub y: f64,
    /// Queried entity's own position at detection
    pub own_x: f64,
    pub own_y: f64,
    pub timestamp: f64,
}

impl From<&Contact> for ContactRecord {
    fn from(contact: &Contact) -> Self {
        Self {
            other_entity_id: contact.other_entity_id.to_string(),
            x: contact.other_position.x,
            y: contact.other_position.y,
            own_x: contact.own_position.x,
            own_y: contact.own_position.y,
            timestamp: contact.timestamp,
        }
    }
}

/// Body of a query response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default = "default_version")]
    pub version: u8,
    pub correlation_id: String,
    pub entity_id: String,
    /// Oldest first
    pub contacts: Vec<ContactRecord>,
    /// Responder wall clock, Unix seconds
    pub generated_at: f64,
}

// ============================================================================
// CODEC
// ============================================================================

fn encode_json<T: Serialize>(body: &T, timestamp_ms: u64) -> Result<Envelope, ProtocolError> {
    let payload = serde_json::to_vec(body).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(Envelope::new(payload, CONTENT_TYPE_JSON, timestamp_ms))
}

fn decode_json<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, ProtocolError> {
    serde_json::from_slice(&envelope.payload).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn check_version(found: u8) -> Result<(), ProtocolError> {
    if found > PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            found,
            supported: PROTOCOL_VERSION,
        });
    }
    Ok(())
}

pub fn encode_position(event: &PositionEvent, timestamp_ms: u64) -> Result<Envelope, ProtocolError> {
    let body = PositionMessage {
        version: PROTOCOL_VERSION,
        entity_id: event.entity_id.to_string(),
        x: event.position.x,
        y: event.position.y,
        timestamp: event.timestamp,
    };
    encode_json(&body, timestamp_ms)
}

/// Decodes a position report. Semantic checks (empty id, non-finite
/// values) are left to `PositionEvent::validate`.
pub fn decode_position(envelope: &Envelope) -> Result<PositionEvent, ProtocolError> {
    let message: PositionMessage = decode_json(envelope)?;
    check_version(message.version)?;
    Ok(PositionEvent::new(message.entity_id, message.x, message.y, message.timestamp))
}

pub fn encode_query(
    correlation_id: &str,
    entity_id: &str,
    reply_to: &str,
    timestamp_ms: u64,
) -> Result<Envelope, ProtocolError> {
    let body = QueryRequestBody {
        version: PROTOCOL_VERSION,
        entity_id: entity_id.to_string(),
    };
    Ok(encode_json(&body, timestamp_ms)?
        .with_correlation_id(correlation_id)
        .with_reply_to(reply_to))
}

pub fn decode_query(envelope: &Envelope) -> Result<QueryRequest, ProtocolError> {
    let correlation_id = envelope
        .correlation_id
        .clone()
        .ok_or(ProtocolError::MissingProperty("correlation_id"))?;
    let reply_to = envelope
        .reply_to
        .clone()
        .ok_or(ProtocolError::MissingProperty("reply_to"))?;

    let body: QueryRequestBody = decode_json(envelope)?;
    check_version(body.version)?;

    Ok(QueryRequest {
        correlation_id,
        entity_id: EntityId::new(body.entity_id),
        reply_to,
    })
}

pub fn encode_response(response: &QueryResponse, timestamp_ms: u64) -> Result<Envelope, ProtocolError> {
    Ok(encode_json(response, timestamp_ms)?.with_correlation_id(response.correlation_id.clone()))
}

/// Decodes a response; the envelope's correlation id wins over the body's.
pub fn decode_response(envelope: &Envelope) -> Result<QueryResponse, ProtocolError> {
    let mut response: QueryResponse = decode_json(envelope)?;
    check_version(response.version)?;
    if let Some(correlation_id) = &envelope.correlation_id {
        response.correlation_id = correlation_id.clone();
    }
    Ok(response)
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unsupported protocol version {found} (supported: {supported})")]
    UnsupportedVersion { found: u8, supported: u8 },

    #[error("Missing message property: {0}")]
    MissingProperty(&'static str),

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector2;

    fn raw(body: &str) -> Envelope {
        Envelope::new(body.as_bytes().to_vec(), CONTENT_TYPE_JSON, 0)
    }

    #[test]
    fn test_position_wire_shape() {
        let envelope = encode_position(&PositionEvent::new("p1", 3.0, 4.0, 12.5), 99).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&envelope.payload).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["entity_id"], "p1");
        assert_eq!(value["x"], 3.0);
        assert_eq!(value["timestamp"], 12.5);
        assert_eq!(envelope.content_type, CONTENT_TYPE_JSON);
        assert_eq!(envelope.timestamp_ms, 99);
    }

    #[test]
    fn test_position_without_version_is_accepted() {
        let event = decode_position(&raw(r#"{"entity_id":"p1","x":1,"y":2,"timestamp":3}"#)).unwrap();
        assert_eq!(event.position, Vector2::new(1.0, 2.0));
    }

    #[test]
    fn test_position_missing_id_is_malformed() {
        let err = decode_position(&raw(r#"{"x":1,"y":2,"timestamp":3}"#)).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_position_non_numeric_coordinate_is_malformed() {
        let err = decode_position(&raw(r#"{"entity_id":"p1","x":"left","y":2,"timestamp":3}"#)).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let err = decode_position(&raw(r#"{"version":9,"entity_id":"p1","x":1,"y":2,"timestamp":3}"#)).unwrap_err();
        assert_eq!(err, ProtocolError::UnsupportedVersion { found: 9, supported: 1 });
    }

    #[test]
    fn test_query_carries_routing_properties() {
        let envelope = encode_query("corr-1", "p7", "reply.abc", 0).unwrap();
        let request = decode_query(&envelope).unwrap();
        assert_eq!(request.correlation_id, "corr-1");
        assert_eq!(request.entity_id.as_str(), "p7");
        assert_eq!(request.reply_to, "reply.abc");
    }

    #[test]
    fn test_query_without_reply_to_is_rejected() {
        let envelope = raw(r#"{"entity_id":"p7"}"#).with_correlation_id("c");
        assert_eq!(
            decode_query(&envelope).unwrap_err(),
            ProtocolError::MissingProperty("reply_to")
        );
    }

    #[test]
    fn test_response_correlation_from_envelope() {
        let response = QueryResponse {
            version: PROTOCOL_VERSION,
            correlation_id: "body-id".into(),
            entity_id: "p1".into(),
            contacts: vec![],
            generated_at: 0.0,
        };
        let mut envelope = encode_response(&response, 0).unwrap();
        assert_eq!(envelope.correlation_id.as_deref(), Some("body-id"));

        envelope.correlation_id = Some("header-id".into());
        assert_eq!(decode_response(&envelope).unwrap().correlation_id, "header-id");
    }

    #[test]
    fn test_contact_record_from_contact() {
        let contact = Contact {
            other_entity_id: EntityId::from("B"),
            own_position: Vector2::new(1.0, 2.0),
            other_position: Vector2::new(3.0, 4.0),
            timestamp: 5.0,
        };
        let record = ContactRecord::from(&contact);
        assert_eq!(record.other_entity_id, "B");
        assert_eq!((record.x, record.y), (3.0, 4.0));
        assert_eq!((record.own_x, record.own_y), (1.0, 2.0));
        assert_eq!(record.timestamp, 5.0);
    }
}
