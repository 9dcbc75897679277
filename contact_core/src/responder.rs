//! Query Responder - binds the tracker's `query` to the request/response protocol.
//!
//! The responder is pure: it decodes a request, snapshots the history under
//! a short lock, releases the lock and encodes the reply. Publishing the
//! reply is the caller's job, so no lock is ever held across broker I/O.

use contact_env::{Envelope, TrackerContext};
use std::sync::Arc;
use tracing::debug;

use crate::protocol::{decode_query, encode_response, ContactRecord, ProtocolError, QueryResponse, PROTOCOL_VERSION};
use crate::tracking::{lock_tracker, SharedTracker};

/// A response ready to be published on the response exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Caller's reply queue (the request's `reply_to`)
    pub routing_key: String,
    pub envelope: Envelope,
    pub contact_count: usize,
}

pub struct QueryResponder<Ctx: TrackerContext> {
    tracker: SharedTracker,
    context: Arc<Ctx>,
}

impl<Ctx: TrackerContext> QueryResponder<Ctx> {
    pub fn new(tracker: SharedTracker, context: Arc<Ctx>) -> Self {
        Self { tracker, context }
    }

    /// Answers one query envelope.
    ///
    /// Unknown entities produce an empty contact list, never an error.
    pub fn respond(&self, request: &Envelope) -> Result<Reply, ProtocolError> {
        let request = decode_query(request)?;

        let contacts: Vec<ContactRecord> = {
            let tracker = lock_tracker(&self.tracker);
            tracker
                .query(request.entity_id.as_str())
                .iter()
                .map(ContactRecord::from)
                .collect()
        };

        let contact_count = contacts.len();
        let response = QueryResponse {
            version: PROTOCOL_VERSION,
            correlation_id: request.correlation_id,
            entity_id: request.entity_id.to_string(),
            contacts,
            generated_at: self.context.unix_seconds(),
        };
        let envelope = encode_response(&response, self.context.unix_millis())?;

        debug!(
            entity = %request.entity_id,
            correlation_id = %response.correlation_id,
            reply_to = %request.reply_to,
            contacts = contact_count,
            "query answered"
        );

        Ok(Reply {
            routing_key: request.reply_to,
            envelope,
            contact_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PositionEvent;
    use crate::protocol::{decode_response, encode_query};
    use crate::tracking::ContactTracker;
    use contact_env::TokioContext;

    fn responder_with_contact() -> QueryResponder<TokioContext> {
        let tracker = ContactTracker::with_defaults().shared();
        {
            let mut guard = lock_tracker(&tracker);
            guard.ingest(&PositionEvent::new("A", 0.0, 0.0, 1.0)).unwrap();
            guard.ingest(&PositionEvent::new("B", 0.0, 0.0, 2.0)).unwrap();
        }
        QueryResponder::new(tracker, TokioContext::shared())
    }

    #[test]
    fn test_respond_with_history() {
        let responder = responder_with_contact();
        let request = encode_query("corr-9", "A", "reply.caller", 0).unwrap();

        let reply = responder.respond(&request).unwrap();
        assert_eq!(reply.routing_key, "reply.caller");
        assert_eq!(reply.contact_count, 1);
        assert_eq!(reply.envelope.correlation_id.as_deref(), Some("corr-9"));

        let response = decode_response(&reply.envelope).unwrap();
        assert_eq!(response.entity_id, "A");
        assert_eq!(response.contacts.len(), 1);
        assert_eq!(response.contacts[0].other_entity_id, "B");
        assert_eq!(response.contacts[0].timestamp, 2.0);
    }

    #[test]
    fn test_unknown_entity_gets_empty_reply() {
        let responder = responder_with_contact();
        let request = encode_query("corr-1", "never-seen-id", "reply.caller", 0).unwrap();

        let reply = responder.respond(&request).unwrap();
        let response = decode_response(&reply.envelope).unwrap();
        assert!(response.contacts.is_empty());
    }

    #[test]
    fn test_malformed_request_is_an_error() {
        let responder = responder_with_contact();
        let request = Envelope::new(b"not json".to_vec(), "text/plain", 0)
            .with_correlation_id("c")
            .with_reply_to("r");
        assert!(matches!(responder.respond(&request), Err(ProtocolError::Malformed(_))));
    }
}
