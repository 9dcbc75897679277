//! Query Client - caller side of the contact query RPC.
//!
//! Each client owns one broker session and one reply queue. A background
//! demux task reads every response on that queue and completes the pending
//! request whose correlation id matches, so any number of concurrent queries
//! can share the queue.

use contact_env::{Broker, BrokerSession, Subscription, TrackerContext, TransportError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{decode_response, encode_query, ProtocolError, QueryResponse, QUERY_EXCHANGE, QUERY_ROUTING_KEY, RESPONSE_EXCHANGE};
use crate::runtime::declare_topology;

/// Default time a caller waits for a response.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<QueryResponse>>>>;

fn lock_pending(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, oneshot::Sender<QueryResponse>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Errors returned to query callers.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No response arrived in time. Retry with a fresh query.
    #[error("No response for '{entity_id}' within {timeout_ms}ms")]
    Timeout { entity_id: String, timeout_ms: u64 },

    /// The reply queue closed before a response arrived.
    #[error("Reply queue closed while waiting for a response")]
    ReplyQueueClosed,
}

/// Issues contact queries against a running tracker.
///
/// Outgoing queries are stamped with the context's clock and the demux task
/// runs on the context's executor. Dropping the client stops the demux.
pub struct QueryClient<S: BrokerSession, Ctx: TrackerContext> {
    session: Arc<S>,
    context: Arc<Ctx>,
    reply_queue: String,
    pending: PendingMap,
    _stop_demux: oneshot::Sender<()>,
}

impl<S: BrokerSession, Ctx: TrackerContext> QueryClient<S, Ctx> {
    /// Opens a session, declares the topology and binds a reply queue.
    pub async fn connect<B>(broker: &B, context: Arc<Ctx>) -> Result<Self, ClientError>
    where
        B: Broker<Session = S>,
    {
        let session = broker.connect().await?;
        declare_topology(&session).await?;

        let reply_queue = session.connection_id().queue_name("reply");
        let responses = session.subscribe(RESPONSE_EXCHANGE, &reply_queue).await?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (stop_tx, stop_rx) = oneshot::channel();
        context.spawn("query-demux", demux_responses(responses, Arc::clone(&pending), stop_rx));
        debug!(reply_queue = %reply_queue, "query client connected");

        Ok(Self {
            session: Arc::new(session),
            context,
            reply_queue,
            pending,
            _stop_demux: stop_tx,
        })
    }

    /// Asks the tracker for `entity_id`'s contact history.
    ///
    /// # Returns
    /// * `Ok(response)` - contacts oldest first; empty for unknown entities
    /// * `Err(ClientError::Timeout)` - no tracker answered within `timeout`
    pub async fn query(&self, entity_id: &str, timeout: Duration) -> Result<QueryResponse, ClientError> {
        let correlation_id = Uuid::new_v4().to_string();
        let envelope = encode_query(&correlation_id, entity_id, &self.reply_queue, self.context.unix_millis())?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(correlation_id.clone(), tx);

        match self.session.publish(QUERY_EXCHANGE, QUERY_ROUTING_KEY, envelope).await {
            Ok(0) => debug!(entity = entity_id, "no tracker bound for queries, waiting anyway"),
            Ok(_) => {}
            Err(e) => {
                lock_pending(&self.pending).remove(&correlation_id);
                return Err(e.into());
            }
        }

        // The deadline is wall-clock: a simulated clock may stand still while
        // the caller waits.
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::ReplyQueueClosed),
            Err(_) => {
                lock_pending(&self.pending).remove(&correlation_id);
                warn!(entity = entity_id, correlation_id = %correlation_id, "query timed out");
                Err(ClientError::Timeout {
                    entity_id: entity_id.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Number of queries still awaiting a response.
    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}

async fn demux_responses(mut responses: Subscription, pending: PendingMap, mut stop: oneshot::Receiver<()>) {
    loop {
        let envelope = tokio::select! {
            _ = &mut stop => {
                debug!("query client dropped, demux stopped");
                break;
            }
            next = responses.recv() => match next {
                Some(envelope) => envelope,
                None => {
                    debug!("reply queue closed, demux stopped");
                    break;
                }
            },
        };

        let response = match decode_response(&envelope) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "dropping malformed query response");
                continue;
            }
        };

        let waiter = lock_pending(&pending).remove(&response.correlation_id);
        match waiter {
            Some(tx) => {
                // The caller may have given up between lookup and send.
                let _ = tx.send(response);
            }
            None => debug!(correlation_id = %response.correlation_id, "response for unknown or expired query dropped"),
        }
    }

    // Dropping the senders wakes every waiter with `ReplyQueueClosed`.
    lock_pending(&pending).clear();
}
