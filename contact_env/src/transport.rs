//! Broker transport abstraction for the tracker and its callers.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::types::{ConnectionId, Envelope, ExchangeKind};

/// A message broker the tracker can (re)connect to.
///
/// # Implementations
///
/// - **In-process**: `MemoryBroker` - tokio channels with fault injection
///
/// Each call to `connect` yields an independent session. Reconnect logic
/// lives with the caller: when a session dies, call `connect` again and
/// redo declarations and subscriptions.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Session type produced by this broker.
    type Session: BrokerSession;

    /// Opens a new session.
    ///
    /// # Returns
    /// * `Ok(session)` - Connected
    /// * `Err(TransportError::Unreachable)` - The endpoint cannot be reached
    async fn connect(&self) -> Result<Self::Session, TransportError>;

    /// The endpoint this broker was configured with (for logging).
    fn endpoint(&self) -> &str;
}

/// One live connection to a broker.
///
/// # Message Flow
///
/// ```text
/// Publisher                  Broker                     Subscriber
///   |                           |                          |
///   |-- publish(ex, key, m) --->|                          |
///   |                           |-- route by kind/key ---->|
///   |                           |                          |-- recv() -> m
/// ```
#[async_trait]
pub trait BrokerSession: Send + Sync + 'static {
    /// Declares an exchange; idempotent for the same kind.
    ///
    /// # Returns
    /// * `Err(TransportError::PreconditionFailed)` - exists with another kind
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError>;

    /// Binds an exclusive queue to `exchange` with `routing_key` and starts
    /// consuming it. The queue disappears with the session.
    async fn subscribe(&self, exchange: &str, routing_key: &str) -> Result<Subscription, TransportError>;

    /// Publishes a message.
    ///
    /// # Returns
    /// Number of queues the message was routed to. Zero is not an error.
    ///
    /// # Note
    /// Success does not guarantee the consumer processes the message.
    async fn publish(&self, exchange: &str, routing_key: &str, envelope: Envelope) -> Result<usize, TransportError>;

    /// Whether the session is still usable.
    fn is_open(&self) -> bool;

    /// Closes the session, dropping all of its queues.
    async fn close(&self);

    /// Returns this session's connection ID.
    fn connection_id(&self) -> ConnectionId;
}

/// Fault injection hooks for brokers used in tests and simulation.
pub trait BrokerController: Send + Sync {
    /// Severs every live session; subscribers observe end-of-stream.
    fn sever_all(&self);

    /// While offline, `connect` fails with `Unreachable`.
    fn set_offline(&self, offline: bool);

    /// Deliver every routed message twice (at-least-once stress).
    fn set_duplicate_delivery(&self, enabled: bool);
}

/// Consumer side of one bound queue.
///
/// `recv` yields `None` once the owning session has been closed or severed,
/// which is the consumer's signal to reconnect.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    rx: mpsc::Receiver<Envelope>,
}

impl Subscription {
    /// Wraps the receiving half of a queue.
    pub fn new(queue: impl Into<String>, rx: mpsc::Receiver<Envelope>) -> Self {
        Self {
            queue: queue.into(),
            rx,
        }
    }

    /// Receives the next message, or `None` when the queue is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Name of the underlying queue.
    pub fn queue(&self) -> &str {
        &self.queue
    }
}
