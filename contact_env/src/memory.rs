//! In-process broker with fanout and direct exchanges.
//!
//! Routing follows AMQP semantics closely enough for the tracker protocol:
//! exchanges outlive sessions, queues are exclusive to the session that bound
//! them, and severing a session drops its queues so consumers see
//! end-of-stream. Messages sitting in a severed queue are lost.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::{Broker, BrokerController, BrokerSession, Subscription};
use crate::types::{ConnectionId, Envelope, ExchangeKind};

/// Default per-queue buffer before the broker starts dropping.
const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Endpoint scheme served by [`MemoryBroker`].
pub const MEMORY_SCHEME: &str = "memory://";

struct Binding {
    connection: ConnectionId,
    queue: String,
    routing_key: String,
    tx: mpsc::Sender<Envelope>,
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

impl Exchange {
    fn routes(&self, binding: &Binding, routing_key: &str) -> bool {
        match self.kind {
            ExchangeKind::Fanout => true,
            ExchangeKind::Direct => binding.routing_key == routing_key,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    sessions: HashMap<ConnectionId, Arc<AtomicBool>>,
}

impl BrokerState {
    /// Marks a session closed and drops every queue it owns.
    fn drop_session(&mut self, id: ConnectionId) {
        if let Some(open) = self.sessions.remove(&id) {
            open.store(false, Ordering::SeqCst);
        }
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|b| b.connection != id);
        }
    }
}

struct BrokerInner {
    endpoint: String,
    queue_capacity: usize,
    state: Mutex<BrokerState>,
    offline: AtomicBool,
    duplicate_delivery: AtomicBool,
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to an in-process broker.
///
/// Cloning is cheap; all clones address the same exchanges.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// Whether `endpoint` names an in-process broker.
    pub fn serves(endpoint: &str) -> bool {
        endpoint.starts_with(MEMORY_SCHEME) && endpoint.len() > MEMORY_SCHEME.len()
    }

    /// Creates a broker reachable under `endpoint`.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_queue_capacity(endpoint, DEFAULT_QUEUE_CAPACITY)
    }

    /// Creates a broker whose queues buffer at most `queue_capacity` messages.
    pub fn with_queue_capacity(endpoint: impl Into<String>, queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                endpoint: endpoint.into(),
                queue_capacity: queue_capacity.max(1),
                state: Mutex::new(BrokerState::default()),
                offline: AtomicBool::new(false),
                duplicate_delivery: AtomicBool::new(false),
            }),
        }
    }

    /// Number of currently open sessions.
    pub fn session_count(&self) -> usize {
        self.inner.state().sessions.len()
    }

    /// Number of queues bound to `exchange` (0 if undeclared).
    pub fn binding_count(&self, exchange: &str) -> usize {
        self.inner
            .state()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    type Session = MemorySession;

    async fn connect(&self) -> Result<MemorySession, TransportError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(TransportError::unreachable(&self.inner.endpoint));
        }

        let id = ConnectionId::new();
        let open = Arc::new(AtomicBool::new(true));
        self.inner.state().sessions.insert(id, Arc::clone(&open));
        debug!(connection = %id, endpoint = %self.inner.endpoint, "session opened");

        Ok(MemorySession {
            id,
            inner: Arc::clone(&self.inner),
            open,
            queue_seq: Arc::new(AtomicU64::new(0)),
        })
    }

    fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }
}

impl BrokerController for MemoryBroker {
    fn sever_all(&self) {
        let mut state = self.inner.state();
        let ids: Vec<ConnectionId> = state.sessions.keys().copied().collect();
        warn!(sessions = ids.len(), "severing all broker sessions");
        for id in ids {
            state.drop_session(id);
        }
    }

    fn set_offline(&self, offline: bool) {
        info!(offline, endpoint = %self.inner.endpoint, "broker availability changed");
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    fn set_duplicate_delivery(&self, enabled: bool) {
        self.inner.duplicate_delivery.store(enabled, Ordering::SeqCst);
    }
}

/// A session on a `MemoryBroker`.
#[derive(Clone)]
pub struct MemorySession {
    id: ConnectionId,
    inner: Arc<BrokerInner>,
    open: Arc<AtomicBool>,
    queue_seq: Arc<AtomicU64>,
}

impl MemorySession {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::disconnected(format!("session {} closed", self.id)))
        }
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError> {
        self.ensure_open()?;
        let mut state = self.inner.state();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(TransportError::PreconditionFailed {
                name: name.to_string(),
                existing: existing.kind.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                debug!(exchange = name, %kind, "exchange declared");
                Ok(())
            }
        }
    }

    async fn subscribe(&self, exchange: &str, routing_key: &str) -> Result<Subscription, TransportError> {
        let seq = self.queue_seq.fetch_add(1, Ordering::Relaxed);
        let queue = format!("{}.{}", self.id.queue_name("amq.gen"), seq);
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);

        // The open check happens under the broker lock so a concurrent sever
        // cannot leave an orphaned binding behind.
        let mut state = self.inner.state();
        self.ensure_open()?;
        let target = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TransportError::UnknownExchange(exchange.to_string()))?;
        target.bindings.push(Binding {
            connection: self.id,
            queue: queue.clone(),
            routing_key: routing_key.to_string(),
            tx,
        });
        debug!(connection = %self.id, exchange, routing_key, queue = %queue, "queue bound");

        Ok(Subscription::new(queue, rx))
    }

    async fn publish(&self, exchange: &str, routing_key: &str, envelope: Envelope) -> Result<usize, TransportError> {
        self.ensure_open()?;

        let targets: Vec<(String, mpsc::Sender<Envelope>)> = {
            let state = self.inner.state();
            let target = state
                .exchanges
                .get(exchange)
                .ok_or_else(|| TransportError::UnknownExchange(exchange.to_string()))?;
            target
                .bindings
                .iter()
                .filter(|b| target.routes(b, routing_key))
                .map(|b| (b.queue.clone(), b.tx.clone()))
                .collect()
        };

        let copies = if self.inner.duplicate_delivery.load(Ordering::SeqCst) { 2 } else { 1 };
        let mut routed = 0;
        let mut saw_closed = false;

        for (queue, tx) in &targets {
            let mut delivered = false;
            for _ in 0..copies {
                match tx.try_send(envelope.clone()) {
                    Ok(()) => delivered = true,
                    Err(TrySendError::Full(_)) => {
                        warn!(queue = %queue, exchange, "queue full, message dropped");
                    }
                    Err(TrySendError::Closed(_)) => {
                        saw_closed = true;
                        break;
                    }
                }
            }
            if delivered {
                routed += 1;
            }
        }

        if saw_closed {
            let mut state = self.inner.state();
            if let Some(target) = state.exchanges.get_mut(exchange) {
                target.bindings.retain(|b| !b.tx.is_closed());
            }
        }

        Ok(routed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        debug!(connection = %self.id, "session closed");
        self.inner.state().drop_session(self.id);
    }

    fn connection_id(&self) -> ConnectionId {
        self.id
    }
}
