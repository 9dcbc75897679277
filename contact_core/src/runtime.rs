//! Tracker Service - drives the tracking engine from the broker.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       TrackerService                         │
//! │                                                              │
//! │  [position] fanout ──┐                                       │
//! │                      ├── select! ──► ContactTracker (lock)   │
//! │  [query] direct ─────┘        │                              │
//! │                               └──► QueryResponder ──► publish│
//! │                                       [query_response]       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! One task drains both subscriptions, so every mutation of the position
//! table, adjacency set and history is serialized. The tracker sits behind a
//! mutex only so that other readers (a UI, tests) can poll it; each critical
//! section covers exactly one `ingest` or one history snapshot.
//!
//! # Reconnection
//!
//! When either subscription ends or a publish reports a lost session, the
//! service reconnects with exponential backoff, re-declares the topology and
//! re-subscribes. Engine state is local and survives the outage.
//!
//! Known gap: messages published while the tracker is disconnected, and
//! messages still queued in the severed session, are lost. Delivery is
//! at-most-once across reconnects.

use contact_env::{Broker, BrokerSession, Envelope, Subscription, TrackerContext, TransportError};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{ReconnectPolicy, TrackerConfig};
use crate::protocol::{decode_position, POSITION_EXCHANGE, QUERY_EXCHANGE, QUERY_ROUTING_KEY, RESPONSE_EXCHANGE, TOPOLOGY};
use crate::responder::QueryResponder;
use crate::stats::TrackerStats;
use crate::tracking::{lock_tracker, ContactTracker, IngestOutcome, SharedTracker, TrackingConfig};

/// Configuration for a tracker service.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub tracking: TrackingConfig,
    pub reconnect: ReconnectPolicy,
}

impl From<&TrackerConfig> for ServiceConfig {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            tracking: config.tracking(),
            reconnect: config.reconnect.clone(),
        }
    }
}

/// Declares every exchange of the protocol.
///
/// An exchange that already exists with another kind is logged and used as-is.
pub async fn declare_topology<S: BrokerSession>(session: &S) -> Result<(), TransportError> {
    for (name, kind) in TOPOLOGY {
        match session.declare_exchange(name, kind).await {
            Ok(()) => {}
            Err(TransportError::PreconditionFailed { name, existing }) => {
                info!(exchange = %name, %existing, wanted = %kind, "exchange already exists with different parameters, using existing");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Errors that stop the service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    /// The broker could not be reached at startup. Fatal.
    #[error("Failed to connect to broker at startup: {0}")]
    Startup(TransportError),

    #[error("Gave up reconnecting after {attempts} attempts: {last}")]
    ReconnectExhausted { attempts: u32, last: TransportError },
}

/// Live subscriptions on one session.
struct Link<S> {
    session: S,
    positions: Subscription,
    queries: Subscription,
}

enum LinkOutcome {
    Shutdown,
    Lost(String),
}

/// Runs the tracking engine against a broker.
pub struct TrackerService<B: Broker, Ctx: TrackerContext> {
    broker: Arc<B>,
    context: Arc<Ctx>,
    tracker: SharedTracker,
    responder: QueryResponder<Ctx>,
    stats: Arc<TrackerStats>,
    config: ServiceConfig,
}

impl<B: Broker, Ctx: TrackerContext> TrackerService<B, Ctx> {
    /// Creates a service with a fresh tracker.
    pub fn new(broker: Arc<B>, context: Arc<Ctx>, config: ServiceConfig) -> Self {
        let tracker = ContactTracker::new(config.tracking.clone()).shared();
        let responder = QueryResponder::new(Arc::clone(&tracker), Arc::clone(&context));

        Self {
            broker,
            context,
            tracker,
            responder,
            stats: Arc::new(TrackerStats::new()),
            config,
        }
    }

    /// Shared handle to the engine, for direct polling.
    pub fn tracker(&self) -> SharedTracker {
        Arc::clone(&self.tracker)
    }

    pub fn stats(&self) -> Arc<TrackerStats> {
        Arc::clone(&self.stats)
    }

    /// Serves until `shutdown` flips to `true` (or its sender is dropped).
    ///
    /// # Returns
    /// * `Ok(())` - clean shutdown
    /// * `Err(ServiceError::Startup)` - the first connection failed
    /// * `Err(ServiceError::ReconnectExhausted)` - the reconnect policy gave up
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServiceError> {
        let mut link = self.establish().await.map_err(|e| {
            error!(endpoint = self.broker.endpoint(), error = %e, "tracker could not connect");
            ServiceError::Startup(e)
        })?;
        info!(endpoint = self.broker.endpoint(), "tracker started, listening for positions and queries");

        loop {
            match self.serve(&mut link, &mut shutdown).await {
                LinkOutcome::Shutdown => {
                    link.session.close().await;
                    info!("tracker shut down");
                    return Ok(());
                }
                LinkOutcome::Lost(reason) => {
                    warn!(%reason, "broker session lost, reconnecting");
                    link.session.close().await;
                    match self.reconnect(&reason, &mut shutdown).await? {
                        Some(next) => link = next,
                        None => {
                            info!("tracker shut down while reconnecting");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Connects, declares the topology and subscribes both channels.
    async fn establish(&self) -> Result<Link<B::Session>, TransportError> {
        let session = self.broker.connect().await?;

        let subscribed = async {
            declare_topology(&session).await?;
            let positions = session.subscribe(POSITION_EXCHANGE, "").await?;
            let queries = session.subscribe(QUERY_EXCHANGE, QUERY_ROUTING_KEY).await?;
            Ok::<_, TransportError>((positions, queries))
        }
        .await;

        match subscribed {
            Ok((positions, queries)) => {
                debug!(
                    connection = %session.connection_id(),
                    position_queue = positions.queue(),
                    query_queue = queries.queue(),
                    "tracker subscriptions bound"
                );
                Ok(Link {
                    session,
                    positions,
                    queries,
                })
            }
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    /// Retries `establish` with backoff. `Ok(None)` means shutdown was requested.
    async fn reconnect(
        &self,
        reason: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Link<B::Session>>, ServiceError> {
        let policy = &self.config.reconnect;
        let mut failures: u32 = 0;
        let mut last_error = TransportError::disconnected(reason);

        loop {
            if !policy.allows(failures) {
                error!(attempts = failures, error = %last_error, "reconnect attempts exhausted");
                return Err(ServiceError::ReconnectExhausted {
                    attempts: failures,
                    last: last_error,
                });
            }

            let delay = jittered_delay(policy, failures);
            tokio::select! {
                _ = self.context.sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(None);
                    }
                }
            }

            match self.establish().await {
                Ok(link) => {
                    self.stats.record_reconnect();
                    info!(attempts = failures + 1, "reconnected to broker");
                    return Ok(Some(link));
                }
                Err(e) => {
                    warn!(attempt = failures + 1, delay_ms = delay.as_millis() as u64, error = %e, "reconnect failed");
                    failures += 1;
                    last_error = e;
                }
            }
        }
    }

    async fn serve(&self, link: &mut Link<B::Session>, shutdown: &mut watch::Receiver<bool>) -> LinkOutcome {
        loop {
            if *shutdown.borrow() {
                return LinkOutcome::Shutdown;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return LinkOutcome::Shutdown;
                    }
                }
                message = link.positions.recv() => match message {
                    Some(envelope) => self.handle_position(&envelope),
                    None => return LinkOutcome::Lost("position queue closed".into()),
                },
                message = link.queries.recv() => match message {
                    Some(envelope) => {
                        if let Err(e) = self.handle_query(&link.session, &envelope).await {
                            return LinkOutcome::Lost(e.to_string());
                        }
                    }
                    None => return LinkOutcome::Lost("query queue closed".into()),
                },
            }
        }
    }

    /// Decodes and ingests one position message. Never fails: malformed or
    /// invalid messages are logged, counted and dropped.
    pub fn handle_position(&self, envelope: &Envelope) {
        let event = match decode_position(envelope) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, bytes = envelope.size(), "dropping malformed position message");
                self.stats.record_dropped();
                return;
            }
        };

        let outcome = lock_tracker(&self.tracker).ingest(&event);
        match outcome {
            Ok(IngestOutcome::Applied { new_contacts, .. }) => {
                self.stats.record_ingest(new_contacts.len());
                debug!(entity = %event.entity_id, x = event.position.x, y = event.position.y, "position updated");
            }
            Ok(IngestOutcome::Stale { .. }) => self.stats.record_stale(),
            Err(e) => {
                warn!(error = %e, "dropping invalid position event");
                self.stats.record_dropped();
            }
        }
    }

    /// Answers one query. Only a lost session is returned as an error.
    async fn handle_query(&self, session: &B::Session, envelope: &Envelope) -> Result<(), TransportError> {
        let reply = match self.responder.respond(envelope) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "dropping malformed query");
                self.stats.record_query(false);
                return Ok(());
            }
        };

        match session.publish(RESPONSE_EXCHANGE, &reply.routing_key, reply.envelope).await {
            Ok(routed) => {
                if routed == 0 {
                    debug!(reply_to = %reply.routing_key, "no queue bound for reply");
                }
                self.stats.record_query(true);
                Ok(())
            }
            Err(e) if e.is_connection_loss() => {
                self.stats.record_query(false);
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, reply_to = %reply.routing_key, "failed to publish reply");
                self.stats.record_query(false);
                Ok(())
            }
        }
    }
}

fn jittered_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let jitter = if policy.jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=policy.jitter_ms)
    } else {
        0
    };
    policy.delay_for(attempt) + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::PositionEvent;
    use crate::protocol::{decode_response, encode_position, encode_query};
    use contact_env::{BrokerController, ExchangeKind, MemoryBroker, TokioContext};

    fn fast_config() -> ServiceConfig {
        ServiceConfig {
            tracking: TrackingConfig::default(),
            reconnect: ReconnectPolicy {
                initial_delay_ms: 5,
                max_delay_ms: 20,
                multiplier: 2.0,
                jitter_ms: 0,
                max_attempts: None,
            },
        }
    }

    fn service(broker: &MemoryBroker) -> Arc<TrackerService<MemoryBroker, TokioContext>> {
        Arc::new(TrackerService::new(
            Arc::new(broker.clone()),
            TokioContext::shared(),
            fast_config(),
        ))
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    async fn publish_position(session: &contact_env::MemorySession, id: &str, x: f64, y: f64, t: f64) {
        let envelope = encode_position(&PositionEvent::new(id, x, y, t), 0).unwrap();
        session.publish(POSITION_EXCHANGE, "", envelope).await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_failure_is_fatal() {
        let broker = MemoryBroker::new("memory://offline");
        broker.set_offline(true);
        let svc = service(&broker);
        let (_tx, rx) = watch::channel(false);

        let err = svc.run(rx).await.unwrap_err();
        assert!(matches!(err, ServiceError::Startup(TransportError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_ingests_and_answers_queries() {
        let broker = MemoryBroker::new("memory://test");
        let svc = service(&broker);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.run(shutdown_rx).await })
        };
        wait_for(|| broker.binding_count(QUERY_EXCHANGE) == 1).await;

        let caller = broker.connect().await.unwrap();
        declare_topology(&caller).await.unwrap();
        let mut replies = caller.subscribe(RESPONSE_EXCHANGE, "reply.test").await.unwrap();

        publish_position(&caller, "A", 0.0, 0.0, 1.0).await;
        publish_position(&caller, "B", 0.0, 0.0, 1.0).await;
        let tracker = svc.tracker();
        wait_for(|| lock_tracker(&tracker).query("A").len() == 1).await;

        let query = encode_query("c-1", "A", "reply.test", 0).unwrap();
        caller.publish(QUERY_EXCHANGE, QUERY_ROUTING_KEY, query).await.unwrap();
        let reply = replies.recv().await.unwrap();
        let response = decode_response(&reply).unwrap();
        assert_eq!(response.correlation_id, "c-1");
        assert_eq!(response.contacts.len(), 1);
        assert_eq!(response.contacts[0].other_entity_id, "B");

        shutdown_tx.send(true).unwrap();
        assert!(runner.await.unwrap().is_ok());
        assert_eq!(svc.stats().snapshot().queries_served, 1);
    }

    #[tokio::test]
    async fn test_malformed_messages_do_not_stop_service() {
        let broker = MemoryBroker::new("memory://test");
        let svc = service(&broker);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.run(shutdown_rx).await })
        };
        wait_for(|| broker.binding_count(POSITION_EXCHANGE) == 1).await;

        let publisher = broker.connect().await.unwrap();
        let garbage = Envelope::new(b"{\"x\": 1}".to_vec(), "application/json", 0);
        publisher.publish(POSITION_EXCHANGE, "", garbage).await.unwrap();
        publish_position(&publisher, "", 1.0, 1.0, 1.0).await;
        publish_position(&publisher, "A", 1.0, 1.0, 1.0).await;

        let tracker = svc.tracker();
        wait_for(|| lock_tracker(&tracker).tracked_count() == 1).await;
        let stats = svc.stats().snapshot();
        assert_eq!(stats.events_dropped, 2);
        assert_eq!(stats.events_ingested, 1);

        shutdown_tx.send(true).unwrap();
        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_records_contact_once() {
        let broker = MemoryBroker::new("memory://test");
        broker.set_duplicate_delivery(true);
        let svc = service(&broker);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.run(shutdown_rx).await })
        };
        wait_for(|| broker.binding_count(POSITION_EXCHANGE) == 1).await;

        let publisher = broker.connect().await.unwrap();
        publish_position(&publisher, "A", 4.0, 4.0, 1.0).await;
        publish_position(&publisher, "B", 4.0, 4.0, 1.0).await;
        wait_for(|| svc.stats().snapshot().events_processed() == 4).await;

        let tracker = svc.tracker();
        assert_eq!(lock_tracker(&tracker).query("A").len(), 1);
        assert_eq!(lock_tracker(&tracker).query("B").len(), 1);
        assert_eq!(svc.stats().snapshot().contacts_recorded, 1);

        shutdown_tx.send(true).unwrap();
        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_reconnects_and_keeps_state() {
        let broker = MemoryBroker::new("memory://test");
        let svc = service(&broker);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.run(shutdown_rx).await })
        };
        wait_for(|| broker.binding_count(POSITION_EXCHANGE) == 1).await;

        let publisher = broker.connect().await.unwrap();
        publish_position(&publisher, "A", 2.0, 2.0, 1.0).await;
        publish_position(&publisher, "B", 2.0, 2.0, 1.0).await;
        let tracker = svc.tracker();
        wait_for(|| lock_tracker(&tracker).query("A").len() == 1).await;

        broker.sever_all();
        wait_for(|| svc.stats().snapshot().reconnects == 1).await;
        wait_for(|| broker.binding_count(POSITION_EXCHANGE) == 1).await;

        // State survived; new traffic flows through the new session.
        let publisher = broker.connect().await.unwrap();
        publish_position(&publisher, "C", 2.0, 2.0, 2.0).await;
        wait_for(|| lock_tracker(&tracker).query("A").len() == 2).await;
        assert_eq!(lock_tracker(&tracker).query("C").len(), 2);

        shutdown_tx.send(true).unwrap();
        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let broker = MemoryBroker::new("memory://test");
        let mut config = fast_config();
        config.reconnect.max_attempts = Some(2);
        let svc = Arc::new(TrackerService::new(
            Arc::new(broker.clone()),
            TokioContext::shared(),
            config,
        ));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.run(shutdown_rx).await })
        };
        wait_for(|| broker.binding_count(POSITION_EXCHANGE) == 1).await;

        broker.set_offline(true);
        broker.sever_all();

        let err = runner.await.unwrap().unwrap_err();
        assert!(matches!(err, ServiceError::ReconnectExhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn test_shutdown_during_outage() {
        let broker = MemoryBroker::new("memory://test");
        let svc = service(&broker);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let svc = Arc::clone(&svc);
            tokio::spawn(async move { svc.run(shutdown_rx).await })
        };
        wait_for(|| broker.binding_count(POSITION_EXCHANGE) == 1).await;

        broker.set_offline(true);
        broker.sever_all();
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();

        assert!(runner.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_topology_tolerates_existing_exchange_kind() {
        let broker = MemoryBroker::new("memory://test");
        let session = broker.connect().await.unwrap();
        session.declare_exchange(QUERY_EXCHANGE, ExchangeKind::Fanout).await.unwrap();

        assert!(declare_topology(&session).await.is_ok());
    }
}
