//! Position Publisher - entity side of the position broadcast.

use contact_env::{Broker, BrokerSession, ConnectionId, TrackerContext};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::client::ClientError;
use crate::event::PositionEvent;
use crate::protocol::{encode_position, POSITION_EXCHANGE};
use crate::runtime::declare_topology;

/// Publishes position reports onto the `position` fanout.
///
/// Publishing is fire-and-forget: a report published while no tracker is
/// bound is routed nowhere and is not an error. Envelopes carry the
/// context's wall clock.
pub struct PositionPublisher<S: BrokerSession, Ctx: TrackerContext> {
    session: S,
    context: Arc<Ctx>,
    published: AtomicU64,
}

impl<S: BrokerSession, Ctx: TrackerContext> PositionPublisher<S, Ctx> {
    /// Opens a dedicated session and declares the topology.
    pub async fn connect<B>(broker: &B, context: Arc<Ctx>) -> Result<Self, ClientError>
    where
        B: Broker<Session = S>,
    {
        let session = broker.connect().await?;
        declare_topology(&session).await?;
        debug!(connection = %session.connection_id(), "position publisher connected");

        Ok(Self {
            session,
            context,
            published: AtomicU64::new(0),
        })
    }

    /// Publishes one report.
    ///
    /// # Returns
    /// Number of queues the report reached (0 when no tracker is listening).
    pub async fn publish(&self, event: &PositionEvent) -> Result<usize, ClientError> {
        let envelope = encode_position(event, self.context.unix_millis())?;
        let routed = self.session.publish(POSITION_EXCHANGE, "", envelope).await?;
        self.published.fetch_add(1, Ordering::Relaxed);
        trace!(entity = %event.entity_id, x = event.position.x, y = event.position.y, routed, "position published");
        Ok(routed)
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.session.connection_id()
    }

    pub async fn close(&self) {
        self.session.close().await;
    }
}
