//! Contact Tracker Core - proximity contact detection over a message broker
//!
//! Entities broadcast positions; one tracker turns the position stream into
//! per-entity contact histories and answers history queries:
//! 1. **Tracking Engine**: debounced pair adjacency, a contact is recorded only
//!    when a pair moves from not-adjacent to adjacent
//! 2. **Contact History Store**: bounded per-entity rings, oldest evicted first
//! 3. **Tracker Service**: single-consumer broker loop with reconnect, plus
//!    the request/response query protocol and its caller-side client

pub mod event;
pub mod history;
pub mod tracking;
pub mod protocol;
pub mod responder;
pub mod runtime;
pub mod client;
pub mod publisher;
pub mod config;
pub mod stats;

// Re-export key types for convenience
pub use event::{EntityId, PositionEvent};
pub use history::{Contact, ContactHistory, DEFAULT_HISTORY_CAPACITY};
pub use tracking::{
    lock_tracker, ContactTracker, DistanceMetric, IngestOutcome, PairKey, PairState, SharedTracker, TrackingConfig,
    TrackingError,
};
pub use protocol::{ContactRecord, ProtocolError, QueryRequest, QueryResponse, PROTOCOL_VERSION};
pub use responder::{QueryResponder, Reply};
pub use runtime::{declare_topology, ServiceConfig, ServiceError, TrackerService};
pub use client::{ClientError, QueryClient, DEFAULT_QUERY_TIMEOUT};
pub use publisher::PositionPublisher;
pub use config::{ConfigError, ReconnectPolicy, TrackerConfig};
pub use stats::{StatsSnapshot, TrackerStats};
