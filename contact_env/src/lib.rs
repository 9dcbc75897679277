//! Contact Tracker Environment Abstraction Layer
//!
//! This crate isolates everything the tracking engine needs from the outside
//! world behind two seams:
//! - **Broker**: publish/subscribe and request/response messaging
//!   (`Broker`, `BrokerSession`, `Subscription`)
//! - **Context**: time, sleeping and task spawning (`TrackerContext`)
//!
//! The engine never holds ambient global state; a broker handle is passed in
//! explicitly and every reconnect goes back through `Broker::connect`.
//!
//! # Exchanges
//!
//! ```text
//! publishers --(fanout)--> [position] ----------> tracker
//! caller ----(direct)----> [query] --tracker_query--> tracker
//! tracker ---(direct)----> [query_response] --reply_to--> caller
//! ```
//!
//! # Example
//!
//! ```ignore
//! use contact_env::{Broker, BrokerSession, ExchangeKind, MemoryBroker};
//!
//! let broker = MemoryBroker::new("memory://local");
//! let session = broker.connect().await?;
//! session.declare_exchange("position", ExchangeKind::Fanout).await?;
//! let mut positions = session.subscribe("position", "").await?;
//! while let Some(envelope) = positions.recv().await {
//!     handle(envelope);
//! }
//! ```

mod context;
mod transport;
mod types;
mod error;
mod tokio_impl;
mod memory;

pub use context::TrackerContext;
pub use transport::{Broker, BrokerSession, BrokerController, Subscription};
pub use types::{ConnectionId, Envelope, ExchangeKind};
pub use error::TransportError;
pub use tokio_impl::TokioContext;
pub use memory::{MemoryBroker, MemorySession, MEMORY_SCHEME};
