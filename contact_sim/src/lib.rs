//! Contact Tracker Simulation Harness
//!
//! Runs a population of random-walking entities against a live tracker
//! service over an in-process broker.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          SimWorld                            │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ SimContext (virtual clock, seeded RNG streams)         │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                                                              │
//! │  ┌────────┐ ┌────────┐         ┌──────────────────────────┐  │
//! │  │ Walker │ │ Walker │  ...    │     TrackerService       │  │
//! │  │  P01   │ │  P02   │         │ (ContactTracker + query) │  │
//! │  └───┬────┘ └───┬────┘         └────────────▲─────────────┘  │
//! │      │          │                           │                │
//! │  ┌───▼──────────▼───────────────────────────┴─────────────┐  │
//! │  │ MemoryBroker  [position] fanout  [query] direct        │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use contact_sim::{SimConfig, SimWorld};
//!
//! let mut world = SimWorld::new(SimConfig { seed: 42, ..Default::default() });
//! let report = world.run().await?;
//! report.write_to_file("contacts.json")?;
//! ```

mod context;
mod walker;
mod world;
pub mod exporter;

pub use context::SimContext;
pub use walker::{Walker, DIRECTIONS};
pub use world::{OutagePlan, SimConfig, SimError, SimWorld};
pub use exporter::{EntityReport, SimEvent, SimExport};
