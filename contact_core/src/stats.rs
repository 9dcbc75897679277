//! Tracker Counters
//! ================
//!
//! Lock-free counters updated by the service loop and readable from any
//! task. `snapshot()` yields a plain serializable copy for reports.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for one tracker service.
#[derive(Debug, Default)]
pub struct TrackerStats {
    events_ingested: AtomicU64,
    events_dropped: AtomicU64,
    stale_events: AtomicU64,
    contacts_recorded: AtomicU64,
    queries_served: AtomicU64,
    queries_failed: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of `TrackerStats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Position events applied to the table
    pub events_ingested: u64,
    /// Malformed position messages discarded
    pub events_dropped: u64,
    /// Position events older than the stored position
    pub stale_events: u64,
    /// Contact transitions (each recorded on both sides)
    pub contacts_recorded: u64,
    pub queries_served: u64,
    /// Queries that could not be decoded or answered
    pub queries_failed: u64,
    /// Successful re-connections after a lost session
    pub reconnects: u64,
}

impl StatsSnapshot {
    /// Position messages the service has taken off the queue, whatever their fate.
    pub fn events_processed(&self) -> u64 {
        self.events_ingested + self.events_dropped + self.stale_events
    }
}

impl TrackerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_ingest(&self, new_contacts: usize) {
        self.events_ingested.fetch_add(1, Ordering::Relaxed);
        self.contacts_recorded.fetch_add(new_contacts as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_stale(&self) {
        self.stale_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_query(&self, ok: bool) {
        if ok {
            self.queries_served.fetch_add(1, Ordering::Relaxed);
        } else {
            self.queries_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_ingested: self.events_ingested.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            stale_events: self.stale_events.load(Ordering::Relaxed),
            contacts_recorded: self.contacts_recorded.load(Ordering::Relaxed),
            queries_served: self.queries_served.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}
