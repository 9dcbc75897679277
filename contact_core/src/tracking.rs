//! The "TRACKING" Engine - Proximity Contact Detection
//!
//! Maintains the last-known position of every entity and turns position
//! updates into contact records:
//! 1. Validation (drop malformed or stale events)
//! 2. Position table update
//! 3. Pairwise proximity check against every tracked entity
//! 4. Debounced transition detection (NOT_ADJACENT -> ADJACENT records a contact)
//! 5. Symmetric recording into both parties' histories
//!
//! Detection compares each party's *most recent* position at the time of
//! ingestion; positions need not share a timestamp, so precision is bounded
//! by publish frequency.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

use crate::event::{EntityId, PositionEvent};
use crate::history::{Contact, ContactHistory, DEFAULT_HISTORY_CAPACITY};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Distance function used by the proximity predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// Straight-line distance
    #[default]
    Euclidean,
    /// |dx| + |dy|
    Manhattan,
    /// max(|dx|, |dy|); threshold 1.0 means "same or neighbouring cell"
    Chebyshev,
}

impl DistanceMetric {
    pub fn distance(&self, a: &Vector2<f64>, b: &Vector2<f64>) -> f64 {
        let delta = a - b;
        match self {
            DistanceMetric::Euclidean => delta.norm(),
            DistanceMetric::Manhattan => delta.lp_norm(1),
            DistanceMetric::Chebyshev => delta.amax(),
        }
    }
}

/// Configuration for the ContactTracker
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    /// Maximum distance at which two entities are in contact (default: 0.0, same cell)
    pub threshold: f64,

    /// Distance function (default: Euclidean)
    pub metric: DistanceMetric,

    /// Contacts retained per entity (default: 100)
    pub history_capacity: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            metric: DistanceMetric::Euclidean,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

// ============================================================================
// PAIR STATE (Debounce)
// ============================================================================

/// Unordered pair of entity ids; `(a, b)` and `(b, a)` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey(EntityId, EntityId);

impl PairKey {
    pub fn new(a: &EntityId, b: &EntityId) -> Self {
        if a <= b {
            Self(a.clone(), b.clone())
        } else {
            Self(b.clone(), a.clone())
        }
    }

    pub fn members(&self) -> (&EntityId, &EntityId) {
        (&self.0, &self.1)
    }
}

/// Per-pair adjacency state. Unseen pairs are `NotAdjacent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairState {
    NotAdjacent,
    Adjacent,
}

/// Result of ingesting one position event.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Position applied; lists the pair transitions it caused.
    Applied {
        /// Entities that entered contact with the ingested entity
        new_contacts: Vec<EntityId>,
        /// Entities that left contact with the ingested entity
        separations: Vec<EntityId>,
    },

    /// Older than the stored position for this entity; ignored.
    Stale { last_timestamp: f64 },
}

impl IngestOutcome {
    pub fn new_contact_count(&self) -> usize {
        match self {
            IngestOutcome::Applied { new_contacts, .. } => new_contacts.len(),
            IngestOutcome::Stale { .. } => 0,
        }
    }
}

// ============================================================================
// CONTACT TRACKER (The Engine)
// ============================================================================

/// Shared handle used by the service loop and any polling reader.
pub type SharedTracker = Arc<Mutex<ContactTracker>>;

/// Locks a shared tracker, recovering the guard if a previous holder panicked.
///
/// Every mutation completes inside a single call, so a poisoned lock still
/// guards consistent state.
pub fn lock_tracker(tracker: &SharedTracker) -> MutexGuard<'_, ContactTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The core engine: position table, adjacency set and contact history.
///
/// All three are mutated together inside `ingest`, so callers serialize
/// access by holding the tracker's lock for the duration of one call.
pub struct ContactTracker {
    /// Last-known position per entity
    positions: HashMap<EntityId, PositionEvent>,

    /// Pairs currently in range (transient debounce state)
    adjacency: HashSet<PairKey>,

    /// Bounded contact rings
    history: ContactHistory,

    config: TrackingConfig,
}

impl ContactTracker {
    /// Create a new ContactTracker with the given configuration.
    pub fn new(config: TrackingConfig) -> Self {
        Self {
            positions: HashMap::new(),
            adjacency: HashSet::new(),
            history: ContactHistory::new(config.history_capacity),
            config,
        }
    }

    /// Create a new ContactTracker with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(TrackingConfig::default())
    }

    /// Wraps the tracker for sharing across tasks.
    pub fn shared(self) -> SharedTracker {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Applies one position event and records any new contacts.
    ///
    /// Duplicate delivery is harmless: adjacency is derived from positions,
    /// so re-ingesting the same event finds every in-range pair already
    /// adjacent and records nothing.
    pub fn ingest(&mut self, event: &PositionEvent) -> Result<IngestOutcome, TrackingError> {
        event.validate()?;

        if let Some(previous) = self.positions.get(&event.entity_id) {
            if event.timestamp < previous.timestamp {
                debug!(
                    entity = %event.entity_id,
                    timestamp = event.timestamp,
                    last = previous.timestamp,
                    "stale position dropped"
                );
                return Ok(IngestOutcome::Stale {
                    last_timestamp: previous.timestamp,
                });
            }
        }

        self.positions.insert(event.entity_id.clone(), event.clone());

        // Evaluate against every other tracked entity's latest position.
        let mut transitions: Vec<(EntityId, Vector2<f64>, bool)> = self
            .positions
            .iter()
            .filter(|(id, _)| **id != event.entity_id)
            .filter_map(|(id, other)| {
                let in_range = self.within_threshold(&event.position, &other.position);
                let adjacent = self.adjacency.contains(&PairKey::new(&event.entity_id, id));
                match (adjacent, in_range) {
                    (false, true) => Some((id.clone(), other.position, true)),
                    (true, false) => Some((id.clone(), other.position, false)),
                    _ => None,
                }
            })
            .collect();
        transitions.sort_by(|a, b| a.0.cmp(&b.0));

        let mut new_contacts = Vec::new();
        let mut separations = Vec::new();

        for (other_id, other_position, entered) in transitions {
            let key = PairKey::new(&event.entity_id, &other_id);
            if entered {
                self.adjacency.insert(key);
                self.record_contact(event, &other_id, other_position);
                new_contacts.push(other_id);
            } else {
                self.adjacency.remove(&key);
                debug!(entity = %event.entity_id, other = %other_id, "contact ended");
                separations.push(other_id);
            }
        }

        Ok(IngestOutcome::Applied {
            new_contacts,
            separations,
        })
    }

    /// Appends the contact to both parties' histories.
    fn record_contact(&mut self, event: &PositionEvent, other_id: &EntityId, other_position: Vector2<f64>) {
        info!(
            entity = %event.entity_id,
            other = %other_id,
            x = event.position.x,
            y = event.position.y,
            timestamp = event.timestamp,
            "contact detected"
        );

        self.history.append(
            &event.entity_id,
            Contact {
                other_entity_id: other_id.clone(),
                own_position: event.position,
                other_position,
                timestamp: event.timestamp,
            },
        );
        self.history.append(
            other_id,
            Contact {
                other_entity_id: event.entity_id.clone(),
                own_position: other_position,
                other_position: event.position,
                timestamp: event.timestamp,
            },
        );
    }

    fn within_threshold(&self, a: &Vector2<f64>, b: &Vector2<f64>) -> bool {
        self.config.metric.distance(a, b) <= self.config.threshold
    }

    /// Contact history for an entity, oldest first. Empty for unknown ids.
    pub fn query(&self, entity_id: &str) -> Vec<Contact> {
        self.history.read(entity_id)
    }

    /// Whether the two entities' latest positions are within range right now.
    ///
    /// Unknown entities are never in range.
    pub fn in_range(&self, a: &str, b: &str) -> bool {
        match (self.positions.get(a), self.positions.get(b)) {
            (Some(pa), Some(pb)) if a != b => self.within_threshold(&pa.position, &pb.position),
            _ => false,
        }
    }

    /// Debounce state of a pair.
    pub fn pair_state(&self, a: &str, b: &str) -> PairState {
        if self.adjacency.contains(&PairKey::new(&EntityId::from(a), &EntityId::from(b))) {
            PairState::Adjacent
        } else {
            PairState::NotAdjacent
        }
    }

    pub fn is_adjacent(&self, a: &str, b: &str) -> bool {
        self.pair_state(a, b) == PairState::Adjacent
    }

    /// Last-known position of an entity.
    pub fn position_of(&self, entity_id: &str) -> Option<&PositionEvent> {
        self.positions.get(entity_id)
    }

    /// Number of entities in the position table.
    pub fn tracked_count(&self) -> usize {
        self.positions.len()
    }

    /// Every entity in the position table, sorted.
    pub fn tracked_entities(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.positions.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Pairs currently adjacent, sorted.
    pub fn adjacent_pairs(&self) -> Vec<(EntityId, EntityId)> {
        let mut pairs: Vec<(EntityId, EntityId)> = self
            .adjacency
            .iter()
            .map(|key| {
                let (a, b) = key.members();
                (a.clone(), b.clone())
            })
            .collect();
        pairs.sort();
        pairs
    }

    pub fn history(&self) -> &ContactHistory {
        &self.history
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Errors that make a position event unusable.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrackingError {
    #[error("Position event has no entity id")]
    MissingEntityId,

    #[error("Invalid coordinates: {0}")]
    InvalidCoordinates(String),

    #[error("Invalid timestamp for {0}")]
    InvalidTimestamp(String),
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn tracker_with_threshold(threshold: f64) -> ContactTracker {
        ContactTracker::new(TrackingConfig {
            threshold,
            ..TrackingConfig::default()
        })
    }

    #[test]
    fn test_distance_metrics() {
        let a = Vector2::new(0.0, 0.0);
        let b = Vector2::new(3.0, 4.0);
        assert_relative_eq!(DistanceMetric::Euclidean.distance(&a, &b), 5.0);
        assert_relative_eq!(DistanceMetric::Manhattan.distance(&a, &b), 7.0);
        assert_relative_eq!(DistanceMetric::Chebyshev.distance(&a, &b), 4.0);
    }

    #[test]
    fn test_pair_key_is_unordered() {
        let a = EntityId::from("a");
        let b = EntityId::from("b");
        assert_eq!(PairKey::new(&a, &b), PairKey::new(&b, &a));
    }

    #[test]
    fn test_colocated_entities_record_one_contact_each() {
        let mut tracker = tracker_with_threshold(1.0);

        tracker.ingest(&PositionEvent::new("A", 0.0, 0.0, 1.0)).unwrap();
        let outcome = tracker.ingest(&PositionEvent::new("B", 0.0, 0.0, 1.0)).unwrap();
        assert_eq!(outcome.new_contact_count(), 1);

        let a_history = tracker.query("A");
        let b_history = tracker.query("B");
        assert_eq!(a_history.len(), 1);
        assert_eq!(b_history.len(), 1);
        assert_eq!(a_history[0].other_entity_id.as_str(), "B");
        assert_eq!(b_history[0].other_entity_id.as_str(), "A");
        assert_eq!(a_history[0].timestamp, b_history[0].timestamp);
        assert!(tracker.is_adjacent("A", "B"));
    }

    #[test]
    fn test_departure_records_nothing() {
        let mut tracker = tracker_with_threshold(1.0);
        tracker.ingest(&PositionEvent::new("A", 0.0, 0.0, 1.0)).unwrap();
        tracker.ingest(&PositionEvent::new("B", 0.0, 0.0, 1.0)).unwrap();

        let outcome = tracker.ingest(&PositionEvent::new("A", 10.0, 10.0, 2.0)).unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Applied {
                new_contacts: vec![],
                separations: vec![EntityId::from("B")],
            }
        );
        assert_eq!(tracker.pair_state("A", "B"), PairState::NotAdjacent);
        assert!(!tracker.in_range("A", "B"));
        assert_eq!(tracker.query("A").len(), 1);
        assert_eq!(tracker.query("B").len(), 1);
    }

    #[test]
    fn test_duplicate_ingestion_is_idempotent() {
        let mut tracker = tracker_with_threshold(1.0);
        tracker.ingest(&PositionEvent::new("A", 0.0, 0.0, 1.0)).unwrap();
        let event = PositionEvent::new("B", 0.5, 0.0, 1.0);
        tracker.ingest(&event).unwrap();
        let again = tracker.ingest(&event).unwrap();

        assert_eq!(again.new_contact_count(), 0);
        assert_eq!(tracker.query("A").len(), 1);
        assert_eq!(tracker.query("B").len(), 1);
    }

    #[test]
    fn test_debounce_over_consecutive_updates() {
        let mut tracker = tracker_with_threshold(1.0);
        for tick in 0..10 {
            let t = tick as f64;
            let x = tick as f64 * 0.1;
            tracker.ingest(&PositionEvent::new("A", x, 0.0, t)).unwrap();
            tracker.ingest(&PositionEvent::new("B", x, 0.5, t)).unwrap();
        }
        assert_eq!(tracker.query("A").len(), 1);
        assert_eq!(tracker.query("B").len(), 1);
    }

    #[test]
    fn test_reentry_records_again() {
        let mut tracker = tracker_with_threshold(0.0);
        tracker.ingest(&PositionEvent::new("A", 1.0, 1.0, 1.0)).unwrap();
        tracker.ingest(&PositionEvent::new("B", 1.0, 1.0, 1.0)).unwrap();
        tracker.ingest(&PositionEvent::new("B", 2.0, 1.0, 2.0)).unwrap();
        tracker.ingest(&PositionEvent::new("B", 1.0, 1.0, 3.0)).unwrap();

        let history = tracker.query("A");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].timestamp, 3.0);
    }

    #[test]
    fn test_only_colocated_party_is_contacted() {
        let mut tracker = ContactTracker::with_defaults();
        tracker.ingest(&PositionEvent::new("person1", 1.0, 1.0, 1.0)).unwrap();
        tracker.ingest(&PositionEvent::new("person3", 2.0, 2.0, 1.0)).unwrap();
        tracker.ingest(&PositionEvent::new("person2", 1.0, 1.0, 1.0)).unwrap();

        assert_eq!(tracker.query("person1").len(), 1);
        assert_eq!(tracker.query("person2").len(), 1);
        assert!(tracker.query("person3").is_empty());
    }

    #[test]
    fn test_contact_positions_are_from_each_side() {
        let mut tracker = tracker_with_threshold(2.0);
        tracker.ingest(&PositionEvent::new("A", 0.0, 0.0, 1.0)).unwrap();
        tracker.ingest(&PositionEvent::new("B", 1.0, 1.0, 2.0)).unwrap();

        let a = &tracker.query("A")[0];
        assert_eq!(a.own_position, Vector2::new(0.0, 0.0));
        assert_eq!(a.other_position, Vector2::new(1.0, 1.0));
        assert_eq!(a.timestamp, 2.0);

        let b = &tracker.query("B")[0];
        assert_eq!(b.own_position, Vector2::new(1.0, 1.0));
        assert_eq!(b.other_position, Vector2::new(0.0, 0.0));
    }

    #[test]
    fn test_stale_event_is_ignored() {
        let mut tracker = ContactTracker::with_defaults();
        tracker.ingest(&PositionEvent::new("A", 5.0, 5.0, 10.0)).unwrap();
        let outcome = tracker.ingest(&PositionEvent::new("A", 0.0, 0.0, 9.0)).unwrap();

        assert_eq!(outcome, IngestOutcome::Stale { last_timestamp: 10.0 });
        assert_eq!(tracker.position_of("A").unwrap().position, Vector2::new(5.0, 5.0));
    }

    #[test]
    fn test_malformed_event_leaves_state_untouched() {
        let mut tracker = ContactTracker::with_defaults();
        let err = tracker.ingest(&PositionEvent::new("", 0.0, 0.0, 0.0)).unwrap_err();
        assert_eq!(err, TrackingError::MissingEntityId);
        assert!(tracker.ingest(&PositionEvent::new("A", f64::NAN, 0.0, 0.0)).is_err());
        assert_eq!(tracker.tracked_count(), 0);
    }

    #[test]
    fn test_unknown_entity_query_is_empty() {
        let tracker = ContactTracker::with_defaults();
        assert!(tracker.query("never-seen-id").is_empty());
        assert_eq!(tracker.pair_state("x", "y"), PairState::NotAdjacent);
    }

    #[test]
    fn test_history_bounded_by_capacity() {
        let mut tracker = ContactTracker::new(TrackingConfig {
            history_capacity: 5,
            ..TrackingConfig::default()
        });
        tracker.ingest(&PositionEvent::new("A", 0.0, 0.0, 0.0)).unwrap();
        for i in 0..12 {
            let t = i as f64 + 1.0;
            // Alternate B between A's cell and a far cell: one transition per visit.
            let x = if i % 2 == 0 { 0.0 } else { 50.0 };
            tracker.ingest(&PositionEvent::new("B", x, 0.0, t)).unwrap();
        }

        let history = tracker.query("A");
        assert_eq!(history.len(), 5);
        let stamps: Vec<f64> = history.iter().map(|c| c.timestamp).collect();
        assert_eq!(stamps, vec![3.0, 5.0, 7.0, 9.0, 11.0]);
    }

    #[test]
    fn test_shared_tracker_survives_poisoning() {
        let shared = ContactTracker::with_defaults().shared();
        let clone = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        let mut tracker = lock_tracker(&shared);
        assert!(tracker.ingest(&PositionEvent::new("A", 0.0, 0.0, 0.0)).is_ok());
    }

    proptest! {
        #[test]
        fn prop_contacts_are_symmetric(
            moves in proptest::collection::vec((0usize..4, 0i32..4, 0i32..4), 1..80)
        ) {
            let mut tracker = ContactTracker::new(TrackingConfig {
                history_capacity: 1000,
                ..TrackingConfig::default()
            });
            let names = ["a", "b", "c", "d"];
            for (step, (who, x, y)) in moves.iter().enumerate() {
                let event = PositionEvent::new(names[*who], *x as f64, *y as f64, step as f64);
                tracker.ingest(&event).unwrap();
            }

            for owner in names {
                for contact in tracker.query(owner) {
                    let mirror = tracker
                        .query(contact.other_entity_id.as_str())
                        .into_iter()
                        .filter(|c| c.other_entity_id.as_str() == owner && c.timestamp == contact.timestamp)
                        .count();
                    prop_assert_eq!(mirror, 1);
                }
            }
        }

        #[test]
        fn prop_stationary_pair_records_once(updates in 1usize..30) {
            let mut tracker = ContactTracker::with_defaults();
            for t in 0..updates {
                tracker.ingest(&PositionEvent::new("a", 2.0, 2.0, t as f64)).unwrap();
                tracker.ingest(&PositionEvent::new("b", 2.0, 2.0, t as f64)).unwrap();
            }
            prop_assert_eq!(tracker.query("a").len(), 1);
            prop_assert_eq!(tracker.query("b").len(), 1);
        }
    }
}
