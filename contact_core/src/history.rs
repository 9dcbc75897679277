//! Bounded per-entity contact history.
//!
//! Each entity owns a FIFO ring of past contacts. Insertion order is
//! detection order; once a ring is full the oldest record is evicted to
//! admit the new one. Records are never mutated after insertion.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::event::EntityId;

/// Default number of contacts retained per entity.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// One recorded contact, as seen from the owning entity's side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// The entity that was in range
    pub other_entity_id: EntityId,

    /// The owner's position at detection
    pub own_position: Vector2<f64>,

    /// The other party's position at detection
    pub other_position: Vector2<f64>,

    /// Timestamp of the event that triggered detection
    pub timestamp: f64,
}

/// Capacity-bounded contact rings keyed by entity.
#[derive(Debug, Clone)]
pub struct ContactHistory {
    rings: HashMap<EntityId, VecDeque<Contact>>,
    capacity: usize,
}

impl ContactHistory {
    /// Creates an empty store; `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: HashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a contact, evicting the oldest one if the ring is full.
    pub fn append(&mut self, entity_id: &EntityId, contact: Contact) {
        let capacity = self.capacity;
        let ring = self
            .rings
            .entry(entity_id.clone())
            .or_insert_with(|| VecDeque::with_capacity(capacity.min(16)));

        if ring.len() >= capacity {
            ring.pop_front();
        }
        ring.push_back(contact);
    }

    /// Snapshot of an entity's contacts, oldest first.
    ///
    /// Unknown entities yield an empty vector.
    pub fn read(&self, entity_id: &str) -> Vec<Contact> {
        self.rings
            .get(entity_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, entity_id: &str) -> usize {
        self.rings.get(entity_id).map(VecDeque::len).unwrap_or(0)
    }

    /// Number of entities with at least one recorded contact.
    pub fn entity_count(&self) -> usize {
        self.rings.len()
    }

    pub fn total_contacts(&self) -> usize {
        self.rings.values().map(VecDeque::len).sum()
    }

    /// Ids of every entity with a history, sorted.
    pub fn entities(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.rings.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for ContactHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
