//! Position events and entity identity.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use crate::tracking::TrackingError;

/// Stable identifier of a tracked entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A single position report published by an entity.
///
/// Immutable once published. `timestamp` is non-decreasing per entity; no
/// ordering is assumed across entities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub entity_id: EntityId,

    /// Position [x, y] on the board
    pub position: Vector2<f64>,

    /// Publisher's timestamp (seconds, logical or wall-clock)
    pub timestamp: f64,
}

impl PositionEvent {
    pub fn new(entity_id: impl Into<EntityId>, x: f64, y: f64, timestamp: f64) -> Self {
        Self {
            entity_id: entity_id.into(),
            position: Vector2::new(x, y),
            timestamp,
        }
    }

    /// Rejects events the engine must not apply.
    pub fn validate(&self) -> Result<(), TrackingError> {
        if self.entity_id.is_empty() {
            return Err(TrackingError::MissingEntityId);
        }
        if !self.position.iter().all(|c| c.is_finite()) {
            return Err(TrackingError::InvalidCoordinates(format!(
                "({}, {}) for {}",
                self.position.x, self.position.y, self.entity_id
            )));
        }
        if !self.timestamp.is_finite() {
            return Err(TrackingError::InvalidTimestamp(self.entity_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_event() {
        let event = PositionEvent::new("p1", 3.0, 4.0, 1.0);
        assert!(event.validate().is_ok());
        assert_eq!(event.entity_id.as_str(), "p1");
    }

    #[test]
    fn test_blank_id_is_rejected() {
        let event = PositionEvent::new("  ", 0.0, 0.0, 0.0);
        assert!(matches!(event.validate(), Err(TrackingError::MissingEntityId)));
    }

    #[test]
    fn test_non_finite_coordinates_are_rejected() {
        let event = PositionEvent::new("p1", f64::NAN, 0.0, 0.0);
        assert!(matches!(event.validate(), Err(TrackingError::InvalidCoordinates(_))));

        let event = PositionEvent::new("p1", 0.0, f64::INFINITY, 0.0);
        assert!(matches!(event.validate(), Err(TrackingError::InvalidCoordinates(_))));
    }

    #[test]
    fn test_non_finite_timestamp_is_rejected() {
        let event = PositionEvent::new("p1", 0.0, 0.0, f64::NAN);
        assert!(matches!(event.validate(), Err(TrackingError::InvalidTimestamp(_))));
    }
}
