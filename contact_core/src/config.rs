//! Static configuration for the tracker and its collaborators.
//!
//! Loaded once at startup (JSON file, every field optional) and never
//! reloaded. The core only reads `max_history`, the proximity settings and
//! the reconnect policy; the rest is consumed by the simulator and CLI.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use contact_env::{MemoryBroker, MEMORY_SCHEME};

use crate::history::DEFAULT_HISTORY_CAPACITY;
use crate::tracking::{DistanceMetric, TrackingConfig};

/// Exponential reconnect backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// First retry delay (default: 100ms)
    pub initial_delay_ms: u64,

    /// Delay ceiling (default: 5s)
    pub max_delay_ms: u64,

    /// Growth factor per attempt (default: 2.0)
    pub multiplier: f64,

    /// Random extra delay added to each retry, up to this many ms (default: 50)
    pub jitter_ms: u64,

    /// Give up after this many consecutive failures (default: never)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter_ms: 50,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Base delay before retry number `attempt` (0-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Side length of the square simulation board (default: 10)
    pub board_size: u32,

    /// Base interval between simulated moves (default: 100ms)
    pub update_interval_ms: u64,

    /// Contacts retained per entity (default: 100)
    pub max_history: usize,

    /// Contact distance (default: 0.0, same cell)
    pub proximity_threshold: f64,

    pub distance_metric: DistanceMetric,

    /// Broker address (default: "memory://local")
    pub broker_endpoint: String,

    pub reconnect: ReconnectPolicy,

    /// Default tracing filter (default: "info")
    pub log_level: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            board_size: 10,
            update_interval_ms: 100,
            max_history: DEFAULT_HISTORY_CAPACITY,
            proximity_threshold: 0.0,
            distance_metric: DistanceMetric::Euclidean,
            broker_endpoint: "memory://local".to_string(),
            reconnect: ReconnectPolicy::default(),
            log_level: "info".to_string(),
        }
    }
}

impl TrackerConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.board_size == 0 {
            return Err(ConfigError::Invalid("board_size must be at least 1".into()));
        }
        if self.update_interval_ms == 0 {
            return Err(ConfigError::Invalid("update_interval_ms must be positive".into()));
        }
        if self.max_history == 0 {
            return Err(ConfigError::Invalid("max_history must be at least 1".into()));
        }
        if !self.proximity_threshold.is_finite() || self.proximity_threshold < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "proximity_threshold must be a non-negative number, got {}",
                self.proximity_threshold
            )));
        }
        if self.broker_endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("broker_endpoint is empty".into()));
        }
        if !MemoryBroker::serves(&self.broker_endpoint) {
            return Err(ConfigError::Invalid(format!(
                "unsupported broker_endpoint '{}': only {}<name> is available",
                self.broker_endpoint, MEMORY_SCHEME
            )));
        }
        let policy = &self.reconnect;
        if policy.multiplier.is_nan() || policy.multiplier < 1.0 {
            return Err(ConfigError::Invalid("reconnect.multiplier must be >= 1.0".into()));
        }
        if policy.initial_delay_ms > policy.max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.initial_delay_ms exceeds reconnect.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Engine settings derived from this file.
    pub fn tracking(&self) -> TrackingConfig {
        TrackingConfig {
            threshold: self.proximity_threshold,
            metric: self.distance_metric,
            history_capacity: self.max_history,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TrackerConfig::default();
        assert_eq!(config.board_size, 10);
        assert_eq!(config.update_interval_ms, 100);
        assert_eq!(config.max_history, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = TrackerConfig::from_json_str(
            r#"{"board_size": 20, "max_history": 5, "distance_metric": "chebyshev", "reconnect": {"max_attempts": 3}}"#,
        )
        .unwrap();
        assert_eq!(config.board_size, 20);
        assert_eq!(config.max_history, 5);
        assert_eq!(config.distance_metric, DistanceMetric::Chebyshev);
        assert_eq!(config.reconnect.max_attempts, Some(3));
        assert_eq!(config.reconnect.initial_delay_ms, 100);
        assert_eq!(config.broker_endpoint, "memory://local");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            TrackerConfig::from_json_str(r#"{"max_history": 0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            TrackerConfig::from_json_str(r#"{"proximity_threshold": -1.0}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            TrackerConfig::from_json_str(r#"{"board_size": "big"}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_unsupported_endpoint_rejected() {
        for endpoint in ["amqp://rabbitmq.invalid:5672", "memory://", "local"] {
            let err = TrackerConfig::from_json_str(&format!(r#"{{"broker_endpoint": "{endpoint}"}}"#))
                .unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{endpoint} accepted");
        }
        let config = TrackerConfig::from_json_str(r#"{"broker_endpoint": "memory://sim"}"#).unwrap();
        assert_eq!(config.broker_endpoint, "memory://sim");
    }

    #[test]
    fn test_missing_file() {
        let err = TrackerConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(20), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_millis(5_000));
    }

    #[test]
    fn test_max_attempts() {
        let unlimited = ReconnectPolicy::default();
        assert!(unlimited.allows(1_000_000));

        let limited = ReconnectPolicy {
            max_attempts: Some(2),
            ..ReconnectPolicy::default()
        };
        assert!(limited.allows(1));
        assert!(!limited.allows(2));
    }

    #[test]
    fn test_tracking_settings() {
        let config = TrackerConfig {
            proximity_threshold: 1.5,
            max_history: 7,
            ..TrackerConfig::default()
        };
        let tracking = config.tracking();
        assert_eq!(tracking.threshold, 1.5);
        assert_eq!(tracking.history_capacity, 7);
    }
}
