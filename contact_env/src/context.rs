//! Core environment context trait for the tracker runtime.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime};

/// The central interface for time and task interaction.
///
/// This trait abstracts the "real world" so that the tracker service and the
/// simulated publishers can run against the wall clock in production and a
/// virtual clock in tests.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`
/// - **Simulation**: `SimContext` (in `contact_sim`) - manually advanced clock
#[async_trait]
pub trait TrackerContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used to stamp outgoing messages.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// Used for publish pacing and reconnect backoff.
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Wall-clock time as fractional seconds since the Unix epoch.
    fn unix_seconds(&self) -> f64 {
        self.system_time()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Wall-clock time in Unix milliseconds, for envelope timestamps.
    fn unix_millis(&self) -> u64 {
        self.system_time()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}
