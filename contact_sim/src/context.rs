//! Simulation context implementing TrackerContext on a virtual clock.

use async_trait::async_trait;
use contact_env::TrackerContext;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tracing::Instrument;

/// Simulation context backed by a manually advanced clock.
///
/// - `now()` only moves when the harness calls `advance_time`
/// - `sleep()` parks until the virtual clock reaches the deadline, so the
///   tracker's reconnect backoff is measured in simulated time
/// - randomness is derived from one master seed per stream
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    clock: Arc<watch::Sender<u64>>,

    /// Virtual time 0 maps to this wall-clock time
    epoch: SystemTime,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        let (clock, _) = watch::channel(0);
        Self {
            seed,
            clock: Arc::new(clock),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time and wakes every sleeper whose deadline passed.
    pub fn advance_time(&self, duration: Duration) {
        let step = duration.as_nanos() as u64;
        self.clock.send_modify(|t| *t = t.saturating_add(step));
    }

    pub fn time_ns(&self) -> u64 {
        *self.clock.borrow()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Independent deterministic RNG for one stream (e.g. one walker).
    pub fn rng_for(&self, stream: u64) -> ChaCha8Rng {
        let combined = self.seed.wrapping_mul(0x9e3779b97f4a7c15) ^ stream;
        ChaCha8Rng::seed_from_u64(combined)
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            clock: Arc::clone(&self.clock),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl TrackerContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        let deadline = self.time_ns().saturating_add(duration.as_nanos() as u64);
        let mut clock = self.clock.subscribe();
        loop {
            let now = *clock.borrow_and_update();
            if now >= deadline {
                return;
            }
            if clock.changed().await.is_err() {
                return;
            }
        }
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let span = tracing::debug_span!("sim_task", name = %name);
        tokio::spawn(future.instrument(span));
    }
}
