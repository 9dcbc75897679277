//! SimWorld - The simulation harness container.
//!
//! Wires one in-process broker, one tracker service and one publisher task per
//! walker. The world drives the virtual clock tick by tick: every walker moves
//! and publishes in a fixed order, then the world waits until the tracker has
//! drained its queue. With no outage injected, a seed fully determines every
//! contact history.

use crate::context::SimContext;
use crate::exporter::{EntityReport, SimExport};
use crate::walker::Walker;

use contact_core::{
    lock_tracker, ClientError, ContactRecord, EntityId, PositionEvent, PositionPublisher, QueryClient, QueryResponse,
    ServiceConfig, ServiceError, SharedTracker, StatsSnapshot, TrackerConfig, TrackerService,
};
use contact_env::{BrokerController, MemoryBroker, MemorySession, TrackerContext};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A scheduled broker outage.
#[derive(Debug, Clone, PartialEq)]
pub struct OutagePlan {
    /// Simulated second the broker goes down
    pub at_secs: f64,
    pub duration_secs: f64,
}

/// Configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    pub num_entities: usize,

    /// Simulated run length in seconds
    pub duration_secs: f64,

    /// Walker speeds are drawn uniformly from this range (moves per second)
    pub min_speed: f64,
    pub max_speed: f64,

    pub outage: Option<OutagePlan>,

    /// Wall-clock budget for the tracker to drain one tick
    pub settle_timeout: Duration,

    /// Board size, tick interval and tracking parameters
    pub tracker: TrackerConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            num_entities: 5,
            duration_secs: 10.0,
            min_speed: 0.5,
            max_speed: 2.0,
            outage: None,
            settle_timeout: Duration::from_secs(2),
            tracker: TrackerConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), SimError> {
        self.tracker
            .validate()
            .map_err(|e| SimError::InvalidConfig(e.to_string()))?;
        if !self.duration_secs.is_finite() || self.duration_secs < 0.0 {
            return Err(SimError::InvalidConfig("duration must be a non-negative number".into()));
        }
        if !(self.min_speed.is_finite() && self.max_speed.is_finite())
            || self.min_speed <= 0.0
            || self.min_speed > self.max_speed
        {
            return Err(SimError::InvalidConfig(format!(
                "speed range {}..{} must be positive and ordered",
                self.min_speed, self.max_speed
            )));
        }
        if let Some(plan) = &self.outage {
            if !(plan.at_secs >= 0.0 && plan.duration_secs > 0.0) {
                return Err(SimError::InvalidConfig("outage needs a start >= 0 and a positive duration".into()));
            }
        }
        Ok(())
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tracker.update_interval_ms)
    }
}

/// Errors that abort a simulation run.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("Invalid simulation config: {0}")]
    InvalidConfig(String),

    #[error("Tracker failed: {0}")]
    Tracker(#[from] ServiceError),

    #[error("Tracker stopped unexpectedly")]
    TrackerStopped,

    #[error("Tracker did not subscribe within {0:?}")]
    TrackerNotReady(Duration),

    #[error("Walker '{0}' stopped unexpectedly")]
    WalkerStopped(EntityId),

    #[error(transparent)]
    Client(#[from] ClientError),
}

struct TickCommand {
    dt: f64,
    reply: oneshot::Sender<WalkerReport>,
}

#[derive(Debug, Default, Clone, Copy)]
struct WalkerReport {
    attempted: u64,
    routed: u64,
    lost: u64,
    cell: (u32, u32),
}

/// Handle to a running walker task.
struct WalkerHandle {
    id: EntityId,
    speed: f64,
    cell: (u32, u32),
    ticks: mpsc::Sender<TickCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutageState {
    Pending,
    Active,
    Done,
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    pub broker: MemoryBroker,

    service: Arc<TrackerService<MemoryBroker, SimContext>>,
    shutdown: watch::Sender<bool>,
    tracker_task: Option<JoinHandle<Result<(), ServiceError>>>,
    walkers: Vec<WalkerHandle>,

    tick_count: u64,
    attempted: u64,
    /// Reports that reached the tracker's queue
    routed: u64,
    lost: u64,
    outage: OutageState,
    export: SimExport,
}

impl SimWorld {
    pub fn new(config: SimConfig) -> Self {
        let context = SimContext::shared(config.seed);
        let broker = MemoryBroker::new(config.tracker.broker_endpoint.clone());
        let service = Arc::new(TrackerService::new(
            Arc::new(broker.clone()),
            Arc::clone(&context),
            ServiceConfig::from(&config.tracker),
        ));
        let (shutdown, _) = watch::channel(false);
        let export = SimExport::new(config.seed, config.tracker.board_size);

        Self {
            config,
            context,
            broker,
            service,
            shutdown,
            tracker_task: None,
            walkers: Vec::new(),
            tick_count: 0,
            attempted: 0,
            routed: 0,
            lost: 0,
            outage: OutageState::Pending,
            export,
        }
    }

    pub fn tracker(&self) -> SharedTracker {
        self.service.tracker()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.service.stats().snapshot()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Entity ids in walker order.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.walkers.iter().map(|w| w.id.clone()).collect()
    }

    /// Starts the tracker, waits for its subscriptions, then spawns walkers
    /// and publishes their starting cells.
    pub async fn start(&mut self) -> Result<(), SimError> {
        if self.tracker_task.is_some() {
            return Ok(());
        }
        self.config.validate()?;

        let service = Arc::clone(&self.service);
        let shutdown = self.shutdown.subscribe();
        self.tracker_task = Some(tokio::spawn(async move { service.run(shutdown).await }));
        self.wait_for_tracker().await?;

        for index in 0..self.config.num_entities {
            let id = EntityId::new(format!("P{:02}", index + 1));
            let mut rng = self.context.rng_for(index as u64);
            let speed = rng.gen_range(self.config.min_speed..=self.config.max_speed);
            let walker = Walker::new(id.clone(), self.config.tracker.board_size, speed, rng);
            let cell = walker.cell();

            let (ticks, inbox) = mpsc::channel(1);
            self.context.spawn(
                &format!("walker-{id}"),
                run_walker(walker, self.broker.clone(), Arc::clone(&self.context), inbox),
            );
            debug!(entity = %id, speed, x = cell.0, y = cell.1, "walker spawned");

            self.walkers.push(WalkerHandle { id, speed, cell, ticks });
        }

        info!(
            seed = self.config.seed,
            entities = self.walkers.len(),
            board_size = self.config.tracker.board_size,
            "simulation started"
        );

        self.dispatch(0.0).await?;
        self.settle().await;
        Ok(())
    }

    async fn wait_for_tracker(&mut self) -> Result<(), SimError> {
        let deadline = tokio::time::Instant::now() + self.config.settle_timeout;
        while self.broker.binding_count(contact_core::protocol::POSITION_EXCHANGE) == 0 {
            self.check_tracker().await?;
            if tokio::time::Instant::now() >= deadline {
                return Err(SimError::TrackerNotReady(self.config.settle_timeout));
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Ok(())
    }

    /// Advances the simulation by one tick.
    pub async fn tick(&mut self) -> Result<(), SimError> {
        let interval = self.config.tick_interval();
        self.context.advance_time(interval);
        self.tick_count += 1;

        self.apply_outage_schedule();
        // Let sleepers woken by the clock (tracker backoff) run first.
        tokio::task::yield_now().await;

        self.dispatch(interval.as_secs_f64()).await?;
        self.settle().await;
        self.check_tracker().await
    }

    /// Runs until the configured duration and returns the report.
    pub async fn run(&mut self) -> Result<SimExport, SimError> {
        self.start().await?;

        let interval_ms = self.config.tracker.update_interval_ms as f64;
        let target_ticks = (self.config.duration_secs * 1000.0 / interval_ms).round() as u64;
        while self.tick_count < target_ticks {
            self.tick().await?;
        }

        let report = self.report();
        info!(
            ticks = report.ticks,
            published = report.published,
            lost = report.lost,
            contacts = report.stats.contacts_recorded,
            "simulation finished"
        );
        Ok(report)
    }

    /// Sends one tick to every walker in order, waiting for each to finish
    /// publishing before the next moves.
    async fn dispatch(&mut self, dt: f64) -> Result<(), SimError> {
        for walker in &mut self.walkers {
            let (reply, done) = oneshot::channel();
            walker
                .ticks
                .send(TickCommand { dt, reply })
                .await
                .map_err(|_| SimError::WalkerStopped(walker.id.clone()))?;
            let report = done.await.map_err(|_| SimError::WalkerStopped(walker.id.clone()))?;

            walker.cell = report.cell;
            self.attempted += report.attempted;
            self.routed += report.routed;
            self.lost += report.lost;
        }
        Ok(())
    }

    /// Waits until the tracker has taken every routed report off its queue.
    async fn settle(&self) {
        let deadline = tokio::time::Instant::now() + self.config.settle_timeout;
        loop {
            let processed = self.stats().events_processed();
            if processed >= self.routed {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(processed, routed = self.routed, "tracker did not drain its queue in time");
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn apply_outage_schedule(&mut self) {
        let Some(plan) = &self.config.outage else {
            return;
        };
        let now = self.context.now().as_secs_f64();

        match self.outage {
            OutageState::Pending if now >= plan.at_secs => {
                warn!(at = now, duration = plan.duration_secs, "injecting broker outage");
                self.broker.set_offline(true);
                self.broker.sever_all();
                self.outage = OutageState::Active;
                self.export.add_event(now, "broker outage started", Some("warn"));
            }
            OutageState::Active if now >= plan.at_secs + plan.duration_secs => {
                info!(at = now, "broker back online");
                self.broker.set_offline(false);
                self.outage = OutageState::Done;
                self.export.add_event(now, "broker outage ended", Some("info"));
            }
            _ => {}
        }
    }

    async fn check_tracker(&mut self) -> Result<(), SimError> {
        let finished = self.tracker_task.as_ref().is_some_and(|task| task.is_finished());
        if !finished {
            return Ok(());
        }
        match self.tracker_task.take() {
            Some(task) => match task.await {
                Ok(Ok(())) | Err(_) => Err(SimError::TrackerStopped),
                Ok(Err(e)) => Err(SimError::Tracker(e)),
            },
            None => Ok(()),
        }
    }

    /// Snapshot of every entity's history plus run counters.
    pub fn report(&self) -> SimExport {
        let mut export = self.export.clone();
        export.duration_sec = self.context.now().as_secs_f64();
        export.ticks = self.tick_count;
        export.attempted = self.attempted;
        export.published = self.routed;
        export.lost = self.lost;
        export.stats = self.stats();

        let tracker = self.tracker();
        let tracker = lock_tracker(&tracker);
        for walker in &self.walkers {
            export.add_entity(EntityReport {
                entity_id: walker.id.to_string(),
                speed: walker.speed,
                final_x: walker.cell.0 as f64,
                final_y: walker.cell.1 as f64,
                contacts: tracker
                    .query(walker.id.as_str())
                    .iter()
                    .map(ContactRecord::from)
                    .collect(),
            });
        }
        export
    }

    /// Queries the running tracker over the broker, like an external caller.
    pub async fn query(&self, entity_id: &str, timeout: Duration) -> Result<QueryResponse, SimError> {
        let client = QueryClient::connect(&self.broker, Arc::clone(&self.context)).await?;
        let response = client.query(entity_id, timeout).await;
        client.close().await;
        Ok(response?)
    }

    /// Stops walkers and the tracker.
    pub async fn shutdown(mut self) -> Result<(), SimError> {
        self.walkers.clear();
        let _ = self.shutdown.send(true);

        match self.tracker_task.take() {
            Some(task) => match task.await {
                Ok(result) => result.map_err(SimError::from),
                Err(_) => Err(SimError::TrackerStopped),
            },
            None => Ok(()),
        }
    }
}

/// One walker's task: moves on each tick and publishes every visited cell.
async fn run_walker(
    mut walker: Walker,
    broker: MemoryBroker,
    context: Arc<SimContext>,
    mut ticks: mpsc::Receiver<TickCommand>,
) {
    let mut publisher: Option<PositionPublisher<MemorySession, SimContext>> = None;

    while let Some(command) = ticks.recv().await {
        let cells = if command.dt > 0.0 {
            walker.advance(command.dt)
        } else {
            vec![walker.cell()]
        };
        let timestamp = context.now().as_secs_f64();

        let mut report = WalkerReport {
            cell: walker.cell(),
            ..WalkerReport::default()
        };
        for (x, y) in cells {
            let event = PositionEvent::new(walker.id().clone(), x as f64, y as f64, timestamp);
            report.attempted += 1;
            match publish(&mut publisher, &broker, &context, &event).await {
                // The tracker is bound before walkers start, so an unrouted
                // report means it is still resubscribing after an outage.
                Ok(0) => {
                    report.lost += 1;
                    debug!(entity = %walker.id(), "position report routed nowhere");
                }
                Ok(routed) => report.routed += routed as u64,
                Err(e) => {
                    report.lost += 1;
                    debug!(entity = %walker.id(), error = %e, "position report lost");
                }
            }
        }

        if command.reply.send(report).is_err() {
            break;
        }
    }

    if let Some(publisher) = publisher {
        publisher.close().await;
    }
}

/// Publishes through `slot`, reconnecting first if the session is gone.
async fn publish(
    slot: &mut Option<PositionPublisher<MemorySession, SimContext>>,
    broker: &MemoryBroker,
    context: &Arc<SimContext>,
    event: &PositionEvent,
) -> Result<usize, ClientError> {
    let publisher = match slot.take() {
        Some(publisher) if publisher.is_open() => publisher,
        _ => PositionPublisher::connect(broker, Arc::clone(context)).await?,
    };
    let result = publisher.publish(event).await;
    *slot = Some(publisher);
    result
}
