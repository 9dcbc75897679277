//! Contact Tracker Simulator CLI
//!
//! Runs random-walking entities against the tracker, optionally injects a
//! broker outage, then reports (and optionally queries) contact histories.

use anyhow::Context;
use clap::Parser;
use contact_core::{QueryResponse, TrackerConfig, DEFAULT_QUERY_TIMEOUT};
use contact_sim::{OutagePlan, SimConfig, SimExport, SimWorld};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "contact-sim")]
#[command(about = "Proximity contact tracker simulator", version)]
struct Args {
    /// Random seed (0 = derive from the wall clock)
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Number of walking entities
    #[arg(short, long, default_value_t = 5)]
    entities: usize,

    /// Simulated duration in seconds
    #[arg(short, long, default_value_t = 10.0)]
    duration: f64,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the board size from the config
    #[arg(long)]
    board_size: Option<u32>,

    /// Override the proximity threshold from the config
    #[arg(long)]
    threshold: Option<f64>,

    /// Slowest walker speed (moves per second)
    #[arg(long, default_value_t = 0.5)]
    min_speed: f64,

    /// Fastest walker speed (moves per second)
    #[arg(long, default_value_t = 2.0)]
    max_speed: f64,

    /// Query this entity's contacts through the broker after the run
    #[arg(short, long)]
    query: Option<String>,

    /// Query timeout in seconds
    #[arg(long, default_value_t = DEFAULT_QUERY_TIMEOUT.as_secs_f64())]
    query_timeout: f64,

    /// Take the broker down at this simulated second
    #[arg(long)]
    outage_at: Option<f64>,

    /// Outage length in simulated seconds
    #[arg(long, default_value_t = 1.0)]
    outage_duration: f64,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Print the report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Export the report to a JSON file
    #[arg(long)]
    export: Option<PathBuf>,
}

fn load_config(args: &Args) -> anyhow::Result<TrackerConfig> {
    let mut config = match &args.config {
        Some(path) => TrackerConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => TrackerConfig::default(),
    };
    if let Some(board_size) = args.board_size {
        config.board_size = board_size;
    }
    if let Some(threshold) = args.threshold {
        config.proximity_threshold = threshold;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn query_timeout(secs: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .with_context(|| format!("--query-timeout must be a finite, non-negative number of seconds, got {secs}"))
}

fn init_logging(args: &Args, config: &TrackerConfig) -> anyhow::Result<()> {
    let default_level = if args.verbose { "debug" } else { config.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")
}

fn print_summary(report: &SimExport) {
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!(
        "{} ticks, {:.1}s simulated, {} reports delivered, {} lost",
        report.ticks, report.duration_sec, report.published, report.lost
    );
    info!(
        "{} contacts recorded, {} reconnects",
        report.stats.contacts_recorded, report.stats.reconnects
    );
    for entity in &report.entities {
        info!(
            "  {} at ({}, {}) speed {:.1}: {} contacts",
            entity.entity_id,
            entity.final_x,
            entity.final_y,
            entity.speed,
            entity.contacts.len()
        );
    }
}

fn print_query(response: &QueryResponse) {
    if response.contacts.is_empty() {
        info!("No contacts found for {}", response.entity_id);
        return;
    }
    info!("Contact history for {}:", response.entity_id);
    for contact in &response.contacts {
        info!(
            "  met {} at ({}, {}), t={:.1}",
            contact.other_entity_id, contact.x, contact.y, contact.timestamp
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let tracker = load_config(&args)?;
    let timeout = query_timeout(args.query_timeout)?;
    init_logging(&args, &tracker)?;

    let seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    let config = SimConfig {
        seed,
        num_entities: args.entities,
        duration_secs: args.duration,
        min_speed: args.min_speed,
        max_speed: args.max_speed,
        outage: args.outage_at.map(|at_secs| OutagePlan {
            at_secs,
            duration_secs: args.outage_duration,
        }),
        tracker,
        ..SimConfig::default()
    };

    if !args.json {
        info!("Contact Tracker Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let mut world = SimWorld::new(config);
    let report = world.run().await.context("simulation failed")?;

    if let Some(path) = &args.export {
        report
            .write_to_file(path)
            .with_context(|| format!("failed to export report to {}", path.display()))?;
        info!(path = %path.display(), "report exported");
    }

    let query = match &args.query {
        Some(entity_id) => {
            match world.query(entity_id, timeout).await {
                Ok(response) => Some(response),
                Err(e) => {
                    error!(entity = %entity_id, error = %e, "query failed");
                    return Err(e).context("query failed");
                }
            }
        }
        None => None,
    };

    if args.json {
        let output = serde_json::json!({
            "report": report,
            "query": query,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_summary(&report);
        if let Some(response) = &query {
            print_query(response);
        }
    }

    world.shutdown().await.context("tracker shutdown failed")?;
    Ok(())
}
