//! Concord Simulator
//!
//! Drives concurrent workers against one coordination engine and checks that
//! its guarantees hold under contention, timeouts and nesting.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod controller;
mod metrics;
mod resource;
mod scenario;

use concord_coordinator::EngineConfig;
use controller::SimulationController;
use scenario::Scenario;

/// Concord Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Concord coordination engine simulator")]
struct Args {
    /// Named scenario to run (contention, timeouts, nested, mixed)
    #[arg(short, long, default_value = "mixed")]
    scenario: String,

    /// Load the scenario from a JSON file instead
    #[arg(long)]
    scenario_file: Option<PathBuf>,

    /// Override the number of workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Override the iterations per worker
    #[arg(short, long)]
    iterations: Option<usize>,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Print engine metrics in Prometheus format
    #[arg(long)]
    prometheus: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = EngineConfig::from_env();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone()),
        ))
        .with(args.json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!args.json).then(|| tracing_subscriber::fmt::layer()))
        .init();

    info!("Starting Concord Simulator");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let mut scenario = match &args.scenario_file {
        Some(path) => Scenario::from_file(path)?,
        None => Scenario::load(&args.scenario)?,
    };
    if let Some(workers) = args.workers {
        scenario.workers = workers;
    }
    if let Some(iterations) = args.iterations {
        scenario.iterations = iterations;
    }

    let controller = SimulationController::new(scenario, config, args.seed)?;
    let report = controller.run().await?;
    controller.shutdown();

    let metrics = &report.metrics;
    let secs = report.elapsed.as_secs_f64();
    info!("Simulation complete: {} (seed {})", report.scenario, report.seed);
    info!("Iterations: {}", metrics.total_iterations);
    info!("Ended: {}", metrics.ended);
    info!("Partially ended: {}", metrics.partially_ended);
    info!("Failed: {}", metrics.failed);
    info!("Timed out: {}", metrics.timed_out);
    info!("Rejected: {}", metrics.rejected);
    info!("Success rate: {:.1}%", metrics.success_rate() * 100.0);
    info!("Throughput: {:.1}/s", metrics.throughput(secs));
    info!(
        "Latency avg/p50/p99: {}/{}/{}ms",
        metrics.average_latency_ms(),
        metrics.p50_latency_ms(),
        metrics.p99_latency_ms()
    );
    info!(
        "Lock waits: {}, lock timeouts: {}, deadlocks refused: {}",
        report.engine.lock_waits, report.engine.lock_timeouts, report.engine.deadlocks_detected
    );

    for (resource, ended, failed) in controller.resource_usage() {
        info!(resource = %resource, ended, failed, "Resource usage");
    }

    if args.prometheus {
        println!("{}", report.prometheus);
    }

    if !report.violations.is_empty() {
        for violation in &report.violations {
            warn!("{}", violation);
        }
        anyhow::bail!("{} engine guarantees violated", report.violations.len());
    }

    Ok(())
}
