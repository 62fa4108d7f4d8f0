mod cli;
mod config;
mod pipeline;
mod video;
mod web;

use anyhow::{Context, Result};
use cli::Args;
use config::SystemConfig;
use pipeline::orchestrator::PerceptionSystem;
use pipeline::stages::OpencvStageFactory;
use pipeline::types::SystemState;
use std::sync::Arc;
use std::time::Duration;
use web::server::run_server;

const HEADLESS_POLL: Duration = Duration::from_millis(200);

fn load_config(args: &Args) -> Result<SystemConfig> {
    let mut config = match &args.config {
        Some(path) => SystemConfig::load(path)?,
        None => {
            tracing::info!("No config file given, using defaults");
            SystemConfig::default()
        }
    };
    if let Some(source) = &args.source {
        config.video.source = source.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn blocking<T, F>(system: &Arc<PerceptionSystem>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&PerceptionSystem) -> Result<T> + Send + 'static,
{
    let system = system.clone();
    tokio::task::spawn_blocking(move || op(&system))
        .await
        .context("Control task failed")?
}

/// Run until the file is read out, the pipeline faults or ctrl-c
async fn run_headless(system: &Arc<PerceptionSystem>) -> Result<()> {
    blocking(system, |s| s.start()).await?;
    tracing::info!("Processing started");

    let mut ticks = tokio::time::interval(HEADLESS_POLL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            _ = ticks.tick() => {
                if system.state() == SystemState::Error {
                    anyhow::bail!("Pipeline entered the error state");
                }
                if system.source_finished() && system.in_flight() == 0 {
                    tracing::info!("Source exhausted");
                    break;
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse_args();
    let config = load_config(&args)?;

    if let Some(path) = &args.dump_config {
        config.save(path)?;
        tracing::info!("Configuration written to {:?}", path);
        return Ok(());
    }

    let system = Arc::new(PerceptionSystem::new(config, Arc::new(OpencvStageFactory))?);
    system.register_state_callback(Arc::new(|state| {
        tracing::info!("System state: {}", state);
    }));
    system.set_vehicle_speed(args.vehicle_speed);
    blocking(&system, |s| s.initialize()).await?;

    let outcome = if args.headless {
        run_headless(&system).await
    } else {
        run_server(args.host, args.port, system.clone()).await
    };

    let performance = system.performance();
    tracing::info!(
        frames = performance.frames_processed,
        dropped = performance.frames_dropped,
        faults = performance.frame_faults,
        fps = performance.fps,
        "Session summary"
    );

    if let Some(path) = args.results_out.clone() {
        blocking(&system, move |s| s.save_results(&path)).await?;
    }
    blocking(&system, |s| s.shutdown()).await?;

    outcome
}
