use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use obdsentinel::config::EngineConfig;
use obdsentinel::detect::profile::VehicleBaselineProfile;
use obdsentinel::storage::SqliteStore;
use obdsentinel::telemetry::TelemetryFrame;

#[derive(Parser)]
#[command(
    name = "obdsentinel",
    about = "Multi-modal anomaly detection for vehicle telemetry",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (TOML). Falls back to OBDSENTINEL_CONFIG, then defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the configuration, then exit
    CheckConfig,

    /// Feed recorded telemetry (JSON lines) through the engine
    Replay {
        /// Input file, one telemetry frame per line
        #[arg(long)]
        input: PathBuf,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Rebuild a vehicle's baseline profile from recorded telemetry
    Baseline {
        /// Vehicle identifier
        #[arg(long)]
        vehicle: String,

        /// Input file, one telemetry frame per line
        #[arg(long)]
        input: PathBuf,
    },

    /// Summarize stored anomalies for a session
    Summary {
        /// Session identifier
        #[arg(long)]
        session: String,

        /// Look-back window in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::load_or_default(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::CheckConfig => {
            println!("Configuration OK");
            println!("  thresholds:       {}", config.thresholds.len());
            println!("  contextual rules: {}", config.rules.len());
            println!("  history capacity: {}", config.history.capacity);
            println!("  model directory:  {}", config.models.dir.display());
            println!("  database:         {}", config.storage.database_path.display());
        }
        Commands::Replay { input, json } => {
            replay(&config, &input, json).await?;
        }
        Commands::Baseline { vehicle, input } => {
            rebuild_baseline(&config, &vehicle, &input).await?;
        }
        Commands::Summary { session, hours } => {
            let since = chrono::Duration::try_hours(hours)
                .and_then(|window| chrono::Utc::now().checked_sub_signed(window))
                .with_context(|| format!("--hours {} is out of range", hours))?;
            let store = SqliteStore::open(&config.storage.database_path)?;
            let summary = tokio::task::spawn_blocking(move || store.summarize(&session, since))
                .await??;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}

/// Read JSON-lines telemetry, skipping blank and malformed lines.
fn read_frames(input: &Path) -> Result<Vec<TelemetryFrame>> {
    let file = std::fs::File::open(input)
        .with_context(|| format!("failed to open telemetry input: {}", input.display()))?;
    let mut frames: Vec<TelemetryFrame> = Vec::new();
    for (line_no, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(frame) => frames.push(frame),
            Err(e) => {
                tracing::warn!(line = line_no + 1, error = %e, "skipping malformed frame");
            }
        }
    }
    Ok(frames)
}

async fn rebuild_baseline(config: &EngineConfig, vehicle: &str, input: &Path) -> Result<()> {
    let samples: Vec<_> = read_frames(input)?
        .into_iter()
        .filter(|frame| frame.vehicle_id.as_deref() == Some(vehicle))
        .map(|frame| frame.readings)
        .collect();
    if samples.is_empty() {
        anyhow::bail!("no frames for vehicle {} in {}", vehicle, input.display());
    }

    let profile = VehicleBaselineProfile::from_samples(vehicle, &samples, chrono::Utc::now());
    let parameters = profile.baseline_parameters.len();
    let store = SqliteStore::open(&config.storage.database_path)?;
    tokio::task::spawn_blocking(move || store.save_vehicle_profile(&profile)).await??;

    println!(
        "Baseline for {}: {} parameters from {} frames",
        vehicle,
        parameters,
        samples.len()
    );
    Ok(())
}

async fn replay(config: &EngineConfig, input: &Path, json: bool) -> Result<()> {
    let input_frames = read_frames(input)?;
    let engine = Arc::new(obdsentinel::build_engine(config)?);
    let sweeper = obdsentinel::spawn_session_sweeper(Arc::clone(&engine), config);

    let frames = input_frames.len();
    let mut anomalies = 0usize;
    for frame in input_frames {
        let results = engine
            .detect(&frame.readings, &frame.session_id, frame.vehicle_id.as_deref())
            .await;
        anomalies += results.len();

        for result in &results {
            if json {
                println!("{}", serde_json::to_string(result)?);
            } else {
                println!(
                    "[{:<8}] {:<11} {:<16} {:>10.2}  {}",
                    result.severity.as_str().to_uppercase(),
                    result.anomaly_type.as_str(),
                    result.parameter_name,
                    result.value,
                    result.description
                );
            }
        }
    }

    sweeper.abort();
    let stored = engine.flush().await;
    tracing::info!(frames, anomalies, stored, "replay finished");
    if !json {
        println!("\n{} frames, {} anomalies ({} stored)", frames, anomalies, stored);
    }
    Ok(())
}
