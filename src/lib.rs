//! obdsentinel -- multi-modal anomaly detection for vehicle telemetry.
//!
//! Each telemetry sample is checked by five independent strategies: absolute
//! and optimal thresholds, cross-parameter contextual rules, pre-trained
//! outlier models, rolling z-score deviation within the session, and the
//! vehicle's long-term baseline. Findings are returned to the caller and
//! logged to SQLite on a best-effort basis.

pub mod config;
pub mod detect;
pub mod history;
pub mod model;
pub mod storage;
pub mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::EngineConfig;
use crate::detect::AnomalyEngine;
use crate::model::ModelRegistry;
use crate::storage::SqliteStore;

/// Assemble an engine backed by the configured SQLite database and model directory.
pub fn build_engine(config: &EngineConfig) -> Result<AnomalyEngine> {
    tracing::info!(db_path = %config.storage.database_path.display(), "Initializing database");
    let store = SqliteStore::open(&config.storage.database_path)
        .context("failed to open anomaly database")?;

    let models = ModelRegistry::load_dir(&config.models.dir);
    tracing::info!(models = models.len(), "model store loaded");

    let engine = AnomalyEngine::new(config, models, Arc::new(store))?;
    Ok(engine)
}

/// Start the periodic session sweep for `engine` as a background task.
pub fn spawn_session_sweeper(
    engine: Arc<AnomalyEngine>,
    config: &EngineConfig,
) -> tokio::task::JoinHandle<()> {
    let interval = std::time::Duration::from_secs(config.history.sweep_interval_secs);
    let max_age = config.history.ttl();
    tokio::spawn(async move {
        detect::run_session_sweeper(engine, interval, max_age).await;
    })
}
