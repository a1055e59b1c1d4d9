//! SQLite persistence collaborator -- schema, anomaly log, vehicle profiles.

pub mod anomalies;
pub mod profiles;
pub mod schema;

use std::path::Path;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detect::profile::VehicleBaselineProfile;
use crate::detect::AnomalyResult;

pub use self::anomalies::AnomalySummary;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// A detection result as persisted, tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub id: Uuid,
    pub session_id: String,
    pub vehicle_id: Option<String>,
    #[serde(flatten)]
    pub result: AnomalyResult,
}

impl AnomalyRecord {
    pub fn new(session_id: &str, vehicle_id: Option<&str>, result: AnomalyResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            vehicle_id: vehicle_id.map(str::to_string),
            result,
        }
    }
}

/// The narrow storage contract the engine depends on.
///
/// Calls may block; the engine only invokes them from the blocking pool.
pub trait AnomalyStore: Send + Sync {
    fn log_anomaly(&self, record: &AnomalyRecord) -> Result<()>;

    fn get_vehicle_profile(&self, vehicle_id: &str) -> Result<Option<VehicleBaselineProfile>>;
}

/// Pool-backed store used by the host process.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    /// Written by the offline baseline job; the engine never calls this.
    pub fn save_vehicle_profile(&self, profile: &VehicleBaselineProfile) -> Result<()> {
        let conn = self.pool.get()?;
        profiles::upsert(&conn, profile)
    }

    pub fn list_recent(&self, session_id: &str, limit: usize) -> Result<Vec<AnomalyRecord>> {
        let conn = self.pool.get()?;
        anomalies::list_recent(&conn, session_id, limit)
    }

    pub fn summarize(
        &self,
        session_id: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> Result<AnomalySummary> {
        let conn = self.pool.get()?;
        anomalies::summarize(&conn, session_id, since)
    }
}

impl AnomalyStore for SqliteStore {
    fn log_anomaly(&self, record: &AnomalyRecord) -> Result<()> {
        let conn = self.pool.get().context("failed to get DB connection")?;
        anomalies::insert(&conn, record)
    }

    fn get_vehicle_profile(&self, vehicle_id: &str) -> Result<Option<VehicleBaselineProfile>> {
        let conn = self.pool.get().context("failed to get DB connection")?;
        profiles::get(&conn, vehicle_id)
    }
}
