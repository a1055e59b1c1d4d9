//! SQLite-backed store wired into a live engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};

use obdsentinel::config::EngineConfig;
use obdsentinel::detect::profile::{ParameterBaseline, VehicleBaselineProfile};
use obdsentinel::detect::{AnomalyEngine, AnomalyType, Severity};
use obdsentinel::model::ModelRegistry;
use obdsentinel::storage::{AnomalyStore, SqliteStore};
use obdsentinel::telemetry::Sample;

fn coolant_profile() -> VehicleBaselineProfile {
    let mut baseline_parameters = BTreeMap::new();
    baseline_parameters.insert(
        "COOLANT_TEMP".to_string(),
        ParameterBaseline {
            mean: 88.0,
            std: 1.5,
            min: 84.0,
            max: 93.0,
            median: 88.0,
            last_updated: Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap(),
        },
    );
    VehicleBaselineProfile { vehicle_id: "WDD2221".into(), baseline_parameters }
}

#[tokio::test]
async fn test_engine_persists_to_sqlite() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = SqliteStore::open(&dir.path().join("nested/anomalies.db")).unwrap();
    store.save_vehicle_profile(&coolant_profile()).unwrap();

    let engine = AnomalyEngine::new(
        &EngineConfig::default(),
        ModelRegistry::new(),
        Arc::new(store.clone()),
    )
    .unwrap();

    // 93.0 is inside the optimal range but 5 degrees off this vehicle's norm.
    let sample: Sample = [("COOLANT_TEMP", 93.0), ("ENGINE_RPM", 7000.0)].into_iter().collect();
    let results = engine.detect(&sample, "trip-7", Some("WDD2221")).await;
    assert!(results.iter().any(|r| r.anomaly_type == AnomalyType::Profile));
    assert!(results.iter().any(|r| r.anomaly_type == AnomalyType::Threshold));

    assert_eq!(engine.flush().await, results.len());

    let stored = store.list_recent("trip-7", 50).unwrap();
    assert_eq!(stored.len(), results.len());
    assert!(stored.iter().all(|r| r.vehicle_id.as_deref() == Some("WDD2221")));

    let summary = store.summarize("trip-7", Utc::now() - Duration::hours(1)).unwrap();
    assert_eq!(summary.total, results.len());
    assert_eq!(summary.by_type.get(&AnomalyType::Profile), Some(&1));
    assert_eq!(summary.by_severity.get(&Severity::High), Some(&1));
    assert_eq!(summary.urgent_actions, vec!["Check engine rpm system immediately"]);
}

#[test]
fn test_profile_roundtrip_and_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("anomalies.db");
    {
        let store = SqliteStore::open(&path).unwrap();
        store.save_vehicle_profile(&coolant_profile()).unwrap();
    }

    // Migrations are idempotent on an existing file.
    let store = SqliteStore::open(&path).unwrap();
    let loaded = store.get_vehicle_profile("WDD2221").unwrap().unwrap();
    assert_eq!(loaded, coolant_profile());
    assert!(store.get_vehicle_profile("unknown").unwrap().is_none());
}
