//! End-to-end behaviour of the anomaly engine against an in-memory store.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use obdsentinel::config::{EngineConfig, ParameterThreshold};
use obdsentinel::detect::profile::VehicleBaselineProfile;
use obdsentinel::detect::{
    run_session_sweeper, AnomalyEngine, AnomalyType, BaselineLookup, DetectionContext,
    DetectorOutcome, Severity, StatisticalModelDetector,
};
use obdsentinel::history::HistoryEntry;
use obdsentinel::model::ModelRegistry;
use obdsentinel::storage::{AnomalyRecord, AnomalyStore};
use obdsentinel::telemetry::Sample;

#[derive(Default)]
struct MemoryStore {
    records: Mutex<Vec<AnomalyRecord>>,
    reject_writes: bool,
}

impl AnomalyStore for MemoryStore {
    fn log_anomaly(&self, record: &AnomalyRecord) -> anyhow::Result<()> {
        if self.reject_writes {
            anyhow::bail!("database is locked");
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn get_vehicle_profile(&self, _vehicle_id: &str) -> anyhow::Result<Option<VehicleBaselineProfile>> {
        Ok(None)
    }
}

fn engine_with(config: &EngineConfig, store: Arc<MemoryStore>) -> AnomalyEngine {
    AnomalyEngine::new(config, ModelRegistry::new(), store).unwrap()
}

fn sample(pairs: &[(&str, f64)]) -> Sample {
    pairs.iter().map(|(k, v)| (*k, *v)).collect()
}

#[tokio::test]
async fn test_three_threshold_breaches() {
    let mut config = EngineConfig::default();
    config.rules.clear();
    config.thresholds = [
        ("ENGINE_RPM", ParameterThreshold::new(600.0, 6500.0, (800.0, 4000.0))),
        ("COOLANT_TEMP", ParameterThreshold::new(70.0, 110.0, (85.0, 95.0))),
        ("OIL_PRESSURE", ParameterThreshold::new(1.5, 8.0, (2.5, 6.0))),
    ]
    .into_iter()
    .map(|(k, t)| (k.to_string(), t))
    .collect::<BTreeMap<_, _>>();
    let engine = engine_with(&config, Arc::new(MemoryStore::default()));

    let results = engine
        .detect(
            &sample(&[("ENGINE_RPM", 7000.0), ("COOLANT_TEMP", 130.0), ("OIL_PRESSURE", 1.0)]),
            "scenario",
            None,
        )
        .await;

    let threshold: Vec<_> = results
        .iter()
        .filter(|r| r.anomaly_type == AnomalyType::Threshold)
        .collect();
    assert_eq!(threshold.len(), 3);
    assert!(threshold
        .iter()
        .all(|r| matches!(r.severity, Severity::High | Severity::Critical)));
    assert!(results.iter().all(|r| r.is_anomaly));
}

#[tokio::test]
async fn test_same_parameter_flagged_by_several_detectors() {
    let engine = engine_with(&EngineConfig::default(), Arc::new(MemoryStore::default()));
    let results = engine
        .detect(&sample(&[("OIL_PRESSURE", 1.0), ("ENGINE_RPM", 1500.0)]), "s", None)
        .await;

    let oil: Vec<_> = results
        .iter()
        .filter(|r| r.parameter_name == "OIL_PRESSURE")
        .map(|r| r.anomaly_type)
        .collect();
    assert_eq!(oil, vec![AnomalyType::Threshold, AnomalyType::Contextual]);
}

#[tokio::test]
async fn test_history_is_bounded_per_session() {
    let mut config = EngineConfig::default();
    config.history.capacity = 5;
    let engine = engine_with(&config, Arc::new(MemoryStore::default()));

    for i in 0..12 {
        engine.detect(&sample(&[("SPEED", i as f64)]), "bounded", None).await;
    }
    engine.detect(&sample(&[("SPEED", 1.0)]), "other", None).await;

    let history = engine.history().snapshot("bounded").await;
    let speeds: Vec<f64> = history.iter().filter_map(|e| e.sample.get("SPEED")).collect();
    assert_eq!(speeds, vec![7.0, 8.0, 9.0, 10.0, 11.0]);
    assert_eq!(engine.history().len("other").await, 1);
}

#[tokio::test]
async fn test_pattern_deviation_through_engine() {
    let engine = engine_with(&EngineConfig::default(), Arc::new(MemoryStore::default()));
    for i in 0..10 {
        let v = if i % 2 == 0 { 95.0 } else { 105.0 };
        let results = engine.detect(&sample(&[("X", v)]), "pattern", None).await;
        assert!(results.is_empty());
    }

    // The spike is part of its own window, which damps the z-score.
    let results = engine.detect(&sample(&[("X", 400.0)]), "pattern", None).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].anomaly_type, AnomalyType::Pattern);
    assert_eq!(results[0].severity, Severity::Medium);
}

#[tokio::test]
async fn test_pattern_high_against_prior_window() {
    let engine = engine_with(&EngineConfig::default(), Arc::new(MemoryStore::default()));
    let now = Utc::now();
    let history: Vec<HistoryEntry> = (0..10)
        .map(|i| HistoryEntry {
            sample: Arc::new(sample(&[("X", if i % 2 == 0 { 95.0 } else { 105.0 })])),
            recorded_at: now,
        })
        .collect();
    let spike = sample(&[("X", 400.0)]);
    let baseline = BaselineLookup::NotRequested;
    let ctx = DetectionContext {
        session_id: "pattern",
        vehicle_id: None,
        sample: &spike,
        history: &history,
        baseline: &baseline,
        timestamp: now,
    };

    let results = engine.evaluate(&ctx).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].severity, Severity::High);
}

#[tokio::test]
async fn test_evaluate_is_deterministic_for_a_snapshot() {
    let engine = engine_with(&EngineConfig::default(), Arc::new(MemoryStore::default()));
    for v in [2000.0, 2100.0, 1900.0] {
        engine
            .detect(&sample(&[("ENGINE_RPM", v), ("COOLANT_TEMP", 101.0), ("ENGINE_LOAD", 20.0)]), "d", None)
            .await;
    }

    let history = engine.history().snapshot("d").await;
    let current = sample(&[("ENGINE_RPM", 7000.0), ("COOLANT_TEMP", 101.0), ("ENGINE_LOAD", 20.0)]);
    let baseline = BaselineLookup::Missing;
    let ctx = DetectionContext {
        session_id: "d",
        vehicle_id: Some("v"),
        sample: &current,
        history: &history,
        baseline: &baseline,
        timestamp: Utc::now(),
    };

    let first = engine.evaluate(&ctx).await;
    let second = engine.evaluate(&ctx).await;
    assert!(!first.is_empty());
    assert_eq!(first, second);
    assert_eq!(engine.history().len("d").await, 3);
}

#[tokio::test]
async fn test_no_models_is_not_an_error() {
    let detector = StatisticalModelDetector::new(ModelRegistry::new(), Duration::from_millis(50));
    let outcome = detector
        .evaluate(&sample(&[("ENGINE_RPM", 9000.0)]), Utc::now())
        .await;
    assert_eq!(outcome, DetectorOutcome::Completed(vec![]));
}

#[tokio::test]
async fn test_rejected_writes_do_not_change_results() {
    let failing = engine_with(
        &EngineConfig::default(),
        Arc::new(MemoryStore { reject_writes: true, ..Default::default() }),
    );
    let healthy_store = Arc::new(MemoryStore::default());
    let healthy = engine_with(&EngineConfig::default(), Arc::clone(&healthy_store));

    let s = sample(&[("TRANS_TEMP", 125.0)]);
    let a = failing.detect(&s, "s", None).await;
    let b = healthy.detect(&s, "s", None).await;

    assert_eq!(a.len(), b.len());
    assert_eq!(failing.flush().await, 0);
    assert_eq!(healthy.flush().await, b.len());
    assert_eq!(healthy_store.records.lock().unwrap().len(), b.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_lose_no_samples() {
    let engine = Arc::new(engine_with(&EngineConfig::default(), Arc::new(MemoryStore::default())));

    let mut handles = Vec::new();
    for producer in 0..8 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            for i in 0..10 {
                let s = sample(&[("SPEED", (producer * 10 + i) as f64)]);
                engine.detect(&s, "shared", None).await;
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert_eq!(engine.history().len("shared").await, 80);
}

#[tokio::test]
async fn test_sweeper_drops_idle_sessions() {
    let engine = Arc::new(engine_with(&EngineConfig::default(), Arc::new(MemoryStore::default())));
    let stale = Utc::now() - chrono::Duration::hours(48);
    engine
        .history()
        .append("parked", Arc::new(sample(&[("SPEED", 0.0)])), stale)
        .await;
    engine.detect(&sample(&[("SPEED", 50.0)]), "driving", None).await;

    let sweeper = tokio::spawn(run_session_sweeper(
        Arc::clone(&engine),
        Duration::from_millis(10),
        chrono::Duration::hours(24),
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    sweeper.abort();

    assert_eq!(engine.history().len("parked").await, 0);
    assert_eq!(engine.history().len("driving").await, 1);
}
