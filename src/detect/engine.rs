use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, EngineConfig};
use crate::detect::{
    AnomalyResult, BaselineLookup, ContextualRuleDetector, DetectionContext, Detector,
    DetectorOutcome, PatternDeviationDetector, ProfileDeviationDetector, StatisticalModelDetector,
    ThresholdDetector,
};
use crate::history::SessionHistoryStore;
use crate::model::ModelRegistry;
use crate::storage::{AnomalyRecord, AnomalyStore};
use crate::telemetry::Sample;

/// Runs every detector against each incoming sample and owns the per-session
/// history plus the loaded model set.
pub struct AnomalyEngine {
    detectors: Vec<Box<dyn Detector>>,
    history: SessionHistoryStore,
    store: Arc<dyn AnomalyStore>,
    persist_tasks: Mutex<JoinSet<usize>>,
}

impl AnomalyEngine {
    /// Build the engine from a validated configuration. Invalid configuration
    /// is refused outright.
    pub fn new(
        config: &EngineConfig,
        models: ModelRegistry,
        store: Arc<dyn AnomalyStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let timeout = Duration::from_millis(config.models.timeout_ms);
        let detectors: Vec<Box<dyn Detector>> = vec![
            Box::new(ThresholdDetector::new(config.thresholds.clone())),
            Box::new(ContextualRuleDetector::new(config.rules.clone())),
            Box::new(StatisticalModelDetector::new(models, timeout)),
            Box::new(PatternDeviationDetector::new()),
            Box::new(ProfileDeviationDetector::new()),
        ];

        info!(
            thresholds = config.thresholds.len(),
            rules = config.rules.len(),
            history_capacity = config.history.capacity,
            "anomaly engine ready"
        );

        Ok(Self {
            detectors,
            history: SessionHistoryStore::new(config.history.capacity),
            store,
            persist_tasks: Mutex::new(JoinSet::new()),
        })
    }

    pub fn history(&self) -> &SessionHistoryStore {
        &self.history
    }

    /// Record `sample` in the session history, evaluate it, and hand the
    /// findings to the store without waiting for the writes.
    pub async fn detect(
        &self,
        sample: &Sample,
        session_id: &str,
        vehicle_id: Option<&str>,
    ) -> Vec<AnomalyResult> {
        let timestamp = Utc::now();
        let history = self
            .history
            .append(session_id, Arc::new(sample.clone()), timestamp)
            .await;
        let baseline = self.fetch_baseline(vehicle_id).await;

        let ctx = DetectionContext {
            session_id,
            vehicle_id,
            sample,
            history: &history,
            baseline: &baseline,
            timestamp,
        };
        let results = self.evaluate(&ctx).await;

        if !results.is_empty() {
            debug!(%session_id, count = results.len(), "anomalies detected");
            self.persist(session_id, vehicle_id, &results).await;
        }
        results
    }

    /// Run all detectors in fixed order against a prepared context.
    ///
    /// Touches neither history nor storage, so equal contexts give equal results.
    pub async fn evaluate(&self, ctx: &DetectionContext<'_>) -> Vec<AnomalyResult> {
        let mut results = Vec::new();
        for detector in &self.detectors {
            match detector.run(ctx).await {
                DetectorOutcome::Completed(found) => results.extend(found),
                DetectorOutcome::Failed { reason } => {
                    warn!(
                        detector = %detector.kind(),
                        session_id = %ctx.session_id,
                        %reason,
                        "detector failed, contributing no results"
                    );
                }
            }
        }
        results
    }

    async fn fetch_baseline(&self, vehicle_id: Option<&str>) -> BaselineLookup {
        let Some(vehicle_id) = vehicle_id else {
            return BaselineLookup::NotRequested;
        };
        let store = Arc::clone(&self.store);
        let id = vehicle_id.to_string();
        match tokio::task::spawn_blocking(move || store.get_vehicle_profile(&id)).await {
            Ok(Ok(Some(profile))) => BaselineLookup::Found(profile),
            Ok(Ok(None)) => BaselineLookup::Missing,
            Ok(Err(e)) => BaselineLookup::Failed(format!("{:#}", e)),
            Err(e) => BaselineLookup::Failed(format!("profile lookup task failed: {}", e)),
        }
    }

    /// Queue one write per result on the blocking pool. Each write is
    /// attempted even if an earlier one failed.
    async fn persist(&self, session_id: &str, vehicle_id: Option<&str>, results: &[AnomalyResult]) {
        let records: Vec<AnomalyRecord> = results
            .iter()
            .cloned()
            .map(|result| AnomalyRecord::new(session_id, vehicle_id, result))
            .collect();
        let store = Arc::clone(&self.store);

        let mut tasks = self.persist_tasks.lock().await;
        // Reap finished writes so the set stays small on long runs.
        while tasks.try_join_next().is_some() {}
        tasks.spawn_blocking(move || {
            let mut stored = 0;
            for record in &records {
                match store.log_anomaly(record) {
                    Ok(()) => stored += 1,
                    Err(e) => {
                        let reason = format!("{:#}", e);
                        error!(
                            id = %record.id,
                            session_id = %record.session_id,
                            parameter = %record.result.parameter_name,
                            error = %reason,
                            "failed to persist anomaly"
                        );
                    }
                }
            }
            stored
        });
    }

    /// Wait for every queued write. Returns how many records were stored.
    ///
    /// Hosts call this before shutting down; detection never does.
    pub async fn flush(&self) -> usize {
        let mut tasks = std::mem::take(&mut *self.persist_tasks.lock().await);
        let mut stored = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(n) => stored += n,
                Err(e) => error!(error = %e, "persistence task failed"),
            }
        }
        stored
    }

    /// Drop histories of sessions that have been idle longer than `max_age`.
    ///
    /// An age reaching past the earliest representable time removes nothing.
    pub async fn cleanup_stale_sessions(&self, max_age: chrono::Duration) -> usize {
        match Utc::now().checked_sub_signed(max_age) {
            Some(cutoff) => self.history.evict_older_than(cutoff).await,
            None => {
                debug!(
                    max_age_secs = max_age.num_seconds(),
                    "session age limit out of range, skipping sweep"
                );
                0
            }
        }
    }
}

/// Periodically sweep idle session histories until the task is dropped.
pub async fn run_session_sweeper(
    engine: Arc<AnomalyEngine>,
    interval: Duration,
    max_age: chrono::Duration,
) {
    info!(interval_secs = interval.as_secs(), "session sweeper started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; nothing can be stale yet.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let removed = engine.cleanup_stale_sessions(max_age).await;
        debug!(removed, "session sweep finished");
    }
}
