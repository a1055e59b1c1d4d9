//! Scoring of the fixed-order feature vector with pre-trained models.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::detect::{AnomalyResult, AnomalyType, DetectionContext, Detector, DetectorOutcome, Severity};
use crate::model::{Label, ModelRegistry, OutlierModel};
use crate::telemetry::Sample;

#[derive(Debug, Error)]
enum ScoreError {
    #[error("previous evaluation still running")]
    Busy,
    #[error("{0}")]
    Failed(String),
}

/// A loaded model plus a single permit held for as long as a call is running.
struct GuardedModel {
    name: String,
    model: Arc<dyn OutlierModel>,
    in_flight: Arc<Semaphore>,
}

pub struct StatisticalModelDetector {
    models: Vec<GuardedModel>,
    timeout: Duration,
}

impl StatisticalModelDetector {
    pub fn new(models: ModelRegistry, timeout: Duration) -> Self {
        let models = models
            .iter()
            .map(|(name, model)| GuardedModel {
                name: name.to_string(),
                model: Arc::clone(model),
                in_flight: Arc::new(Semaphore::new(1)),
            })
            .collect();
        Self { models, timeout }
    }

    /// Evaluate every model whose name mentions "anomaly".
    ///
    /// Failed or timed-out models are logged and skipped; the outcome is
    /// `Failed` only when every eligible model failed. A model whose previous
    /// call has not returned yet is skipped rather than started again.
    pub async fn evaluate(&self, sample: &Sample, timestamp: DateTime<Utc>) -> DetectorOutcome {
        let eligible: Vec<&GuardedModel> = self
            .models
            .iter()
            .filter(|m| m.name.to_lowercase().contains("anomaly"))
            .collect();
        if eligible.is_empty() {
            return DetectorOutcome::Completed(Vec::new());
        }

        let features = Arc::new(sample.feature_vector());
        let runs = eligible.iter().map(|guarded| {
            let features = Arc::clone(&features);
            async move { (guarded.name.as_str(), self.score(guarded, features).await) }
        });

        let mut results = Vec::new();
        let mut failures = Vec::new();
        for (name, scored) in join_all(runs).await {
            match scored {
                Ok((score, Label::Outlier)) => {
                    if let Some(result) = outlier_result(name, score, sample, timestamp) {
                        results.push(result);
                    }
                }
                Ok((score, Label::Inlier)) => {
                    debug!(model = %name, score, "sample scored as inlier");
                }
                Err(ScoreError::Busy) => {
                    warn!(model = %name, "previous evaluation still running, skipping model");
                    failures.push(format!("{}: {}", name, ScoreError::Busy));
                }
                Err(ScoreError::Failed(reason)) => {
                    error!(model = %name, error = %reason, "statistical model evaluation failed");
                    failures.push(format!("{}: {}", name, reason));
                }
            }
        }

        if failures.len() == eligible.len() {
            return DetectorOutcome::Failed { reason: failures.join("; ") };
        }
        DetectorOutcome::Completed(results)
    }

    async fn score(
        &self,
        guarded: &GuardedModel,
        features: Arc<Vec<f64>>,
    ) -> Result<(f64, Label), ScoreError> {
        // The permit moves into the blocking task, so a call that outlives the
        // timeout keeps the model marked busy until it really returns.
        let permit = Arc::clone(&guarded.in_flight)
            .try_acquire_owned()
            .map_err(|_| ScoreError::Busy)?;
        let model = Arc::clone(&guarded.model);
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let score = model.decision_function(&features)?;
            let label = model.predict(&features)?;
            Ok::<_, crate::model::ModelError>((score, label))
        });
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(scored))) => Ok(scored),
            Ok(Ok(Err(e))) => Err(ScoreError::Failed(e.to_string())),
            Ok(Err(join_err)) => Err(ScoreError::Failed(format!("model task aborted: {}", join_err))),
            Err(_) => Err(ScoreError::Failed(format!("timed out after {:?}", self.timeout))),
        }
    }
}

/// Attribute the finding to the sample's largest-magnitude reading.
///
/// This is a coarse heuristic, not a per-feature explanation.
fn outlier_result(
    model_name: &str,
    score: f64,
    sample: &Sample,
    timestamp: DateTime<Utc>,
) -> Option<AnomalyResult> {
    let Some((parameter, value)) = sample.dominant_parameter() else {
        warn!(model = %model_name, "outlier flagged on an empty sample, nothing to attribute");
        return None;
    };
    Some(AnomalyResult {
        parameter_name: parameter.to_string(),
        value,
        anomaly_score: score.abs(),
        is_anomaly: true,
        confidence: score.abs().min(1.0),
        severity: severity_for_score(score),
        anomaly_type: AnomalyType::Statistical,
        description: format!("Statistical anomaly detected by {}", model_name),
        recommended_action: "Review recent parameter trends and vehicle condition".to_string(),
        timestamp,
    })
}

fn severity_for_score(score: f64) -> Severity {
    let magnitude = score.abs();
    if magnitude > 0.8 {
        Severity::High
    } else if magnitude > 0.5 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

#[async_trait::async_trait]
impl Detector for StatisticalModelDetector {
    fn kind(&self) -> AnomalyType {
        AnomalyType::Statistical
    }

    async fn run(&self, ctx: &DetectionContext<'_>) -> DetectorOutcome {
        self.evaluate(ctx.sample, ctx.timestamp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fixed-score stub.
    struct Fixed(f64);

    impl OutlierModel for Fixed {
        fn decision_function(&self, _features: &[f64]) -> Result<f64, ModelError> {
            Ok(self.0)
        }
        fn predict(&self, _features: &[f64]) -> Result<Label, ModelError> {
            Ok(if self.0 < 0.0 { Label::Outlier } else { Label::Inlier })
        }
    }

    struct Broken;

    impl OutlierModel for Broken {
        fn decision_function(&self, _features: &[f64]) -> Result<f64, ModelError> {
            Err(ModelError::Malformed("weights missing".into()))
        }
        fn predict(&self, _features: &[f64]) -> Result<Label, ModelError> {
            Err(ModelError::Malformed("weights missing".into()))
        }
    }

    struct Slow;

    impl OutlierModel for Slow {
        fn decision_function(&self, _features: &[f64]) -> Result<f64, ModelError> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(-0.9)
        }
        fn predict(&self, _features: &[f64]) -> Result<Label, ModelError> {
            Ok(Label::Outlier)
        }
    }

    /// Counts entries, then blocks far longer than any test timeout.
    struct Hung(Arc<AtomicUsize>);

    impl OutlierModel for Hung {
        fn decision_function(&self, _features: &[f64]) -> Result<f64, ModelError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            Ok(-0.9)
        }
        fn predict(&self, _features: &[f64]) -> Result<Label, ModelError> {
            Ok(Label::Outlier)
        }
    }

    fn sample() -> Sample {
        [("ENGINE_RPM", 2500.0), ("COOLANT_TEMP", -3000.0), ("SPEED", 60.0)]
            .into_iter()
            .collect()
    }

    fn m(name: &str, model: impl OutlierModel + 'static) -> (&str, Arc<dyn OutlierModel>) {
        (name, Arc::new(model))
    }

    fn detector(models: Vec<(&str, Arc<dyn OutlierModel>)>) -> StatisticalModelDetector {
        let mut registry = ModelRegistry::new();
        for (name, model) in models {
            registry.insert(name, model);
        }
        StatisticalModelDetector::new(registry, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_no_models_is_empty_not_error() {
        let d = detector(vec![]);
        assert_eq!(d.evaluate(&sample(), Utc::now()).await, DetectorOutcome::Completed(vec![]));
    }

    #[tokio::test]
    async fn test_outlier_attribution_and_severity() {
        let d = detector(vec![
            m("engine_anomaly", Fixed(-0.9)),
            m("Anomaly_v2", Fixed(-0.6)),
            m("normal_anomaly", Fixed(0.2)),
        ]);
        let results = d.evaluate(&sample(), Utc::now()).await.into_results();
        assert_eq!(results.len(), 2);
        // Largest magnitude reading, sign ignored.
        assert_eq!(results[0].parameter_name, "COOLANT_TEMP");
        assert_eq!(results[0].value, -3000.0);
        assert_eq!(results[0].severity, Severity::High);
        assert_eq!(results[0].confidence, 0.9);
        assert_eq!(results[0].anomaly_type, AnomalyType::Statistical);
        assert_eq!(results[1].severity, Severity::Medium);
        assert!(results[1].description.contains("Anomaly_v2"));
    }

    #[tokio::test]
    async fn test_models_without_anomaly_in_name_are_ignored() {
        let d = detector(vec![m("fuel_forecast", Fixed(-0.9))]);
        assert_eq!(d.evaluate(&sample(), Utc::now()).await, DetectorOutcome::Completed(vec![]));
    }

    #[tokio::test]
    async fn test_failing_model_does_not_block_others() {
        let d = detector(vec![
            m("broken_anomaly", Broken),
            m("slow_anomaly", Slow),
            m("good_anomaly", Fixed(-0.3)),
        ]);
        let outcome = d.evaluate(&sample(), Utc::now()).await;
        let results = outcome.into_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].severity, Severity::Low);
        assert!(results[0].description.contains("good_anomaly"));
    }

    #[tokio::test]
    async fn test_all_models_failing_is_reported() {
        let d = detector(vec![m("broken_anomaly", Broken)]);
        match d.evaluate(&sample(), Utc::now()).await {
            DetectorOutcome::Failed { reason } => assert!(reason.contains("weights missing")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hung_model_is_not_restarted_while_running() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ModelRegistry::new();
        registry.insert("hung_anomaly", Arc::new(Hung(Arc::clone(&calls))));
        let d = StatisticalModelDetector::new(registry, Duration::from_millis(10));

        for _ in 0..20 {
            let outcome = d.evaluate(&sample(), Utc::now()).await;
            assert!(matches!(outcome, DetectorOutcome::Failed { .. }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Once the stuck call returns the model is eligible again.
        tokio::time::sleep(Duration::from_millis(400)).await;
        d.evaluate(&sample(), Utc::now()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_busy_model_is_reported_as_such() {
        let mut registry = ModelRegistry::new();
        registry.insert("hung_anomaly", Arc::new(Hung(Arc::new(AtomicUsize::new(0)))));
        let d = StatisticalModelDetector::new(registry, Duration::from_millis(10));

        d.evaluate(&sample(), Utc::now()).await;
        match d.evaluate(&sample(), Utc::now()).await {
            DetectorOutcome::Failed { reason } => assert!(reason.contains("still running")),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
