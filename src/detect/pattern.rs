//! Rolling-window deviation of each parameter against its own session history.

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::detect::series::TimeSeries;
use crate::detect::{
    humanize, AnomalyResult, AnomalyType, DetectError, DetectionContext, Detector,
    DetectorOutcome, Severity,
};
use crate::history::HistoryEntry;
use crate::telemetry::Sample;

/// Session entries required before any parameter is analysed.
pub const MIN_HISTORY: usize = 10;
/// Readings of a single parameter required within that history.
pub const MIN_POINTS: usize = 5;
/// Deviations beyond this many standard deviations are flagged.
pub const Z_THRESHOLD: f64 = 3.0;

#[derive(Default)]
pub struct PatternDeviationDetector;

impl PatternDeviationDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        session_id: &str,
        sample: &Sample,
        history: &[HistoryEntry],
        timestamp: DateTime<Utc>,
    ) -> Vec<AnomalyResult> {
        if history.len() < MIN_HISTORY {
            trace!(%session_id, have = history.len(), "not enough history for pattern analysis");
            return Vec::new();
        }

        let mut results = Vec::new();
        for (param, current) in sample.iter() {
            let values: Vec<f64> = history
                .iter()
                .filter_map(|entry| entry.sample.get(param))
                .collect();
            let series = TimeSeries::new(values);

            let z = match series.abs_z_score(current, MIN_POINTS) {
                Ok(Some(z)) => z,
                Ok(None) => continue,
                Err(DetectError::InsufficientBaseline { .. }) => continue,
            };
            if z <= Z_THRESHOLD {
                continue;
            }

            results.push(AnomalyResult {
                parameter_name: param.to_string(),
                value: current,
                anomaly_score: (z / Z_THRESHOLD).min(1.0),
                is_anomaly: true,
                confidence: 0.8,
                severity: if z < 4.0 { Severity::Medium } else { Severity::High },
                anomaly_type: AnomalyType::Pattern,
                description: format!(
                    "{} deviates significantly from recent pattern (Z-score: {:.2})",
                    param, z
                ),
                recommended_action: format!("Investigate cause of {} variation", humanize(param)),
                timestamp,
            });
        }
        results
    }
}

#[async_trait::async_trait]
impl Detector for PatternDeviationDetector {
    fn kind(&self) -> AnomalyType {
        AnomalyType::Pattern
    }

    async fn run(&self, ctx: &DetectionContext<'_>) -> DetectorOutcome {
        DetectorOutcome::Completed(self.evaluate(
            ctx.session_id,
            ctx.sample,
            ctx.history,
            ctx.timestamp,
        ))
    }
}
