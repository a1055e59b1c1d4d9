//! Absolute and optimal range checks per parameter.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::config::ParameterThreshold;
use crate::detect::{
    humanize, AnomalyResult, AnomalyType, DetectionContext, Detector, DetectorOutcome, Severity,
};
use crate::telemetry::Sample;

pub struct ThresholdDetector {
    table: BTreeMap<String, ParameterThreshold>,
}

impl ThresholdDetector {
    pub fn new(table: BTreeMap<String, ParameterThreshold>) -> Self {
        Self { table }
    }

    pub fn evaluate(&self, sample: &Sample, timestamp: DateTime<Utc>) -> Vec<AnomalyResult> {
        sample
            .iter()
            .filter_map(|(param, value)| {
                let threshold = self.table.get(param)?;
                check(param, value, threshold, timestamp)
            })
            .collect()
    }
}

fn check(
    param: &str,
    value: f64,
    t: &ParameterThreshold,
    timestamp: DateTime<Utc>,
) -> Option<AnomalyResult> {
    let (opt_lo, opt_hi) = t.optimal_range;

    if value < t.min || value > t.max {
        let (bound, critical) = if value < t.min {
            (t.min, value <= lower_critical_limit(t.min))
        } else {
            (t.max, value >= upper_critical_limit(t.max))
        };
        return Some(AnomalyResult {
            parameter_name: param.to_string(),
            value,
            anomaly_score: breach_score(value, bound),
            is_anomaly: true,
            confidence: 0.9,
            severity: if critical { Severity::Critical } else { Severity::High },
            anomaly_type: AnomalyType::Threshold,
            description: format!(
                "{} value {} outside safe range [{}, {}]",
                param, value, t.min, t.max
            ),
            recommended_action: format!("Check {} system immediately", humanize(param)),
            timestamp,
        });
    }

    if value < opt_lo || value > opt_hi {
        let bound = if value < opt_lo { opt_lo } else { opt_hi };
        return Some(AnomalyResult {
            parameter_name: param.to_string(),
            value,
            anomaly_score: breach_score(value, bound),
            is_anomaly: true,
            confidence: 0.7,
            severity: Severity::Low,
            anomaly_type: AnomalyType::Threshold,
            description: format!(
                "{} value {} outside optimal range ({}, {})",
                param, value, opt_lo, opt_hi
            ),
            recommended_action: format!("Monitor {} trends", humanize(param)),
            timestamp,
        });
    }

    None
}

/// A breach of 20% of the bound's magnitude is critical.
fn upper_critical_limit(max: f64) -> f64 {
    if max >= 0.0 {
        max * 1.2
    } else {
        max * 0.8
    }
}

fn lower_critical_limit(min: f64) -> f64 {
    if min >= 0.0 {
        min * 0.8
    } else {
        min * 1.2
    }
}

/// Relative breach, capped at 1.0. Any breach of a zero bound scores 1.0.
fn breach_score(value: f64, bound: f64) -> f64 {
    if bound == 0.0 {
        return 1.0;
    }
    ((value - bound).abs() / bound.abs()).min(1.0)
}

#[async_trait::async_trait]
impl Detector for ThresholdDetector {
    fn kind(&self) -> AnomalyType {
        AnomalyType::Threshold
    }

    async fn run(&self, ctx: &DetectionContext<'_>) -> DetectorOutcome {
        DetectorOutcome::Completed(self.evaluate(ctx.sample, ctx.timestamp))
    }
}
