//! Cross-parameter rules evaluated over the whole sample.

use chrono::{DateTime, Utc};

use crate::config::ContextualRule;
use crate::detect::{AnomalyResult, AnomalyType, DetectionContext, Detector, DetectorOutcome};
use crate::telemetry::Sample;

pub struct ContextualRuleDetector {
    rules: Vec<ContextualRule>,
}

impl ContextualRuleDetector {
    pub fn new(rules: Vec<ContextualRule>) -> Self {
        Self { rules }
    }

    pub fn evaluate(&self, sample: &Sample, timestamp: DateTime<Utc>) -> Vec<AnomalyResult> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(sample))
            .filter_map(|rule| {
                let (parameter, value) = attribute(rule, sample)?;
                Some(AnomalyResult {
                    parameter_name: parameter.to_string(),
                    value,
                    anomaly_score: 0.8,
                    is_anomaly: true,
                    confidence: 0.85,
                    severity: rule.severity,
                    anomaly_type: AnomalyType::Contextual,
                    description: rule.description.clone(),
                    recommended_action: rule.action.clone(),
                    timestamp,
                })
            })
            .collect()
    }
}

/// The rule's primary parameter, which a matched rule always carries since it
/// must appear in one of the conditions. Unmapped rules use the first key.
fn attribute<'a>(rule: &'a ContextualRule, sample: &'a Sample) -> Option<(&'a str, f64)> {
    if let Some(primary) = rule.primary_parameter.as_deref() {
        if let Some(value) = sample.get(primary) {
            return Some((primary, value));
        }
    }
    sample.iter().next()
}

#[async_trait::async_trait]
impl Detector for ContextualRuleDetector {
    fn kind(&self) -> AnomalyType {
        AnomalyType::Contextual
    }

    async fn run(&self, ctx: &DetectionContext<'_>) -> DetectorOutcome {
        DetectorOutcome::Completed(self.evaluate(ctx.sample, ctx.timestamp))
    }
}
