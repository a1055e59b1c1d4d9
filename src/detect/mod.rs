//! Anomaly detection: result model, detector capability trait, and the five
//! detection strategies orchestrated by [`engine::AnomalyEngine`].

pub mod contextual;
pub mod engine;
pub mod pattern;
pub mod profile;
pub mod series;
pub mod statistical;
pub mod threshold;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::HistoryEntry;
use crate::telemetry::Sample;
use self::profile::VehicleBaselineProfile;

pub use self::contextual::ContextualRuleDetector;
pub use self::engine::{run_session_sweeper, AnomalyEngine};
pub use self::pattern::PatternDeviationDetector;
pub use self::profile::ProfileDeviationDetector;
pub use self::statistical::StatisticalModelDetector;
pub use self::threshold::ThresholdDetector;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("insufficient baseline data: need {needed} samples, have {have}")]
    InsufficientBaseline { needed: usize, have: usize },
}

/// Severity levels for detected anomalies, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

/// Which detection strategy produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyType {
    Threshold,
    Contextual,
    Statistical,
    Pattern,
    Profile,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::Threshold => "threshold",
            AnomalyType::Contextual => "contextual",
            AnomalyType::Statistical => "statistical",
            AnomalyType::Pattern => "pattern",
            AnomalyType::Profile => "profile",
        }
    }
}

impl std::fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AnomalyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "threshold" => Ok(AnomalyType::Threshold),
            "contextual" => Ok(AnomalyType::Contextual),
            "statistical" => Ok(AnomalyType::Statistical),
            "pattern" => Ok(AnomalyType::Pattern),
            "profile" => Ok(AnomalyType::Profile),
            other => Err(format!("unknown anomaly type '{}'", other)),
        }
    }
}

/// One explainable finding. Only anomalous evaluations are ever emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyResult {
    pub parameter_name: String,
    pub value: f64,
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    pub confidence: f64,
    pub severity: Severity,
    pub anomaly_type: AnomalyType,
    pub description: String,
    pub recommended_action: String,
    pub timestamp: DateTime<Utc>,
}

/// Readable form of a parameter key for operator text, e.g. `oil pressure`.
pub(crate) fn humanize(parameter: &str) -> String {
    parameter.to_lowercase().replace('_', " ")
}

/// Per-call state of the vehicle baseline fetch.
#[derive(Debug, Clone)]
pub enum BaselineLookup {
    /// The call carried no vehicle id.
    NotRequested,
    /// No profile is stored for the vehicle.
    Missing,
    Found(VehicleBaselineProfile),
    Failed(String),
}

/// Everything a detector may look at for one sample.
pub struct DetectionContext<'a> {
    pub session_id: &'a str,
    pub vehicle_id: Option<&'a str>,
    pub sample: &'a Sample,
    /// Session history, oldest first, already including `sample`.
    pub history: &'a [HistoryEntry],
    pub baseline: &'a BaselineLookup,
    pub timestamp: DateTime<Utc>,
}

/// What a detector contributed for one call.
///
/// "Nothing anomalous" and "could not evaluate" both add no results, but stay
/// distinguishable for logging and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectorOutcome {
    Completed(Vec<AnomalyResult>),
    Failed { reason: String },
}

impl DetectorOutcome {
    pub fn into_results(self) -> Vec<AnomalyResult> {
        match self {
            DetectorOutcome::Completed(results) => results,
            DetectorOutcome::Failed { .. } => Vec::new(),
        }
    }
}

/// Trait for all detection strategies run by the engine.
#[async_trait::async_trait]
pub trait Detector: Send + Sync {
    fn kind(&self) -> AnomalyType;

    /// Evaluate one sample. Must not panic or propagate per-parameter problems.
    async fn run(&self, ctx: &DetectionContext<'_>) -> DetectorOutcome;
}
