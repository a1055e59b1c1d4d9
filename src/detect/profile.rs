//! Comparison against a vehicle's long-term baseline.
//!
//! Baselines are rebuilt offline with [`VehicleBaselineProfile::from_samples`];
//! the engine only reads the snapshot fetched once per detection call.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::detect::series::TimeSeries;
use crate::detect::{
    humanize, AnomalyResult, AnomalyType, BaselineLookup, DetectionContext, Detector,
    DetectorOutcome, Severity,
};
use crate::telemetry::Sample;

/// A parameter needs at least this many readings to get a baseline.
pub const MIN_BASELINE_POINTS: usize = 11;

/// Bookkeeping columns that may ride along in recorded frames.
const NON_SENSOR_KEYS: [&str; 2] = ["timestamp", "session_id"];

/// Historical statistics of one parameter for one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterBaseline {
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleBaselineProfile {
    pub vehicle_id: String,
    #[serde(default)]
    pub baseline_parameters: BTreeMap<String, ParameterBaseline>,
}

impl VehicleBaselineProfile {
    /// Summarize historical samples of one vehicle into a baseline.
    ///
    /// Parameters with fewer than [`MIN_BASELINE_POINTS`] readings are left out.
    pub fn from_samples(vehicle_id: &str, samples: &[Sample], now: DateTime<Utc>) -> Self {
        let mut columns: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for sample in samples {
            for (param, value) in sample.iter() {
                if NON_SENSOR_KEYS.contains(&param) {
                    continue;
                }
                columns.entry(param).or_default().push(value);
            }
        }

        let mut baseline_parameters = BTreeMap::new();
        for (param, values) in columns {
            if values.len() < MIN_BASELINE_POINTS {
                debug!(
                    %vehicle_id,
                    parameter = %param,
                    points = values.len(),
                    "too few readings for a baseline"
                );
                continue;
            }
            let series = TimeSeries::new(values);
            let (Some(min), Some(max), Some(median)) =
                (series.min(), series.max(), series.median())
            else {
                continue;
            };
            baseline_parameters.insert(
                param.to_string(),
                ParameterBaseline {
                    mean: series.mean(),
                    std: series.sample_std_dev(),
                    min,
                    max,
                    median,
                    last_updated: now,
                },
            );
        }

        info!(
            %vehicle_id,
            samples = samples.len(),
            parameters = baseline_parameters.len(),
            "updated vehicle baseline"
        );
        Self { vehicle_id: vehicle_id.to_string(), baseline_parameters }
    }

    pub fn is_empty(&self) -> bool {
        self.baseline_parameters.is_empty()
    }
}

#[derive(Default)]
pub struct ProfileDeviationDetector;

impl ProfileDeviationDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        vehicle_id: &str,
        sample: &Sample,
        profile: Option<&VehicleBaselineProfile>,
        timestamp: DateTime<Utc>,
    ) -> Vec<AnomalyResult> {
        let Some(profile) = profile.filter(|p| !p.is_empty()) else {
            return Vec::new();
        };

        sample
            .iter()
            .filter_map(|(param, value)| {
                let baseline = profile.baseline_parameters.get(param)?;
                let expected = baseline.mean;
                let tolerance = 2.0 * baseline.std;
                let deviation = (value - expected).abs();
                if tolerance <= 0.0 || deviation <= tolerance {
                    return None;
                }
                let ratio = deviation / tolerance;
                Some(AnomalyResult {
                    parameter_name: param.to_string(),
                    value,
                    anomaly_score: (ratio / 2.0).min(1.0),
                    is_anomaly: true,
                    confidence: 0.75,
                    severity: if ratio < 1.5 { Severity::Low } else { Severity::Medium },
                    anomaly_type: AnomalyType::Profile,
                    description: format!(
                        "{} deviates from vehicle {} baseline (expected: {:.1})",
                        param, vehicle_id, expected
                    ),
                    recommended_action: format!(
                        "Compare with historical {} values",
                        humanize(param)
                    ),
                    timestamp,
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Detector for ProfileDeviationDetector {
    fn kind(&self) -> AnomalyType {
        AnomalyType::Profile
    }

    async fn run(&self, ctx: &DetectionContext<'_>) -> DetectorOutcome {
        let Some(vehicle_id) = ctx.vehicle_id else {
            return DetectorOutcome::Completed(Vec::new());
        };
        match ctx.baseline {
            BaselineLookup::Found(profile) => DetectorOutcome::Completed(self.evaluate(
                vehicle_id,
                ctx.sample,
                Some(profile),
                ctx.timestamp,
            )),
            BaselineLookup::NotRequested | BaselineLookup::Missing => {
                DetectorOutcome::Completed(Vec::new())
            }
            BaselineLookup::Failed(reason) => DetectorOutcome::Failed {
                reason: format!("baseline lookup failed: {}", reason),
            },
        }
    }
}
