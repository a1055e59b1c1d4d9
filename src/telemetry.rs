//! Telemetry samples as they arrive from the vehicle adapter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Parameter order the statistical models were trained on.
///
/// Changing this order (or its length) invalidates every serialized model.
pub const FEATURE_ORDER: [&str; 8] = [
    "ENGINE_RPM",
    "COOLANT_TEMP",
    "ENGINE_LOAD",
    "SPEED",
    "OIL_PRESSURE",
    "TRANS_TEMP",
    "AIR_PRESSURE_FL",
    "AIR_PRESSURE_FR",
];

/// One snapshot of named telemetry readings.
///
/// Keys are kept sorted so iteration order (and therefore tie-breaking in the
/// detectors) is stable across calls. Non-finite readings are dropped on insert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct Sample {
    readings: BTreeMap<String, f64>,
}

impl Sample {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a reading. Returns `false` when the value was not finite and got dropped.
    pub fn insert(&mut self, parameter: impl Into<String>, value: f64) -> bool {
        let parameter = parameter.into();
        if !value.is_finite() {
            debug!(%parameter, value, "dropping non-finite reading");
            return false;
        }
        self.readings.insert(parameter, value);
        true
    }

    pub fn get(&self, parameter: &str) -> Option<f64> {
        self.readings.get(parameter).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.readings.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Assemble the model input in [`FEATURE_ORDER`].
    ///
    /// This is the only place a missing parameter is read as `0.0`.
    pub fn feature_vector(&self) -> Vec<f64> {
        FEATURE_ORDER
            .iter()
            .map(|name| self.get(name).unwrap_or(0.0))
            .collect()
    }

    /// Key with the largest absolute reading; the first key wins a tie.
    pub fn dominant_parameter(&self) -> Option<(&str, f64)> {
        let mut best: Option<(&str, f64)> = None;
        for (name, value) in self.iter() {
            match best {
                Some((_, current)) if value.abs() <= current.abs() => {}
                _ => best = Some((name, value)),
            }
        }
        best
    }
}

impl From<BTreeMap<String, f64>> for Sample {
    fn from(readings: BTreeMap<String, f64>) -> Self {
        readings.into_iter().collect()
    }
}

impl From<Sample> for BTreeMap<String, f64> {
    fn from(sample: Sample) -> Self {
        sample.readings
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for Sample {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        let mut sample = Sample::new();
        for (k, v) in iter {
            sample.insert(k, v);
        }
        sample
    }
}

/// A sample tagged with its session, as read from a replay file (JSON lines).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub session_id: String,
    #[serde(default)]
    pub vehicle_id: Option<String>,
    pub readings: Sample,
}
