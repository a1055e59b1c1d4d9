//! TOML configuration for the anomaly engine.
//!
//! Every section falls back to compiled-in defaults (the W222 threshold table
//! and contextual rule set). Unlike most host settings, a configuration that
//! fails validation is fatal: the engine refuses to start on it.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::detect::Severity;
use crate::telemetry::Sample;

/// Environment variable naming the config file to load.
pub const CONFIG_ENV: &str = "OBDSENTINEL_CONFIG";

/// Longest accepted session TTL (ten years).
pub const MAX_TTL_HOURS: u64 = 24 * 365 * 10;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("threshold for {parameter} is invalid: {reason}")]
    InvalidThreshold { parameter: String, reason: String },
    #[error("contextual rule '{rule}' is invalid: {reason}")]
    InvalidRule { rule: String, reason: String },
    #[error("contextual rule '{0}' is defined more than once")]
    DuplicateRule(String),
    #[error("invalid {section} setting: {reason}")]
    InvalidSetting { section: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_thresholds")]
    pub thresholds: BTreeMap<String, ParameterThreshold>,
    #[serde(default = "default_rules")]
    pub rules: Vec<ContextualRule>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history: HistoryConfig::default(),
            models: ModelsConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            thresholds: default_thresholds(),
            rules: default_rules(),
        }
    }
}

impl EngineConfig {
    /// Load and validate configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded engine configuration");
        Ok(config)
    }

    /// Load the file named by `OBDSENTINEL_CONFIG`, or the compiled-in defaults
    /// when the variable is unset. A named file that cannot be loaded is an error.
    pub fn load_or_default() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(env_path) => Self::load(Path::new(&env_path)),
            Err(_) => {
                debug!("{} not set, using compiled-in defaults", CONFIG_ENV);
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history.capacity == 0 {
            return Err(ConfigError::InvalidSetting {
                section: "history",
                reason: "capacity must be at least 1".into(),
            });
        }
        if self.history.ttl_hours == 0 {
            return Err(ConfigError::InvalidSetting {
                section: "history",
                reason: "ttl_hours must be positive".into(),
            });
        }
        if self.history.ttl_hours > MAX_TTL_HOURS {
            return Err(ConfigError::InvalidSetting {
                section: "history",
                reason: format!("ttl_hours must not exceed {}", MAX_TTL_HOURS),
            });
        }
        if self.history.sweep_interval_secs == 0 {
            return Err(ConfigError::InvalidSetting {
                section: "history",
                reason: "sweep_interval_secs must be positive".into(),
            });
        }
        if self.models.timeout_ms == 0 {
            return Err(ConfigError::InvalidSetting {
                section: "models",
                reason: "timeout_ms must be positive".into(),
            });
        }
        for (parameter, threshold) in &self.thresholds {
            threshold.validate(parameter)?;
        }
        let mut seen = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !seen.insert(rule.name.as_str()) {
                return Err(ConfigError::DuplicateRule(rule.name.clone()));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Per-session history buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum samples retained per session.
    pub capacity: usize,
    /// Sessions idle for longer than this are swept.
    pub ttl_hours: u64,
    /// How often the background sweep runs.
    pub sweep_interval_secs: u64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            ttl_hours: 24,
            sweep_interval_secs: 3600,
        }
    }
}

impl HistoryConfig {
    /// Session TTL, clamped to [`MAX_TTL_HOURS`] for unvalidated values.
    pub fn ttl(&self) -> chrono::Duration {
        let hours = self.ttl_hours.min(MAX_TTL_HOURS) as i64;
        chrono::Duration::try_hours(hours).unwrap_or(chrono::Duration::MAX)
    }
}

/// Pre-trained model store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Directory scanned for `*.json` model files at start-up.
    pub dir: PathBuf,
    /// Upper bound on a single model evaluation.
    pub timeout_ms: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("models"),
            timeout_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/obdsentinel.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Absolute and optimal operating range for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterThreshold {
    pub min: f64,
    pub max: f64,
    pub optimal_range: (f64, f64),
}

impl ParameterThreshold {
    pub const fn new(min: f64, max: f64, optimal_range: (f64, f64)) -> Self {
        Self { min, max, optimal_range }
    }

    fn validate(&self, parameter: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidThreshold {
            parameter: parameter.to_string(),
            reason: reason.to_string(),
        };
        let (lo, hi) = self.optimal_range;
        if ![self.min, self.max, lo, hi].iter().all(|v| v.is_finite()) {
            return Err(invalid("bounds must be finite"));
        }
        if self.min >= self.max {
            return Err(invalid("min must be below max"));
        }
        if lo >= hi {
            return Err(invalid("optimal range must be increasing"));
        }
        if lo < self.min || hi > self.max {
            return Err(invalid("optimal range must lie within [min, max]"));
        }
        Ok(())
    }
}

fn default_thresholds() -> BTreeMap<String, ParameterThreshold> {
    [
        ("ENGINE_RPM", ParameterThreshold::new(600.0, 6500.0, (800.0, 4000.0))),
        ("COOLANT_TEMP", ParameterThreshold::new(70.0, 110.0, (85.0, 95.0))),
        ("ENGINE_LOAD", ParameterThreshold::new(0.0, 100.0, (10.0, 80.0))),
        ("SPEED", ParameterThreshold::new(0.0, 250.0, (0.0, 180.0))),
        ("OIL_PRESSURE", ParameterThreshold::new(1.5, 8.0, (2.5, 6.0))),
        ("TRANS_TEMP", ParameterThreshold::new(60.0, 120.0, (80.0, 100.0))),
        ("AIR_PRESSURE_FL", ParameterThreshold::new(8.0, 16.0, (10.0, 14.0))),
        ("AIR_PRESSURE_FR", ParameterThreshold::new(8.0, 16.0, (10.0, 14.0))),
        ("FUEL_LEVEL", ParameterThreshold::new(0.0, 100.0, (10.0, 90.0))),
    ]
    .into_iter()
    .map(|(name, t)| (name.to_string(), t))
    .collect()
}

// ---------------------------------------------------------------------------
// Contextual rules
// ---------------------------------------------------------------------------

/// A single comparison over the sample. Missing parameters make it false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Above { parameter: String, value: f64 },
    Below { parameter: String, value: f64 },
    AbsDifferenceAbove { left: String, right: String, value: f64 },
}

impl Condition {
    pub fn holds(&self, sample: &Sample) -> bool {
        match self {
            Condition::Above { parameter, value } => {
                sample.get(parameter).is_some_and(|v| v > *value)
            }
            Condition::Below { parameter, value } => {
                sample.get(parameter).is_some_and(|v| v < *value)
            }
            Condition::AbsDifferenceAbove { left, right, value } => {
                match (sample.get(left), sample.get(right)) {
                    (Some(l), Some(r)) => (l - r).abs() > *value,
                    _ => false,
                }
            }
        }
    }

    fn parameters(&self) -> Vec<&str> {
        match self {
            Condition::Above { parameter, .. } | Condition::Below { parameter, .. } => {
                vec![parameter.as_str()]
            }
            Condition::AbsDifferenceAbove { left, right, .. } => vec![left.as_str(), right.as_str()],
        }
    }

    fn threshold(&self) -> f64 {
        match self {
            Condition::Above { value, .. }
            | Condition::Below { value, .. }
            | Condition::AbsDifferenceAbove { value, .. } => *value,
        }
    }
}

/// A named cross-parameter predicate and what to tell the operator when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextualRule {
    pub name: String,
    pub severity: Severity,
    pub description: String,
    pub action: String,
    /// Parameter the finding is attributed to.
    #[serde(default)]
    pub primary_parameter: Option<String>,
    pub conditions: Vec<Condition>,
}

impl ContextualRule {
    /// All conditions must hold.
    pub fn matches(&self, sample: &Sample) -> bool {
        !self.conditions.is_empty() && self.conditions.iter().all(|c| c.holds(sample))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidRule {
            rule: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.conditions.is_empty() {
            return Err(invalid("at least one condition is required"));
        }
        for condition in &self.conditions {
            if !condition.threshold().is_finite() {
                return Err(invalid("condition value must be finite"));
            }
            if condition.parameters().iter().any(|p| p.trim().is_empty()) {
                return Err(invalid("condition parameter must not be empty"));
            }
        }
        if let Some(primary) = &self.primary_parameter {
            if primary.trim().is_empty() {
                return Err(invalid("primary_parameter must not be empty"));
            }
            // A matched rule then always carries the primary reading.
            let referenced = self
                .conditions
                .iter()
                .any(|c| c.parameters().contains(&primary.as_str()));
            if !referenced {
                return Err(invalid("primary_parameter must appear in a condition"));
            }
        }
        Ok(())
    }
}

fn rule(
    name: &str,
    severity: Severity,
    description: &str,
    action: &str,
    primary: &str,
    conditions: Vec<Condition>,
) -> ContextualRule {
    ContextualRule {
        name: name.to_string(),
        severity,
        description: description.to_string(),
        action: action.to_string(),
        primary_parameter: Some(primary.to_string()),
        conditions,
    }
}

fn above(parameter: &str, value: f64) -> Condition {
    Condition::Above { parameter: parameter.to_string(), value }
}

fn below(parameter: &str, value: f64) -> Condition {
    Condition::Below { parameter: parameter.to_string(), value }
}

fn default_rules() -> Vec<ContextualRule> {
    vec![
        rule(
            "high_rpm_low_speed",
            Severity::Medium,
            "High RPM at low speed - possible transmission issue or aggressive driving",
            "Check transmission fluid and driving patterns",
            "ENGINE_RPM",
            vec![above("ENGINE_RPM", 3000.0), below("SPEED", 30.0)],
        ),
        rule(
            "high_temp_normal_load",
            Severity::High,
            "High coolant temperature with normal load - possible cooling system issue",
            "Check cooling system, thermostat, and coolant levels",
            "COOLANT_TEMP",
            vec![above("COOLANT_TEMP", 100.0), below("ENGINE_LOAD", 50.0)],
        ),
        rule(
            "low_oil_pressure",
            Severity::Critical,
            "Low oil pressure at operating RPM - immediate attention required",
            "Stop engine immediately and check oil level and pump",
            "OIL_PRESSURE",
            vec![below("OIL_PRESSURE", 2.0), above("ENGINE_RPM", 1000.0)],
        ),
        rule(
            "air_suspension_imbalance",
            Severity::Medium,
            "Air suspension pressure imbalance detected",
            "Check air suspension system and struts",
            "AIR_PRESSURE_FL",
            vec![Condition::AbsDifferenceAbove {
                left: "AIR_PRESSURE_FL".to_string(),
                right: "AIR_PRESSURE_FR".to_string(),
                value: 2.0,
            }],
        ),
        rule(
            "transmission_overheating",
            Severity::High,
            "Transmission overheating detected",
            "Reduce load and check transmission cooling system",
            "TRANS_TEMP",
            vec![above("TRANS_TEMP", 110.0)],
        ),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
