//! Pre-trained unsupervised models, loaded once at start-up.
//!
//! Models are produced by an offline training job and shipped as JSON files.
//! Once loaded they are immutable and shared read-only across detection calls.

pub mod isolation_forest;

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};

pub use self::isolation_forest::IsolationForest;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("feature vector length mismatch: expected {expected}, got {got}")]
    FeatureLength { expected: usize, got: usize },
    #[error("malformed model: {0}")]
    Malformed(String),
    #[error("failed to read model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse model file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Outlier/inlier verdict, encoded as `-1` / `1` like the training toolkit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Outlier = -1,
    Inlier = 1,
}

/// Capability every loaded model exposes to the statistical detector.
pub trait OutlierModel: Send + Sync {
    /// Signed anomaly score; negative values lean towards outliers.
    fn decision_function(&self, features: &[f64]) -> Result<f64, ModelError>;

    fn predict(&self, features: &[f64]) -> Result<Label, ModelError>;
}

/// On-disk model document, tagged by algorithm.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ModelDocument {
    IsolationForest(IsolationForest),
}

/// Parse a model document and check its structure.
pub fn load_model(path: &Path) -> Result<Arc<dyn OutlierModel>, ModelError> {
    let content = std::fs::read_to_string(path)?;
    match serde_json::from_str::<ModelDocument>(&content)? {
        ModelDocument::IsolationForest(forest) => {
            forest.validate()?;
            Ok(Arc::new(forest))
        }
    }
}

/// Named set of loaded models.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: Vec<(String, Arc<dyn OutlierModel>)>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, model: Arc<dyn OutlierModel>) {
        self.models.push((name.into(), model));
    }

    /// Load every `*.json` file in `dir`, named by file stem, in name order.
    ///
    /// A missing directory yields an empty registry; a file that fails to load
    /// is logged and skipped.
    pub fn load_dir(dir: &Path) -> Self {
        let mut registry = Self::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "model directory unavailable, running without statistical models");
                return registry;
            }
        };

        let mut paths: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();
        info!(dir = %dir.display(), count = paths.len(), "found model files");

        for path in paths {
            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match load_model(&path) {
                Ok(model) => {
                    info!(model = %name, "loaded model");
                    registry.insert(name, model);
                }
                Err(e) => {
                    error!(model = %name, path = %path.display(), error = %e, "failed to load model");
                }
            }
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn OutlierModel>)> {
        self.models.iter().map(|(name, model)| (name.as_str(), model))
    }
}
