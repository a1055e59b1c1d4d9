//! Scoring-only isolation forest.
//!
//! Trees are stored as flat node arrays in pre-order: every split points to
//! children with larger indices, so traversal always terminates.

use serde::{Deserialize, Serialize};

use crate::model::{Label, ModelError, OutlierModel};

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

fn default_offset() -> f64 {
    -0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    pub n_features: usize,
    /// Sub-sample size each tree was grown on.
    pub max_samples: usize,
    /// Subtracted from the raw score so that outliers fall below zero.
    #[serde(default = "default_offset")]
    pub offset: f64,
    pub trees: Vec<IsolationTree>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationTree {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        size: usize,
    },
}

/// Average path length of an unsuccessful BST search over `n` points.
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}

impl IsolationTree {
    fn path_length(&self, features: &[f64]) -> f64 {
        let mut index = 0;
        let mut depth = 0.0;
        loop {
            match self.nodes.get(index) {
                Some(Node::Split { feature, threshold, left, right }) => {
                    index = if features[*feature] <= *threshold { *left } else { *right };
                    depth += 1.0;
                }
                Some(Node::Leaf { size }) => return depth + average_path_length(*size),
                // Unreachable for validated trees.
                None => return depth,
            }
        }
    }

    fn validate(&self, n_features: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".into());
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if let Node::Split { feature, threshold, left, right } = node {
                if *feature >= n_features {
                    return Err(format!("node {} splits on feature {} of {}", i, feature, n_features));
                }
                if !threshold.is_finite() {
                    return Err(format!("node {} has a non-finite threshold", i));
                }
                for child in [left, right] {
                    if *child <= i || *child >= self.nodes.len() {
                        return Err(format!("node {} has invalid child index {}", i, child));
                    }
                }
            }
        }
        Ok(())
    }
}

impl IsolationForest {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.n_features == 0 {
            return Err(ModelError::Malformed("n_features must be positive".into()));
        }
        if self.max_samples < 2 {
            return Err(ModelError::Malformed("max_samples must be at least 2".into()));
        }
        if !self.offset.is_finite() {
            return Err(ModelError::Malformed("offset must be finite".into()));
        }
        if self.trees.is_empty() {
            return Err(ModelError::Malformed("forest has no trees".into()));
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate(self.n_features)
                .map_err(|reason| ModelError::Malformed(format!("tree {}: {}", i, reason)))?;
        }
        Ok(())
    }

    /// Raw score in `[-1, 0]`; closer to -1 is more anomalous.
    pub fn score_sample(&self, features: &[f64]) -> Result<f64, ModelError> {
        if features.len() != self.n_features {
            return Err(ModelError::FeatureLength {
                expected: self.n_features,
                got: features.len(),
            });
        }
        let total: f64 = self.trees.iter().map(|t| t.path_length(features)).sum();
        let mean_depth = total / self.trees.len() as f64;
        Ok(-(2f64).powf(-mean_depth / average_path_length(self.max_samples)))
    }
}

impl OutlierModel for IsolationForest {
    fn decision_function(&self, features: &[f64]) -> Result<f64, ModelError> {
        Ok(self.score_sample(features)? - self.offset)
    }

    fn predict(&self, features: &[f64]) -> Result<Label, ModelError> {
        if self.decision_function(features)? < 0.0 {
            Ok(Label::Outlier)
        } else {
            Ok(Label::Inlier)
        }
    }
}
