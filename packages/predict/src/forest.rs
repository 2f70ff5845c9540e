//! JSON classifier artifacts.
//!
//! Two model families are supported, selected by the `kind` field:
//!
//! * `random_forest` — decision trees exported from scikit-learn's tree
//!   arrays (`children_left`, `children_right`, `feature`, `threshold`,
//!   `value`). Leaves hold per-class counts or fractions; the forest
//!   probability is the mean of each tree's normalized positive-class
//!   frequency.
//! * `logistic_regression` — six coefficients and an intercept; the
//!   probability is the sigmoid of the linear score.

use std::path::Path;

use parking_finder_parking_models::{FEATURE_NAMES, FeatureVector};
use serde::Deserialize;

use crate::PredictError;
use crate::classifier::Classifier;

/// Marker scikit-learn uses for "no child" in its tree arrays.
const LEAF: i64 = -1;

const FEATURE_COUNT: usize = FEATURE_NAMES.len();

/// One decision tree in scikit-learn array form.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DecisionTree {
    /// Left child per node, `-1` at leaves.
    pub children_left: Vec<i64>,
    /// Right child per node, `-1` at leaves.
    pub children_right: Vec<i64>,
    /// Split feature index per node.
    pub feature: Vec<i64>,
    /// Split threshold per node; rows with `x <= threshold` go left.
    pub threshold: Vec<f64>,
    /// Class counts or fractions per node, `[negative, positive]`.
    pub value: Vec<Vec<f64>>,
}

impl DecisionTree {
    fn validate(&self, index: usize) -> Result<(), PredictError> {
        let invalid = |message: String| PredictError::InvalidModel {
            message: format!("tree {index}: {message}"),
        };
        let nodes = self.children_left.len();
        if nodes == 0 {
            return Err(invalid("tree has no nodes".to_string()));
        }
        if [
            self.children_right.len(),
            self.feature.len(),
            self.threshold.len(),
            self.value.len(),
        ]
        .iter()
        .any(|len| *len != nodes)
        {
            return Err(invalid("node arrays differ in length".to_string()));
        }

        for node in 0..nodes {
            let (left, right) = (self.children_left[node], self.children_right[node]);
            if left == LEAF || right == LEAF {
                if left != right {
                    return Err(invalid(format!("node {node} has a single child")));
                }
                let counts = &self.value[node];
                if counts.len() != 2 || counts.iter().any(|c| !c.is_finite() || *c < 0.0) {
                    return Err(invalid(format!("leaf {node} must hold two class weights")));
                }
                if counts.iter().sum::<f64>() <= 0.0 {
                    return Err(invalid(format!("leaf {node} has zero weight")));
                }
                continue;
            }

            // Children always come after their parent, which also rules out
            // cycles.
            let node_i64 = i64::try_from(node).unwrap_or(i64::MAX);
            let nodes_i64 = i64::try_from(nodes).unwrap_or(i64::MAX);
            for child in [left, right] {
                if child <= node_i64 || child >= nodes_i64 {
                    return Err(invalid(format!("node {node} has invalid child {child}")));
                }
            }
            if !usize::try_from(self.feature[node]).is_ok_and(|f| f < FEATURE_COUNT) {
                return Err(invalid(format!(
                    "node {node} splits on unknown feature {}",
                    self.feature[node]
                )));
            }
            if self.threshold[node].is_nan() {
                return Err(invalid(format!("node {node} has a NaN threshold")));
            }
        }
        Ok(())
    }

    /// Positive-class frequency at the leaf `row` falls into. Assumes the
    /// tree passed validation.
    fn positive_frequency(&self, row: &[f64; FEATURE_COUNT]) -> f64 {
        let mut node = 0_usize;
        loop {
            let left = self.children_left[node];
            if left == LEAF {
                let counts = &self.value[node];
                return counts[1] / (counts[0] + counts[1]);
            }
            let feature = usize::try_from(self.feature[node]).unwrap_or_default();
            let next = if row[feature] <= self.threshold[node] {
                left
            } else {
                self.children_right[node]
            };
            node = usize::try_from(next).unwrap_or_default();
        }
    }
}

/// A deserialized classifier artifact.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    /// Ensemble of decision trees.
    RandomForest {
        /// Feature names the model was trained on, if recorded.
        #[serde(default)]
        feature_names: Option<Vec<String>>,
        /// The trees.
        trees: Vec<DecisionTree>,
    },
    /// Logistic regression.
    LogisticRegression {
        /// Feature names the model was trained on, if recorded.
        #[serde(default)]
        feature_names: Option<Vec<String>>,
        /// One weight per feature.
        coefficients: Vec<f64>,
        /// Bias term.
        intercept: f64,
    },
}

impl ModelArtifact {
    /// Reads and validates an artifact file.
    ///
    /// # Errors
    ///
    /// Returns [`PredictError`] if the file cannot be read, is not valid
    /// JSON, or fails validation.
    pub fn from_path(path: &Path) -> Result<Self, PredictError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parses and validates an artifact.
    ///
    /// # Errors
    ///
    /// Returns [`PredictError`] if the text is not a valid artifact.
    pub fn from_json(text: &str) -> Result<Self, PredictError> {
        let artifact: Self = serde_json::from_str(text)?;
        artifact.validate()?;
        Ok(artifact)
    }

    fn validate(&self) -> Result<(), PredictError> {
        let (Self::RandomForest { feature_names, .. }
        | Self::LogisticRegression { feature_names, .. }) = self;
        if let Some(names) = feature_names
            && !names.iter().map(String::as_str).eq(FEATURE_NAMES)
        {
            return Err(PredictError::InvalidModel {
                message: format!("feature names {names:?} do not match {FEATURE_NAMES:?}"),
            });
        }

        match self {
            Self::RandomForest { trees, .. } => {
                if trees.is_empty() {
                    return Err(PredictError::InvalidModel {
                        message: "forest has no trees".to_string(),
                    });
                }
                trees
                    .iter()
                    .enumerate()
                    .try_for_each(|(i, tree)| tree.validate(i))
            }
            Self::LogisticRegression {
                coefficients,
                intercept,
                ..
            } => {
                if coefficients.len() != FEATURE_COUNT
                    || !intercept.is_finite()
                    || coefficients.iter().any(|c| !c.is_finite())
                {
                    return Err(PredictError::InvalidModel {
                        message: format!(
                            "logistic regression needs {FEATURE_COUNT} finite coefficients"
                        ),
                    });
                }
                Ok(())
            }
        }
    }

    /// Short human-readable summary for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::RandomForest { trees, .. } => format!("random forest ({} trees)", trees.len()),
            Self::LogisticRegression { .. } => "logistic regression".to_string(),
        }
    }

    fn probability(&self, row: &[f64; FEATURE_COUNT]) -> f64 {
        match self {
            Self::RandomForest { trees, .. } => {
                let total: f64 = trees.iter().map(|tree| tree.positive_frequency(row)).sum();
                #[allow(clippy::cast_precision_loss)]
                let count = trees.len() as f64;
                total / count
            }
            Self::LogisticRegression {
                coefficients,
                intercept,
                ..
            } => {
                let score: f64 = intercept
                    + coefficients
                        .iter()
                        .zip(row)
                        .map(|(w, x)| w * x)
                        .sum::<f64>();
                1.0 / (1.0 + (-score).exp())
            }
        }
    }
}

impl Classifier for ModelArtifact {
    fn predict_probability(&self, rows: &[FeatureVector]) -> Result<Vec<f64>, PredictError> {
        rows.iter()
            .map(|row| {
                if row.values().iter().any(|v| !v.is_finite()) {
                    return Err(PredictError::Inference {
                        message: format!("non-finite feature in {:?}", row.values()),
                    });
                }
                Ok(self.probability(row.values()))
            })
            .collect()
    }
}
