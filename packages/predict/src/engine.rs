//! Feature assembly, batched inference, and the decision rule.

use std::sync::Arc;

use parking_finder_parking_models::{
    Candidate, FeatureVector, PredictedStatus, PredictionResult, TimeContext,
};

use crate::PredictError;
use crate::classifier::ModelHandle;

/// Default decision threshold on `P(occupied)`.
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Turns candidates and a time context into labeled predictions.
#[derive(Debug, Clone)]
pub struct PredictionEngine {
    model: Arc<ModelHandle>,
}

impl PredictionEngine {
    /// Creates an engine over a shared model handle.
    #[must_use]
    pub const fn new(model: Arc<ModelHandle>) -> Self {
        Self { model }
    }

    /// Predicts occupancy for every eligible candidate.
    ///
    /// Candidates without a location or zone number are dropped; the rest
    /// keep their input order. The classifier is not touched when nothing
    /// is eligible.
    ///
    /// # Errors
    ///
    /// * [`PredictError::InvalidThreshold`] if `threshold` is outside `[0, 1]`
    /// * [`PredictError::ModelUnavailable`] if the model cannot be loaded
    /// * [`PredictError::Inference`] if inference fails
    pub async fn predict(
        &self,
        candidates: Vec<Candidate>,
        time: TimeContext,
        threshold: f64,
    ) -> Result<Vec<PredictionResult>, PredictError> {
        validate_threshold(threshold)?;

        let total = candidates.len();
        let (eligible, rows): (Vec<Candidate>, Vec<FeatureVector>) = candidates
            .into_iter()
            .filter_map(|candidate| {
                let row = FeatureVector::for_candidate(&candidate, &time)?;
                Some((candidate, row))
            })
            .unzip();

        if eligible.len() < total {
            log::debug!(
                "Dropped {} of {total} candidates missing location or zone",
                total - eligible.len()
            );
        }
        if eligible.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.model.get()?;
        let probabilities = tokio::task::spawn_blocking(move || model.predict_probability(&rows))
            .await
            .map_err(|e| PredictError::Inference {
                message: format!("inference task failed: {e}"),
            })??;

        if probabilities.len() != eligible.len() {
            return Err(PredictError::Inference {
                message: format!(
                    "model returned {} probabilities for {} rows",
                    probabilities.len(),
                    eligible.len()
                ),
            });
        }

        eligible
            .into_iter()
            .zip(probabilities)
            .map(|(candidate, p)| {
                if !(0.0..=1.0).contains(&p) {
                    return Err(PredictError::Inference {
                        message: format!("probability {p} outside [0, 1]"),
                    });
                }
                let (predicted_status, confidence) = decide(p, threshold);
                Ok(PredictionResult {
                    candidate,
                    proba_occupied: round4(p),
                    predicted_status,
                    confidence: round4(confidence),
                })
            })
            .collect()
    }
}

/// Checks that `threshold` lies within `[0, 1]`.
///
/// # Errors
///
/// Returns [`PredictError::InvalidThreshold`] otherwise, including for NaN.
pub fn validate_threshold(threshold: f64) -> Result<(), PredictError> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(PredictError::InvalidThreshold { threshold })
    }
}

/// Applies the decision rule to `p = P(occupied)`.
///
/// The label compares `p` against `threshold`; the confidence always
/// measures distance from 0.5.
#[must_use]
pub fn decide(p: f64, threshold: f64) -> (PredictedStatus, f64) {
    let status = if p >= threshold {
        PredictedStatus::Occupied
    } else {
        PredictedStatus::Available
    };
    let confidence = if p >= 0.5 { p } else { 1.0 - p };
    (status, confidence)
}

/// Rounds to 4 decimal places.
#[must_use]
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
