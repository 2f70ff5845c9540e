#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Occupancy prediction.
//!
//! [`time`] turns an ISO-8601 timestamp into calendar features in the
//! Melbourne civil timezone. [`engine::PredictionEngine`] builds the fixed
//! six-column feature rows, runs one batched inference call on the blocking
//! pool, and applies the threshold rule. The classifier itself is loaded once
//! per process through [`classifier::ModelHandle`].

pub mod classifier;
pub mod engine;
pub mod forest;
pub mod time;

pub use classifier::{Classifier, ModelHandle};
pub use engine::{DEFAULT_THRESHOLD, PredictionEngine};
pub use time::TimeError;

/// Errors from model loading and inference.
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    /// The classifier artifact is missing or corrupt.
    #[error("Model unavailable: {message}")]
    ModelUnavailable {
        /// Why the model could not be loaded.
        message: String,
    },

    /// The artifact parsed but is not a usable model.
    #[error("Invalid model artifact: {message}")]
    InvalidModel {
        /// Description of what went wrong.
        message: String,
    },

    /// The decision threshold is outside `[0, 1]`.
    #[error("Invalid threshold {threshold}: must be within [0, 1]")]
    InvalidThreshold {
        /// The rejected threshold.
        threshold: f64,
    },

    /// Inference failed at runtime.
    #[error("Inference failed: {message}")]
    Inference {
        /// Description of what went wrong.
        message: String,
    },

    /// I/O error reading the artifact.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The artifact is not valid JSON.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}
