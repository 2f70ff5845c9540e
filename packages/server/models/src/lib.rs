#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! API request and response types for the parking finder server.
//!
//! Candidate and prediction rows are serialized straight from the shared
//! parking models; the types here only wrap them into request/response
//! envelopes.

use parking_finder_parking_models::PredictionResult;
use serde::{Deserialize, Serialize};

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiHealth {
    /// Whether the server is healthy.
    pub healthy: bool,
    /// Server version.
    pub version: String,
}

/// Error body returned with every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// Human-readable error message.
    pub error: String,
}

/// Query parameters locating a search center.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct LocationParams {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
}

const fn default_available_only() -> bool {
    true
}

/// Query parameters for the realtime endpoint.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RealtimeParams {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// Only return bays whose sensor currently reports them as free.
    #[serde(default = "default_available_only")]
    pub available_only: bool,
}

/// Body of a prediction request.
#[derive(Debug, Clone, Deserialize)]
pub struct PredictionRequest {
    /// Latitude in degrees.
    pub lat: f64,
    /// Longitude in degrees.
    pub lon: f64,
    /// ISO-8601 instant to predict for.
    #[serde(alias = "datetime_iso")]
    pub timestamp: String,
    /// Decision threshold on `P(occupied)`; defaults to the configured value.
    #[serde(default)]
    pub threshold: Option<f64>,
}

/// Describes the model that produced a prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model name.
    pub name: String,
    /// Offline accuracy estimate, if known.
    pub accuracy_estimate: Option<f64>,
}

/// Prediction response.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionResponse {
    /// The requested instant, RFC 3339 in the service timezone.
    pub timestamp: String,
    /// The model used.
    pub model_info: ModelInfo,
    /// One row per eligible nearby bay, nearest first.
    pub results: Vec<PredictionResult>,
}
