#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Parking data source capabilities.
//!
//! The pipeline talks to reference and live data through three traits:
//!
//! * [`CandidateSource`] returns the bays nearest to a point.
//! * [`AttributeSource`] resolves identifiers to attributes, one batched
//!   lookup per attribute kind.
//! * [`LiveStatusSource`] returns fresh sensor readings near a point.
//!
//! [`open_data::OpenDataClient`] implements all three against the City of
//! Melbourne open data API; [`memory::MemorySource`] implements them over a
//! pre-joined in-memory index.

pub mod memory;
pub mod open_data;
pub mod retry;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_finder_parking_models::{
    BayId, Candidate, DEFAULT_CANDIDATE_LIMIT, DEFAULT_RADIUS_METERS, LiveStatus, Point,
    Restriction, SegmentId, ZoneNumber,
};

/// Errors that can occur while talking to a data source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON parsing failed.
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error (reading a local data file).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Loading the spatial index failed.
    #[error("Spatial index error: {0}")]
    Spatial(#[from] parking_finder_spatial::SpatialError),

    /// The upstream answered with an error status.
    #[error("Upstream error: {message}")]
    Upstream {
        /// Description of what went wrong.
        message: String,
    },

    /// The upstream answered, but not in the expected shape.
    #[error("Unexpected response: {message}")]
    Response {
        /// Description of what went wrong.
        message: String,
    },
}

/// Parameters of a nearest-bays query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearbyQuery {
    /// Search center.
    pub center: Point,
    /// Maximum number of bays to return.
    pub limit: usize,
    /// Search radius in meters.
    pub radius_m: f64,
}

impl NearbyQuery {
    /// A query with the default limit (20) and radius (1000 m).
    #[must_use]
    pub const fn new(center: Point) -> Self {
        Self {
            center,
            limit: DEFAULT_CANDIDATE_LIMIT,
            radius_m: DEFAULT_RADIUS_METERS,
        }
    }
}

/// Parameters of a live sensor query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveQuery {
    /// Search center.
    pub center: Point,
    /// Search radius in meters.
    pub radius_m: f64,
    /// Maximum age of a reading.
    pub freshness: Duration,
    /// Maximum number of readings to return.
    pub limit: usize,
    /// Only return readings reporting the bay as unoccupied.
    pub unoccupied_only: bool,
}

/// Returns bays near a point, nearest first.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Returns up to `query.limit` bays within `query.radius_m` meters of
    /// `query.center`, ordered by ascending distance.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the source cannot be queried.
    async fn nearest_candidates(&self, query: &NearbyQuery) -> Result<Vec<Candidate>, SourceError>;
}

/// Resolves identifiers to attributes.
///
/// Every method is a single batched lookup for the whole identifier set.
/// Identifiers without a match are absent from the returned map.
#[async_trait]
pub trait AttributeSource: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Bay id → description.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the lookup fails.
    async fn descriptions(
        &self,
        bays: &BTreeSet<BayId>,
    ) -> Result<BTreeMap<BayId, String>, SourceError>;

    /// Road segment → zones linked to it, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the lookup fails.
    async fn segment_zones(
        &self,
        segments: &BTreeSet<SegmentId>,
    ) -> Result<BTreeMap<SegmentId, Vec<ZoneNumber>>, SourceError>;

    /// Zone → restriction records.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the lookup fails.
    async fn restrictions(
        &self,
        zones: &BTreeSet<ZoneNumber>,
    ) -> Result<BTreeMap<ZoneNumber, Vec<Restriction>>, SourceError>;
}

/// Returns fresh sensor readings near a point.
#[async_trait]
pub trait LiveStatusSource: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// Returns readings updated within `query.freshness`, nearest first.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the feed cannot be queried.
    async fn live_statuses(&self, query: &LiveQuery) -> Result<Vec<LiveStatus>, SourceError>;
}

/// Groups `(key, value)` pairs into a map of sorted, de-duplicated lists.
pub(crate) fn group_sorted<K: Ord, V: Ord>(
    pairs: impl IntoIterator<Item = (K, V)>,
) -> BTreeMap<K, Vec<V>> {
    let mut map: BTreeMap<K, Vec<V>> = BTreeMap::new();
    for (key, value) in pairs {
        map.entry(key).or_default().push(value);
    }
    for values in map.values_mut() {
        values.sort();
        values.dedup();
    }
    map
}
