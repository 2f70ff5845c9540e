//! Geo candidate store.
//!
//! Wraps any [`CandidateSource`] and enforces the nearest-query contract
//! on whatever it returns: every candidate has a location inside the
//! radius, ordering is by great-circle distance, and the result holds at
//! most `limit` entries.

use std::sync::Arc;
use std::time::Duration;

use parking_finder_parking_models::Candidate;
use parking_finder_source::{CandidateSource, NearbyQuery};
use parking_finder_spatial::haversine_meters;

use crate::{PipelineError, bounded};

/// Nearest-candidate retrieval with validation and a per-call timeout.
#[derive(Clone)]
pub struct GeoCandidateStore {
    source: Arc<dyn CandidateSource>,
    timeout: Duration,
}

impl GeoCandidateStore {
    /// Wraps `source`; each call is abandoned after `timeout`.
    #[must_use]
    pub fn new(source: Arc<dyn CandidateSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// Returns up to `query.limit` candidates within `query.radius_m` of
    /// `query.center`, nearest first. Nothing in range is an empty result.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UpstreamUnavailable`] if the source fails or
    /// times out.
    pub async fn nearest_candidates(
        &self,
        query: &NearbyQuery,
    ) -> Result<Vec<Candidate>, PipelineError> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }

        let name = self.source.name();
        let raw = bounded(
            name,
            self.timeout,
            log::Level::Error,
            self.source.nearest_candidates(query),
        ).await?;
        let returned = raw.len();

        let mut ranked: Vec<(f64, Candidate)> = raw
            .into_iter()
            .filter_map(|candidate| {
                let distance = haversine_meters(query.center, candidate.location?);
                (distance <= query.radius_m).then_some((distance, candidate))
            })
            .collect();

        if ranked.len() < returned {
            log::warn!(
                "{name}: dropped {} of {returned} candidates without a location or out of range",
                returned - ranked.len()
            );
        }

        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        ranked.truncate(query.limit);
        log::debug!("{name}: {} candidates near {:?}", ranked.len(), query.center);

        Ok(ranked.into_iter().map(|(_, candidate)| candidate).collect())
    }
}
