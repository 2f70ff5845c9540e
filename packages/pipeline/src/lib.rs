#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Candidate enrichment and prediction flows.
//!
//! Two request paths share the same stages:
//!
//! * **realtime**: nearest candidates and live sensor readings are fetched
//!   concurrently, merged by bay id, then enriched by the bulk join.
//! * **prediction**: nearest candidates are enriched, the timestamp is
//!   converted to calendar features, and the classifier labels every
//!   eligible candidate.

pub mod join;
pub mod live;
pub mod store;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_finder_parking_models::{
    Candidate, DEFAULT_CANDIDATE_LIMIT, DEFAULT_RADIUS_METERS, LiveCandidate, Point,
    PredictionResult,
};
use parking_finder_predict::time::{self, DEFAULT_TIME_ZONE, TimeError};
use parking_finder_predict::{PredictError, PredictionEngine, engine};
use parking_finder_source::{
    AttributeSource, CandidateSource, LiveQuery, LiveStatusSource, NearbyQuery, SourceError,
};

pub use join::BulkJoinResolver;
pub use store::GeoCandidateStore;

/// Errors surfaced by the pipeline flows.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Timestamp rejected.
    #[error(transparent)]
    Time(#[from] TimeError),

    /// Model loading, threshold validation, or inference failed.
    #[error(transparent)]
    Predict(#[from] PredictError),

    /// A primary upstream call failed or timed out.
    #[error("Upstream unavailable ({source_name}): {message}")]
    UpstreamUnavailable {
        /// Source that failed.
        source_name: String,
        /// Description of what went wrong.
        message: String,
    },
}

/// Runs a source call under `timeout`, mapping failures to
/// [`PipelineError::UpstreamUnavailable`]. Failures are logged at `level`.
pub(crate) async fn bounded<T>(
    name: &str,
    timeout: Duration,
    level: log::Level,
    call: impl Future<Output = Result<T, SourceError>>,
) -> Result<T, PipelineError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            log::log!(level, "{name}: {e}");
            Err(PipelineError::UpstreamUnavailable {
                source_name: name.to_string(),
                message: e.to_string(),
            })
        }
        Err(_) => {
            log::log!(level, "{name}: timed out after {timeout:?}");
            Err(PipelineError::UpstreamUnavailable {
                source_name: name.to_string(),
                message: format!("timed out after {timeout:?}"),
            })
        }
    }
}

/// Search parameters shared by every request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    /// Candidates per request.
    pub limit: usize,
    /// Search radius in meters.
    pub radius_m: f64,
    /// Maximum age of a live reading.
    pub freshness: Duration,
    /// Live readings requested per realtime query.
    pub live_limit: usize,
    /// Per-call timeout for every upstream call.
    pub timeout: Duration,
    /// Civil timezone for prediction timestamps.
    pub zone: Tz,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            limit: DEFAULT_CANDIDATE_LIMIT,
            radius_m: DEFAULT_RADIUS_METERS,
            freshness: Duration::from_secs(60),
            live_limit: 100,
            timeout: Duration::from_secs(10),
            zone: DEFAULT_TIME_ZONE,
        }
    }
}

/// Predictions for one timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionOutcome {
    /// The requested instant in the configured timezone.
    pub timestamp: DateTime<Tz>,
    /// One result per eligible candidate, nearest first.
    pub results: Vec<PredictionResult>,
}

/// The assembled pipeline.
#[derive(Clone)]
pub struct Pipeline {
    store: GeoCandidateStore,
    joiner: BulkJoinResolver,
    live: Option<Arc<dyn LiveStatusSource>>,
    engine: PredictionEngine,
    settings: PipelineSettings,
}

impl Pipeline {
    /// Assembles a pipeline. Without a live source the realtime path is
    /// unavailable.
    #[must_use]
    pub fn new(
        candidates: Arc<dyn CandidateSource>,
        attributes: Arc<dyn AttributeSource>,
        live: Option<Arc<dyn LiveStatusSource>>,
        engine: PredictionEngine,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store: GeoCandidateStore::new(candidates, settings.timeout),
            joiner: BulkJoinResolver::new(attributes, settings.timeout),
            live,
            engine,
            settings,
        }
    }

    /// The active settings.
    #[must_use]
    pub const fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn nearby_query(&self, center: Point) -> NearbyQuery {
        NearbyQuery {
            center,
            limit: self.settings.limit,
            radius_m: self.settings.radius_m,
        }
    }

    /// Nearest candidates with live occupancy overlaid and attributes
    /// resolved.
    ///
    /// With `available_only` the rows are the nearest bays with a fresh
    /// `Unoccupied` reading, up to the configured limit. Bays the store
    /// returned keep their stored attributes; the rest are built from the
    /// reading's own location and zone.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UpstreamUnavailable`] if candidate retrieval
    /// or the live feed fails, or no live feed is configured.
    pub async fn realtime_bays(
        &self,
        center: Point,
        available_only: bool,
    ) -> Result<Vec<LiveCandidate>, PipelineError> {
        let Some(live) = &self.live else {
            return Err(PipelineError::UpstreamUnavailable {
                source_name: "live".to_string(),
                message: "no live sensor feed configured".to_string(),
            });
        };

        let nearby = self.nearby_query(center);
        let live_query = LiveQuery {
            center,
            radius_m: self.settings.radius_m,
            freshness: self.settings.freshness,
            limit: self.settings.live_limit,
            unoccupied_only: available_only,
        };

        let (candidates, statuses) = tokio::try_join!(
            self.store.nearest_candidates(&nearby),
            bounded(
                live.name(),
                self.settings.timeout,
                log::Level::Error,
                live.live_statuses(&live_query),
            ),
        )?;

        let merged = if available_only {
            live::nearest_available(candidates, statuses, center, self.settings.limit)
        } else {
            live::merge(candidates, statuses)
        };

        let (candidates, overlays): (Vec<_>, Vec<_>) = merged
            .into_iter()
            .map(|row| (row.candidate, (row.occupancy, row.last_updated)))
            .unzip();
        let enriched = self.joiner.enrich(candidates).await;

        Ok(enriched
            .into_iter()
            .zip(overlays)
            .map(|(candidate, (occupancy, last_updated))| LiveCandidate {
                candidate,
                occupancy,
                last_updated,
            })
            .collect())
    }

    /// Nearest candidates with attributes resolved, ready for prediction.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UpstreamUnavailable`] if candidate retrieval
    /// fails.
    pub async fn nearby_for_prediction(
        &self,
        center: Point,
    ) -> Result<Vec<Candidate>, PipelineError> {
        let candidates = self
            .store
            .nearest_candidates(&self.nearby_query(center))
            .await?;
        Ok(self.joiner.enrich(candidates).await)
    }

    /// Predicts occupancy near `center` at `timestamp`.
    ///
    /// The timestamp must be strictly later than `now`. Input validation
    /// happens before any upstream call.
    ///
    /// # Errors
    ///
    /// * [`PipelineError::Time`] for a malformed or non-future timestamp
    /// * [`PipelineError::Predict`] for an invalid threshold or unavailable
    ///   model
    /// * [`PipelineError::UpstreamUnavailable`] if candidate retrieval fails
    pub async fn predict_at(
        &self,
        center: Point,
        timestamp: &str,
        threshold: f64,
        now: DateTime<Utc>,
    ) -> Result<PredictionOutcome, PipelineError> {
        let instant = time::parse_in_zone(timestamp, self.settings.zone)?;
        time::ensure_future(&instant, now)?;
        engine::validate_threshold(threshold)?;

        let candidates = self.nearby_for_prediction(center).await?;
        let context = time::time_context_of(&instant);
        log::debug!(
            "Predicting {} candidates at {instant} ({context:?})",
            candidates.len()
        );

        let results = self.engine.predict(candidates, context, threshold).await?;
        Ok(PredictionOutcome {
            timestamp: instant,
            results,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_finder_parking_models::{
        BayId, FeatureVector, LiveStatus, OccupancyState, PredictedStatus, Restriction, SegmentId,
        ZoneNumber,
    };
    use parking_finder_predict::{Classifier, DEFAULT_THRESHOLD, ModelHandle};
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct Fake {
        candidates: Vec<Candidate>,
        live: Vec<LiveStatus>,
        fail_live: bool,
        candidate_calls: AtomicUsize,
        attribute_calls: AtomicUsize,
    }

    #[async_trait]
    impl CandidateSource for Fake {
        fn name(&self) -> &str {
            "fake"
        }

        async fn nearest_candidates(
            &self,
            query: &NearbyQuery,
        ) -> Result<Vec<Candidate>, SourceError> {
            self.candidate_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.candidates.iter().take(query.limit).cloned().collect())
        }
    }

    #[async_trait]
    impl AttributeSource for Fake {
        fn name(&self) -> &str {
            "fake"
        }

        async fn descriptions(
            &self,
            bays: &BTreeSet<BayId>,
        ) -> Result<BTreeMap<BayId, String>, SourceError> {
            self.attribute_calls.fetch_add(1, Ordering::SeqCst);
            Ok(bays
                .iter()
                .map(|id| (id.clone(), format!("Bay {id}")))
                .collect())
        }

        async fn segment_zones(
            &self,
            segments: &BTreeSet<SegmentId>,
        ) -> Result<BTreeMap<SegmentId, Vec<ZoneNumber>>, SourceError> {
            self.attribute_calls.fetch_add(1, Ordering::SeqCst);
            Ok(segments.iter().map(|s| (*s, vec![7550])).collect())
        }

        async fn restrictions(
            &self,
            zones: &BTreeSet<ZoneNumber>,
        ) -> Result<BTreeMap<ZoneNumber, Vec<Restriction>>, SourceError> {
            self.attribute_calls.fetch_add(1, Ordering::SeqCst);
            Ok(zones
                .iter()
                .map(|z| {
                    let plate = Restriction::from_json(json!({"display": "2P"}));
                    (*z, plate.into_iter().collect())
                })
                .collect())
        }
    }

    #[async_trait]
    impl LiveStatusSource for Fake {
        fn name(&self) -> &str {
            "fake"
        }

        async fn live_statuses(&self, query: &LiveQuery) -> Result<Vec<LiveStatus>, SourceError> {
            if self.fail_live {
                return Err(SourceError::Upstream {
                    message: "HTTP 502".to_string(),
                });
            }
            Ok(self
                .live
                .iter()
                .filter(|s| !query.unoccupied_only || s.state == OccupancyState::Unoccupied)
                .cloned()
                .collect())
        }
    }

    struct Fixed(f64);

    impl Classifier for Fixed {
        fn predict_probability(&self, rows: &[FeatureVector]) -> Result<Vec<f64>, PredictError> {
            Ok(vec![self.0; rows.len()])
        }
    }

    fn center() -> Point {
        Point::new(-37.81, 144.96).unwrap()
    }

    fn bay(id: &str, segment: SegmentId) -> Candidate {
        Candidate {
            bay_id: BayId::new(id),
            segment_id: Some(segment),
            ..Candidate::at(Point::new(-37.8101, 144.9601).unwrap())
        }
    }

    fn reading(id: &str, token: &str) -> LiveStatus {
        LiveStatus {
            bay_id: BayId::new(id).unwrap(),
            state: OccupancyState::from_token(token),
            status_description: token.to_string(),
            last_updated: Utc::now(),
            zone_number: None,
            location: None,
        }
    }

    fn pipeline(fake: &Arc<Fake>, p: f64) -> Pipeline {
        let engine = PredictionEngine::new(Arc::new(ModelHandle::preloaded(Arc::new(Fixed(p)))));
        Pipeline::new(
            fake.clone(),
            fake.clone(),
            Some(fake.clone()),
            engine,
            PipelineSettings::default(),
        )
    }

    fn future_timestamp() -> String {
        (Utc::now() + chrono::Duration::days(7))
            .format("%Y-%m-%dT%H:%M:%SZ")
            .to_string()
    }

    #[tokio::test]
    async fn predicts_end_to_end() {
        let fake = Arc::new(Fake {
            candidates: vec![bay("1", 20186), bay("2", 20187)],
            ..Fake::default()
        });
        let outcome = pipeline(&fake, 0.7)
            .predict_at(center(), &future_timestamp(), DEFAULT_THRESHOLD, Utc::now())
            .await
            .unwrap();

        assert_eq!(outcome.results.len(), 2);
        let first = &outcome.results[0];
        assert_eq!(first.candidate.description, "Bay 1");
        assert_eq!(first.candidate.zone_number, Some(7550));
        assert_eq!(first.candidate.restrictions.len(), 1);
        assert!((first.proba_occupied - 0.7).abs() < 1e-12);
        assert_eq!(first.predicted_status, PredictedStatus::Occupied);
        assert!((first.confidence - 0.7).abs() < 1e-12);
        // descriptions + segment zones + restrictions
        assert_eq!(fake.attribute_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_candidates_is_empty_success() {
        let fake = Arc::new(Fake::default());
        let outcome = pipeline(&fake, 0.7)
            .predict_at(center(), &future_timestamp(), DEFAULT_THRESHOLD, Utc::now())
            .await
            .unwrap();
        assert!(outcome.results.is_empty());
        assert_eq!(fake.attribute_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejects_bad_input_before_fetching() {
        let fake = Arc::new(Fake {
            candidates: vec![bay("1", 20186)],
            ..Fake::default()
        });
        let pipeline = pipeline(&fake, 0.7);

        assert!(matches!(
            pipeline
                .predict_at(center(), "not a time", DEFAULT_THRESHOLD, Utc::now())
                .await,
            Err(PipelineError::Time(TimeError::InvalidTimestamp { .. }))
        ));
        assert!(matches!(
            pipeline
                .predict_at(center(), "2020-01-01T09:00:00", DEFAULT_THRESHOLD, Utc::now())
                .await,
            Err(PipelineError::Time(TimeError::NotInFuture { .. }))
        ));
        assert!(matches!(
            pipeline
                .predict_at(center(), &future_timestamp(), 2.0, Utc::now())
                .await,
            Err(PipelineError::Predict(PredictError::InvalidThreshold { .. }))
        ));
        assert_eq!(fake.candidate_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn realtime_merges_live_status() {
        let fake = Arc::new(Fake {
            candidates: vec![bay("1", 20186), bay("2", 20187), bay("3", 20188)],
            live: vec![reading("1", "Unoccupied"), reading("2", "Present")],
            ..Fake::default()
        });
        let pipeline = pipeline(&fake, 0.5);

        let all = pipeline.realtime_bays(center(), false).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].occupancy, Some(OccupancyState::Unoccupied));
        assert_eq!(all[1].occupancy, Some(OccupancyState::Occupied));
        assert!(all[2].occupancy.is_none());
        assert_eq!(all[2].candidate.description, "Bay 3");

        let available = pipeline.realtime_bays(center(), true).await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].candidate.bay_id, BayId::new("1"));
        assert_eq!(available[0].candidate.restrictions.len(), 1);
    }

    #[tokio::test]
    async fn realtime_available_reaches_past_occupied_nearest_bays() {
        // 25 bays roughly 11 m apart; the nearest 20 are occupied.
        let at = |i: u32| Point::new(-37.81 + f64::from(i) * 0.0001, 144.96).unwrap();
        let candidates = (0..25)
            .map(|i| Candidate {
                bay_id: BayId::new(i.to_string()),
                segment_id: Some(20_000 + i64::from(i)),
                ..Candidate::at(at(i))
            })
            .collect();
        let live = (0..25)
            .map(|i| LiveStatus {
                location: Some(at(i)),
                zone_number: Some(7550),
                ..reading(&i.to_string(), if i < 20 { "Present" } else { "Unoccupied" })
            })
            .collect();
        let fake = Arc::new(Fake {
            candidates,
            live,
            ..Fake::default()
        });

        let available = pipeline(&fake, 0.5)
            .realtime_bays(center(), true)
            .await
            .unwrap();

        let ids: Vec<_> = available
            .iter()
            .map(|row| row.candidate.bay_id.clone())
            .collect();
        let expected: Vec<_> = (20..25).map(|i| BayId::new(i.to_string())).collect();
        assert_eq!(ids, expected);
        assert!(
            available
                .iter()
                .all(|row| row.occupancy == Some(OccupancyState::Unoccupied))
        );
        assert_eq!(available[0].candidate.description, "Bay 20");
        assert_eq!(available[0].candidate.zone_number, Some(7550));
        assert_eq!(available[0].candidate.restrictions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_maps_timeouts_and_errors() {
        let slow = bounded("slow", Duration::from_secs(1), log::Level::Debug, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, SourceError>(())
        })
        .await;
        assert!(matches!(
            slow,
            Err(PipelineError::UpstreamUnavailable { ref source_name, ref message })
                if source_name == "slow" && message.starts_with("timed out")
        ));

        let failed = bounded("flaky", Duration::from_secs(1), log::Level::Warn, async {
            Err::<(), _>(SourceError::Upstream {
                message: "HTTP 500".to_string(),
            })
        })
        .await;
        assert!(matches!(
            failed,
            Err(PipelineError::UpstreamUnavailable { ref message, .. }) if message.contains("HTTP 500")
        ));
    }

    #[tokio::test]
    async fn realtime_live_failure_is_fatal() {
        let fake = Arc::new(Fake {
            candidates: vec![bay("1", 20186)],
            fail_live: true,
            ..Fake::default()
        });
        assert!(matches!(
            pipeline(&fake, 0.5).realtime_bays(center(), true).await,
            Err(PipelineError::UpstreamUnavailable { .. })
        ));

        let engine = PredictionEngine::new(Arc::new(ModelHandle::preloaded(Arc::new(Fixed(0.5)))));
        let no_live = Pipeline::new(
            fake.clone(),
            fake,
            None,
            engine,
            PipelineSettings::default(),
        );
        assert!(matches!(
            no_live.realtime_bays(center(), false).await,
            Err(PipelineError::UpstreamUnavailable { .. })
        ));
    }
}
