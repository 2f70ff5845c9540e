//! In-memory source backed by a pre-joined bay index.
//!
//! Bays come from a `GeoJSON` file loaded into a [`BayIndex`]. Segment
//! links, restrictions, and live readings are optional JSON files holding
//! arrays of records in the same shape the open data exports return, so a
//! snapshot downloaded from the API can be served offline.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_finder_parking_models::{
    BayId, Candidate, LiveStatus, OccupancyState, Restriction, SegmentId, ZoneNumber,
};
use parking_finder_spatial::{BayIndex, haversine_meters};
use serde::Deserialize;

use crate::open_data::{
    live_status_from_record, restrictions_from_records, segment_zones_from_records,
};
use crate::{
    AttributeSource, CandidateSource, LiveQuery, LiveStatusSource, NearbyQuery, SourceError,
};

/// Files backing a [`MemorySource`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MemorySourceConfig {
    /// `GeoJSON` `FeatureCollection` of bay points.
    pub bays_path: PathBuf,
    /// JSON array of `{segment_id, parkingzone}` records.
    #[serde(default)]
    pub segment_zones_path: Option<PathBuf>,
    /// JSON array of sign plate records keyed by `parkingzone`.
    #[serde(default)]
    pub restrictions_path: Option<PathBuf>,
    /// JSON array of sensor records.
    ///
    /// A snapshot does not age: freshness is measured against its newest
    /// reading rather than the wall clock.
    #[serde(default)]
    pub live_path: Option<PathBuf>,
}

/// Serves every source capability from memory.
pub struct MemorySource {
    index: BayIndex,
    descriptions: BTreeMap<BayId, String>,
    segment_zones: BTreeMap<SegmentId, Vec<ZoneNumber>>,
    restrictions: BTreeMap<ZoneNumber, Vec<Restriction>>,
    live: Vec<LiveStatus>,
    snapshot_at: Option<DateTime<Utc>>,
}

impl MemorySource {
    /// Builds a source from an index and attribute tables.
    ///
    /// Descriptions are taken from the indexed bays themselves.
    #[must_use]
    pub fn new(
        index: BayIndex,
        segment_zones: BTreeMap<SegmentId, Vec<ZoneNumber>>,
        restrictions: BTreeMap<ZoneNumber, Vec<Restriction>>,
        live: Vec<LiveStatus>,
    ) -> Self {
        let descriptions = index
            .iter()
            .filter_map(|candidate| {
                candidate
                    .bay_id
                    .clone()
                    .map(|id| (id, candidate.description.clone()))
            })
            .collect();

        Self {
            index,
            descriptions,
            segment_zones,
            restrictions,
            live,
            snapshot_at: None,
        }
    }

    /// Loads every configured file.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if a file cannot be read or parsed.
    pub fn from_files(config: &MemorySourceConfig) -> Result<Self, SourceError> {
        let bays = std::fs::read_to_string(&config.bays_path)?;
        let index = BayIndex::from_geojson(&bays)?;

        let segment_zones = match &config.segment_zones_path {
            Some(path) => segment_zones_from_records(&read_records(path)?),
            None => BTreeMap::new(),
        };
        let restrictions = match &config.restrictions_path {
            Some(path) => restrictions_from_records(read_records(path)?),
            None => BTreeMap::new(),
        };
        let live: Vec<LiveStatus> = match &config.live_path {
            Some(path) => read_records(path)?
                .iter()
                .filter_map(live_status_from_record)
                .collect(),
            None => Vec::new(),
        };

        log::info!(
            "Memory source ready: {} bays, {} segment links, {} zones with restrictions, {} live readings",
            index.len(),
            segment_zones.len(),
            restrictions.len(),
            live.len()
        );

        let snapshot_at = live.iter().map(|status| status.last_updated).max();
        Ok(Self {
            snapshot_at,
            ..Self::new(index, segment_zones, restrictions, live)
        })
    }

    /// Live readings matching `query`, evaluated at `now`.
    fn live_at(&self, query: &LiveQuery, now: DateTime<Utc>) -> Vec<LiveStatus> {
        let freshness = chrono::Duration::from_std(query.freshness)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let oldest = now - freshness;

        let mut hits: Vec<(f64, &LiveStatus)> = self
            .live
            .iter()
            .filter(|status| status.last_updated > oldest)
            .filter(|status| !query.unoccupied_only || status.state == OccupancyState::Unoccupied)
            .filter_map(|status| {
                let distance = haversine_meters(query.center, status.location?);
                (distance <= query.radius_m).then_some((distance, status))
            })
            .collect();

        hits.sort_by(|a, b| a.0.total_cmp(&b.0));
        hits.truncate(query.limit);
        hits.into_iter().map(|(_, status)| status.clone()).collect()
    }
}

fn read_records(path: &Path) -> Result<Vec<serde_json::Value>, SourceError> {
    let text = std::fs::read_to_string(path)?;
    match serde_json::from_str(&text)? {
        serde_json::Value::Array(records) => Ok(records),
        _ => Err(SourceError::Response {
            message: format!("{} is not a JSON array", path.display()),
        }),
    }
}

fn select<K: Ord + Clone, V: Clone>(table: &BTreeMap<K, V>, keys: &BTreeSet<K>) -> BTreeMap<K, V> {
    keys.iter()
        .filter_map(|key| table.get(key).map(|value| (key.clone(), value.clone())))
        .collect()
}

#[async_trait]
impl CandidateSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn nearest_candidates(&self, query: &NearbyQuery) -> Result<Vec<Candidate>, SourceError> {
        Ok(self
            .index
            .nearest(query.center, query.limit, query.radius_m)
            .into_iter()
            .map(|(_, candidate)| candidate.clone())
            .collect())
    }
}

#[async_trait]
impl AttributeSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn descriptions(
        &self,
        bays: &BTreeSet<BayId>,
    ) -> Result<BTreeMap<BayId, String>, SourceError> {
        Ok(select(&self.descriptions, bays))
    }

    async fn segment_zones(
        &self,
        segments: &BTreeSet<SegmentId>,
    ) -> Result<BTreeMap<SegmentId, Vec<ZoneNumber>>, SourceError> {
        Ok(select(&self.segment_zones, segments))
    }

    async fn restrictions(
        &self,
        zones: &BTreeSet<ZoneNumber>,
    ) -> Result<BTreeMap<ZoneNumber, Vec<Restriction>>, SourceError> {
        Ok(select(&self.restrictions, zones))
    }
}

#[async_trait]
impl LiveStatusSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn live_statuses(&self, query: &LiveQuery) -> Result<Vec<LiveStatus>, SourceError> {
        Ok(self.live_at(query, self.snapshot_at.unwrap_or_else(Utc::now)))
    }
}
