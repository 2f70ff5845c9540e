//! City of Melbourne open data client (Opendatasoft Explore API v2.1).
//!
//! Nearest-bay and live sensor queries go through the paginated
//! `records` endpoint with an ODSQL `where`/`order_by` filter. Batched
//! attribute lookups go through the `exports/json` endpoint, which has no
//! page-size cap, so one `IN (...)` filter covers any number of ids in a
//! single request.
//!
//! Datasets:
//!
//! * `on-street-parking-bays` — bay locations, segment ids, descriptions
//! * `on-street-parking-bay-sensors` — live occupancy
//! * `parking-zones-linked-to-street-segments` — segment → zone links
//! * `sign-plates-located-in-each-parking-zone` — zone restrictions

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_finder_parking_models::{
    BayId, Candidate, LiveStatus, NO_DESCRIPTION, OccupancyState, Point, Restriction, SegmentId,
    ZoneNumber, json_i64, json_zone,
};
use serde::Deserialize;

use crate::retry::{self, RetryPolicy};
use crate::{
    AttributeSource, CandidateSource, LiveQuery, LiveStatusSource, NearbyQuery, SourceError,
    group_sorted,
};

/// Largest page the `records` endpoint accepts.
pub const MAX_PAGE_SIZE: usize = 100;

/// Connection settings for the open data API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpenDataConfig {
    /// API root, e.g. `https://data.melbourne.vic.gov.au/api/explore/v2.1`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Live sensor dataset id.
    #[serde(default = "default_sensors_dataset")]
    pub sensors_dataset: String,
    /// Bay reference dataset id.
    #[serde(default = "default_bays_dataset")]
    pub bays_dataset: String,
    /// Segment → zone link dataset id.
    #[serde(default = "default_segment_zones_dataset")]
    pub segment_zones_dataset: String,
    /// Zone sign plate dataset id.
    #[serde(default = "default_restrictions_dataset")]
    pub restrictions_dataset: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_base_url() -> String {
    "https://data.melbourne.vic.gov.au/api/explore/v2.1".to_string()
}

fn default_sensors_dataset() -> String {
    "on-street-parking-bay-sensors".to_string()
}

fn default_bays_dataset() -> String {
    "on-street-parking-bays".to_string()
}

fn default_segment_zones_dataset() -> String {
    "parking-zones-linked-to-street-segments".to_string()
}

fn default_restrictions_dataset() -> String {
    "sign-plates-located-in-each-parking-zone".to_string()
}

const fn default_timeout_secs() -> u64 {
    10
}

const fn default_max_retries() -> u32 {
    2
}

impl Default for OpenDataConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            sensors_dataset: default_sensors_dataset(),
            bays_dataset: default_bays_dataset(),
            segment_zones_dataset: default_segment_zones_dataset(),
            restrictions_dataset: default_restrictions_dataset(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

/// Open data API client implementing every source capability.
pub struct OpenDataClient {
    client: reqwest::Client,
    config: OpenDataConfig,
    retry: RetryPolicy,
}

impl OpenDataClient {
    /// Builds a client with the configured per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Http`] if the HTTP client cannot be built.
    pub fn new(config: OpenDataConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("parking-finder/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let retry = RetryPolicy {
            max_retries: config.max_retries,
            ..RetryPolicy::default()
        };

        Ok(Self {
            client,
            config,
            retry,
        })
    }

    fn dataset_url(&self, dataset: &str, endpoint: &str) -> String {
        format!(
            "{}/catalog/datasets/{dataset}/{endpoint}",
            self.config.base_url.trim_end_matches('/')
        )
    }

    /// Fetches one page from a dataset's `records` endpoint and returns its
    /// `results` array.
    async fn fetch_records(
        &self,
        dataset: &str,
        params: &[(&str, String)],
    ) -> Result<Vec<serde_json::Value>, SourceError> {
        let url = self.dataset_url(dataset, "records");
        let body = retry::send_json(|| self.client.get(&url).query(params), &self.retry).await?;

        match body.get("results") {
            Some(serde_json::Value::Array(results)) => Ok(results.clone()),
            _ => Err(SourceError::Response {
                message: format!("no results array in {dataset} response"),
            }),
        }
    }

    /// Fetches every record of a dataset matching `where_clause` through the
    /// `exports/json` endpoint.
    async fn fetch_export(
        &self,
        dataset: &str,
        where_clause: String,
    ) -> Result<Vec<serde_json::Value>, SourceError> {
        let url = self.dataset_url(dataset, "exports/json");
        let params = [("where", where_clause)];
        let body = retry::send_json(|| self.client.get(&url).query(&params), &self.retry).await?;

        match body {
            serde_json::Value::Array(records) => {
                log::debug!("Fetched {} records from {dataset} export", records.len());
                Ok(records)
            }
            _ => Err(SourceError::Response {
                message: format!("{dataset} export is not a JSON array"),
            }),
        }
    }
}

#[async_trait]
impl CandidateSource for OpenDataClient {
    fn name(&self) -> &str {
        "open_data"
    }

    async fn nearest_candidates(&self, query: &NearbyQuery) -> Result<Vec<Candidate>, SourceError> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let params = [
            ("limit", clamp_page(query.limit).to_string()),
            ("order_by", distance_order(query.center)),
            ("where", within_distance(query.center, query.radius_m)),
        ];
        let records = self
            .fetch_records(&self.config.bays_dataset, &params)
            .await?;

        Ok(records.iter().filter_map(candidate_from_bay_record).collect())
    }
}

#[async_trait]
impl AttributeSource for OpenDataClient {
    fn name(&self) -> &str {
        "open_data"
    }

    async fn descriptions(
        &self,
        bays: &BTreeSet<BayId>,
    ) -> Result<BTreeMap<BayId, String>, SourceError> {
        let filter = in_strings("kerbsideid", bays.iter().map(BayId::as_str));
        let records = self
            .fetch_export(&self.config.bays_dataset, filter)
            .await?;
        Ok(descriptions_from_records(&records))
    }

    async fn segment_zones(
        &self,
        segments: &BTreeSet<SegmentId>,
    ) -> Result<BTreeMap<SegmentId, Vec<ZoneNumber>>, SourceError> {
        let filter = in_numbers("segment_id", segments.iter());
        let records = self
            .fetch_export(&self.config.segment_zones_dataset, filter)
            .await?;
        Ok(segment_zones_from_records(&records))
    }

    async fn restrictions(
        &self,
        zones: &BTreeSet<ZoneNumber>,
    ) -> Result<BTreeMap<ZoneNumber, Vec<Restriction>>, SourceError> {
        let filter = in_numbers("parkingzone", zones.iter());
        let records = self
            .fetch_export(&self.config.restrictions_dataset, filter)
            .await?;
        Ok(restrictions_from_records(records))
    }
}

#[async_trait]
impl LiveStatusSource for OpenDataClient {
    fn name(&self) -> &str {
        "open_data"
    }

    async fn live_statuses(&self, query: &LiveQuery) -> Result<Vec<LiveStatus>, SourceError> {
        if query.limit == 0 {
            return Ok(Vec::new());
        }
        let params = [
            ("limit", clamp_page(query.limit).to_string()),
            ("order_by", distance_order(query.center)),
            ("where", live_filter(query)),
        ];
        let records = self
            .fetch_records(&self.config.sensors_dataset, &params)
            .await?;

        Ok(records.iter().filter_map(live_status_from_record).collect())
    }
}

fn clamp_page(limit: usize) -> usize {
    if limit > MAX_PAGE_SIZE {
        log::debug!("Clamping page size {limit} to {MAX_PAGE_SIZE}");
    }
    limit.min(MAX_PAGE_SIZE)
}

// ── ODSQL builders ─────────────────────────────────────────────────

/// `geom'POINT(lon lat)'` literal for a point.
#[must_use]
pub fn geom_point(center: Point) -> String {
    format!("geom'POINT({} {})'", center.longitude(), center.latitude())
}

/// Filter keeping records whose `location` is within `radius_m` meters.
#[must_use]
pub fn within_distance(center: Point, radius_m: f64) -> String {
    format!(
        "within_distance(location, {}, {radius_m}m)",
        geom_point(center)
    )
}

/// Ordering expression sorting records by distance from `center`.
#[must_use]
pub fn distance_order(center: Point) -> String {
    format!("distance(location, {})", geom_point(center))
}

/// Filter for live sensor readings: within range, fresh, and optionally
/// unoccupied only.
#[must_use]
pub fn live_filter(query: &LiveQuery) -> String {
    let status = if query.unoccupied_only {
        "status_description=\"Unoccupied\" AND "
    } else {
        ""
    };
    format!(
        "{status}{} AND lastupdated>now(seconds=-{})",
        within_distance(query.center, query.radius_m),
        query.freshness.as_secs().max(1)
    )
}

/// `field IN ('a','b')` with single quotes escaped.
pub fn in_strings<'a>(field: &str, values: impl Iterator<Item = &'a str>) -> String {
    let list: Vec<String> = values
        .map(|v| format!("'{}'", v.replace('\\', "\\\\").replace('\'', "\\'")))
        .collect();
    format!("{field} IN ({})", list.join(","))
}

/// `field IN (1,2,3)`.
pub fn in_numbers<T: std::fmt::Display>(field: &str, values: impl Iterator<Item = T>) -> String {
    let list: Vec<String> = values.map(|v| v.to_string()).collect();
    format!("{field} IN ({})", list.join(","))
}

// ── Record parsing ─────────────────────────────────────────────────

/// Reads a record's location from the `location` object, falling back to
/// flat `latitude`/`longitude` fields.
fn record_location(record: &serde_json::Value) -> Option<Point> {
    let location = &record["location"];
    let lat = location["lat"]
        .as_f64()
        .or_else(|| record["latitude"].as_f64())?;
    let lon = location["lon"]
        .as_f64()
        .or_else(|| record["longitude"].as_f64())?;
    Point::new(lat, lon).ok()
}

/// Converts an `on-street-parking-bays` record into a candidate.
///
/// The bay dataset carries no zone number; zones are resolved through the
/// segment link dataset.
#[must_use]
pub fn candidate_from_bay_record(record: &serde_json::Value) -> Option<Candidate> {
    let location = record_location(record);
    if location.is_none() {
        log::debug!("Skipping bay record without location: {record}");
        return None;
    }

    Some(Candidate {
        bay_id: BayId::from_json(&record["kerbsideid"]),
        segment_id: json_i64(&record["roadsegmentid"]),
        location,
        zone_number: None,
        description: record["roadsegmentdescription"]
            .as_str()
            .filter(|d| !d.trim().is_empty())
            .map_or_else(|| NO_DESCRIPTION.to_string(), str::to_string),
        restrictions: Vec::new(),
    })
}

/// Converts an `on-street-parking-bay-sensors` record into a live status.
#[must_use]
pub fn live_status_from_record(record: &serde_json::Value) -> Option<LiveStatus> {
    let bay_id = BayId::from_json(&record["kerbsideid"])?;
    let status_description = record["status_description"].as_str()?.to_string();
    let last_updated = ["lastupdated", "status_timestamp"]
        .iter()
        .find_map(|field| record[*field].as_str().and_then(parse_utc))?;

    Some(LiveStatus {
        bay_id,
        state: OccupancyState::from_token(&status_description),
        status_description,
        last_updated,
        zone_number: json_zone(&record["zone_number"]),
        location: record_location(record),
    })
}

fn parse_utc(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Bay id → description from bay records. The first record per bay wins;
/// records without a description are left out so callers apply defaults.
#[must_use]
pub fn descriptions_from_records(records: &[serde_json::Value]) -> BTreeMap<BayId, String> {
    let mut map = BTreeMap::new();
    for record in records {
        let Some(bay_id) = BayId::from_json(&record["kerbsideid"]) else {
            continue;
        };
        let Some(description) = record["roadsegmentdescription"]
            .as_str()
            .filter(|d| !d.trim().is_empty())
        else {
            continue;
        };
        map.entry(bay_id).or_insert_with(|| description.to_string());
    }
    map
}

/// Segment → sorted zone list from segment link records.
#[must_use]
pub fn segment_zones_from_records(
    records: &[serde_json::Value],
) -> BTreeMap<SegmentId, Vec<ZoneNumber>> {
    group_sorted(records.iter().filter_map(|record| {
        let segment = json_i64(&record["segment_id"])?;
        let zone = json_zone(&record["parkingzone"])?;
        Some((segment, zone))
    }))
}

/// Zone → sign plate records. Record order within a zone is preserved.
#[must_use]
pub fn restrictions_from_records(
    records: Vec<serde_json::Value>,
) -> BTreeMap<ZoneNumber, Vec<Restriction>> {
    let mut map: BTreeMap<ZoneNumber, Vec<Restriction>> = BTreeMap::new();
    for record in records {
        let Some(zone) = json_zone(&record["parkingzone"]) else {
            continue;
        };
        if let Some(restriction) = Restriction::from_json(record) {
            map.entry(zone).or_default().push(restriction);
        }
    }
    map
}
