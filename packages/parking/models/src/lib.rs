#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Parking bay types shared across the parking-finder system.
//!
//! Every data source (the City of Melbourne open data API, the in-memory
//! geo index, the `PostGIS` reference store) produces [`Candidate`] records
//! in this shape. The prediction path turns candidates into
//! [`FeatureVector`]s and then into [`PredictionResult`]s; the realtime
//! path overlays [`LiveStatus`] readings to produce [`LiveCandidate`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// Description used when no source knows anything about a bay.
pub const NO_DESCRIPTION: &str = "No description";

/// Default number of candidates returned by a nearby query.
pub const DEFAULT_CANDIDATE_LIMIT: usize = 20;

/// Default search radius for a nearby query, in meters.
pub const DEFAULT_RADIUS_METERS: f64 = 1000.0;

/// Error returned when a coordinate is outside the WGS84 range.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error(
    "invalid coordinate ({latitude}, {longitude}): latitude must be within [-90, 90] \
     and longitude within [-180, 180]"
)]
pub struct InvalidCoordinateError {
    /// The latitude that was provided.
    pub latitude: f64,
    /// The longitude that was provided.
    pub longitude: f64,
}

/// A WGS84 location.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PointRepr")]
pub struct Point {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct PointRepr {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<PointRepr> for Point {
    type Error = InvalidCoordinateError;

    fn try_from(value: PointRepr) -> Result<Self, Self::Error> {
        Self::new(value.latitude, value.longitude)
    }
}

impl Point {
    /// Creates a point, validating both coordinates.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidCoordinateError`] if either coordinate is out of
    /// range or not finite.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, InvalidCoordinateError> {
        if (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude) {
            Ok(Self {
                latitude,
                longitude,
            })
        } else {
            Err(InvalidCoordinateError {
                latitude,
                longitude,
            })
        }
    }

    /// Latitude in degrees.
    #[must_use]
    pub const fn latitude(&self) -> f64 {
        self.latitude
    }

    /// Longitude in degrees.
    #[must_use]
    pub const fn longitude(&self) -> f64 {
        self.longitude
    }
}

/// Stable external identifier of a single bay (the `kerbsideid` in the
/// city's datasets).
///
/// The upstream feeds are inconsistent about whether this is a JSON string
/// or a number, so it is always normalized to its decimal text form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BayId(String);

impl BayId {
    /// Wraps an identifier, trimming surrounding whitespace.
    ///
    /// Returns `None` for blank identifiers.
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Option<Self> {
        let id = id.as_ref().trim();
        if id.is_empty() {
            None
        } else {
            Some(Self(id.to_string()))
        }
    }

    /// Extracts an identifier from a JSON string or integer.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Self::new(s),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(|v| v.to_string())
                .or_else(|| n.as_u64().map(|v| v.to_string()))
                .and_then(Self::new),
            _ => None,
        }
    }

    /// The identifier text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Road segment identifier (`roadsegmentid` / `segment_id`).
pub type SegmentId = i64;

/// Parking zone number (`Zone_Number` / `parkingzone`).
pub type ZoneNumber = u32;

/// Reads an integer that may be encoded as a JSON number, a float with no
/// fractional part, or a numeric string.
#[must_use]
pub fn json_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                .map(whole_f64_to_i64)
        }),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn whole_f64_to_i64(value: f64) -> i64 {
    value as i64
}

/// Reads a zone number from JSON, rejecting negative or oversized values.
#[must_use]
pub fn json_zone(value: &serde_json::Value) -> Option<ZoneNumber> {
    json_i64(value).and_then(|v| ZoneNumber::try_from(v).ok())
}

/// A parking rule record (sign plate) attached to a zone.
///
/// Treated as an opaque bag of attributes and passed through unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Restriction(pub serde_json::Map<String, serde_json::Value>);

impl Restriction {
    /// Wraps a JSON object. Non-object values are rejected.
    #[must_use]
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }
}

fn no_description() -> String {
    NO_DESCRIPTION.to_string()
}

/// A bay under consideration for availability or occupancy prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// External bay identifier, when the reference data has one.
    #[serde(default, rename = "kerbsideid", skip_serializing_if = "Option::is_none")]
    pub bay_id: Option<BayId>,
    /// Road segment the bay belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<SegmentId>,
    /// Bay location. Serialized as flat `latitude`/`longitude` fields.
    #[serde(flatten)]
    pub location: Option<Point>,
    /// Parking zone, if known.
    #[serde(default)]
    pub zone_number: Option<ZoneNumber>,
    /// Human-readable bay or segment description.
    #[serde(default = "no_description")]
    pub description: String,
    /// Restrictions attached to the bay's zone.
    #[serde(default)]
    pub restrictions: Vec<Restriction>,
}

impl Candidate {
    /// Creates a candidate at `location` with default enrichment fields.
    #[must_use]
    pub fn at(location: Point) -> Self {
        Self {
            bay_id: None,
            segment_id: None,
            location: Some(location),
            zone_number: None,
            description: no_description(),
            restrictions: Vec::new(),
        }
    }
}

impl Default for Candidate {
    fn default() -> Self {
        Self {
            bay_id: None,
            segment_id: None,
            location: None,
            zone_number: None,
            description: no_description(),
            restrictions: Vec::new(),
        }
    }
}

/// Occupancy state reported by an in-ground bay sensor.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
pub enum OccupancyState {
    /// The sensor reports the bay as free.
    Unoccupied,
    /// Any other sensor token (the feed uses `Present`).
    Occupied,
}

impl OccupancyState {
    /// Maps a raw `status_description` token to a state.
    ///
    /// Only `Unoccupied` (case-insensitive) means free; every other token
    /// is treated as occupied.
    #[must_use]
    pub fn from_token(token: &str) -> Self {
        if token.trim().eq_ignore_ascii_case("unoccupied") {
            Self::Unoccupied
        } else {
            Self::Occupied
        }
    }
}

/// A live sensor reading for one bay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveStatus {
    /// Bay the reading belongs to.
    pub bay_id: BayId,
    /// Normalized state.
    pub state: OccupancyState,
    /// Raw token as reported by the feed.
    pub status_description: String,
    /// When the sensor last reported.
    pub last_updated: DateTime<Utc>,
    /// Zone number reported alongside the reading.
    pub zone_number: Option<ZoneNumber>,
    /// Sensor location.
    pub location: Option<Point>,
}

/// A candidate with its live sensor status overlaid.
///
/// `occupancy` is `None` when no fresh reading matched the bay; that means
/// "unknown", not "available".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveCandidate {
    /// The enriched candidate.
    #[serde(flatten)]
    pub candidate: Candidate,
    /// Live state, if a reading matched.
    pub occupancy: Option<OccupancyState>,
    /// Timestamp of the matched reading.
    #[serde(rename = "lastupdated")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Calendar features of a civil-time instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeContext {
    /// Hour of day, 0-23.
    pub hour: u32,
    /// Day of week, 0 = Monday through 6 = Sunday.
    pub weekday: u32,
    /// Month, 1-12.
    pub month: u32,
}

/// Column names of [`FeatureVector`], in the order the classifier was
/// trained on.
pub const FEATURE_NAMES: [&str; 6] = [
    "latitude",
    "longitude",
    "hour",
    "weekday",
    "month",
    "Zone_Number",
];

/// One row of classifier input.
///
/// The column order is fixed to [`FEATURE_NAMES`]. Changing it silently
/// invalidates every prediction made by an existing model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector([f64; 6]);

impl FeatureVector {
    /// Builds a row for a candidate.
    ///
    /// Returns `None` when the candidate lacks a location or a zone number;
    /// such rows are never passed to the classifier with placeholders.
    #[must_use]
    pub fn for_candidate(candidate: &Candidate, time: &TimeContext) -> Option<Self> {
        let location = candidate.location?;
        let zone = candidate.zone_number?;
        Some(Self([
            location.latitude(),
            location.longitude(),
            f64::from(time.hour),
            f64::from(time.weekday),
            f64::from(time.month),
            f64::from(zone),
        ]))
    }

    /// Builds a row directly from raw values.
    #[must_use]
    pub const fn from_values(values: [f64; 6]) -> Self {
        Self(values)
    }

    /// The row values in [`FEATURE_NAMES`] order.
    #[must_use]
    pub const fn values(&self) -> &[f64; 6] {
        &self.0
    }
}

/// The label reported for a prediction.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
pub enum PredictedStatus {
    /// Probability of occupancy reached the threshold.
    Occupied,
    /// Probability of occupancy stayed below the threshold.
    Available,
}

/// A candidate together with its predicted occupancy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// The candidate the prediction is for.
    #[serde(flatten)]
    pub candidate: Candidate,
    /// Probability that the bay is occupied, rounded to 4 places.
    pub proba_occupied: f64,
    /// Label derived from the decision threshold.
    pub predicted_status: PredictedStatus,
    /// Probability of the reported label against the 0.5 midpoint,
    /// rounded to 4 places. Always within `[0.5, 1]`.
    pub confidence: f64,
}
