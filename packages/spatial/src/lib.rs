#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! In-memory geodesic index of parking bays.
//!
//! Loads bay points (from a `GeoJSON` `FeatureCollection` or directly from
//! candidates), builds an R-tree over their coordinates, and answers
//! "K nearest bays within R meters" queries. The R-tree only prunes by a
//! bounding box; ordering and the radius cut use great-circle distance so
//! results stay correct away from the equator.

use geo::{Destination, Distance, Haversine};
use geojson::GeoJson;
use parking_finder_parking_models::{
    BayId, Candidate, NO_DESCRIPTION, Point, Restriction, json_i64, json_zone,
};
use rstar::{AABB, RTree, RTreeObject};
use thiserror::Error;

/// Errors from loading a bay index.
#[derive(Debug, Error)]
pub enum SpatialError {
    /// The input is not valid `GeoJSON`.
    #[error("GeoJSON error: {0}")]
    GeoJson(#[from] geojson::Error),

    /// The `GeoJSON` parsed but does not have the expected shape.
    #[error("Invalid bay data: {message}")]
    InvalidData {
        /// Description of what went wrong.
        message: String,
    },
}

/// A bay stored in the R-tree.
struct BayEntry {
    position: [f64; 2],
    candidate: Candidate,
}

impl RTreeObject for BayEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

/// Great-circle distance between two points, in meters.
#[must_use]
pub fn haversine_meters(a: Point, b: Point) -> f64 {
    Haversine.distance(to_geo(a), to_geo(b))
}

fn to_geo(point: Point) -> geo::Point<f64> {
    geo::Point::new(point.longitude(), point.latitude())
}

/// Bounding box (`[lon, lat]` corners) that contains every point within
/// `radius_m` meters of `center`.
#[must_use]
pub fn search_envelope(center: Point, radius_m: f64) -> AABB<[f64; 2]> {
    let origin = to_geo(center);
    let north = Haversine.destination(origin, 0.0, radius_m);
    let east = Haversine.destination(origin, 90.0, radius_m);
    let south = Haversine.destination(origin, 180.0, radius_m);
    let west = Haversine.destination(origin, 270.0, radius_m);

    AABB::from_corners([west.x(), south.y()], [east.x(), north.y()])
}

/// Pre-joined bay index answering nearest-bay queries.
pub struct BayIndex {
    tree: RTree<BayEntry>,
}

impl BayIndex {
    /// Builds an index from candidates. Candidates without a location are
    /// skipped.
    #[must_use]
    pub fn new(candidates: Vec<Candidate>) -> Self {
        let total = candidates.len();
        let entries: Vec<BayEntry> = candidates
            .into_iter()
            .filter_map(|candidate| {
                let location = candidate.location?;
                Some(BayEntry {
                    position: [location.longitude(), location.latitude()],
                    candidate,
                })
            })
            .collect();

        if entries.len() < total {
            log::warn!(
                "Skipped {} bays without a location while building the index",
                total - entries.len()
            );
        }

        Self {
            tree: RTree::bulk_load(entries),
        }
    }

    /// Parses a `GeoJSON` `FeatureCollection` of bay points and builds an
    /// index.
    ///
    /// Recognized feature properties: `bay_id` (or `kerbsideid`),
    /// `segment_id` (or `roadsegmentid`), `zone_number`, `description`
    /// (or `roadsegmentdescription`), and `restrictions` (array of objects).
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError`] if the text is not a `FeatureCollection`.
    pub fn from_geojson(geojson_str: &str) -> Result<Self, SpatialError> {
        let geojson: GeoJson = geojson_str.parse()?;
        let GeoJson::FeatureCollection(collection) = geojson else {
            return Err(SpatialError::InvalidData {
                message: "expected a FeatureCollection".to_string(),
            });
        };

        let mut candidates = Vec::with_capacity(collection.features.len());
        for feature in &collection.features {
            match candidate_from_feature(feature) {
                Some(candidate) => candidates.push(candidate),
                None => log::debug!("Skipping bay feature without point geometry"),
            }
        }
        log::info!("Loaded {} bays into spatial index", candidates.len());

        Ok(Self::new(candidates))
    }

    /// Number of indexed bays.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.size()
    }

    /// Whether the index holds no bays.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    /// Iterates over every indexed bay in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.tree.iter().map(|entry| &entry.candidate)
    }

    /// Returns up to `limit` bays within `radius_m` meters of `center`,
    /// nearest first, paired with their distance in meters.
    ///
    /// Ties keep the R-tree's iteration order; callers that need a stable
    /// tie-break should not rely on it.
    #[must_use]
    pub fn nearest(&self, center: Point, limit: usize, radius_m: f64) -> Vec<(f64, &Candidate)> {
        if limit == 0 || !(radius_m >= 0.0) {
            return Vec::new();
        }

        let envelope = search_envelope(center, radius_m);
        let mut hits: Vec<(f64, &Candidate)> = self
            .tree
            .locate_in_envelope_intersecting(&envelope)
            .filter_map(|entry| {
                let location = entry.candidate.location?;
                let distance = haversine_meters(center, location);
                (distance <= radius_m).then_some((distance, &entry.candidate))
            })
            .collect();

        hits.sort_by(|a, b| a.0.total_cmp(&b.0));
        hits.truncate(limit);
        hits
    }
}

fn candidate_from_feature(feature: &geojson::Feature) -> Option<Candidate> {
    let geometry = feature.geometry.as_ref()?;
    let geo_geometry: geo::Geometry<f64> = geometry.clone().try_into().ok()?;
    let geo::Geometry::Point(point) = geo_geometry else {
        return None;
    };
    let location = Point::new(point.y(), point.x()).ok()?;

    let property = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| feature.property(name).filter(|v| !v.is_null()))
    };

    let description = property(&["description", "roadsegmentdescription"])
        .and_then(serde_json::Value::as_str)
        .map_or_else(|| NO_DESCRIPTION.to_string(), str::to_string);

    let restrictions = property(&["restrictions"])
        .and_then(serde_json::Value::as_array)
        .map(|items| {
            items
                .iter()
                .cloned()
                .filter_map(Restriction::from_json)
                .collect()
        })
        .unwrap_or_default();

    Some(Candidate {
        bay_id: property(&["bay_id", "kerbsideid"]).and_then(BayId::from_json),
        segment_id: property(&["segment_id", "roadsegmentid"]).and_then(json_i64),
        location: Some(location),
        zone_number: property(&["zone_number"]).and_then(json_zone),
        description,
        restrictions,
    })
}
