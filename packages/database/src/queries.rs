//! Parking bay queries.
//!
//! The nearest search uses `ST_DWithin`/`ST_Distance` over `geography` so
//! radius and ordering are geodesic. Attribute lookups bind every
//! identifier into a single `IN ($1, ..., $n)` query.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use moosicbox_json_utils::database::ToValue as _;
use parking_finder_parking_models::{
    BayId, Candidate, NO_DESCRIPTION, Point, Restriction, SegmentId, ZoneNumber,
};
use parking_finder_source::{AttributeSource, CandidateSource, NearbyQuery, SourceError};
use switchy_database::{Database, DatabaseValue};

use crate::DbError;

/// `PostGIS`-backed candidate and attribute source.
pub struct PostgisSource {
    db: Box<dyn Database>,
}

impl PostgisSource {
    /// Wraps an open connection.
    #[must_use]
    pub fn new(db: Box<dyn Database>) -> Self {
        Self { db }
    }

    /// Returns up to `limit` bays within `radius_m` meters of `center`,
    /// nearest first. Ties are broken by row id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub async fn query_nearest(
        &self,
        center: Point,
        limit: usize,
        radius_m: f64,
    ) -> Result<Vec<Candidate>, DbError> {
        let rows = self
            .db
            .query_raw_params(
                "SELECT kerbside_id, segment_id, zone_number, description,
                        ST_Y(location::geometry) AS latitude,
                        ST_X(location::geometry) AS longitude
                 FROM parking_bays
                 WHERE ST_DWithin(location, ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography, $3)
                 ORDER BY ST_Distance(location, ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography), id
                 LIMIT $4",
                &[
                    DatabaseValue::Real64(center.longitude()),
                    DatabaseValue::Real64(center.latitude()),
                    DatabaseValue::Real64(radius_m),
                    DatabaseValue::Int64(i64::try_from(limit).unwrap_or(i64::MAX)),
                ],
            )
            .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let latitude: f64 = row.to_value("latitude").map_err(|e| DbError::Conversion {
                message: format!("Failed to parse latitude: {e}"),
            })?;
            let longitude: f64 = row.to_value("longitude").map_err(|e| DbError::Conversion {
                message: format!("Failed to parse longitude: {e}"),
            })?;
            let kerbside_id: Option<String> = row.to_value("kerbside_id").unwrap_or(None);
            let zone_number: Option<i32> = row.to_value("zone_number").unwrap_or(None);
            let description: Option<String> = row.to_value("description").unwrap_or(None);

            candidates.push(Candidate {
                bay_id: kerbside_id.and_then(BayId::new),
                segment_id: row.to_value("segment_id").unwrap_or(None),
                location: Point::new(latitude, longitude).ok(),
                zone_number: zone_number.and_then(|z| ZoneNumber::try_from(z).ok()),
                description: description.unwrap_or_else(|| NO_DESCRIPTION.to_string()),
                restrictions: Vec::new(),
            });
        }

        log::debug!("PostGIS returned {} bays", candidates.len());
        Ok(candidates)
    }

    /// Bay id → description for the given bays.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub async fn query_descriptions(
        &self,
        bays: &BTreeSet<BayId>,
    ) -> Result<BTreeMap<BayId, String>, DbError> {
        if bays.is_empty() {
            return Ok(BTreeMap::new());
        }
        let sql = format!(
            "SELECT kerbside_id, description FROM parking_bays
             WHERE description IS NOT NULL AND kerbside_id IN ({})",
            placeholders(1, bays.len())
        );
        let params: Vec<DatabaseValue> = bays
            .iter()
            .map(|id| DatabaseValue::String(id.as_str().to_string()))
            .collect();
        let rows = self.db.query_raw_params(&sql, &params).await?;

        let mut map = BTreeMap::new();
        for row in &rows {
            let id: String = row.to_value("kerbside_id").unwrap_or_default();
            let description: String = row.to_value("description").unwrap_or_default();
            if let Some(id) = BayId::new(id) {
                map.entry(id).or_insert(description);
            }
        }
        Ok(map)
    }

    /// Segment → ascending zone list for the given segments.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails.
    pub async fn query_segment_zones(
        &self,
        segments: &BTreeSet<SegmentId>,
    ) -> Result<BTreeMap<SegmentId, Vec<ZoneNumber>>, DbError> {
        if segments.is_empty() {
            return Ok(BTreeMap::new());
        }
        let sql = format!(
            "SELECT segment_id, zone_number FROM segment_zones
             WHERE segment_id IN ({})
             ORDER BY segment_id, zone_number",
            placeholders(1, segments.len())
        );
        let params: Vec<DatabaseValue> = segments.iter().map(|s| DatabaseValue::Int64(*s)).collect();
        let rows = self.db.query_raw_params(&sql, &params).await?;

        let mut map: BTreeMap<SegmentId, Vec<ZoneNumber>> = BTreeMap::new();
        for row in &rows {
            let segment: i64 = row.to_value("segment_id").map_err(|e| DbError::Conversion {
                message: format!("Failed to parse segment_id: {e}"),
            })?;
            let zone: i32 = row.to_value("zone_number").map_err(|e| DbError::Conversion {
                message: format!("Failed to parse zone_number: {e}"),
            })?;
            if let Ok(zone) = ZoneNumber::try_from(zone) {
                map.entry(segment).or_default().push(zone);
            }
        }
        Ok(map)
    }

    /// Zone → restriction records for the given zones, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`DbError`] if the query fails or a stored record is not a
    /// JSON object.
    pub async fn query_restrictions(
        &self,
        zones: &BTreeSet<ZoneNumber>,
    ) -> Result<BTreeMap<ZoneNumber, Vec<Restriction>>, DbError> {
        if zones.is_empty() {
            return Ok(BTreeMap::new());
        }
        let sql = format!(
            "SELECT zone_number, restriction FROM zone_restrictions
             WHERE zone_number IN ({})
             ORDER BY zone_number, id",
            placeholders(1, zones.len())
        );
        let params: Vec<DatabaseValue> = zones
            .iter()
            .map(|z| DatabaseValue::Int64(i64::from(*z)))
            .collect();
        let rows = self.db.query_raw_params(&sql, &params).await?;

        let mut map: BTreeMap<ZoneNumber, Vec<Restriction>> = BTreeMap::new();
        for row in &rows {
            let zone: i32 = row.to_value("zone_number").map_err(|e| DbError::Conversion {
                message: format!("Failed to parse zone_number: {e}"),
            })?;
            let text: String = row.to_value("restriction").unwrap_or_default();
            let restriction = parse_restriction(&text)?;
            if let Ok(zone) = ZoneNumber::try_from(zone) {
                map.entry(zone).or_default().push(restriction);
            }
        }
        Ok(map)
    }
}

/// `$start, $start+1, ...` for `count` parameters.
#[must_use]
pub fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn parse_restriction(text: &str) -> Result<Restriction, DbError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| DbError::Conversion {
        message: format!("Invalid restriction JSON: {e}"),
    })?;
    Restriction::from_json(value).ok_or_else(|| DbError::Conversion {
        message: "Restriction is not a JSON object".to_string(),
    })
}

#[async_trait]
impl CandidateSource for PostgisSource {
    fn name(&self) -> &str {
        "postgis"
    }

    async fn nearest_candidates(&self, query: &NearbyQuery) -> Result<Vec<Candidate>, SourceError> {
        Ok(self
            .query_nearest(query.center, query.limit, query.radius_m)
            .await?)
    }
}

#[async_trait]
impl AttributeSource for PostgisSource {
    fn name(&self) -> &str {
        "postgis"
    }

    async fn descriptions(
        &self,
        bays: &BTreeSet<BayId>,
    ) -> Result<BTreeMap<BayId, String>, SourceError> {
        Ok(self.query_descriptions(bays).await?)
    }

    async fn segment_zones(
        &self,
        segments: &BTreeSet<SegmentId>,
    ) -> Result<BTreeMap<SegmentId, Vec<ZoneNumber>>, SourceError> {
        Ok(self.query_segment_zones(segments).await?)
    }

    async fn restrictions(
        &self,
        zones: &BTreeSet<ZoneNumber>,
    ) -> Result<BTreeMap<ZoneNumber, Vec<Restriction>>, SourceError> {
        Ok(self.query_restrictions(zones).await?)
    }
}
