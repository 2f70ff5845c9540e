//! Live status merger.

use std::collections::BTreeMap;

use parking_finder_parking_models::{
    BayId, Candidate, LiveCandidate, LiveStatus, OccupancyState, Point,
};
use parking_finder_spatial::haversine_meters;

/// The most recently updated reading per bay id.
fn latest(statuses: Vec<LiveStatus>) -> BTreeMap<BayId, LiveStatus> {
    let mut latest: BTreeMap<BayId, LiveStatus> = BTreeMap::new();
    for status in statuses {
        match latest.get(&status.bay_id) {
            Some(existing) if existing.last_updated >= status.last_updated => {}
            _ => {
                latest.insert(status.bay_id.clone(), status);
            }
        }
    }
    latest
}

/// Overlays live sensor readings onto candidates by bay id.
///
/// Candidates keep their order. A candidate without a matching reading
/// carries no occupancy (status unknown). When several readings share a bay
/// id the most recently updated one wins. A reading's zone number fills in
/// a candidate's missing zone.
#[must_use]
pub fn merge(candidates: Vec<Candidate>, statuses: Vec<LiveStatus>) -> Vec<LiveCandidate> {
    let latest = latest(statuses);

    let mut matched = 0_usize;
    let merged: Vec<LiveCandidate> = candidates
        .into_iter()
        .map(|mut candidate| {
            let Some(status) = candidate.bay_id.as_ref().and_then(|id| latest.get(id)) else {
                return LiveCandidate {
                    candidate,
                    occupancy: None,
                    last_updated: None,
                };
            };
            matched += 1;
            if candidate.zone_number.is_none() {
                candidate.zone_number = status.zone_number;
            }
            LiveCandidate {
                occupancy: Some(status.state),
                last_updated: Some(status.last_updated),
                candidate,
            }
        })
        .collect();

    log::debug!(
        "Matched {matched} of {} candidates against {} live readings",
        merged.len(),
        latest.len()
    );
    merged
}

/// The `limit` bays nearest `center` whose newest reading is `Unoccupied`.
///
/// Bays among `candidates` keep their stored attributes. Other bays are
/// built from the reading's location and zone; readings with neither a
/// stored candidate nor a location are skipped. Ties in distance are broken
/// by bay id.
#[must_use]
pub fn nearest_available(
    candidates: Vec<Candidate>,
    statuses: Vec<LiveStatus>,
    center: Point,
    limit: usize,
) -> Vec<LiveCandidate> {
    let mut known: BTreeMap<BayId, Candidate> = BTreeMap::new();
    for candidate in candidates {
        if let Some(id) = candidate.bay_id.clone() {
            known.entry(id).or_insert(candidate);
        }
    }

    let mut skipped = 0_usize;
    let mut ranked: Vec<(f64, LiveCandidate)> = latest(statuses)
        .into_iter()
        .filter(|(_, status)| status.state == OccupancyState::Unoccupied)
        .filter_map(|(id, status)| {
            let Some(location) = known
                .get(&id)
                .and_then(|candidate| candidate.location)
                .or(status.location)
            else {
                skipped += 1;
                return None;
            };
            let mut candidate = known.remove(&id).unwrap_or_else(|| Candidate {
                bay_id: Some(id),
                ..Candidate::at(location)
            });
            candidate.location = Some(location);
            if candidate.zone_number.is_none() {
                candidate.zone_number = status.zone_number;
            }
            Some((
                haversine_meters(center, location),
                LiveCandidate {
                    candidate,
                    occupancy: Some(status.state),
                    last_updated: Some(status.last_updated),
                },
            ))
        })
        .collect();

    ranked.sort_by(|(a, x), (b, y)| {
        a.total_cmp(b)
            .then_with(|| x.candidate.bay_id.cmp(&y.candidate.bay_id))
    });
    ranked.truncate(limit);

    log::debug!(
        "Selected {} available bays ({skipped} readings without a location)",
        ranked.len()
    );
    ranked.into_iter().map(|(_, row)| row).collect()
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use super::*;

    fn candidate(id: Option<&str>) -> Candidate {
        Candidate {
            bay_id: id.and_then(BayId::new),
            ..Candidate::at(Point::new(-37.81, 144.96).unwrap())
        }
    }

    fn status(id: &str, token: &str, at: DateTime<Utc>) -> LiveStatus {
        LiveStatus {
            bay_id: BayId::new(id).unwrap(),
            state: OccupancyState::from_token(token),
            status_description: token.to_string(),
            last_updated: at,
            zone_number: Some(7550),
            location: None,
        }
    }

    #[test]
    fn overlays_matches_and_keeps_order() {
        let now = Utc::now();
        let merged = merge(
            vec![candidate(Some("2")), candidate(None), candidate(Some("1"))],
            vec![status("1", "Unoccupied", now), status("9", "Present", now)],
        );

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].candidate.bay_id, BayId::new("2"));
        assert!(merged[0].occupancy.is_none());
        assert!(merged[1].occupancy.is_none());
        assert_eq!(merged[2].occupancy, Some(OccupancyState::Unoccupied));
        assert_eq!(merged[2].last_updated, Some(now));
        assert_eq!(merged[2].candidate.zone_number, Some(7550));
        assert!(merged[0].candidate.zone_number.is_none());
    }

    #[test]
    fn newest_reading_wins() {
        let now = Utc::now();
        let merged = merge(
            vec![candidate(Some("1"))],
            vec![
                status("1", "Present", now - Duration::seconds(30)),
                status("1", "Unoccupied", now),
                status("1", "Present", now - Duration::seconds(5)),
            ],
        );
        assert_eq!(merged[0].occupancy, Some(OccupancyState::Unoccupied));
        assert_eq!(merged[0].last_updated, Some(now));
    }

    fn status_at(id: &str, token: &str, location: Point) -> LiveStatus {
        LiveStatus {
            location: Some(location),
            ..status(id, token, Utc::now())
        }
    }

    #[test]
    fn available_bays_come_from_readings_beyond_stored_candidates() {
        let center = Point::new(-37.81, 144.96).unwrap();
        let near = |meters: f64| Point::new(-37.81 + meters / 111_000.0, 144.96).unwrap();

        let mut stored = candidate(Some("1"));
        stored.description = "Stored bay".to_string();
        let merged = nearest_available(
            vec![stored, candidate(Some("2"))],
            vec![
                status_at("1", "Unoccupied", near(0.0)),
                status_at("2", "Present", near(10.0)),
                status_at("7", "Unoccupied", near(300.0)),
                status_at("5", "Unoccupied", near(100.0)),
                status("6", "Unoccupied", Utc::now()),
            ],
            center,
            2,
        );

        let ids: Vec<_> = merged
            .iter()
            .map(|row| row.candidate.bay_id.clone())
            .collect();
        assert_eq!(ids, vec![BayId::new("1"), BayId::new("5")]);
        assert_eq!(merged[0].candidate.description, "Stored bay");
        assert_eq!(merged[1].candidate.zone_number, Some(7550));
        assert_eq!(merged[1].candidate.location, Some(near(100.0)));
        assert!(
            merged
                .iter()
                .all(|row| row.occupancy == Some(OccupancyState::Unoccupied))
        );
    }

    #[test]
    fn available_uses_newest_reading() {
        let now = Utc::now();
        let at = Point::new(-37.81, 144.96).unwrap();
        let merged = nearest_available(
            vec![candidate(Some("1"))],
            vec![
                status("1", "Unoccupied", now - Duration::seconds(30)),
                status("1", "Present", now),
            ],
            at,
            20,
        );
        assert!(merged.is_empty());
    }

    #[test]
    fn existing_zone_is_kept() {
        let mut with_zone = candidate(Some("1"));
        with_zone.zone_number = Some(1);
        let merged = merge(vec![with_zone], vec![status("1", "Present", Utc::now())]);
        assert_eq!(merged[0].candidate.zone_number, Some(1));
        assert_eq!(merged[0].occupancy, Some(OccupancyState::Occupied));
    }
}
