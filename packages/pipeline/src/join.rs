//! Bulk join resolver.
//!
//! Enriches candidates with descriptions, zones, and restrictions using one
//! batched lookup per attribute kind, however many candidates there are.
//! Descriptions and segment zones do not depend on each other and are
//! fetched concurrently; restrictions need the resolved zones and follow.
//!
//! Join failures are not fatal: the affected attribute keeps its default
//! and a warning is logged.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_finder_parking_models::{Candidate, NO_DESCRIPTION, ZoneNumber};
use parking_finder_source::{AttributeSource, SourceError};
use strum_macros::{AsRefStr, Display};

use crate::bounded;

/// The attribute kinds the resolver looks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum AttributeKind {
    /// Bay id → description.
    Description,
    /// Segment id → zone numbers.
    SegmentZones,
    /// Zone number → restriction records.
    Restrictions,
}

/// Batched attribute enrichment over an [`AttributeSource`].
#[derive(Clone)]
pub struct BulkJoinResolver {
    source: Arc<dyn AttributeSource>,
    timeout: Duration,
}

impl BulkJoinResolver {
    /// Wraps `source`; each lookup is abandoned after `timeout`.
    #[must_use]
    pub fn new(source: Arc<dyn AttributeSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// Fills in missing attributes, keeping candidate order.
    ///
    /// Only attributes that are still at their defaults are looked up, so
    /// candidates from a pre-joined store pass through without any calls.
    /// A segment linked to several zones resolves to the smallest one.
    pub async fn enrich(&self, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        let bay_ids: BTreeSet<_> = candidates
            .iter()
            .filter(|c| c.description == NO_DESCRIPTION)
            .filter_map(|c| c.bay_id.clone())
            .collect();
        let segments: BTreeSet<_> = candidates
            .iter()
            .filter(|c| c.zone_number.is_none())
            .filter_map(|c| c.segment_id)
            .collect();

        let (descriptions, segment_zones) = tokio::join!(
            self.lookup(AttributeKind::Description, &bay_ids, || {
                self.source.descriptions(&bay_ids)
            }),
            self.lookup(AttributeKind::SegmentZones, &segments, || {
                self.source.segment_zones(&segments)
            }),
        );

        for candidate in &mut candidates {
            if let Some(description) = candidate
                .bay_id
                .as_ref()
                .and_then(|id| descriptions.get(id))
            {
                candidate.description.clone_from(description);
            }
            if candidate.zone_number.is_none() {
                candidate.zone_number = candidate
                    .segment_id
                    .and_then(|segment| segment_zones.get(&segment))
                    .and_then(|zones| smallest_zone(zones));
            }
        }

        let zones: BTreeSet<ZoneNumber> = candidates
            .iter()
            .filter(|c| c.restrictions.is_empty())
            .filter_map(|c| c.zone_number)
            .collect();
        let restrictions = self
            .lookup(AttributeKind::Restrictions, &zones, || {
                self.source.restrictions(&zones)
            })
            .await;

        for candidate in &mut candidates {
            if candidate.restrictions.is_empty()
                && let Some(found) = candidate.zone_number.and_then(|z| restrictions.get(&z))
            {
                candidate.restrictions.clone_from(found);
            }
        }

        candidates
    }

    /// Runs one batched lookup. Empty key sets issue no call; failures
    /// degrade to an empty map; keys that were not requested are dropped.
    async fn lookup<K, V, F, Fut>(
        &self,
        kind: AttributeKind,
        keys: &BTreeSet<K>,
        call: F,
    ) -> BTreeMap<K, V>
    where
        K: Ord,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BTreeMap<K, V>, SourceError>>,
    {
        if keys.is_empty() {
            return BTreeMap::new();
        }

        let name = self.source.name();
        match bounded(name, self.timeout, log::Level::Debug, call()).await {
            Ok(mut found) => {
                let before = found.len();
                found.retain(|key, _| keys.contains(key));
                if found.len() < before {
                    log::warn!(
                        "{name}: discarded {} unrequested {kind} entries",
                        before - found.len()
                    );
                }
                log::debug!(
                    "{name}: resolved {} of {} {kind} keys",
                    found.len(),
                    keys.len()
                );
                found
            }
            Err(e) => {
                log::warn!(
                    "{name}: {kind} lookup for {} keys failed, using defaults: {e}",
                    keys.len()
                );
                BTreeMap::new()
            }
        }
    }
}

/// The zone a multi-zone segment resolves to.
fn smallest_zone(zones: &[ZoneNumber]) -> Option<ZoneNumber> {
    zones.iter().copied().min()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_finder_parking_models::{BayId, Point, Restriction, SegmentId};
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct Counting {
        description_calls: AtomicUsize,
        segment_calls: AtomicUsize,
        restriction_calls: AtomicUsize,
        fail_restrictions: bool,
    }

    #[async_trait]
    impl AttributeSource for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn descriptions(
            &self,
            bays: &BTreeSet<BayId>,
        ) -> Result<BTreeMap<BayId, String>, SourceError> {
            self.description_calls.fetch_add(1, Ordering::SeqCst);
            let mut map: BTreeMap<BayId, String> = bays
                .iter()
                .filter(|id| id.as_str() != "unknown")
                .map(|id| (id.clone(), format!("Bay {id}")))
                .collect();
            // Sources occasionally return rows nobody asked for.
            map.insert(BayId::new("stray").unwrap(), "Stray".to_string());
            Ok(map)
        }

        async fn segment_zones(
            &self,
            segments: &BTreeSet<SegmentId>,
        ) -> Result<BTreeMap<SegmentId, Vec<ZoneNumber>>, SourceError> {
            self.segment_calls.fetch_add(1, Ordering::SeqCst);
            Ok(segments
                .iter()
                .filter(|s| **s != 0)
                .map(|s| (*s, vec![7551, 7550]))
                .collect())
        }

        async fn restrictions(
            &self,
            zones: &BTreeSet<ZoneNumber>,
        ) -> Result<BTreeMap<ZoneNumber, Vec<Restriction>>, SourceError> {
            self.restriction_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_restrictions {
                return Err(SourceError::Upstream {
                    message: "HTTP 503".to_string(),
                });
            }
            Ok(zones
                .iter()
                .map(|z| {
                    let plate = Restriction::from_json(json!({"zone": z, "display": "2P"}));
                    (*z, plate.into_iter().collect())
                })
                .collect())
        }
    }

    fn bare(id: &str, segment: SegmentId) -> Candidate {
        Candidate {
            bay_id: BayId::new(id),
            segment_id: Some(segment),
            ..Candidate::at(Point::new(-37.81, 144.96).unwrap())
        }
    }

    fn resolver(source: &Arc<Counting>) -> BulkJoinResolver {
        BulkJoinResolver::new(source.clone(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn one_call_per_kind_and_order_kept() {
        let source = Arc::new(Counting::default());
        let candidates = vec![
            bare("b", 20186),
            bare("a", 20186),
            bare("b", 20187),
            bare("unknown", 0),
        ];

        let enriched = resolver(&source).enrich(candidates).await;

        assert_eq!(source.description_calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.segment_calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.restriction_calls.load(Ordering::SeqCst), 1);

        let ids: Vec<&str> = enriched
            .iter()
            .map(|c| c.bay_id.as_ref().unwrap().as_str())
            .collect();
        assert_eq!(ids, ["b", "a", "b", "unknown"]);
        assert_eq!(enriched[0].description, "Bay b");
        assert_eq!(enriched[0].zone_number, Some(7550));
        assert_eq!(enriched[0].restrictions.len(), 1);
    }

    #[tokio::test]
    async fn unmatched_candidates_keep_defaults() {
        let source = Arc::new(Counting::default());
        let enriched = resolver(&source).enrich(vec![bare("unknown", 0)]).await;

        assert_eq!(enriched[0].description, NO_DESCRIPTION);
        assert!(enriched[0].zone_number.is_none());
        assert!(enriched[0].restrictions.is_empty());
        // No zone resolved, so no restriction lookup.
        assert_eq!(source.restriction_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_input_issues_no_calls() {
        let source = Arc::new(Counting::default());
        assert!(resolver(&source).enrich(Vec::new()).await.is_empty());
        assert_eq!(source.description_calls.load(Ordering::SeqCst), 0);
        assert_eq!(source.segment_calls.load(Ordering::SeqCst), 0);
        assert_eq!(source.restriction_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn prejoined_candidates_skip_lookups() {
        let source = Arc::new(Counting::default());
        let prejoined = Candidate {
            description: "Already known".to_string(),
            zone_number: Some(1),
            restrictions: Restriction::from_json(json!({"display": "1P"}))
                .into_iter()
                .collect(),
            ..bare("a", 20186)
        };

        let enriched = resolver(&source).enrich(vec![prejoined.clone()]).await;
        assert_eq!(enriched, vec![prejoined]);
        assert_eq!(source.description_calls.load(Ordering::SeqCst), 0);
        assert_eq!(source.segment_calls.load(Ordering::SeqCst), 0);
        assert_eq!(source.restriction_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_lookup_degrades_to_defaults() {
        let source = Arc::new(Counting {
            fail_restrictions: true,
            ..Counting::default()
        });
        let enriched = resolver(&source).enrich(vec![bare("a", 20186)]).await;

        assert_eq!(enriched[0].description, "Bay a");
        assert_eq!(enriched[0].zone_number, Some(7550));
        assert!(enriched[0].restrictions.is_empty());
    }

    #[test]
    fn multi_zone_segment_picks_smallest() {
        assert_eq!(smallest_zone(&[7551, 7549, 7550]), Some(7549));
        assert_eq!(smallest_zone(&[]), None);
    }
}
