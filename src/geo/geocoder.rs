//! Coordinate -> postal code resolution with a process-wide cache
//!
//! Outcomes are classified, not errors: a coordinate outside every
//! supported bbox is `Foreign`, inside a bbox but in no polygon is
//! `Unmatched`. Both feed coverage statistics downstream.

use super::countries::{CountrySpec, SUPPORTED_COUNTRIES};
use super::store::GeoPolygonStore;
use crate::types::GeoInfo;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GeocodeOutcome {
    Matched(GeoInfo),
    /// Outside every supported country's bbox
    Foreign,
    /// Inside at least one bbox but contained by no polygon
    Unmatched,
}

/// Coordinates rounded to 4 decimals (~11 m) for cache keying.
type CacheKey = (i64, i64);

fn cache_key(lat: f64, lng: f64) -> CacheKey {
    ((lat * 10_000.0).round() as i64, (lng * 10_000.0).round() as i64)
}

/// Bounded coordinate cache with bulk eviction: once the ceiling is hit,
/// the oldest 20% of entries go in one pass.
struct CoordCache {
    entries: HashMap<CacheKey, GeocodeOutcome>,
    order: VecDeque<CacheKey>,
    ceiling: usize,
}

impl CoordCache {
    fn new(ceiling: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            ceiling: ceiling.max(1),
        }
    }

    fn get(&self, key: &CacheKey) -> Option<GeocodeOutcome> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: CacheKey, outcome: GeocodeOutcome) {
        if self.entries.insert(key, outcome).is_none() {
            self.order.push_back(key);
        }
        if self.entries.len() > self.ceiling {
            let evict = self.ceiling / 5;
            for _ in 0..evict {
                if let Some(old) = self.order.pop_front() {
                    self.entries.remove(&old);
                }
            }
            log::debug!(
                "geocode cache: evicted {} oldest entries, {} remain",
                evict,
                self.entries.len()
            );
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub const DEFAULT_CACHE_CEILING: usize = 50_000;

pub struct ReverseGeocoder {
    store: Arc<GeoPolygonStore>,
    cache: Mutex<CoordCache>,
}

impl ReverseGeocoder {
    pub fn new(store: Arc<GeoPolygonStore>) -> Self {
        Self::with_cache_ceiling(store, DEFAULT_CACHE_CEILING)
    }

    pub fn with_cache_ceiling(store: Arc<GeoPolygonStore>, ceiling: usize) -> Self {
        Self {
            store,
            cache: Mutex::new(CoordCache::new(ceiling)),
        }
    }

    /// Countries whose bbox contains the point, most specific (smallest
    /// bbox area) first. Matters where rectangles overlap, e.g. island
    /// territories inside a neighbor's rectangle.
    pub fn bbox_candidates(lat: f64, lng: f64) -> Vec<&'static CountrySpec> {
        let mut candidates: Vec<&CountrySpec> = SUPPORTED_COUNTRIES
            .iter()
            .filter(|c| c.bbox.contains(lat, lng))
            .collect();
        candidates.sort_by(|a, b| a.bbox.area().total_cmp(&b.bbox.area()));
        candidates
    }

    /// Resolve one coordinate. Never fails: a country whose polygon set
    /// cannot be loaded is logged and skipped, and the point falls through
    /// to the next candidate or to `Unmatched`.
    pub async fn resolve(&self, lat: f64, lng: f64) -> GeocodeOutcome {
        let key = cache_key(lat, lng);
        if let Some(hit) = self.cache.lock().unwrap().get(&key) {
            return hit;
        }

        let candidates = Self::bbox_candidates(lat, lng);
        let outcome = if candidates.is_empty() {
            GeocodeOutcome::Foreign
        } else {
            let mut found = GeocodeOutcome::Unmatched;
            for spec in candidates {
                match self.store.load(spec.code).await {
                    Ok(polygons) => {
                        if let Some(info) = polygons.locate(lat, lng) {
                            found = GeocodeOutcome::Matched(info.clone());
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!("skipping {} while geocoding: {}", spec.code, e);
                    }
                }
            }
            found
        };

        self.cache.lock().unwrap().insert(key, outcome.clone());
        outcome
    }

    pub fn cache_len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }
}
