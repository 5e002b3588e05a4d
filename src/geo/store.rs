//! Per-country lazy-loaded boundary polygons with a disk cache
//!
//! Loading order per country: in-process cache, local cache file, download
//! then cache to disk. Loaded polygon sets stay cached for the process
//! lifetime. The check-then-load path is guarded by an async mutex so two
//! concurrent resolves never download the same country twice.

use super::countries::{self, Bbox, CountrySpec};
use crate::error::{LabError, LabResult};
use crate::types::GeoInfo;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Deserialize)]
struct FeatureCollection {
    features: Vec<Feature>,
}

#[derive(Deserialize)]
struct Feature {
    #[serde(default)]
    properties: serde_json::Value,
    geometry: Geometry,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum Geometry {
    Polygon {
        /// outer ring first, then holes; points are [lng, lat]
        coordinates: Vec<Vec<[f64; 2]>>,
    },
    MultiPolygon {
        coordinates: Vec<Vec<Vec<[f64; 2]>>>,
    },
}

/// One polygon: outer ring plus holes, points as (lng, lat).
#[derive(Debug, Clone)]
pub struct PolygonRings {
    outer: Vec<(f64, f64)>,
    holes: Vec<Vec<(f64, f64)>>,
}

fn ring_contains(ring: &[(f64, f64)], lat: f64, lng: f64) -> bool {
    // Ray casting on the (lng, lat) plane
    let mut inside = false;
    let mut j = ring.len().wrapping_sub(1);
    for i in 0..ring.len() {
        let (lng_i, lat_i) = ring[i];
        let (lng_j, lat_j) = ring[j];
        if (lat_i > lat) != (lat_j > lat)
            && lng < (lng_j - lng_i) * (lat - lat_i) / (lat_j - lat_i) + lng_i
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

impl PolygonRings {
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        if !ring_contains(&self.outer, lat, lng) {
            return false;
        }
        !self.holes.iter().any(|h| ring_contains(h, lat, lng))
    }
}

/// One postal area: normalized info, a per-area bbox for quick rejection,
/// and its polygon(s).
#[derive(Debug, Clone)]
pub struct PostalArea {
    pub info: GeoInfo,
    pub bbox: Bbox,
    polygons: Vec<PolygonRings>,
}

impl PostalArea {
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        self.bbox.contains(lat, lng) && self.polygons.iter().any(|p| p.contains(lat, lng))
    }
}

/// All postal areas of one country.
#[derive(Debug, Clone)]
pub struct CountryPolygons {
    pub code: String,
    pub areas: Vec<PostalArea>,
}

impl CountryPolygons {
    /// First postal area containing the point, if any.
    pub fn locate(&self, lat: f64, lng: f64) -> Option<&GeoInfo> {
        self.areas
            .iter()
            .find(|a| a.contains(lat, lng))
            .map(|a| &a.info)
    }
}

fn ring_points(raw: &[[f64; 2]]) -> Vec<(f64, f64)> {
    raw.iter().map(|p| (p[0], p[1])).collect()
}

fn bbox_of(polygons: &[PolygonRings]) -> Bbox {
    let mut bbox = Bbox::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN);
    for poly in polygons {
        for &(lng, lat) in &poly.outer {
            bbox.min_lat = bbox.min_lat.min(lat);
            bbox.min_lng = bbox.min_lng.min(lng);
            bbox.max_lat = bbox.max_lat.max(lat);
            bbox.max_lng = bbox.max_lng.max(lng);
        }
    }
    bbox
}

/// Parse a country's GeoJSON into postal areas. Features with no usable
/// postal code are dropped (logged once per country with a count).
pub fn parse_country_geojson(spec: &CountrySpec, raw: &str) -> LabResult<CountryPolygons> {
    let collection: FeatureCollection = serde_json::from_str(raw)
        .map_err(|e| LabError::Geo(format!("invalid GeoJSON for {}: {}", spec.code, e)))?;

    let mut dropped = 0usize;
    let mut areas = Vec::with_capacity(collection.features.len());
    for feature in collection.features {
        let Some(info) = countries::normalize_properties(spec, &feature.properties) else {
            dropped += 1;
            continue;
        };
        let polygons: Vec<PolygonRings> = match feature.geometry {
            Geometry::Polygon { coordinates } => vec![rings_from(coordinates)],
            Geometry::MultiPolygon { coordinates } => {
                coordinates.into_iter().map(rings_from).collect()
            }
        };
        let bbox = bbox_of(&polygons);
        areas.push(PostalArea {
            info,
            bbox,
            polygons,
        });
    }
    if dropped > 0 {
        log::debug!(
            "{}: dropped {} boundary features without a postal code",
            spec.code,
            dropped
        );
    }
    Ok(CountryPolygons {
        code: spec.code.to_string(),
        areas,
    })
}

fn rings_from(coordinates: Vec<Vec<[f64; 2]>>) -> PolygonRings {
    let mut iter = coordinates.into_iter();
    let outer = iter.next().map(|r| ring_points(&r)).unwrap_or_default();
    let holes = iter.map(|r| ring_points(&r)).collect();
    PolygonRings { outer, holes }
}

pub struct GeoPolygonStore {
    cache_dir: PathBuf,
    download_base: String,
    client: reqwest::Client,
    loaded: Mutex<HashMap<String, Arc<CountryPolygons>>>,
}

impl GeoPolygonStore {
    /// `download_base` is the URL prefix for boundary files; the store
    /// fetches `{download_base}/{code}.geojson` on a local cache miss.
    pub fn new(cache_dir: &Path, download_base: &str) -> LabResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
            download_base: download_base.trim_end_matches('/').to_string(),
            client,
            loaded: Mutex::new(HashMap::new()),
        })
    }

    fn cache_file(&self, code: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.geojson", code))
    }

    /// Load one country's polygon set, from (in order) the in-process
    /// cache, the disk cache, or the network. Holding the mutex across the
    /// whole load serializes concurrent misses on purpose.
    pub async fn load(&self, code: &str) -> LabResult<Arc<CountryPolygons>> {
        let spec = countries::spec_for(code)
            .ok_or_else(|| LabError::Configuration(format!("unsupported country: {}", code)))?;

        let mut loaded = self.loaded.lock().await;
        if let Some(polygons) = loaded.get(code) {
            return Ok(Arc::clone(polygons));
        }

        let raw = self.read_or_download(spec).await?;
        let polygons = Arc::new(parse_country_geojson(spec, &raw)?);
        log::info!(
            "loaded {} postal areas for {}",
            polygons.areas.len(),
            spec.code
        );
        loaded.insert(code.to_string(), Arc::clone(&polygons));
        Ok(polygons)
    }

    async fn read_or_download(&self, spec: &CountrySpec) -> LabResult<String> {
        let path = self.cache_file(spec.code);
        if path.exists() {
            log::debug!("{}: boundary file cache hit at {}", spec.code, path.display());
            return Ok(tokio::fs::read_to_string(&path).await?);
        }

        let url = format!("{}/{}.geojson", self.download_base, spec.code);
        log::info!("{}: downloading boundaries from {}", spec.code, url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(LabError::Geo(format!(
                "boundary download for {} returned {}",
                spec.code,
                resp.status()
            )));
        }
        let raw = resp.text().await?;

        tokio::fs::create_dir_all(&self.cache_dir).await?;
        if let Err(e) = tokio::fs::write(&path, &raw).await {
            // Disk cache is an optimization; the download already succeeded
            log::warn!("{}: could not cache boundary file: {}", spec.code, e);
        }
        Ok(raw)
    }

    /// Number of countries currently held in memory.
    pub async fn loaded_count(&self) -> usize {
        self.loaded.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn square(code: &str, postal: &str, min: (f64, f64), max: (f64, f64)) -> String {
        // A closed square ring in GeoJSON [lng, lat] order
        json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {"COD_POSTAL": postal, "NOMBRE": code},
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[
                        [min.1, min.0], [max.1, min.0], [max.1, max.0],
                        [min.1, max.0], [min.1, min.0]
                    ]]
                }
            }]
        })
        .to_string()
    }

    #[test]
    fn test_parse_and_locate_inside_square() {
        let spec = countries::spec_for("ES").unwrap();
        let raw = square("ES", "28001", (40.0, -4.0), (41.0, -3.0));
        let country = parse_country_geojson(spec, &raw).unwrap();
        assert_eq!(country.areas.len(), 1);
        let info = country.locate(40.5, -3.5).unwrap();
        assert_eq!(info.postal_code, "28001");
        assert!(country.locate(42.0, -3.5).is_none(), "outside the square");
    }

    #[test]
    fn test_polygon_hole_excluded() {
        let outer: Vec<[f64; 2]> = vec![
            [-4.0, 40.0],
            [-3.0, 40.0],
            [-3.0, 41.0],
            [-4.0, 41.0],
            [-4.0, 40.0],
        ];
        let hole: Vec<[f64; 2]> = vec![
            [-3.7, 40.4],
            [-3.5, 40.4],
            [-3.5, 40.6],
            [-3.7, 40.6],
            [-3.7, 40.4],
        ];
        let rings = rings_from(vec![outer, hole]);
        assert!(rings.contains(40.2, -3.9), "inside outer, outside hole");
        assert!(!rings.contains(40.5, -3.6), "inside the hole");
    }

    #[test]
    fn test_multipolygon_any_part_matches() {
        let spec = countries::spec_for("ES").unwrap();
        let raw = json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {"COD_POSTAL": "07001"},
                "geometry": {
                    "type": "MultiPolygon",
                    "coordinates": [
                        [[[2.6, 39.5], [2.7, 39.5], [2.7, 39.6], [2.6, 39.6], [2.6, 39.5]]],
                        [[[3.0, 39.7], [3.1, 39.7], [3.1, 39.8], [3.0, 39.8], [3.0, 39.7]]]
                    ]
                }
            }]
        })
        .to_string();
        let country = parse_country_geojson(spec, &raw).unwrap();
        assert!(country.locate(39.55, 2.65).is_some());
        assert!(country.locate(39.75, 3.05).is_some());
        assert!(country.locate(39.65, 2.85).is_none(), "between the parts");
    }

    #[test]
    fn test_features_without_postal_code_dropped() {
        let spec = countries::spec_for("ES").unwrap();
        let raw = json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "properties": {"NOMBRE": "sin_codigo"},
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]
                }
            }]
        })
        .to_string();
        let country = parse_country_geojson(spec, &raw).unwrap();
        assert!(country.areas.is_empty());
    }

    #[test]
    fn test_invalid_geojson_is_geo_error() {
        let spec = countries::spec_for("ES").unwrap();
        let err = parse_country_geojson(spec, "not json").unwrap_err();
        assert!(err.to_string().contains("invalid GeoJSON for ES"));
    }

    #[tokio::test]
    async fn test_store_reads_disk_cache_and_memoizes() {
        let dir = tempfile::tempdir().unwrap();
        let raw = square("ES", "28001", (40.0, -4.0), (41.0, -3.0));
        std::fs::write(dir.path().join("ES.geojson"), raw).unwrap();

        let store = GeoPolygonStore::new(dir.path(), "http://unreachable.invalid").unwrap();
        let first = store.load("ES").await.unwrap();
        assert_eq!(first.areas.len(), 1);
        assert_eq!(store.loaded_count().await, 1);

        // Second load must come from memory even if the file disappears
        std::fs::remove_file(dir.path().join("ES.geojson")).unwrap();
        let second = store.load("ES").await.unwrap();
        assert_eq!(second.areas.len(), 1);
    }

    #[tokio::test]
    async fn test_store_rejects_unsupported_country() {
        let dir = tempfile::tempdir().unwrap();
        let store = GeoPolygonStore::new(dir.path(), "http://unreachable.invalid").unwrap();
        let err = store.load("US").await.unwrap_err();
        assert!(matches!(err, LabError::Configuration(_)));
    }
}
