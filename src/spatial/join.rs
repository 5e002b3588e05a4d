//! In-memory join core and the executor-backed join run
//!
//! The sync path fetches POIs and filtered pings through the query executor
//! (the pings and distinct-device-count queries run concurrently), then joins
//! in memory with `match_pings`. The async path pushes the same algorithm
//! into a materializing query; see `spatial::sql`.

use super::grid::GridIndex;
use super::sql;
use super::JoinConfig;
use crate::error::{LabError, LabResult};
use crate::query::{self, PollConfig, QueryExecutor, Row};
use crate::types::{Ping, Poi, Visit};
use chrono::{DateTime, NaiveDate, Timelike};
use std::collections::HashMap;

/// Inputs of one spatial join: dataset, POI categories of interest and the
/// optional country/date filters shared with the device-count query.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub dataset_id: String,
    pub country: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    /// Sorted for deterministic SQL generation
    pub categories: Vec<String>,
    pub config: JoinConfig,
}

impl JoinRequest {
    pub fn new(dataset_id: &str, mut categories: Vec<String>, config: JoinConfig) -> Self {
        categories.sort();
        categories.dedup();
        Self {
            dataset_id: dataset_id.to_string(),
            country: None,
            date_from: None,
            date_to: None,
            categories,
            config,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JoinOutput {
    /// One visit per device x day x matched POI, origin unset
    pub visits: Vec<Visit>,
    /// Distinct devices in the dataset under the same filters
    pub total_devices: u64,
}

/// A single ping matched to its nearest in-radius POI.
#[derive(Debug, Clone)]
pub struct MatchedPing {
    pub device_id: String,
    pub timestamp: i64,
    pub poi_id: String,
    pub category: String,
}

struct VisitAccumulator {
    category: String,
    first_ts: i64,
    last_ts: i64,
    ping_count: u32,
}

/// Group matched pings into visits: one per device x day x POI, with
/// dwell = last - first matched-ping timestamp and visit hour taken from
/// the first matched ping.
pub fn group_into_visits(matched: impl IntoIterator<Item = MatchedPing>) -> Vec<Visit> {
    let mut groups: HashMap<(String, NaiveDate, String), VisitAccumulator> = HashMap::new();

    for m in matched {
        let Some(dt) = DateTime::from_timestamp(m.timestamp, 0) else {
            log::warn!("discarding ping with out-of-range timestamp {}", m.timestamp);
            continue;
        };
        let date = dt.date_naive();
        let key = (m.device_id, date, m.poi_id);
        groups
            .entry(key)
            .and_modify(|acc| {
                acc.first_ts = acc.first_ts.min(m.timestamp);
                acc.last_ts = acc.last_ts.max(m.timestamp);
                acc.ping_count += 1;
            })
            .or_insert(VisitAccumulator {
                category: m.category,
                first_ts: m.timestamp,
                last_ts: m.timestamp,
                ping_count: 1,
            });
    }

    let mut visits: Vec<Visit> = groups
        .into_iter()
        .map(|((device_id, date, poi_id), acc)| {
            let first = DateTime::from_timestamp(acc.first_ts, 0)
                .map(|dt| dt.hour())
                .unwrap_or(0);
            Visit {
                device_id,
                date,
                poi_id,
                category: acc.category,
                dwell_minutes: (acc.last_ts - acc.first_ts) as f64 / 60.0,
                visit_hour: first,
                ping_count: acc.ping_count,
                origin_lat: None,
                origin_lng: None,
            }
        })
        .collect();

    // Deterministic output order for downstream consumers and tests
    visits.sort_by(|a, b| {
        (&a.device_id, a.date, &a.poi_id).cmp(&(&b.device_id, b.date, &b.poi_id))
    });
    visits
}

/// The in-memory join: bucket POIs into an expanded grid, probe each ping's
/// cell, keep the nearest POI within radius, group into visits.
pub fn match_pings(pings: &[Ping], pois: &[Poi], cfg: &JoinConfig) -> Vec<Visit> {
    let index = GridIndex::build(pois, cfg.cell_size_degrees);
    log::debug!(
        "grid index: {} POIs across {} cells",
        pois.len(),
        index.cell_count()
    );

    let matched = pings.iter().filter_map(|ping| {
        index
            .nearest_within(ping.lat, ping.lng, cfg.radius_meters, pois)
            .map(|(idx, _dist)| MatchedPing {
                device_id: ping.device_id.clone(),
                timestamp: ping.timestamp,
                poi_id: pois[idx].id.clone(),
                category: pois[idx].category.clone(),
            })
    });

    group_into_visits(matched)
}

pub fn ping_from_row(row: &Row) -> Option<Ping> {
    Some(Ping {
        device_id: query::row_str(row, "device_id")?.to_string(),
        timestamp: query::row_i64(row, "ts")?,
        lat: query::row_f64(row, "lat")?,
        lng: query::row_f64(row, "lng")?,
        accuracy_m: query::row_f64(row, "accuracy_m"),
    })
}

pub fn poi_from_row(row: &Row) -> Option<Poi> {
    Some(Poi {
        id: query::row_str(row, "id")?.to_string(),
        category: query::row_str(row, "category")?.to_string(),
        lat: query::row_f64(row, "lat")?,
        lng: query::row_f64(row, "lng")?,
    })
}

/// Parse a grouped visit row, as produced by the materialized visits table.
pub fn visit_from_row(row: &Row) -> Option<Visit> {
    Some(Visit {
        device_id: query::row_str(row, "device_id")?.to_string(),
        date: query::row_str(row, "visit_date")?.parse().ok()?,
        poi_id: query::row_str(row, "poi_id")?.to_string(),
        category: query::row_str(row, "category")?.to_string(),
        dwell_minutes: query::row_f64(row, "dwell_minutes")?.max(0.0),
        visit_hour: query::row_i64(row, "visit_hour")? as u32,
        ping_count: query::row_i64(row, "ping_count")? as u32,
        origin_lat: None,
        origin_lng: None,
    })
}

pub struct SpatialJoinEngine {
    poll: PollConfig,
}

impl SpatialJoinEngine {
    pub fn new(poll: PollConfig) -> Self {
        Self { poll }
    }

    /// Run the join through the executor: fetch POIs of the requested
    /// categories, then the filtered pings and the distinct device count
    /// concurrently, and join in memory.
    ///
    /// Any executor error fails the whole join; partial results are never
    /// trusted.
    pub async fn run(
        &self,
        executor: &dyn QueryExecutor,
        req: &JoinRequest,
    ) -> LabResult<JoinOutput> {
        req.config.validate()?;
        if req.categories.is_empty() {
            return Err(LabError::Configuration(
                "spatial join needs at least one POI category".to_string(),
            ));
        }

        let poi_rows = query::run_to_rows(executor, &sql::pois_sql(req), &self.poll).await?;
        let pois: Vec<Poi> = poi_rows.iter().filter_map(poi_from_row).collect();
        log::info!(
            "spatial join: {} POIs of interest in {} categories",
            pois.len(),
            req.categories.len()
        );

        let pings_query = sql::pings_sql(req);
        let count_query = sql::device_count_sql(req);
        let (ping_rows, count_rows) = tokio::try_join!(
            query::run_to_rows(executor, &pings_query, &self.poll),
            query::run_to_rows(executor, &count_query, &self.poll),
        )?;

        let mut skipped = 0usize;
        let pings: Vec<Ping> = ping_rows
            .iter()
            .filter_map(|row| {
                let parsed = ping_from_row(row);
                if parsed.is_none() {
                    skipped += 1;
                }
                parsed
            })
            .collect();
        if skipped > 0 {
            log::warn!("spatial join: skipped {} malformed ping rows", skipped);
        }

        let total_devices = count_rows
            .first()
            .and_then(|row| query::row_i64(row, "device_count"))
            .ok_or_else(|| {
                LabError::QueryExecution("device count query returned no rows".to_string())
            })? as u64;

        let visits = match_pings(&pings, &pois, &req.config);
        log::info!(
            "spatial join: {} pings -> {} visits, {} total devices",
            pings.len(),
            visits.len(),
            total_devices
        );

        Ok(JoinOutput {
            visits,
            total_devices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping(device: &str, ts: i64, lat: f64, lng: f64) -> Ping {
        Ping {
            device_id: device.to_string(),
            timestamp: ts,
            lat,
            lng,
            accuracy_m: None,
        }
    }

    fn poi(id: &str, category: &str, lat: f64, lng: f64) -> Poi {
        Poi {
            id: id.to_string(),
            category: category.to_string(),
            lat,
            lng,
        }
    }

    // 2026-03-02 09:00:00 UTC
    const T0: i64 = 1_772_442_000;

    #[test]
    fn test_visit_grouping_dwell_and_hour() {
        let pois = vec![poi("gym_1", "gym", 40.0, -3.7)];
        let pings = vec![
            ping("d1", T0, 40.0001, -3.7),
            ping("d1", T0 + 600, 40.0002, -3.7),
            ping("d1", T0 + 1800, 40.0001, -3.7001),
        ];
        let visits = match_pings(&pings, &pois, &JoinConfig::default());
        assert_eq!(visits.len(), 1);
        let v = &visits[0];
        assert_eq!(v.device_id, "d1");
        assert_eq!(v.poi_id, "gym_1");
        assert_eq!(v.category, "gym");
        assert_eq!(v.ping_count, 3);
        assert!((v.dwell_minutes - 30.0).abs() < 1e-9);
        assert_eq!(v.visit_hour, 9);
        assert!(v.origin_lat.is_none(), "join leaves origin unset");
    }

    #[test]
    fn test_separate_days_separate_visits() {
        let pois = vec![poi("gym_1", "gym", 40.0, -3.7)];
        let pings = vec![
            ping("d1", T0, 40.0001, -3.7),
            ping("d1", T0 + 86_400, 40.0001, -3.7),
        ];
        let visits = match_pings(&pings, &pois, &JoinConfig::default());
        assert_eq!(visits.len(), 2);
        assert_ne!(visits[0].date, visits[1].date);
        assert!(visits.iter().all(|v| v.dwell_minutes == 0.0));
    }

    #[test]
    fn test_ping_without_nearby_poi_discarded() {
        let pois = vec![poi("gym_1", "gym", 40.0, -3.7)];
        // ~2.2 km away: different cell block entirely
        let pings = vec![ping("d1", T0, 40.02, -3.7)];
        let visits = match_pings(&pings, &pois, &JoinConfig::default());
        assert!(visits.is_empty());
    }

    #[test]
    fn test_no_device_within_radius_is_missed() {
        // Property: for valid configs, every ping within radius of a POI
        // matches, wherever it falls relative to cell boundaries.
        let cfg = JoinConfig {
            radius_meters: 200.0,
            cell_size_degrees: 0.002, // 222 m cell edge, still >= radius
        };
        cfg.validate().unwrap();

        let pois = vec![poi("p", "gym", 40.0, -3.7)];
        let mut pings = Vec::new();
        // Ring of pings ~150 m out in 16 directions
        for i in 0..16 {
            let angle = (i as f64) * std::f64::consts::TAU / 16.0;
            let dlat = 150.0 * angle.cos() / 111_320.0;
            let dlng = 150.0 * angle.sin() / (111_320.0 * 40.0_f64.to_radians().cos());
            pings.push(ping(&format!("d{}", i), T0 + i, 40.0 + dlat, -3.7 + dlng));
        }
        let visits = match_pings(&pings, &pois, &cfg);
        assert_eq!(visits.len(), 16, "a within-radius ping was dropped");
    }

    #[test]
    fn test_nearest_poi_wins_per_ping() {
        let pois = vec![
            poi("far_gym", "gym", 40.0012, -3.7),
            poi("near_cafe", "cafe", 40.0001, -3.7),
        ];
        let pings = vec![ping("d1", T0, 40.0, -3.7)];
        let visits = match_pings(&pings, &pois, &JoinConfig::default());
        assert_eq!(visits.len(), 1);
        assert_eq!(visits[0].poi_id, "near_cafe");
    }

    #[test]
    fn test_visit_row_parsing() {
        let mut row = Row::new();
        row.insert("device_id".to_string(), serde_json::json!("d1"));
        row.insert("visit_date".to_string(), serde_json::json!("2026-03-02"));
        row.insert("poi_id".to_string(), serde_json::json!("gym_1"));
        row.insert("category".to_string(), serde_json::json!("gym"));
        row.insert("dwell_minutes".to_string(), serde_json::json!(12.5));
        row.insert("visit_hour".to_string(), serde_json::json!(9));
        row.insert("ping_count".to_string(), serde_json::json!(4));

        let v = visit_from_row(&row).unwrap();
        assert_eq!(v.date, NaiveDate::from_ymd_opt(2026, 3, 2).unwrap());
        assert_eq!(v.visit_hour, 9);
        assert_eq!(v.ping_count, 4);

        row.remove("poi_id");
        assert!(visit_from_row(&row).is_none());
    }
}
