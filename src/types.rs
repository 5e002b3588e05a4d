//! Core data model shared across the engine
//!
//! `Ping` is transient (fetched, joined, discarded). `Visit` is the unit
//! everything downstream consumes: one row per device x day x matched POI.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One raw device location sample. Never persisted as an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub device_id: String,
    /// Unix timestamp in seconds (UTC)
    pub timestamp: i64,
    pub lat: f64,
    pub lng: f64,
    /// Horizontal accuracy in meters, when the provider reports one
    pub accuracy_m: Option<f64>,
}

/// A point of interest with a single category tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poi {
    pub id: String,
    pub category: String,
    pub lat: f64,
    pub lng: f64,
}

/// Grouped pings for one device at one POI on one day.
///
/// Produced by the spatial join with origin unset; the origin resolver
/// fills `origin_lat`/`origin_lng` afterwards for matched devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Visit {
    pub device_id: String,
    pub date: NaiveDate,
    pub poi_id: String,
    pub category: String,
    /// Last minus first matched-ping timestamp, in minutes. Always >= 0.
    pub dwell_minutes: f64,
    /// Hour (0-23, UTC) of the first matched ping
    pub visit_hour: u32,
    pub ping_count: u32,
    pub origin_lat: Option<f64>,
    pub origin_lng: Option<f64>,
}

/// Half-open hour window `[hour_from, hour_to)`.
///
/// Wraps past midnight when `hour_from > hour_to`: `{22, 6}` means
/// hour >= 22 OR hour < 6.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeWindow {
    pub hour_from: u32,
    pub hour_to: u32,
}

impl TimeWindow {
    pub fn contains(&self, hour: u32) -> bool {
        if self.hour_from <= self.hour_to {
            hour >= self.hour_from && hour < self.hour_to
        } else {
            hour >= self.hour_from || hour < self.hour_to
        }
    }
}

fn default_min_frequency() -> u32 {
    1
}

/// One predicate of an audience recipe.
///
/// Categories are an OR-set; the window and dwell bounds are optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeStep {
    pub id: String,
    pub categories: HashSet<String>,
    #[serde(default)]
    pub time_window: Option<TimeWindow>,
    #[serde(default)]
    pub min_dwell_minutes: Option<f64>,
    #[serde(default)]
    pub max_dwell_minutes: Option<f64>,
    /// Minimum number of qualifying visits for the step to match
    #[serde(default = "default_min_frequency")]
    pub min_frequency: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecipeLogic {
    And,
    Or,
}

/// Declarative multi-step audience definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    pub steps: Vec<RecipeStep>,
    pub logic: RecipeLogic,
    /// AND-only: first-qualifying-date per step must be non-decreasing
    /// across steps (same-day counts as ordered)
    #[serde(default)]
    pub ordered: bool,
}

impl Recipe {
    /// Union of all step category sets. Drives the shared spatial join.
    pub fn category_union(&self) -> HashSet<String> {
        self.steps
            .iter()
            .flat_map(|s| s.categories.iter().cloned())
            .collect()
    }
}

/// One device's membership record in a segment. Lifetime = one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentDevice {
    pub device_id: String,
    pub matched_step_count: u32,
    pub total_visits: u32,
    pub avg_dwell_minutes: f64,
    pub categories_visited: Vec<String>,
}

/// Normalized administrative info for a resolved coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub postal_code: String,
    pub city: String,
    pub province: String,
    pub region: String,
}

/// Per-(postal code, category) affinity scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityRecord {
    pub postal_code: String,
    pub category: String,
    pub visits: u64,
    pub unique_devices: u64,
    pub avg_dwell_minutes: f64,
    /// Average visits per device for this (zipcode, category)
    pub frequency: f64,
    pub concentration_score: f64,
    pub frequency_score: f64,
    pub dwell_score: f64,
    /// Composite score, always in [0, 100]
    pub affinity_index: u32,
}

/// Per-postal-code aggregate across all scored categories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZipcodeProfile {
    pub postal_code: String,
    /// category -> affinity index
    pub affinities: HashMap<String, u32>,
    pub top_category: String,
    pub top_affinity: u32,
    /// Category group with the highest average affinity, per the fixed
    /// group taxonomy (not the single top category)
    pub dominant_group: String,
    pub total_visits: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Externally persisted run record, keyed by (dataset_id, country).
///
/// Created at run start, mutated throughout, superseded by the next run
/// for the same key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub dataset_id: String,
    pub country: String,
    pub status: RunState,
    pub phase: String,
    pub percent: u8,
    pub cancel_requested: bool,
    pub completed_audiences: Vec<String>,
    /// Unix timestamp of the last update; drives staleness takeover
    pub updated_at: i64,
}

/// Run-level statistics, including geocode coverage accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabStats {
    pub total_devices: u64,
    pub matched_devices: u64,
    pub total_visits: u64,
    /// Devices whose home coordinate resolved to a supported-country zipcode
    pub geocoded_devices: u64,
    /// Devices whose home coordinate fell outside every supported bbox
    pub foreign_devices: u64,
    /// Devices inside a bbox but matching no polygon
    pub unmatched_domestic_devices: u64,
    /// Matched devices with no resolvable origin coordinate
    pub unresolved_origin_devices: u64,
    pub scored_zipcodes: u64,
    pub elapsed_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_window_plain() {
        let w = TimeWindow {
            hour_from: 6,
            hour_to: 10,
        };
        assert!(w.contains(6));
        assert!(w.contains(9));
        assert!(!w.contains(10), "upper bound is exclusive");
        assert!(!w.contains(23));
    }

    #[test]
    fn test_time_window_wraparound() {
        // [22, 6) wraps past midnight
        let w = TimeWindow {
            hour_from: 22,
            hour_to: 6,
        };
        assert!(w.contains(23));
        assert!(w.contains(0));
        assert!(w.contains(5));
        assert!(!w.contains(6), "upper bound is exclusive after wrap");
        assert!(!w.contains(10));
    }

    #[test]
    fn test_recipe_category_union() {
        let recipe = Recipe {
            name: "test".to_string(),
            steps: vec![
                RecipeStep {
                    id: "s1".to_string(),
                    categories: ["gym".to_string(), "yoga".to_string()].into(),
                    time_window: None,
                    min_dwell_minutes: None,
                    max_dwell_minutes: None,
                    min_frequency: 1,
                },
                RecipeStep {
                    id: "s2".to_string(),
                    categories: ["gym".to_string(), "supermarket".to_string()].into(),
                    time_window: None,
                    min_dwell_minutes: None,
                    max_dwell_minutes: None,
                    min_frequency: 1,
                },
            ],
            logic: RecipeLogic::And,
            ordered: false,
        };
        let union = recipe.category_union();
        assert_eq!(union.len(), 3);
        assert!(union.contains("gym"));
        assert!(union.contains("supermarket"));
    }

    #[test]
    fn test_recipe_step_defaults_from_json() {
        let json = r#"{"id":"s1","categories":["gym"]}"#;
        let step: RecipeStep = serde_json::from_str(json).unwrap();
        assert_eq!(step.min_frequency, 1);
        assert!(step.time_window.is_none());
        assert!(step.min_dwell_minutes.is_none());
    }
}
