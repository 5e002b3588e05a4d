//! Engine configuration from environment variables plus per-run input
//!
//! `LabConfig` covers process-level settings (engine endpoint, cache and
//! output locations, poll pacing). `RunRequest` is the serde JSON input that
//! describes one run: dataset, country, date range, recipes and tuning knobs.

use crate::error::{LabError, LabResult};
use crate::types::{Recipe, RecipeLogic};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::env;

/// Process-level configuration.
///
/// Environment variables:
/// - `LAB_ENGINE_URL` (default: http://localhost:8123)
/// - `LAB_ENGINE_TOKEN` (optional bearer token)
/// - `LAB_GEO_CACHE_DIR` (default: /var/lib/affinity-lab/geo)
/// - `LAB_BLOB_DIR` (default: /var/lib/affinity-lab/blobs)
/// - `LAB_EXPORT_DIR` (default: /var/lib/affinity-lab/exports)
/// - `LAB_STATUS_DB_PATH` (default: /var/lib/affinity-lab/run_status.db)
/// - `LAB_POLL_INTERVAL_MS` (default: 2000)
/// - `LAB_POLL_MAX_ATTEMPTS` (default: 900)
/// - `LAB_STALE_RUN_SECS` (default: 360)
/// - `LAB_HEARTBEAT_INTERVAL_MS` (default: 15000)
#[derive(Debug, Clone)]
pub struct LabConfig {
    pub engine_url: String,
    pub engine_token: Option<String>,
    pub geo_cache_dir: String,
    pub blob_dir: String,
    pub export_dir: String,
    pub status_db_path: String,
    pub poll_interval_ms: u64,
    pub poll_max_attempts: u32,
    /// A "running" record older than this is treated as abandoned
    pub stale_run_secs: i64,
    pub heartbeat_interval_ms: u64,
}

impl LabConfig {
    pub fn from_env() -> Self {
        Self {
            engine_url: env::var("LAB_ENGINE_URL")
                .unwrap_or_else(|_| "http://localhost:8123".to_string()),

            engine_token: env::var("LAB_ENGINE_TOKEN").ok(),

            geo_cache_dir: env::var("LAB_GEO_CACHE_DIR")
                .unwrap_or_else(|_| "/var/lib/affinity-lab/geo".to_string()),

            blob_dir: env::var("LAB_BLOB_DIR")
                .unwrap_or_else(|_| "/var/lib/affinity-lab/blobs".to_string()),

            export_dir: env::var("LAB_EXPORT_DIR")
                .unwrap_or_else(|_| "/var/lib/affinity-lab/exports".to_string()),

            status_db_path: env::var("LAB_STATUS_DB_PATH")
                .unwrap_or_else(|_| "/var/lib/affinity-lab/run_status.db".to_string()),

            poll_interval_ms: env::var("LAB_POLL_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2_000),

            poll_max_attempts: env::var("LAB_POLL_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(900),

            stale_run_secs: env::var("LAB_STALE_RUN_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(360),

            heartbeat_interval_ms: env::var("LAB_HEARTBEAT_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(15_000),
        }
    }
}

fn default_noise_floor() -> u64 {
    5
}

fn default_radius_meters() -> f64 {
    200.0
}

fn default_cell_size_degrees() -> f64 {
    0.01
}

/// One run's input: dataset, target country, optional inclusive date range,
/// one recipe (single mode) or several (batch mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub dataset_id: String,
    /// ISO-2 country code, must be in the supported set
    pub country: String,
    #[serde(default)]
    pub date_from: Option<NaiveDate>,
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
    pub recipes: Vec<Recipe>,
    #[serde(default = "default_noise_floor")]
    pub noise_floor: u64,
    #[serde(default = "default_radius_meters")]
    pub radius_meters: f64,
    #[serde(default = "default_cell_size_degrees")]
    pub cell_size_degrees: f64,
}

impl RunRequest {
    /// Reject inputs the engine cannot run: empty recipe sets, empty steps,
    /// OR-logic recipes flagged as ordered, inverted date ranges and hour
    /// bounds outside 0-23.
    pub fn validate(&self) -> LabResult<()> {
        if self.dataset_id.is_empty() {
            return Err(LabError::Configuration("dataset_id is empty".to_string()));
        }
        if self.recipes.is_empty() {
            return Err(LabError::Configuration("no recipes provided".to_string()));
        }
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                return Err(LabError::Configuration(format!(
                    "date_from {} is after date_to {}",
                    from, to
                )));
            }
        }
        for recipe in &self.recipes {
            if recipe.steps.is_empty() {
                return Err(LabError::Configuration(format!(
                    "recipe '{}' has no steps",
                    recipe.name
                )));
            }
            if recipe.ordered && recipe.logic != RecipeLogic::And {
                return Err(LabError::Configuration(format!(
                    "recipe '{}': ordered is only defined for AND logic",
                    recipe.name
                )));
            }
            for step in &recipe.steps {
                if step.categories.is_empty() {
                    return Err(LabError::Configuration(format!(
                        "recipe '{}' step '{}' has no categories",
                        recipe.name, step.id
                    )));
                }
                if let Some(w) = &step.time_window {
                    if w.hour_from > 23 || w.hour_to > 23 {
                        return Err(LabError::Configuration(format!(
                            "recipe '{}' step '{}': hours must be 0-23",
                            recipe.name, step.id
                        )));
                    }
                }
                if let (Some(min), Some(max)) = (step.min_dwell_minutes, step.max_dwell_minutes) {
                    if min > max {
                        return Err(LabError::Configuration(format!(
                            "recipe '{}' step '{}': min dwell {} exceeds max dwell {}",
                            recipe.name, step.id, min, max
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn is_batch(&self) -> bool {
        self.recipes.len() > 1
    }
}
