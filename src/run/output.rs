//! Result persistence: per-run JSON blobs, a "latest" pointer per audience
//! and a per-device CSV export for downstream delivery.

use crate::error::LabResult;
use crate::store::blob::{self, BlobStore};
use crate::types::{AffinityRecord, LabStats, SegmentDevice, ZipcodeProfile};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How many zipcodes the latest-pointer summary carries.
const LATEST_TOP_N: usize = 20;

/// Full result of one recipe within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeResult {
    pub run_id: String,
    pub recipe_name: String,
    /// Unix timestamp, seconds
    pub generated_at: i64,
    pub stats: LabStats,
    pub records: Vec<AffinityRecord>,
    pub profiles: Vec<ZipcodeProfile>,
}

/// Compact summary stored under the latest pointer, cheap for dashboards
/// that only want the headline zipcodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatestSummary {
    pub run_id: String,
    pub recipe_name: String,
    pub generated_at: i64,
    pub scored_zipcodes: u64,
    pub top_zipcodes: Vec<TopZipcode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopZipcode {
    pub postal_code: String,
    pub top_category: String,
    pub affinity: u32,
}

pub fn result_key(dataset_id: &str, country: &str, recipe_name: &str, run_id: &str) -> String {
    format!("results/{}/{}/{}/{}", dataset_id, country, recipe_name, run_id)
}

pub fn latest_key(dataset_id: &str, country: &str, recipe_name: &str) -> String {
    format!("latest/{}/{}/{}", dataset_id, country, recipe_name)
}

fn summarize(result: &RecipeResult) -> LatestSummary {
    let mut ranked: Vec<&ZipcodeProfile> = result.profiles.iter().collect();
    ranked.sort_by(|a, b| {
        b.top_affinity
            .cmp(&a.top_affinity)
            .then_with(|| a.postal_code.cmp(&b.postal_code))
    });
    LatestSummary {
        run_id: result.run_id.clone(),
        recipe_name: result.recipe_name.clone(),
        generated_at: result.generated_at,
        scored_zipcodes: result.profiles.len() as u64,
        top_zipcodes: ranked
            .into_iter()
            .take(LATEST_TOP_N)
            .map(|p| TopZipcode {
                postal_code: p.postal_code.clone(),
                top_category: p.top_category.clone(),
                affinity: p.top_affinity,
            })
            .collect(),
    }
}

/// Write the full result blob and refresh the audience's latest pointer.
pub async fn persist_recipe_result(
    store: &dyn BlobStore,
    dataset_id: &str,
    country: &str,
    result: &RecipeResult,
) -> LabResult<()> {
    blob::put_typed(
        store,
        &result_key(dataset_id, country, &result.recipe_name, &result.run_id),
        result,
    )
    .await?;
    blob::put_typed(
        store,
        &latest_key(dataset_id, country, &result.recipe_name),
        &summarize(result),
    )
    .await
}

/// Export segment membership as CSV, one row per device. Returns the file
/// path written.
pub fn export_segment_csv(
    export_dir: &Path,
    run_id: &str,
    recipe_name: &str,
    segment: &[SegmentDevice],
) -> LabResult<PathBuf> {
    std::fs::create_dir_all(export_dir)?;
    let path = export_dir.join(format!("{}_{}.csv", run_id, recipe_name));

    let mut writer = csv::Writer::from_path(&path)?;
    writer.write_record([
        "device_id",
        "matched_step_count",
        "total_visits",
        "avg_dwell_minutes",
        "categories_visited",
    ])?;
    for device in segment {
        writer.write_record([
            device.device_id.as_str(),
            &device.matched_step_count.to_string(),
            &device.total_visits.to_string(),
            &format!("{:.2}", device.avg_dwell_minutes),
            &device.categories_visited.join(";"),
        ])?;
    }
    writer.flush()?;
    log::info!(
        "exported {} segment devices to {}",
        segment.len(),
        path.display()
    );
    Ok(path)
}
