//! Origin resolution: first-ping-of-day coordinates for matched devices
//!
//! Runs only over devices that matched a recipe, to keep query cost down.
//! Device ids go out in fixed-size batches (engine literal-list limits);
//! a failed batch is logged and skipped. Partial coverage is acceptable:
//! devices without an origin are excluded from geocoded scoring but remain
//! counted in the segment.

use crate::query::{self, PollConfig, QueryExecutor};
use crate::types::Visit;
use std::collections::HashMap;

/// Max device ids per query, to respect engine literal-list limits.
pub const ORIGIN_BATCH_SIZE: usize = 500;

/// `device_id|date` -> first-of-day coordinate
pub type OriginMap = HashMap<String, (f64, f64)>;

pub fn origin_key(device_id: &str, date: &chrono::NaiveDate) -> String {
    format!("{}|{}", device_id, date)
}

fn batch_sql(dataset_id: &str, device_ids: &[String]) -> String {
    format!(
        "WITH ranked AS (\n\
         \x20 SELECT device_id,\n\
         \x20        CAST(DATE(FROM_UNIXTIME(ts)) AS VARCHAR) AS ping_date,\n\
         \x20        lat, lng,\n\
         \x20        ROW_NUMBER() OVER (\n\
         \x20          PARTITION BY device_id, DATE(FROM_UNIXTIME(ts)) ORDER BY ts\n\
         \x20        ) AS rn\n\
         \x20 FROM pings\n\
         \x20 WHERE dataset_id = {} AND device_id IN ({})\n\
         )\n\
         SELECT device_id, ping_date, lat, lng FROM ranked WHERE rn = 1",
        query::sql_quote(dataset_id),
        query::sql_in_list(device_ids),
    )
}

pub struct OriginResolver {
    poll: PollConfig,
}

impl OriginResolver {
    pub fn new(poll: PollConfig) -> Self {
        Self { poll }
    }

    /// Fetch first-of-day coordinates for the given devices, one query per
    /// batch of at most `ORIGIN_BATCH_SIZE` ids. Batch failures are logged
    /// and skipped; the merged map may cover only a subset of devices.
    pub async fn resolve(
        &self,
        executor: &dyn QueryExecutor,
        dataset_id: &str,
        device_ids: &[String],
    ) -> OriginMap {
        let mut origins = OriginMap::new();
        let total_batches = device_ids.len().div_ceil(ORIGIN_BATCH_SIZE);

        for (batch_no, chunk) in device_ids.chunks(ORIGIN_BATCH_SIZE).enumerate() {
            let sql = batch_sql(dataset_id, chunk);
            match query::run_to_rows(executor, &sql, &self.poll).await {
                Ok(rows) => {
                    merge_origin_rows(&mut origins, &rows);
                }
                Err(e) => {
                    log::warn!(
                        "origin batch {}/{} failed ({} devices skipped): {}",
                        batch_no + 1,
                        total_batches,
                        chunk.len(),
                        e
                    );
                }
            }
        }

        log::info!(
            "origin resolution: {} device-day origins for {} devices",
            origins.len(),
            device_ids.len()
        );
        origins
    }
}

/// Merge rows of a resolved batch into the map, ignoring malformed rows.
pub fn merge_origin_rows(origins: &mut OriginMap, rows: &[query::Row]) {
    for row in rows {
        let Some(device_id) = query::row_str(row, "device_id") else {
            continue;
        };
        let Some(date) = query::row_str(row, "ping_date") else {
            continue;
        };
        let (Some(lat), Some(lng)) = (query::row_f64(row, "lat"), query::row_f64(row, "lng"))
        else {
            continue;
        };
        origins.insert(format!("{}|{}", device_id, date), (lat, lng));
    }
}

/// Stamp resolved origins onto visits by device and date.
pub fn apply_origins(visits: &mut [Visit], origins: &OriginMap) {
    for visit in visits.iter_mut() {
        if let Some(&(lat, lng)) = origins.get(&origin_key(&visit.device_id, &visit.date)) {
            visit.origin_lat = Some(lat);
            visit.origin_lng = Some(lng);
        }
    }
}
