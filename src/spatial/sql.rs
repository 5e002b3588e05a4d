//! SQL generation for the executor-side spatial join
//!
//! The materializing form reproduces the in-memory algorithm: POIs expand
//! into their 3x3 cell block, pings equi-join on bucket coordinates, the
//! nearest in-radius POI per ping wins via a window function, and matched
//! pings group into one row per device x day x POI.

use super::join::JoinRequest;
use crate::query::{sql_in_list, sql_quote};

// Column references take an alias prefix ("" or "g." / "p.") so aliased
// forms never touch the quoted literal values.
fn ping_filters(req: &JoinRequest, alias: &str) -> String {
    let mut clauses = vec![format!("{}dataset_id = {}", alias, sql_quote(&req.dataset_id))];
    if let Some(country) = &req.country {
        clauses.push(format!("{}country = {}", alias, sql_quote(country)));
    }
    if let Some(from) = req.date_from {
        clauses.push(format!(
            "DATE(FROM_UNIXTIME({}ts)) >= DATE {}",
            alias,
            sql_quote(&from.to_string())
        ));
    }
    if let Some(to) = req.date_to {
        clauses.push(format!(
            "DATE(FROM_UNIXTIME({}ts)) <= DATE {}",
            alias,
            sql_quote(&to.to_string())
        ));
    }
    clauses.join(" AND ")
}

fn poi_filters(req: &JoinRequest, alias: &str) -> String {
    let mut clauses = vec![format!("{}category IN ({})", alias, sql_in_list(&req.categories))];
    if let Some(country) = &req.country {
        clauses.push(format!("{}country = {}", alias, sql_quote(country)));
    }
    clauses.join(" AND ")
}

/// POIs of the requested categories.
pub fn pois_sql(req: &JoinRequest) -> String {
    format!(
        "SELECT id, category, lat, lng FROM pois WHERE {}",
        poi_filters(req, "")
    )
}

/// Filtered raw pings for the in-memory join path.
pub fn pings_sql(req: &JoinRequest) -> String {
    format!(
        "SELECT device_id, ts, lat, lng, accuracy_m FROM pings WHERE {}",
        ping_filters(req, "")
    )
}

/// Distinct device count under the same filters as the ping fetch.
pub fn device_count_sql(req: &JoinRequest) -> String {
    format!(
        "SELECT COUNT(DISTINCT device_id) AS device_count FROM pings WHERE {}",
        ping_filters(req, "")
    )
}

/// The full SQL-side join, grouped to visit rows. Used by the async path as
/// a materializing query so only the small visits table ever leaves the
/// engine.
pub fn visits_select_sql(req: &JoinRequest) -> String {
    let step = req.config.cell_size_degrees;
    let radius = req.config.radius_meters;
    format!(
        "WITH poi_cells AS (\n\
         \x20 SELECT p.id, p.category, p.lat, p.lng,\n\
         \x20        CAST(FLOOR(p.lat / {step}) AS BIGINT) + dr.d AS cell_lat,\n\
         \x20        CAST(FLOOR(p.lng / {step}) AS BIGINT) + dc.d AS cell_lng\n\
         \x20 FROM pois p\n\
         \x20 CROSS JOIN (VALUES (-1), (0), (1)) AS dr(d)\n\
         \x20 CROSS JOIN (VALUES (-1), (0), (1)) AS dc(d)\n\
         \x20 WHERE {poi_where}\n\
         ),\n\
         candidates AS (\n\
         \x20 SELECT g.device_id, g.ts, c.id AS poi_id, c.category,\n\
         \x20        SQRT(POWER((g.lat - c.lat) * 111320, 2) +\n\
         \x20             POWER((g.lng - c.lng) * 111320 * COS(RADIANS(c.lat)), 2)) AS dist_m\n\
         \x20 FROM pings g\n\
         \x20 JOIN poi_cells c\n\
         \x20   ON CAST(FLOOR(g.lat / {step}) AS BIGINT) = c.cell_lat\n\
         \x20  AND CAST(FLOOR(g.lng / {step}) AS BIGINT) = c.cell_lng\n\
         \x20 WHERE {ping_where}\n\
         ),\n\
         nearest AS (\n\
         \x20 SELECT device_id, ts, poi_id, category,\n\
         \x20        ROW_NUMBER() OVER (PARTITION BY device_id, ts ORDER BY dist_m, poi_id) AS rn\n\
         \x20 FROM candidates\n\
         \x20 WHERE dist_m <= {radius}\n\
         )\n\
         SELECT device_id,\n\
         \x20      CAST(DATE(FROM_UNIXTIME(ts)) AS VARCHAR) AS visit_date,\n\
         \x20      poi_id,\n\
         \x20      category,\n\
         \x20      (MAX(ts) - MIN(ts)) / 60.0 AS dwell_minutes,\n\
         \x20      HOUR(FROM_UNIXTIME(MIN(ts))) AS visit_hour,\n\
         \x20      COUNT(*) AS ping_count\n\
         FROM nearest\n\
         WHERE rn = 1\n\
         GROUP BY device_id, CAST(DATE(FROM_UNIXTIME(ts)) AS VARCHAR), poi_id, category",
        step = step,
        radius = radius,
        poi_where = poi_filters(req, "p."),
        ping_where = ping_filters(req, "g."),
    )
}

/// Origins for every device in a materialized visits table: the first ping
/// of each device-day, resolved in one dataset-wide query instead of one
/// per 500 devices.
pub fn origins_select_sql(req: &JoinRequest, visits_table: &str) -> String {
    format!(
        "WITH matched AS (\n\
         \x20 SELECT DISTINCT device_id FROM {visits_table}\n\
         ),\n\
         ranked AS (\n\
         \x20 SELECT g.device_id,\n\
         \x20        CAST(DATE(FROM_UNIXTIME(g.ts)) AS VARCHAR) AS ping_date,\n\
         \x20        g.lat, g.lng,\n\
         \x20        ROW_NUMBER() OVER (\n\
         \x20          PARTITION BY g.device_id, DATE(FROM_UNIXTIME(g.ts))\n\
         \x20          ORDER BY g.ts\n\
         \x20        ) AS rn\n\
         \x20 FROM pings g\n\
         \x20 JOIN matched m ON m.device_id = g.device_id\n\
         \x20 WHERE {ping_where}\n\
         )\n\
         SELECT device_id, ping_date, lat, lng FROM ranked WHERE rn = 1",
        visits_table = visits_table,
        ping_where = ping_filters(req, "g."),
    )
}
