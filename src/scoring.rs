//! Affinity scoring: geocoded, recipe-matched visits -> per-(zipcode,
//! category) records and per-zipcode profiles
//!
//! Three signals, each rescaled to 0-100, combined with fixed weights
//! summing to 1.0. Every sub-score and the composite degrade to 0 under
//! degenerate inputs (zero national share, zero frequency, zero median
//! dwell) instead of producing NaN.

use crate::geo::GeocodeOutcome;
use crate::types::{AffinityRecord, Visit, ZipcodeProfile};
use std::collections::{HashMap, HashSet};

/// Fixed category-group taxonomy used for `dominant_group`.
pub const CATEGORY_GROUPS: &[(&str, &[&str])] = &[
    ("food_drink", &["restaurant", "cafe", "bar", "fast_food", "bakery"]),
    ("fitness_wellness", &["gym", "yoga", "spa", "sports_club", "pool"]),
    ("retail", &["supermarket", "mall", "clothing", "electronics", "furniture"]),
    ("leisure_culture", &["cinema", "museum", "theater", "park", "stadium"]),
    ("services", &["bank", "pharmacy", "hospital", "school", "hairdresser"]),
    ("travel", &["hotel", "airport", "train_station", "gas_station", "car_rental"]),
];

#[derive(Debug, Clone, Copy)]
pub struct ScoringConfig {
    /// Zipcodes with fewer total visits than this are dropped entirely
    pub noise_floor: u64,
    pub weight_concentration: f64,
    pub weight_frequency: f64,
    pub weight_dwell: f64,
    /// Concentration ratio cap before rescaling
    pub concentration_cap: f64,
    /// Frequency ceiling for log2 normalization
    pub frequency_ceiling: f64,
    /// Cap applied to the per-category median dwell, bounding outliers
    /// such as stale or stuck pings
    pub dwell_median_cap_minutes: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            noise_floor: 5,
            weight_concentration: 0.40,
            weight_frequency: 0.35,
            weight_dwell: 0.25,
            concentration_cap: 5.0,
            frequency_ceiling: 16.0,
            dwell_median_cap_minutes: 120.0,
        }
    }
}

impl ScoringConfig {
    pub fn with_noise_floor(noise_floor: u64) -> Self {
        Self {
            noise_floor,
            ..Self::default()
        }
    }
}

/// One matched device with its geocoded home outcome and its visits.
///
/// The home outcome comes from the origin of the device's earliest visit
/// with a resolved origin; all the device's visits are credited to that
/// home zipcode.
#[derive(Debug, Clone)]
pub struct GeocodedDevice {
    pub device_id: String,
    pub home: GeocodeOutcome,
    pub visits: Vec<Visit>,
}

#[derive(Debug, Default)]
struct CategoryAggregate {
    visits: u64,
    devices: HashSet<String>,
    dwell_sum: f64,
}

#[derive(Debug, Default)]
struct ZipAggregate {
    total_visits: u64,
    devices: HashSet<String>,
    categories: HashMap<String, CategoryAggregate>,
}

/// Device-level coverage accounting. The invariant callers rely on:
/// matched zipcode devices + foreign + unmatched domestic == input devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Coverage {
    pub matched_devices: u64,
    pub foreign_devices: u64,
    pub unmatched_domestic_devices: u64,
}

struct Aggregation {
    zips: HashMap<String, ZipAggregate>,
    coverage: Coverage,
}

/// Bucket devices and their visits by home zipcode, counting each device
/// exactly once in the coverage tallies.
fn aggregate_by_zipcode(devices: &[GeocodedDevice]) -> Aggregation {
    let mut zips: HashMap<String, ZipAggregate> = HashMap::new();
    let mut coverage = Coverage::default();

    for device in devices {
        let info = match &device.home {
            GeocodeOutcome::Matched(info) => {
                coverage.matched_devices += 1;
                info
            }
            GeocodeOutcome::Foreign => {
                coverage.foreign_devices += 1;
                continue;
            }
            GeocodeOutcome::Unmatched => {
                coverage.unmatched_domestic_devices += 1;
                continue;
            }
        };

        let zip = zips.entry(info.postal_code.clone()).or_default();
        zip.devices.insert(device.device_id.clone());
        for visit in &device.visits {
            zip.total_visits += 1;
            let cat = zip.categories.entry(visit.category.clone()).or_default();
            cat.visits += 1;
            cat.devices.insert(device.device_id.clone());
            cat.dwell_sum += visit.dwell_minutes;
        }
    }

    Aggregation { zips, coverage }
}

fn median(values: &mut Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn clamp_score(raw: f64) -> f64 {
    if raw.is_finite() {
        raw.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Concentration: local category share over national category share,
/// capped then linearly rescaled. Zero national share scores 0.
fn concentration_score(local_share: f64, national_share: f64, cap: f64) -> f64 {
    if national_share <= 0.0 || local_share <= 0.0 {
        return 0.0;
    }
    let ratio = (local_share / national_share).min(cap);
    clamp_score(ratio / cap * 100.0)
}

/// Frequency: log2-normalized against the ceiling, because visit frequency
/// is heavily right-skewed. Clamped to [0, 1] before scaling.
fn frequency_score(avg_visits_per_device: f64, ceiling: f64) -> f64 {
    if avg_visits_per_device <= 0.0 || ceiling <= 0.0 {
        return 0.0;
    }
    let normalized = (1.0 + avg_visits_per_device).log2() / (1.0 + ceiling).log2();
    clamp_score(normalized.clamp(0.0, 1.0) * 100.0)
}

/// Dwell: average dwell relative to the category's run-wide median (the
/// median itself capped). Twice the median saturates the signal.
fn dwell_score(avg_dwell: f64, category_median: f64, median_cap: f64) -> f64 {
    let capped_median = category_median.min(median_cap);
    if capped_median <= 0.0 || avg_dwell <= 0.0 {
        return 0.0;
    }
    let ratio = avg_dwell / capped_median;
    clamp_score((ratio / 2.0).clamp(0.0, 1.0) * 100.0)
}

#[derive(Debug)]
pub struct ScoreOutput {
    pub records: Vec<AffinityRecord>,
    pub profiles: Vec<ZipcodeProfile>,
    pub coverage: Coverage,
}

/// Score all geocoded devices of one recipe run.
pub fn score(devices: &[GeocodedDevice], cfg: &ScoringConfig) -> ScoreOutput {
    let aggregation = aggregate_by_zipcode(devices);

    // National totals across the run, for concentration baselines
    let national_total: u64 = aggregation.zips.values().map(|z| z.total_visits).sum();
    let mut national_by_category: HashMap<&str, u64> = HashMap::new();
    for zip in aggregation.zips.values() {
        for (category, agg) in &zip.categories {
            *national_by_category.entry(category.as_str()).or_default() += agg.visits;
        }
    }

    // Run-wide median dwell per category, over geocoded visits
    let mut dwell_samples: HashMap<&str, Vec<f64>> = HashMap::new();
    for device in devices {
        if matches!(device.home, GeocodeOutcome::Matched(_)) {
            for visit in &device.visits {
                dwell_samples
                    .entry(visit.category.as_str())
                    .or_default()
                    .push(visit.dwell_minutes);
            }
        }
    }
    let category_medians: HashMap<&str, f64> = dwell_samples
        .into_iter()
        .map(|(category, mut samples)| (category, median(&mut samples)))
        .collect();

    let mut records = Vec::new();
    let mut profiles = Vec::new();

    let mut zip_codes: Vec<&String> = aggregation.zips.keys().collect();
    zip_codes.sort();

    for zip_code in zip_codes {
        let zip = &aggregation.zips[zip_code];
        if zip.total_visits < cfg.noise_floor {
            continue;
        }

        let mut affinities: HashMap<String, u32> = HashMap::new();
        let mut categories: Vec<&String> = zip.categories.keys().collect();
        categories.sort();

        for category in categories {
            let agg = &zip.categories[category];
            let local_share = agg.visits as f64 / zip.total_visits as f64;
            let national_share = if national_total > 0 {
                national_by_category
                    .get(category.as_str())
                    .copied()
                    .unwrap_or(0) as f64
                    / national_total as f64
            } else {
                0.0
            };
            let avg_dwell = if agg.visits > 0 {
                agg.dwell_sum / agg.visits as f64
            } else {
                0.0
            };
            let frequency = if agg.devices.is_empty() {
                0.0
            } else {
                agg.visits as f64 / agg.devices.len() as f64
            };

            let c_score = concentration_score(local_share, national_share, cfg.concentration_cap);
            let f_score = frequency_score(frequency, cfg.frequency_ceiling);
            let d_score = dwell_score(
                avg_dwell,
                category_medians.get(category.as_str()).copied().unwrap_or(0.0),
                cfg.dwell_median_cap_minutes,
            );

            let composite = cfg.weight_concentration * c_score
                + cfg.weight_frequency * f_score
                + cfg.weight_dwell * d_score;
            let affinity_index = clamp_score(composite).round() as u32;

            affinities.insert(category.clone(), affinity_index);
            records.push(AffinityRecord {
                postal_code: zip_code.clone(),
                category: category.clone(),
                visits: agg.visits,
                unique_devices: agg.devices.len() as u64,
                avg_dwell_minutes: avg_dwell,
                frequency,
                concentration_score: c_score,
                frequency_score: f_score,
                dwell_score: d_score,
                affinity_index,
            });
        }

        profiles.push(build_profile(zip_code, zip.total_visits, affinities));
    }

    log::info!(
        "scoring: {} affinity records across {} zipcodes ({} devices matched, {} foreign, {} unmatched)",
        records.len(),
        profiles.len(),
        aggregation.coverage.matched_devices,
        aggregation.coverage.foreign_devices,
        aggregation.coverage.unmatched_domestic_devices
    );

    ScoreOutput {
        records,
        profiles,
        coverage: aggregation.coverage,
    }
}

fn build_profile(
    postal_code: &str,
    total_visits: u64,
    affinities: HashMap<String, u32>,
) -> ZipcodeProfile {
    // Top category by index, alphabetical tie-break for determinism
    let (top_category, top_affinity) = affinities
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(category, index)| (category.clone(), *index))
        .unwrap_or_default();

    ZipcodeProfile {
        postal_code: postal_code.to_string(),
        dominant_group: dominant_group(&affinities),
        top_category,
        top_affinity,
        total_visits,
        affinities,
    }
}

/// Group with the highest *average* affinity across the taxonomy, which is
/// deliberately not the same thing as the single top category.
pub fn dominant_group(affinities: &HashMap<String, u32>) -> String {
    let mut best: Option<(&str, f64)> = None;
    for (group, categories) in CATEGORY_GROUPS {
        let scores: Vec<f64> = categories
            .iter()
            .filter_map(|c| affinities.get(*c).map(|v| *v as f64))
            .collect();
        if scores.is_empty() {
            continue;
        }
        let avg = scores.iter().sum::<f64>() / scores.len() as f64;
        if best.map(|(_, b)| avg > b).unwrap_or(true) {
            best = Some((group, avg));
        }
    }
    best.map(|(group, _)| group.to_string())
        .unwrap_or_else(|| "other".to_string())
}
