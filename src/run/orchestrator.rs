//! Run orchestration: the synchronous single and batch flows
//!
//! Both flows share one spatial join per run. Batch mode unions the POI
//! categories of every recipe into that join, then evaluates each recipe
//! against the in-memory visit set, so adding a recipe to a batch costs no
//! additional engine scans. Cancellation is cooperative: the external
//! status record is re-read between recipes, never mid-recipe.

use super::output::{self, RecipeResult};
use super::progress::{Heartbeat, ProgressEvent, ProgressSink, RecipeSummary};
use crate::config::{LabConfig, RunRequest};
use crate::error::{LabError, LabResult};
use crate::geo::{countries, ReverseGeocoder};
use crate::origin::{apply_origins, OriginMap, OriginResolver};
use crate::query::{PollConfig, QueryExecutor};
use crate::recipe;
use crate::scoring::{self, GeocodedDevice, ScoringConfig};
use crate::spatial::join::{JoinRequest, SpatialJoinEngine};
use crate::spatial::JoinConfig;
use crate::store::{BlobStore, RunStatusStore};
use crate::types::{LabStats, Recipe, RunState, RunStatus, Visit};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything a run needs, bundled once at startup.
pub struct LabContext {
    pub executor: Arc<dyn QueryExecutor>,
    pub blobs: Arc<dyn BlobStore>,
    pub status: Arc<dyn RunStatusStore>,
    pub geocoder: Arc<ReverseGeocoder>,
    pub config: LabConfig,
}

/// Outcome of one run: per-recipe results plus the recipes that failed or
/// were skipped after a cancellation request.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub state: RunState,
    pub results: Vec<RecipeResult>,
    pub failed: Vec<(String, String)>,
    pub skipped: Vec<String>,
}

pub struct RunOrchestrator {
    ctx: LabContext,
}

/// Join request for a run: the union of every recipe's categories under the
/// request's country and date filters.
pub(crate) fn join_request_for(req: &RunRequest) -> JoinRequest {
    let categories: Vec<String> = req
        .recipes
        .iter()
        .flat_map(|r| r.category_union())
        .collect();
    let mut join_req = JoinRequest::new(
        &req.dataset_id,
        categories,
        JoinConfig {
            radius_meters: req.radius_meters,
            cell_size_degrees: req.cell_size_degrees,
        },
    );
    join_req.country = Some(req.country.clone());
    join_req.date_from = req.date_from;
    join_req.date_to = req.date_to;
    join_req
}

pub(crate) fn group_by_device(visits: Vec<Visit>) -> HashMap<String, Vec<Visit>> {
    let mut by_device: HashMap<String, Vec<Visit>> = HashMap::new();
    for visit in visits {
        by_device.entry(visit.device_id.clone()).or_default().push(visit);
    }
    by_device
}

impl RunOrchestrator {
    pub fn new(ctx: LabContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &LabContext {
        &self.ctx
    }

    fn poll(&self) -> PollConfig {
        PollConfig::from_lab_config(&self.ctx.config)
    }

    /// Validate the request and claim the (dataset, country) slot.
    ///
    /// A fresh "running" record belongs to a live process and blocks the
    /// claim. A stale one (no update within the staleness window, meaning
    /// heartbeat status writes stopped) is treated as abandoned and taken
    /// over.
    pub(crate) async fn claim_run(&self, req: &RunRequest) -> LabResult<String> {
        req.validate()?;
        if !countries::is_supported(&req.country) {
            return Err(LabError::Configuration(format!(
                "country '{}' is not supported",
                req.country
            )));
        }
        JoinConfig {
            radius_meters: req.radius_meters,
            cell_size_degrees: req.cell_size_degrees,
        }
        .validate()?;

        if let Some(existing) = self.ctx.status.get(&req.dataset_id, &req.country).await? {
            if existing.status == RunState::Running {
                let idle = Utc::now().timestamp() - existing.updated_at;
                if idle < self.ctx.config.stale_run_secs {
                    return Err(LabError::Configuration(format!(
                        "run {} for {}/{} is already in progress (updated {}s ago)",
                        existing.run_id, req.dataset_id, req.country, idle
                    )));
                }
                log::warn!(
                    "taking over run {} for {}/{}: no update for {}s",
                    existing.run_id,
                    req.dataset_id,
                    req.country,
                    idle
                );
            }
        }

        Ok(format!("run_{}", Utc::now().timestamp_millis()))
    }

    pub(crate) fn fresh_status(&self, req: &RunRequest, run_id: &str, phase: &str) -> RunStatus {
        RunStatus {
            run_id: run_id.to_string(),
            dataset_id: req.dataset_id.clone(),
            country: req.country.clone(),
            status: RunState::Running,
            phase: phase.to_string(),
            percent: 0,
            cancel_requested: false,
            completed_audiences: Vec::new(),
            updated_at: Utc::now().timestamp(),
        }
    }

    pub(crate) async fn update_status(
        &self,
        status: &mut RunStatus,
        state: RunState,
        phase: &str,
        percent: u8,
    ) -> LabResult<()> {
        status.status = state;
        status.phase = phase.to_string();
        status.percent = percent;
        status.updated_at = Utc::now().timestamp();
        self.ctx.status.put(status).await
    }

    /// Re-read the external record: has anyone flipped the cancel flag?
    /// Read failures are logged and treated as "not cancelled" so a flaky
    /// status store cannot kill an otherwise healthy run.
    pub(crate) async fn cancel_requested(&self, dataset_id: &str, country: &str) -> bool {
        match self.ctx.status.get(dataset_id, country).await {
            Ok(Some(s)) => s.cancel_requested,
            Ok(None) => false,
            Err(e) => {
                log::warn!("cancellation check failed, continuing: {}", e);
                false
            }
        }
    }

    /// Run one request synchronously: one spatial join, then evaluate and
    /// score every recipe against it.
    pub async fn run_sync(
        &self,
        req: &RunRequest,
        sink: Arc<dyn ProgressSink>,
    ) -> LabResult<RunReport> {
        let run_id = self.claim_run(req).await?;
        let mut status = self.fresh_status(req, &run_id, "spatial_join");
        self.ctx.status.put(&status).await?;
        sink.emit(&ProgressEvent::Started {
            run_id: run_id.clone(),
        });
        let _heartbeat = Heartbeat::start(
            sink.clone(),
            Duration::from_millis(self.ctx.config.heartbeat_interval_ms),
        );

        // Union of categories across every recipe: one join serves them all
        let join_req = join_request_for(req);
        let engine = SpatialJoinEngine::new(self.poll());
        let join = match engine.run(self.ctx.executor.as_ref(), &join_req).await {
            Ok(join) => join,
            Err(e) => {
                self.update_status(&mut status, RunState::Failed, "spatial_join", 100)
                    .await?;
                sink.emit(&ProgressEvent::Error {
                    run_id: run_id.clone(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        self.update_status(&mut status, RunState::Running, "recipes", 30)
            .await?;
        let visits_by_device = group_by_device(join.visits);

        self.score_all(
            req,
            &run_id,
            &mut status,
            &visits_by_device,
            join.total_devices,
            None,
            &sink,
        )
        .await
    }

    /// Evaluate and score every recipe of the request against the shared
    /// visit set. Used by the synchronous flow and by the final async phase.
    pub(crate) async fn score_all(
        &self,
        req: &RunRequest,
        run_id: &str,
        status: &mut RunStatus,
        visits_by_device: &HashMap<String, Vec<Visit>>,
        total_devices: u64,
        preloaded_origins: Option<&OriginMap>,
        sink: &Arc<dyn ProgressSink>,
    ) -> LabResult<RunReport> {
        let total = req.recipes.len();
        let mut results = Vec::new();
        let mut failed: Vec<(String, String)> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();
        let mut cancelled = false;

        for (i, recipe) in req.recipes.iter().enumerate() {
            if self.cancel_requested(&req.dataset_id, &req.country).await {
                log::warn!(
                    "run {}: cancellation requested, skipping {} remaining recipe(s)",
                    run_id,
                    total - i
                );
                skipped.extend(req.recipes[i..].iter().map(|r| r.name.clone()));
                cancelled = true;
                break;
            }

            let percent = (30 + i * 65 / total) as u8;
            self.update_status(
                status,
                RunState::Running,
                &format!("recipe:{}", recipe.name),
                percent,
            )
            .await?;
            sink.emit(&ProgressEvent::Progress {
                phase: "recipes".to_string(),
                current: (i + 1) as u32,
                total: total as u32,
                percent,
                message: format!("evaluating recipe '{}'", recipe.name),
            });

            match self
                .process_recipe(
                    req,
                    recipe,
                    run_id,
                    visits_by_device,
                    total_devices,
                    preloaded_origins,
                )
                .await
            {
                Ok(result) => {
                    status.completed_audiences.push(recipe.name.clone());
                    sink.emit(&ProgressEvent::RecipeCompleted {
                        recipe_name: recipe.name.clone(),
                        segment_size: result.stats.matched_devices,
                        scored_zipcodes: result.stats.scored_zipcodes,
                    });
                    results.push(result);
                }
                Err(e) => {
                    sink.emit(&ProgressEvent::RecipeFailed {
                        recipe_name: recipe.name.clone(),
                        message: e.to_string(),
                    });
                    if req.is_batch() {
                        // One bad recipe must not sink its siblings
                        log::error!("recipe '{}' failed: {}", recipe.name, e);
                        failed.push((recipe.name.clone(), e.to_string()));
                    } else {
                        self.update_status(status, RunState::Failed, "recipes", 100)
                            .await?;
                        sink.emit(&ProgressEvent::Error {
                            run_id: run_id.to_string(),
                            message: e.to_string(),
                        });
                        return Err(e);
                    }
                }
            }
        }

        let state = if cancelled {
            RunState::Cancelled
        } else if results.is_empty() && !failed.is_empty() {
            RunState::Failed
        } else {
            RunState::Completed
        };
        self.update_status(status, state, "done", 100).await?;
        if !results.is_empty() {
            sink.emit(&ProgressEvent::Result {
                run_id: run_id.to_string(),
                results: results
                    .iter()
                    .map(|r| RecipeSummary {
                        recipe_name: r.recipe_name.clone(),
                        segment_size: r.stats.matched_devices,
                        scored_zipcodes: r.stats.scored_zipcodes,
                    })
                    .collect(),
            });
        }
        match state {
            RunState::Completed => sink.emit(&ProgressEvent::Completed {
                run_id: run_id.to_string(),
            }),
            RunState::Cancelled => sink.emit(&ProgressEvent::Cancelled {
                run_id: run_id.to_string(),
            }),
            _ => sink.emit(&ProgressEvent::Error {
                run_id: run_id.to_string(),
                message: format!("{} recipe(s) failed", failed.len()),
            }),
        }

        Ok(RunReport {
            run_id: run_id.to_string(),
            state,
            results,
            failed,
            skipped,
        })
    }

    /// One recipe: evaluate membership, resolve origins, geocode each
    /// matched device's home and score by zipcode.
    async fn process_recipe(
        &self,
        req: &RunRequest,
        recipe: &Recipe,
        run_id: &str,
        visits_by_device: &HashMap<String, Vec<Visit>>,
        total_devices: u64,
        preloaded_origins: Option<&OriginMap>,
    ) -> LabResult<RecipeResult> {
        let started = Instant::now();
        let union = recipe.category_union();

        // Deterministic device order keeps runs reproducible
        let mut device_ids: Vec<&String> = visits_by_device.keys().collect();
        device_ids.sort();

        let mut segment = Vec::new();
        let mut matched: Vec<(String, Vec<Visit>)> = Vec::new();
        for device_id in device_ids {
            let visits = &visits_by_device[device_id];
            let outcome = recipe::evaluate(recipe, visits);
            if !outcome.matched {
                continue;
            }
            segment.push(recipe::build_segment_device(device_id, recipe, visits, &outcome));
            // Scoring only sees visits in the recipe's own categories; the
            // shared batch join may carry sibling recipes' categories too
            let relevant: Vec<Visit> = visits
                .iter()
                .filter(|v| union.contains(&v.category))
                .cloned()
                .collect();
            matched.push((device_id.clone(), relevant));
        }

        let matched_ids: Vec<String> = matched.iter().map(|(id, _)| id.clone()).collect();
        log::info!(
            "recipe '{}': {} of {} active devices matched",
            recipe.name,
            matched_ids.len(),
            visits_by_device.len()
        );

        let resolved;
        let origins: &OriginMap = match preloaded_origins {
            Some(map) => map,
            None => {
                resolved = OriginResolver::new(self.poll())
                    .resolve(self.ctx.executor.as_ref(), &req.dataset_id, &matched_ids)
                    .await;
                &resolved
            }
        };

        let mut geocoded: Vec<GeocodedDevice> = Vec::new();
        let mut unresolved = 0u64;
        let mut total_visits = 0u64;
        for (device_id, mut visits) in matched {
            total_visits += visits.len() as u64;
            visits.sort_by(|a, b| (a.date, a.visit_hour).cmp(&(b.date, b.visit_hour)));
            apply_origins(&mut visits, origins);
            // Home = where the device started the day of its earliest visit
            let home_coord = visits
                .iter()
                .find_map(|v| v.origin_lat.zip(v.origin_lng));
            match home_coord {
                Some((lat, lng)) => {
                    let home = self.ctx.geocoder.resolve(lat, lng).await;
                    geocoded.push(GeocodedDevice {
                        device_id,
                        home,
                        visits,
                    });
                }
                None => unresolved += 1,
            }
        }

        let scored = scoring::score(&geocoded, &ScoringConfig::with_noise_floor(req.noise_floor));
        let stats = LabStats {
            total_devices,
            matched_devices: matched_ids.len() as u64,
            total_visits,
            geocoded_devices: scored.coverage.matched_devices,
            foreign_devices: scored.coverage.foreign_devices,
            unmatched_domestic_devices: scored.coverage.unmatched_domestic_devices,
            unresolved_origin_devices: unresolved,
            scored_zipcodes: scored.profiles.len() as u64,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        let result = RecipeResult {
            run_id: run_id.to_string(),
            recipe_name: recipe.name.clone(),
            generated_at: Utc::now().timestamp(),
            stats,
            records: scored.records,
            profiles: scored.profiles,
        };
        output::persist_recipe_result(
            self.ctx.blobs.as_ref(),
            &req.dataset_id,
            &req.country,
            &result,
        )
        .await?;
        if req.is_batch() {
            output::export_segment_csv(
                Path::new(&self.ctx.config.export_dir),
                run_id,
                &recipe.name,
                &segment,
            )?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_by_device() {
        let mk = |device: &str| Visit {
            device_id: device.to_string(),
            date: chrono::NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            poi_id: "p".to_string(),
            category: "gym".to_string(),
            dwell_minutes: 5.0,
            visit_hour: 9,
            ping_count: 1,
            origin_lat: None,
            origin_lng: None,
        };
        let grouped = group_by_device(vec![mk("d1"), mk("d2"), mk("d1")]);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["d1"].len(), 2);
        assert_eq!(grouped["d2"].len(), 1);
    }
}
