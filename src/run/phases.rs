//! Resumable three-phase async flow for long date ranges
//!
//! Phase 1 submits the materializing spatial join and the device count and
//! returns immediately. Phase 2 verifies the join finished and submits the
//! origin query against the materialized visits table. Phase 3 collects
//! everything, scores and cleans up. Between phases nothing runs: all state
//! needed to resume, including the engine query handles, is persisted as a
//! JSON blob keyed by (dataset, country), so any process can pick the run
//! back up.

use super::orchestrator::{group_by_device, join_request_for, RunOrchestrator, RunReport};
use super::progress::{Heartbeat, ProgressEvent, ProgressSink};
use crate::config::RunRequest;
use crate::error::{LabError, LabResult};
use crate::origin::{merge_origin_rows, OriginMap};
use crate::query::{self, PollConfig, QueryHandle, QueryState};
use crate::spatial::join::visit_from_row;
use crate::store::blob;
use crate::types::{RunState, Visit};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncPhase {
    JoinSubmitted,
    OriginsSubmitted,
}

/// Everything needed to resume an async run from another process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncRunState {
    pub run_id: String,
    pub request: RunRequest,
    pub phase: AsyncPhase,
    pub visits_table: String,
    pub origins_table: String,
    pub visits_handle: QueryHandle,
    pub count_handle: QueryHandle,
    pub origins_handle: Option<QueryHandle>,
}

pub fn state_key(dataset_id: &str, country: &str) -> String {
    format!("async_state/{}/{}", dataset_id, country)
}

fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

pub fn visits_table_name(req: &RunRequest) -> String {
    format!(
        "lab_visits_{}_{}",
        sanitize_identifier(&req.dataset_id),
        sanitize_identifier(&req.country)
    )
}

pub fn origins_table_name(req: &RunRequest) -> String {
    format!(
        "lab_origins_{}_{}",
        sanitize_identifier(&req.dataset_id),
        sanitize_identifier(&req.country)
    )
}

impl RunOrchestrator {
    async fn load_async_state(&self, dataset_id: &str, country: &str) -> LabResult<AsyncRunState> {
        blob::get_typed(self.context().blobs.as_ref(), &state_key(dataset_id, country))
            .await?
            .ok_or_else(|| {
                LabError::Configuration(format!(
                    "no async run in flight for {}/{}",
                    dataset_id, country
                ))
            })
    }

    async fn save_async_state(&self, state: &AsyncRunState) -> LabResult<()> {
        blob::put_typed(
            self.context().blobs.as_ref(),
            &state_key(&state.request.dataset_id, &state.request.country),
            state,
        )
        .await
    }

    /// Phase 1: submit the materializing join and the device count, persist
    /// the handles, return without waiting.
    pub async fn start_async(&self, req: &RunRequest) -> LabResult<AsyncRunState> {
        let run_id = self.claim_run(req).await?;
        let join_req = join_request_for(req);
        if join_req.categories.is_empty() {
            return Err(LabError::Configuration(
                "recipes reference no POI categories".to_string(),
            ));
        }

        let visits_table = visits_table_name(req);
        let executor = self.context().executor.as_ref();
        let visits_handle = executor
            .submit_materializing(&crate::spatial::sql::visits_select_sql(&join_req), &visits_table)
            .await?;
        let count_handle = executor
            .submit(&crate::spatial::sql::device_count_sql(&join_req))
            .await?;

        let state = AsyncRunState {
            run_id: run_id.clone(),
            request: req.clone(),
            phase: AsyncPhase::JoinSubmitted,
            visits_table,
            origins_table: origins_table_name(req),
            visits_handle,
            count_handle,
            origins_handle: None,
        };
        self.save_async_state(&state).await?;

        let mut status = self.fresh_status(req, &run_id, "async:join_submitted");
        self.update_status(&mut status, RunState::Running, "async:join_submitted", 10)
            .await?;
        log::info!(
            "async run {} started: join materializing into {}",
            run_id,
            state.visits_table
        );
        Ok(state)
    }

    /// Phase 2: if the join finished, submit the origin query against the
    /// materialized visits table. A join still in flight returns the state
    /// unchanged; callers retry later.
    pub async fn advance_async(
        &self,
        dataset_id: &str,
        country: &str,
    ) -> LabResult<AsyncRunState> {
        let mut state = self.load_async_state(dataset_id, country).await?;
        if self.cancel_requested(dataset_id, country).await {
            self.cancel_async(&state).await?;
            return Ok(state);
        }
        if state.phase != AsyncPhase::JoinSubmitted {
            return Ok(state);
        }

        let executor = self.context().executor.as_ref();
        let status = executor.poll(&state.visits_handle).await?;
        match status.state {
            QueryState::Queued | QueryState::Running => {
                log::debug!(
                    "async run {}: join still {:?}",
                    state.run_id,
                    status.state
                );
                return Ok(state);
            }
            QueryState::Failed | QueryState::Cancelled => {
                let message = status
                    .error
                    .unwrap_or_else(|| format!("join query ended {:?}", status.state));
                let mut run_status =
                    self.fresh_status(&state.request, &state.run_id, "async:join_submitted");
                self.update_status(&mut run_status, RunState::Failed, "async:join_failed", 100)
                    .await?;
                return Err(LabError::QueryExecution(message));
            }
            QueryState::Succeeded => {}
        }

        // One dataset-wide query against the small visits table, instead of
        // one batched query per 500 devices
        let join_req = join_request_for(&state.request);
        let origins_handle = executor
            .submit_materializing(
                &crate::spatial::sql::origins_select_sql(&join_req, &state.visits_table),
                &state.origins_table,
            )
            .await?;
        state.origins_handle = Some(origins_handle);
        state.phase = AsyncPhase::OriginsSubmitted;
        self.save_async_state(&state).await?;

        let mut run_status =
            self.fresh_status(&state.request, &state.run_id, "async:origins_submitted");
        self.update_status(
            &mut run_status,
            RunState::Running,
            "async:origins_submitted",
            40,
        )
        .await?;
        Ok(state)
    }

    /// Phase 3: wait for every outstanding query, pull the results down,
    /// score all recipes and clean up the materialized table and the state
    /// blob.
    pub async fn complete_async(
        &self,
        dataset_id: &str,
        country: &str,
        sink: Arc<dyn ProgressSink>,
    ) -> LabResult<RunReport> {
        let state = self.load_async_state(dataset_id, country).await?;
        if self.cancel_requested(dataset_id, country).await {
            self.cancel_async(&state).await?;
            sink.emit(&ProgressEvent::Cancelled {
                run_id: state.run_id.clone(),
            });
            return Ok(RunReport {
                run_id: state.run_id.clone(),
                state: RunState::Cancelled,
                results: Vec::new(),
                failed: Vec::new(),
                skipped: state
                    .request
                    .recipes
                    .iter()
                    .map(|r| r.name.clone())
                    .collect(),
            });
        }
        let Some(origins_handle) = state.origins_handle.clone() else {
            return Err(LabError::Configuration(
                "async run is not ready: origin query not yet submitted".to_string(),
            ));
        };

        let req = &state.request;
        let executor = self.context().executor.as_ref();
        let poll = PollConfig::from_lab_config(&self.context().config);
        let _heartbeat = Heartbeat::start(
            sink.clone(),
            Duration::from_millis(self.context().config.heartbeat_interval_ms),
        );
        let mut status = self.fresh_status(req, &state.run_id, "async:collect");
        self.update_status(&mut status, RunState::Running, "async:collect", 50)
            .await?;

        query::poll_until_complete(executor, &state.visits_handle, &poll).await?;
        query::poll_until_complete(executor, &state.count_handle, &poll).await?;
        query::poll_until_complete(executor, &origins_handle, &poll).await?;

        let count_rows = query::fetch_all(executor, &state.count_handle).await?;
        let total_devices = count_rows
            .first()
            .and_then(|row| query::row_i64(row, "device_count"))
            .ok_or_else(|| {
                LabError::QueryExecution("device count query returned no rows".to_string())
            })? as u64;

        let visit_rows = query::run_to_rows(
            executor,
            &format!(
                "SELECT device_id, visit_date, poi_id, category, dwell_minutes, \
                 visit_hour, ping_count FROM {}",
                state.visits_table
            ),
            &poll,
        )
        .await?;
        let visits: Vec<Visit> = visit_rows.iter().filter_map(visit_from_row).collect();
        if visits.len() < visit_rows.len() {
            log::warn!(
                "async run {}: skipped {} malformed visit rows",
                state.run_id,
                visit_rows.len() - visits.len()
            );
        }

        let origin_rows = query::run_to_rows(
            executor,
            &format!(
                "SELECT device_id, ping_date, lat, lng FROM {}",
                state.origins_table
            ),
            &poll,
        )
        .await?;
        let mut origins = OriginMap::new();
        merge_origin_rows(&mut origins, &origin_rows);
        log::info!(
            "async run {}: {} visits, {} device-day origins, {} total devices",
            state.run_id,
            visits.len(),
            origins.len(),
            total_devices
        );

        let visits_by_device = group_by_device(visits);
        let report = self
            .score_all(
                req,
                &state.run_id,
                &mut status,
                &visits_by_device,
                total_devices,
                Some(&origins),
                &sink,
            )
            .await?;

        self.cleanup_async(&state).await;
        Ok(report)
    }

    /// Honor an external cancel between phases: mark the run cancelled and
    /// tear everything down before any further engine work.
    async fn cancel_async(&self, state: &AsyncRunState) -> LabResult<()> {
        log::warn!(
            "async run {}: cancellation requested, stopping before the next phase",
            state.run_id
        );
        let mut run_status =
            self.fresh_status(&state.request, &state.run_id, "async:cancelled");
        self.update_status(&mut run_status, RunState::Cancelled, "async:cancelled", 100)
            .await?;
        self.cleanup_async(state).await;
        Ok(())
    }

    /// Best-effort teardown: a cleanup failure is logged, never fatal. An
    /// orphaned table costs storage, not correctness.
    async fn cleanup_async(&self, state: &AsyncRunState) {
        let executor = self.context().executor.as_ref();
        for table in [&state.visits_table, &state.origins_table] {
            if let Err(e) = executor.drop_table(table).await {
                log::warn!("could not drop table {}: {}", table, e);
            }
            if let Err(e) = executor.delete_materialized_data(table).await {
                log::warn!("could not delete data behind {}: {}", table, e);
            }
        }
        let key = state_key(&state.request.dataset_id, &state.request.country);
        if let Err(e) = self.context().blobs.delete(&key).await {
            log::warn!("could not delete async state {}: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Recipe, RecipeLogic, RecipeStep};

    fn request() -> RunRequest {
        RunRequest {
            dataset_id: "ds-1.prod".to_string(),
            country: "ES".to_string(),
            date_from: None,
            date_to: None,
            recipes: vec![Recipe {
                name: "gym_goers".to_string(),
                steps: vec![RecipeStep {
                    id: "s1".to_string(),
                    categories: ["gym".to_string()].into(),
                    time_window: None,
                    min_dwell_minutes: None,
                    max_dwell_minutes: None,
                    min_frequency: 1,
                }],
                logic: RecipeLogic::And,
                ordered: false,
            }],
            noise_floor: 5,
            radius_meters: 200.0,
            cell_size_degrees: 0.01,
        }
    }

    #[test]
    fn test_visits_table_name_is_sql_safe() {
        let name = visits_table_name(&request());
        assert_eq!(name, "lab_visits_ds_1_prod_es");
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }

    #[test]
    fn test_state_roundtrips_through_json() {
        let state = AsyncRunState {
            run_id: "run_1".to_string(),
            request: request(),
            phase: AsyncPhase::OriginsSubmitted,
            visits_table: "lab_visits_ds_1_prod_es".to_string(),
            origins_table: "lab_origins_ds_1_prod_es".to_string(),
            visits_handle: QueryHandle("q_visits".to_string()),
            count_handle: QueryHandle("q_count".to_string()),
            origins_handle: Some(QueryHandle("q_origins".to_string())),
        };
        let json = serde_json::to_string(&state).unwrap();
        let back: AsyncRunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.phase, AsyncPhase::OriginsSubmitted);
        assert_eq!(back.visits_handle, state.visits_handle);
        assert_eq!(back.origins_handle, state.origins_handle);
        assert_eq!(back.request.dataset_id, "ds-1.prod");
    }

    #[test]
    fn test_state_key_per_dataset_and_country() {
        assert_eq!(state_key("ds_1", "ES"), "async_state/ds_1/ES");
        assert_ne!(state_key("ds_1", "ES"), state_key("ds_1", "FR"));
    }
}
