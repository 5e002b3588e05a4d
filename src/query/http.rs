//! HTTP client for a SQL-over-HTTP query engine
//!
//! Endpoints (relative to the configured base URL):
//! - `POST /v1/queries` with `{"sql": ...}` (plus `"output_table"` for
//!   materializing queries) -> `{"query_id": ...}`
//! - `GET /v1/queries/{id}` -> `{"state": ..., "error": ...}`
//! - `GET /v1/queries/{id}/results?page_token=...` ->
//!   `{"rows": [...], "next_page_token": ...}`
//! - `DELETE /v1/tables/{name}` and `DELETE /v1/tables/{name}/data`

use super::{Page, QueryExecutor, QueryHandle, QueryState, QueryStatus, Row};
use crate::config::LabConfig;
use crate::error::{LabError, LabResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

pub struct HttpQueryExecutor {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct SubmitResponse {
    query_id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    state: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ResultsResponse {
    #[serde(default)]
    rows: Vec<Row>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl HttpQueryExecutor {
    pub fn new(base_url: &str, token: Option<String>) -> LabResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(cfg: &LabConfig) -> LabResult<Self> {
        Self::new(&cfg.engine_url, cfg.engine_token.clone())
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn check(&self, resp: reqwest::Response) -> LabResult<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(LabError::Configuration(format!(
                "query engine rejected credentials ({}): {}",
                status, body
            )));
        }
        Err(LabError::QueryExecution(format!(
            "engine returned {}: {}",
            status, body
        )))
    }

    fn parse_state(raw: &str) -> QueryState {
        match raw {
            "queued" | "pending" => QueryState::Queued,
            "running" => QueryState::Running,
            "succeeded" | "finished" => QueryState::Succeeded,
            "cancelled" | "canceled" => QueryState::Cancelled,
            _ => QueryState::Failed,
        }
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    async fn submit(&self, sql: &str) -> LabResult<QueryHandle> {
        let url = format!("{}/v1/queries", self.base_url);
        let resp = self
            .authed(self.client.post(&url))
            .json(&serde_json::json!({ "sql": sql }))
            .send()
            .await?;
        let resp = self.check(resp).await?;
        let body: SubmitResponse = resp.json().await?;
        log::debug!("submitted query {} ({} chars of SQL)", body.query_id, sql.len());
        Ok(QueryHandle(body.query_id))
    }

    async fn poll(&self, handle: &QueryHandle) -> LabResult<QueryStatus> {
        let url = format!("{}/v1/queries/{}", self.base_url, handle.0);
        let resp = self.authed(self.client.get(&url)).send().await?;
        let resp = self.check(resp).await?;
        let body: StatusResponse = resp.json().await?;
        Ok(QueryStatus {
            state: Self::parse_state(&body.state),
            error: body.error,
        })
    }

    async fn fetch_page(&self, handle: &QueryHandle, token: Option<&str>) -> LabResult<Page> {
        let mut url = format!("{}/v1/queries/{}/results", self.base_url, handle.0);
        if let Some(t) = token {
            url = format!("{}?page_token={}", url, t);
        }
        let resp = self.authed(self.client.get(&url)).send().await?;
        let resp = self.check(resp).await?;
        let body: ResultsResponse = resp.json().await?;
        Ok(Page {
            rows: body.rows,
            next_token: body.next_page_token,
        })
    }

    async fn submit_materializing(
        &self,
        select_sql: &str,
        output_table: &str,
    ) -> LabResult<QueryHandle> {
        let url = format!("{}/v1/queries", self.base_url);
        let resp = self
            .authed(self.client.post(&url))
            .json(&serde_json::json!({
                "sql": select_sql,
                "output_table": output_table,
            }))
            .send()
            .await?;
        let resp = self.check(resp).await?;
        let body: SubmitResponse = resp.json().await?;
        log::info!(
            "submitted materializing query {} -> table {}",
            body.query_id,
            output_table
        );
        Ok(QueryHandle(body.query_id))
    }

    async fn drop_table(&self, table: &str) -> LabResult<()> {
        let url = format!("{}/v1/tables/{}", self.base_url, table);
        let resp = self.authed(self.client.delete(&url)).send().await?;
        self.check(resp).await?;
        Ok(())
    }

    async fn delete_materialized_data(&self, table: &str) -> LabResult<()> {
        let url = format!("{}/v1/tables/{}/data", self.base_url, table);
        let resp = self.authed(self.client.delete(&url)).send().await?;
        self.check(resp).await?;
        Ok(())
    }
}
