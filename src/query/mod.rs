//! External SQL query executor seam
//!
//! The engine never runs SQL itself: it submits statements to an external
//! distributed engine, polls until a terminal state, then fetches paginated
//! rows. All waiting goes through `poll_until_complete`, a bounded loop with
//! a fixed interval and a hard attempt ceiling. Exceeding the ceiling is a
//! fatal timeout, never an infinite wait.

pub mod http;

use crate::error::{LabError, LabResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Opaque handle to a submitted query. Serializable so async-phase state can
/// persist handles across process invocations and re-poll them on resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryHandle(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryState::Succeeded | QueryState::Failed | QueryState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryStatus {
    pub state: QueryState,
    pub error: Option<String>,
}

/// One row as returned by the engine: column name -> JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// One page of results plus the continuation token, if any.
#[derive(Debug, Clone)]
pub struct Page {
    pub rows: Vec<Row>,
    pub next_token: Option<String>,
}

/// Submit / poll / fetch interface to the external query engine.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn submit(&self, sql: &str) -> LabResult<QueryHandle>;

    async fn poll(&self, handle: &QueryHandle) -> LabResult<QueryStatus>;

    /// Fetch one page of results. Callers must follow `next_token` to
    /// exhaustion; see `fetch_all`.
    async fn fetch_page(&self, handle: &QueryHandle, token: Option<&str>) -> LabResult<Page>;

    /// Submit a query whose result set is persisted as a new queryable
    /// table instead of returned inline.
    async fn submit_materializing(
        &self,
        select_sql: &str,
        output_table: &str,
    ) -> LabResult<QueryHandle>;

    async fn drop_table(&self, table: &str) -> LabResult<()>;

    /// Delete the storage backing a materialized table.
    async fn delete_materialized_data(&self, table: &str) -> LabResult<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2_000),
            max_attempts: 900,
        }
    }
}

impl PollConfig {
    pub fn from_lab_config(cfg: &crate::config::LabConfig) -> Self {
        Self {
            interval: Duration::from_millis(cfg.poll_interval_ms),
            max_attempts: cfg.poll_max_attempts,
        }
    }
}

/// Poll a handle until it reaches a terminal state.
///
/// Failed and cancelled queries surface the engine's error verbatim as
/// `QueryExecution`. Exceeding the attempt ceiling yields `QueryTimeout`
/// with the elapsed wall time.
pub async fn poll_until_complete(
    executor: &dyn QueryExecutor,
    handle: &QueryHandle,
    cfg: &PollConfig,
) -> LabResult<()> {
    let started = std::time::Instant::now();
    for attempt in 0..cfg.max_attempts {
        let status = executor.poll(handle).await?;
        match status.state {
            QueryState::Succeeded => return Ok(()),
            QueryState::Failed => {
                return Err(LabError::QueryExecution(
                    status.error.unwrap_or_else(|| "unknown engine error".to_string()),
                ));
            }
            QueryState::Cancelled => {
                return Err(LabError::QueryExecution(format!(
                    "query {} was cancelled by the engine",
                    handle.0
                )));
            }
            QueryState::Queued | QueryState::Running => {
                log::trace!(
                    "query {} still {:?} (poll {}/{})",
                    handle.0,
                    status.state,
                    attempt + 1,
                    cfg.max_attempts
                );
                tokio::time::sleep(cfg.interval).await;
            }
        }
    }
    Err(LabError::QueryTimeout {
        elapsed_secs: started.elapsed().as_secs(),
        attempts: cfg.max_attempts,
    })
}

/// Fetch every page of a completed query, following continuation tokens
/// until exhaustion.
pub async fn fetch_all(executor: &dyn QueryExecutor, handle: &QueryHandle) -> LabResult<Vec<Row>> {
    let mut rows = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = executor.fetch_page(handle, token.as_deref()).await?;
        rows.extend(page.rows);
        match page.next_token {
            Some(t) => token = Some(t),
            None => break,
        }
    }
    Ok(rows)
}

/// Submit, await, fetch. The workhorse for inline (non-materializing) reads.
pub async fn run_to_rows(
    executor: &dyn QueryExecutor,
    sql: &str,
    cfg: &PollConfig,
) -> LabResult<Vec<Row>> {
    let handle = executor.submit(sql).await?;
    poll_until_complete(executor, &handle, cfg).await?;
    fetch_all(executor, &handle).await
}

// Typed accessors for engine rows. Engines disagree on whether numerics come
// back as JSON numbers or strings, so both are accepted.

pub fn row_str<'a>(row: &'a Row, key: &str) -> Option<&'a str> {
    row.get(key).and_then(|v| v.as_str())
}

pub fn row_f64(row: &Row, key: &str) -> Option<f64> {
    match row.get(key)? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn row_i64(row: &Row, key: &str) -> Option<i64> {
    match row.get(key)? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Quote a string literal for SQL interpolation.
pub fn sql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Render a quoted, comma-separated IN-list.
pub fn sql_in_list<I, S>(values: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| sql_quote(v.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Executor that stays "running" forever. Exercises the poll ceiling.
    struct NeverFinishes {
        polls: AtomicU32,
    }

    #[async_trait]
    impl QueryExecutor for NeverFinishes {
        async fn submit(&self, _sql: &str) -> LabResult<QueryHandle> {
            Ok(QueryHandle("q1".to_string()))
        }

        async fn poll(&self, _handle: &QueryHandle) -> LabResult<QueryStatus> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Ok(QueryStatus {
                state: QueryState::Running,
                error: None,
            })
        }

        async fn fetch_page(&self, _handle: &QueryHandle, _token: Option<&str>) -> LabResult<Page> {
            Ok(Page {
                rows: vec![],
                next_token: None,
            })
        }

        async fn submit_materializing(
            &self,
            _select_sql: &str,
            _output_table: &str,
        ) -> LabResult<QueryHandle> {
            Ok(QueryHandle("q1".to_string()))
        }

        async fn drop_table(&self, _table: &str) -> LabResult<()> {
            Ok(())
        }

        async fn delete_materialized_data(&self, _table: &str) -> LabResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_poll_ceiling_is_fatal_timeout() {
        let exec = NeverFinishes {
            polls: AtomicU32::new(0),
        };
        let cfg = PollConfig {
            interval: Duration::from_millis(1),
            max_attempts: 5,
        };
        let handle = QueryHandle("q1".to_string());
        let err = poll_until_complete(&exec, &handle, &cfg).await.unwrap_err();
        match err {
            LabError::QueryTimeout { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(exec.polls.load(Ordering::SeqCst), 5);
    }

    /// Executor whose results span three pages.
    struct Paginated;

    #[async_trait]
    impl QueryExecutor for Paginated {
        async fn submit(&self, _sql: &str) -> LabResult<QueryHandle> {
            Ok(QueryHandle("pg".to_string()))
        }

        async fn poll(&self, _handle: &QueryHandle) -> LabResult<QueryStatus> {
            Ok(QueryStatus {
                state: QueryState::Succeeded,
                error: None,
            })
        }

        async fn fetch_page(&self, _handle: &QueryHandle, token: Option<&str>) -> LabResult<Page> {
            let mk_row = |i: u32| {
                let mut row = Row::new();
                row.insert("n".to_string(), serde_json::json!(i));
                row
            };
            let page = match token {
                None => Page {
                    rows: vec![mk_row(0), mk_row(1)],
                    next_token: Some("p2".to_string()),
                },
                Some("p2") => Page {
                    rows: vec![mk_row(2)],
                    next_token: Some("p3".to_string()),
                },
                _ => Page {
                    rows: vec![mk_row(3)],
                    next_token: None,
                },
            };
            Ok(page)
        }

        async fn submit_materializing(
            &self,
            _select_sql: &str,
            _output_table: &str,
        ) -> LabResult<QueryHandle> {
            Ok(QueryHandle("pg".to_string()))
        }

        async fn drop_table(&self, _table: &str) -> LabResult<()> {
            Ok(())
        }

        async fn delete_materialized_data(&self, _table: &str) -> LabResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fetch_all_follows_tokens_to_exhaustion() {
        let exec = Paginated;
        let rows = fetch_all(&exec, &QueryHandle("pg".to_string())).await.unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(row_i64(&rows[3], "n"), Some(3));
    }

    #[tokio::test]
    async fn test_failed_query_surfaces_engine_error() {
        struct Fails;

        #[async_trait]
        impl QueryExecutor for Fails {
            async fn submit(&self, _sql: &str) -> LabResult<QueryHandle> {
                Ok(QueryHandle("f".to_string()))
            }

            async fn poll(&self, _handle: &QueryHandle) -> LabResult<QueryStatus> {
                Ok(QueryStatus {
                    state: QueryState::Failed,
                    error: Some("TABLE_NOT_FOUND: pings_v3".to_string()),
                })
            }

            async fn fetch_page(
                &self,
                _handle: &QueryHandle,
                _token: Option<&str>,
            ) -> LabResult<Page> {
                unreachable!()
            }

            async fn submit_materializing(
                &self,
                _select_sql: &str,
                _output_table: &str,
            ) -> LabResult<QueryHandle> {
                Ok(QueryHandle("f".to_string()))
            }

            async fn drop_table(&self, _table: &str) -> LabResult<()> {
                Ok(())
            }

            async fn delete_materialized_data(&self, _table: &str) -> LabResult<()> {
                Ok(())
            }
        }

        let err = run_to_rows(&Fails, "SELECT 1", &PollConfig::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("TABLE_NOT_FOUND: pings_v3"));
    }

    #[test]
    fn test_sql_quote_escapes() {
        assert_eq!(sql_quote("a'b"), "'a''b'");
        assert_eq!(sql_in_list(["x", "y"]), "'x', 'y'");
    }
}
