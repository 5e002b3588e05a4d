//! Error taxonomy for the analysis engine
//!
//! Fatal errors (configuration, query execution, poll timeout) abort the
//! current run or recipe. Best-effort paths (origin batches, result
//! persistence, temp-table cleanup) log and continue instead of returning
//! these.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabError {
    /// Missing credentials, unsupported country, invalid grid/radius setup.
    /// Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The external query engine reported a failure. Surfaced verbatim.
    #[error("query execution failed: {0}")]
    QueryExecution(String),

    /// The poll ceiling was exceeded while waiting on a query.
    #[error("query timed out after {elapsed_secs}s ({attempts} polls)")]
    QueryTimeout { elapsed_secs: u64, attempts: u32 },

    /// Boundary polygon data could not be loaded or parsed.
    #[error("geo data error: {0}")]
    Geo(String),

    /// Blob or result storage failure.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("run status store error: {0}")]
    StatusStore(#[from] rusqlite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv export error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type LabResult<T> = Result<T, LabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_includes_elapsed() {
        let err = LabError::QueryTimeout {
            elapsed_secs: 1800,
            attempts: 900,
        };
        let msg = err.to_string();
        assert!(msg.contains("1800s"), "expected elapsed time in: {}", msg);
        assert!(msg.contains("900 polls"), "expected attempts in: {}", msg);
    }

    #[test]
    fn test_query_failure_surfaced_verbatim() {
        let err = LabError::QueryExecution("SYNTAX_ERROR at line 3".to_string());
        assert!(err.to_string().contains("SYNTAX_ERROR at line 3"));
    }
}
