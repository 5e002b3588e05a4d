//! Progress reporting for long-running analyses
//!
//! Sinks are infallible by contract: a sink that loses its transport logs
//! the failure and drops the event, and the run keeps going. Consumers that
//! stop listening must never stall or kill an analysis.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        run_id: String,
    },
    Progress {
        phase: String,
        current: u32,
        total: u32,
        percent: u8,
        message: String,
    },
    RecipeCompleted {
        recipe_name: String,
        segment_size: u64,
        scored_zipcodes: u64,
    },
    RecipeFailed {
        recipe_name: String,
        message: String,
    },
    /// Final result summary, emitted once all recipes are settled. Full
    /// records live in the result blobs; this carries the headline numbers.
    Result {
        run_id: String,
        results: Vec<RecipeSummary>,
    },
    Completed {
        run_id: String,
    },
    /// Terminal failure, published as `error` on the stream.
    Error {
        run_id: String,
        message: String,
    },
    Cancelled {
        run_id: String,
    },
    Heartbeat {
        timestamp: i64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RecipeSummary {
    pub recipe_name: String,
    pub segment_size: u64,
    pub scored_zipcodes: u64,
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// Default sink: one JSON line per event through the logger.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn emit(&self, event: &ProgressEvent) {
        match serde_json::to_string(event) {
            Ok(line) => log::info!("progress: {}", line),
            Err(e) => log::warn!("progress event not serializable: {}", e),
        }
    }
}

/// Emits heartbeat events on a fixed interval until dropped.
///
/// Keeps external watchers (and the staleness check of a competing launcher)
/// aware that the run is alive through long quiet stretches such as engine
/// polling.
pub struct Heartbeat {
    handle: tokio::task::JoinHandle<()>,
}

impl Heartbeat {
    pub fn start(sink: Arc<dyn ProgressSink>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                sink.emit(&ProgressEvent::Heartbeat {
                    timestamp: chrono::Utc::now().timestamp(),
                });
            }
        });
        Self { handle }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
