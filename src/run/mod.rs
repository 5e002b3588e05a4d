//! Run orchestration: synchronous single and batch flows, the resumable
//! async three-phase flow, progress reporting and result persistence.

pub mod orchestrator;
pub mod output;
pub mod phases;
pub mod progress;

pub use orchestrator::{LabContext, RunOrchestrator, RunReport};
pub use output::RecipeResult;
pub use phases::{AsyncPhase, AsyncRunState};
pub use progress::{LogSink, ProgressEvent, ProgressSink, RecipeSummary};
