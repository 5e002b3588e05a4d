//! Affinity Laboratory analysis engine
//!
//! Turns raw device-location pings into audience segments and postal-code
//! affinity profiles. The pipeline per run:
//!
//! 1. Spatial join: pings against POIs of interest on a fixed grid, grouped
//!    into visits (one per device x day x POI). One join per run, shared by
//!    every recipe in a batch.
//! 2. Recipe evaluation: pure in-memory matching of each device's visits
//!    against declarative multi-step recipes.
//! 3. Origin resolution and reverse geocoding: each matched device's home
//!    postal code, from the first ping of the day of its earliest visit.
//! 4. Scoring: concentration, frequency and dwell signals combined into a
//!    0-100 affinity index per (zipcode, category), plus zipcode profiles.
//!
//! All SQL runs on an external query engine behind the [`query::QueryExecutor`]
//! seam. Long date ranges use a resumable async flow that materializes the
//! join inside the engine; see [`run::phases`].

pub mod config;
pub mod error;
pub mod geo;
pub mod origin;
pub mod query;
pub mod recipe;
pub mod run;
pub mod scoring;
pub mod spatial;
pub mod store;
pub mod types;

pub use config::{LabConfig, RunRequest};
pub use error::{LabError, LabResult};
pub use run::{LabContext, RunOrchestrator, RunReport};
