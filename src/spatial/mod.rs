//! Spatial join of device pings against POIs of interest
//!
//! A naive all-pairs comparison is infeasible at billions of pings, so the
//! plane is partitioned into a fixed grid (default cell edge 0.01 degrees,
//! about 1.1 km). Every ping lands in one cell; every POI is expanded into
//! its own cell plus the 8 neighbors, so matches adjacent to a cell boundary
//! are not missed. Pings then equi-join the expanded POI-cell set on bucket
//! coordinates, reducing O(N x M) to O(N x k).
//!
//! The same algorithm exists twice on purpose: an in-memory core (sync runs
//! over bounded date ranges) and a generated SQL form (async materializing
//! runs at full scale). Both share cell math and grouping semantics.

pub mod grid;
pub mod join;
pub mod sql;

pub use join::{JoinOutput, JoinRequest, SpatialJoinEngine};

use crate::error::{LabError, LabResult};
use serde::{Deserialize, Serialize};

/// Meters per degree of latitude; also the equatorial meters per degree of
/// longitude used by the grid invariant check.
pub const METERS_PER_DEGREE: f64 = 111_320.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JoinConfig {
    /// Match radius around each POI, in meters
    pub radius_meters: f64,
    /// Grid cell edge, in degrees
    pub cell_size_degrees: f64,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            radius_meters: 200.0,
            cell_size_degrees: 0.01,
        }
    }
}

impl JoinConfig {
    /// Correctness invariant, not a tuning knob: the 9-cell POI expansion
    /// only covers the full search radius when one cell edge is at least
    /// the radius. Misconfiguration silently drops true matches near cell
    /// boundaries, so it is rejected up front.
    pub fn validate(&self) -> LabResult<()> {
        if self.radius_meters <= 0.0 {
            return Err(LabError::Configuration(format!(
                "radius_meters must be positive, got {}",
                self.radius_meters
            )));
        }
        if self.cell_size_degrees <= 0.0 {
            return Err(LabError::Configuration(format!(
                "cell_size_degrees must be positive, got {}",
                self.cell_size_degrees
            )));
        }
        let cell_meters = self.cell_size_degrees * METERS_PER_DEGREE;
        if cell_meters < self.radius_meters {
            return Err(LabError::Configuration(format!(
                "grid cell edge ({:.1} m) is smaller than the search radius ({:.1} m); \
                 matches near cell boundaries would be silently dropped",
                cell_meters, self.radius_meters
            )));
        }
        Ok(())
    }
}
