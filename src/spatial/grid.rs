//! Grid cell math and the flat-earth distance approximation

use super::METERS_PER_DEGREE;
use crate::types::Poi;
use std::collections::HashMap;

pub type Cell = (i64, i64);

/// Cell containing a coordinate: `(floor(lat/step), floor(lng/step))`.
pub fn cell_for(lat: f64, lng: f64, step: f64) -> Cell {
    ((lat / step).floor() as i64, (lng / step).floor() as i64)
}

/// The 3x3 block centered on a cell.
pub fn neighbor_block(cell: Cell) -> [Cell; 9] {
    let (r, c) = cell;
    [
        (r - 1, c - 1),
        (r - 1, c),
        (r - 1, c + 1),
        (r, c - 1),
        (r, c),
        (r, c + 1),
        (r + 1, c - 1),
        (r + 1, c),
        (r + 1, c + 1),
    ]
}

/// Flat-earth distance in meters. Accurate to well under 1% at the sub-km
/// scales the join operates on, and far cheaper than full haversine.
pub fn flat_distance_meters(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let mean_lat = ((lat1 + lat2) / 2.0).to_radians();
    let dy = (lat2 - lat1) * METERS_PER_DEGREE;
    let dx = (lng2 - lng1) * METERS_PER_DEGREE * mean_lat.cos();
    (dx * dx + dy * dy).sqrt()
}

/// POI index: every POI is registered in its 3x3 cell block, so a ping only
/// ever probes its own cell.
pub struct GridIndex {
    cells: HashMap<Cell, Vec<usize>>,
    step: f64,
}

impl GridIndex {
    pub fn build(pois: &[Poi], step: f64) -> Self {
        let mut cells: HashMap<Cell, Vec<usize>> = HashMap::new();
        for (idx, poi) in pois.iter().enumerate() {
            for cell in neighbor_block(cell_for(poi.lat, poi.lng, step)) {
                cells.entry(cell).or_default().push(idx);
            }
        }
        Self { cells, step }
    }

    /// Nearest POI within `radius_meters` of the coordinate, if any.
    /// Ties resolve to the smallest distance; equal distances keep the
    /// first candidate in bucket order, which is deterministic.
    pub fn nearest_within(
        &self,
        lat: f64,
        lng: f64,
        radius_meters: f64,
        pois: &[Poi],
    ) -> Option<(usize, f64)> {
        let candidates = self.cells.get(&cell_for(lat, lng, self.step))?;
        let mut best: Option<(usize, f64)> = None;
        for &idx in candidates {
            let poi = &pois[idx];
            let dist = flat_distance_meters(lat, lng, poi.lat, poi.lng);
            if dist <= radius_meters {
                match best {
                    Some((_, best_dist)) if dist >= best_dist => {}
                    _ => best = Some((idx, dist)),
                }
            }
        }
        best
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poi(id: &str, lat: f64, lng: f64) -> Poi {
        Poi {
            id: id.to_string(),
            category: "gym".to_string(),
            lat,
            lng,
        }
    }

    #[test]
    fn test_cell_for_handles_negative_coordinates() {
        assert_eq!(cell_for(40.005, -3.705, 0.01), (4000, -371));
        assert_eq!(cell_for(-0.005, -0.005, 0.01), (-1, -1));
        assert_eq!(cell_for(0.0, 0.0, 0.01), (0, 0));
    }

    #[test]
    fn test_neighbor_block_has_nine_distinct_cells() {
        let block = neighbor_block((10, -5));
        assert_eq!(block.len(), 9);
        let unique: std::collections::HashSet<_> = block.iter().collect();
        assert_eq!(unique.len(), 9);
        assert!(block.contains(&(10, -5)));
        assert!(block.contains(&(9, -6)));
        assert!(block.contains(&(11, -4)));
    }

    #[test]
    fn test_flat_distance_one_degree_latitude() {
        let d = flat_distance_meters(40.0, -3.7, 41.0, -3.7);
        assert!((d - 111_320.0).abs() < 1.0, "got {}", d);
    }

    #[test]
    fn test_flat_distance_longitude_shrinks_with_latitude() {
        let at_equator = flat_distance_meters(0.0, 0.0, 0.0, 0.01);
        let at_madrid = flat_distance_meters(40.4, -3.70, 40.4, -3.69);
        assert!(at_madrid < at_equator);
        // cos(40.4 deg) ~ 0.761
        assert!((at_madrid / at_equator - 0.761).abs() < 0.01);
    }

    #[test]
    fn test_cross_boundary_match_found_via_expansion() {
        // POI sits just under a cell boundary; a ping just over it lands in
        // the adjacent cell, and must still see the POI as a candidate.
        let pois = vec![poi("p1", 40.00999, -3.7)];
        let index = GridIndex::build(&pois, 0.01);
        let hit = index.nearest_within(40.01001, -3.7, 200.0, &pois);
        assert!(hit.is_some(), "boundary-adjacent match was dropped");
        let (idx, dist) = hit.unwrap();
        assert_eq!(idx, 0);
        assert!(dist < 10.0);
    }

    #[test]
    fn test_nearest_wins_among_multiple_candidates() {
        let pois = vec![
            poi("far", 40.0010, -3.7),
            poi("near", 40.0002, -3.7),
            poi("mid", 40.0005, -3.7),
        ];
        let index = GridIndex::build(&pois, 0.01);
        let (idx, _) = index.nearest_within(40.0, -3.7, 200.0, &pois).unwrap();
        assert_eq!(pois[idx].id, "near");
    }

    #[test]
    fn test_out_of_radius_discarded() {
        let pois = vec![poi("p1", 40.0, -3.7)];
        let index = GridIndex::build(&pois, 0.01);
        // ~550 m north of the POI, same cell block but outside 200 m
        assert!(index.nearest_within(40.005, -3.7, 200.0, &pois).is_none());
    }
}
