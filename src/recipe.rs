//! Pure recipe evaluation over one device's in-memory visits
//!
//! No I/O anywhere in this module: batch mode relies on evaluating many
//! recipes against the same visit set without touching the query engine
//! again.

use crate::types::{Recipe, RecipeLogic, RecipeStep, SegmentDevice, Visit};
use chrono::NaiveDate;
use std::collections::BTreeSet;

/// Result of matching one step against one device's visits.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub qualifying_count: u32,
    /// Date of the earliest qualifying visit, when any qualifies
    pub earliest_date: Option<NaiveDate>,
    pub matched: bool,
}

/// Does one visit satisfy a step's predicates (ignoring frequency)?
fn visit_qualifies(step: &RecipeStep, visit: &Visit) -> bool {
    if !step.categories.contains(&visit.category) {
        return false;
    }
    if let Some(window) = &step.time_window {
        if !window.contains(visit.visit_hour) {
            return false;
        }
    }
    if let Some(min) = step.min_dwell_minutes {
        if visit.dwell_minutes < min {
            return false;
        }
    }
    if let Some(max) = step.max_dwell_minutes {
        if visit.dwell_minutes > max {
            return false;
        }
    }
    true
}

/// Match a step: qualifying visits are those passing category, window and
/// dwell predicates; the step matches iff their count reaches
/// `min_frequency`.
pub fn match_step(step: &RecipeStep, visits: &[Visit]) -> StepOutcome {
    let mut qualifying_count = 0u32;
    let mut earliest_date: Option<NaiveDate> = None;

    for visit in visits {
        if visit_qualifies(step, visit) {
            qualifying_count += 1;
            earliest_date = Some(match earliest_date {
                Some(d) => d.min(visit.date),
                None => visit.date,
            });
        }
    }

    StepOutcome {
        qualifying_count,
        earliest_date,
        matched: qualifying_count >= step.min_frequency.max(1),
    }
}

#[derive(Debug, Clone)]
pub struct RecipeOutcome {
    pub matched: bool,
    pub matched_step_count: u32,
}

/// Evaluate a full recipe against one device's visits.
///
/// AND: every step matches; with `ordered`, each step's earliest qualifying
/// date must additionally be <= the next step's (same-day is ordered).
/// OR: any step matches.
pub fn evaluate(recipe: &Recipe, visits: &[Visit]) -> RecipeOutcome {
    let outcomes: Vec<StepOutcome> = recipe
        .steps
        .iter()
        .map(|step| match_step(step, visits))
        .collect();

    let matched_step_count = outcomes.iter().filter(|o| o.matched).count() as u32;

    let matched = match recipe.logic {
        RecipeLogic::Or => matched_step_count > 0,
        RecipeLogic::And => {
            let all = matched_step_count == recipe.steps.len() as u32;
            if !all {
                false
            } else if recipe.ordered {
                ordered_dates_hold(&outcomes)
            } else {
                true
            }
        }
    };

    RecipeOutcome {
        matched,
        matched_step_count,
    }
}

fn ordered_dates_hold(outcomes: &[StepOutcome]) -> bool {
    let mut prev: Option<NaiveDate> = None;
    for outcome in outcomes {
        // All steps matched already, so earliest_date is present
        let Some(date) = outcome.earliest_date else {
            return false;
        };
        if let Some(p) = prev {
            if date < p {
                return false;
            }
        }
        prev = Some(date);
    }
    true
}

/// Segment record for a matched device: stats over its visits in the
/// recipe's category union.
pub fn build_segment_device(
    device_id: &str,
    recipe: &Recipe,
    visits: &[Visit],
    outcome: &RecipeOutcome,
) -> SegmentDevice {
    let union = recipe.category_union();
    let relevant: Vec<&Visit> = visits
        .iter()
        .filter(|v| union.contains(&v.category))
        .collect();

    let total_visits = relevant.len() as u32;
    let avg_dwell_minutes = if relevant.is_empty() {
        0.0
    } else {
        relevant.iter().map(|v| v.dwell_minutes).sum::<f64>() / relevant.len() as f64
    };
    let categories_visited: BTreeSet<String> =
        relevant.iter().map(|v| v.category.clone()).collect();

    SegmentDevice {
        device_id: device_id.to_string(),
        matched_step_count: outcome.matched_step_count,
        total_visits,
        avg_dwell_minutes,
        categories_visited: categories_visited.into_iter().collect(),
    }
}
