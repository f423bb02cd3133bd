use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};

use crate::models::{ProgressEvent, Role, UserDailySummary};

const COMPLETE: &str = "true";

/// Only not-complete to complete transitions count toward productivity.
pub fn is_forward_completion(old_value: Option<&str>, new_value: Option<&str>) -> bool {
    new_value == Some(COMPLETE) && old_value != Some(COMPLETE)
}

#[derive(Default)]
struct Rollup {
    transitions: BTreeSet<(String, DateTime<Utc>)>,
    utilities: BTreeSet<String>,
    jobs: BTreeSet<String>,
}

/// Rolls one day's completion events up into one row per (actor, role).
///
/// Each forward transition is counted on its own, so a pole completed,
/// reopened and completed again on the same day counts twice. Reversals and
/// events without an actor never contribute.
pub fn summarize_day(date: NaiveDate, events: &[ProgressEvent]) -> Vec<UserDailySummary> {
    let mut rollups: BTreeMap<(String, Role), Rollup> = BTreeMap::new();

    for progress in events {
        let event = &progress.event;
        if event.changed_at.date_naive() != date {
            continue;
        }
        let Some(role) = event.field.role() else {
            continue;
        };
        if !is_forward_completion(event.old_value.as_deref(), event.new_value.as_deref()) {
            continue;
        }
        let Some(user_id) = event.changed_by.as_ref() else {
            continue;
        };

        let entry = rollups.entry((user_id.clone(), role)).or_default();
        entry
            .transitions
            .insert((format!("{}/{}", event.job_id, event.entity_id), event.changed_at));
        entry.jobs.insert(event.job_id.clone());
        if let Some(utility) = progress.utility.as_ref() {
            entry.utilities.insert(utility.clone());
        }
    }

    rollups
        .into_iter()
        .map(|((user_id, role), rollup)| UserDailySummary {
            user_id,
            date,
            role,
            poles_completed: rollup.transitions.len() as i64,
            utilities: rollup.utilities.into_iter().collect(),
            jobs: rollup.jobs.into_iter().collect(),
        })
        .collect()
}
