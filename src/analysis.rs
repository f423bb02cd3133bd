use std::collections::HashMap;

use serde::Serialize;

use crate::models::{StatusChangeEvent, TrackedField};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusFlow {
    pub old_status: Option<String>,
    pub new_status: Option<String>,
    pub transitions: usize,
    pub share_pct: f64,
    pub mean_hours_in_prior: Option<f64>,
}

/// Counts job status transitions per (old, new) pair, most frequent first.
pub fn status_flow(events: &[StatusChangeEvent]) -> Vec<StatusFlow> {
    let mut map: HashMap<(Option<String>, Option<String>), (usize, f64, usize)> = HashMap::new();

    for event in events.iter().filter(|event| event.field == TrackedField::Status) {
        let entry = map
            .entry((event.old_value.clone(), event.new_value.clone()))
            .or_insert((0, 0.0, 0));
        entry.0 += 1;
        if let Some(hours) = event.duration_hours {
            entry.1 += hours;
            entry.2 += 1;
        }
    }

    let total: usize = map.values().map(|(count, _, _)| count).sum();
    let mut flows: Vec<StatusFlow> = map
        .into_iter()
        .map(|((old_status, new_status), (count, hours, timed))| StatusFlow {
            old_status,
            new_status,
            transitions: count,
            share_pct: if total == 0 {
                0.0
            } else {
                count as f64 / total as f64 * 100.0
            },
            mean_hours_in_prior: (timed > 0).then(|| hours / timed as f64),
        })
        .collect();

    flows.sort_by(|a, b| {
        b.transitions
            .cmp(&a.transitions)
            .then_with(|| a.old_status.cmp(&b.old_status))
            .then_with(|| a.new_status.cmp(&b.new_status))
    });
    flows
}
