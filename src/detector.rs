//! Field-level transition detection between consecutive snapshots.
//!
//! Detection is a pure function of the entity's prior state and the newly
//! written snapshot. Store backends call it inside the same transaction that
//! inserts the snapshot, so a committed snapshot always has its events.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::{EntityType, JobSnapshot, PoleSnapshot, StatusChangeEvent, TrackedField};

/// What the store knows about an entity strictly before a new observation.
#[derive(Debug, Clone)]
pub struct PriorState<T> {
    /// Snapshot with the greatest observation time below the new one.
    pub previous: Option<T>,
    pub first_observed_at: Option<DateTime<Utc>>,
    pub last_transitions: HashMap<TrackedField, DateTime<Utc>>,
}

impl<T> Default for PriorState<T> {
    fn default() -> Self {
        Self {
            previous: None,
            first_observed_at: None,
            last_transitions: HashMap::new(),
        }
    }
}

impl<T> PriorState<T> {
    fn duration_hours(&self, field: TrackedField, at: DateTime<Utc>) -> Option<f64> {
        let since = self
            .last_transitions
            .get(&field)
            .copied()
            .or(self.first_observed_at)?;
        Some(hours_between(since, at))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoleDetection {
    pub events: Vec<StatusChangeEvent>,
    /// Set when back-office completion was just reached and the row has no completion time.
    pub back_office_completed_at: Option<DateTime<Utc>>,
}

pub fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_seconds() as f64 / 3600.0
}

pub fn detect_job_changes(prior: &PriorState<JobSnapshot>, next: &JobSnapshot) -> Vec<StatusChangeEvent> {
    let Some(previous) = prior.previous.as_ref() else {
        return Vec::new();
    };

    if previous.status == next.status {
        return Vec::new();
    }

    vec![StatusChangeEvent {
        job_id: next.job_id.clone(),
        entity_type: EntityType::Job,
        entity_id: next.job_id.clone(),
        field: TrackedField::Status,
        old_value: previous.status.clone(),
        new_value: next.status.clone(),
        changed_at: next.observed_at,
        changed_by: next.status_actor().map(ToString::to_string),
        duration_hours: prior.duration_hours(TrackedField::Status, next.observed_at),
    }]
}

pub fn detect_pole_changes(prior: &PriorState<PoleSnapshot>, next: &PoleSnapshot) -> PoleDetection {
    let Some(previous) = prior.previous.as_ref() else {
        return PoleDetection::default();
    };

    let mut detection = PoleDetection::default();
    let dimensions = [
        (
            TrackedField::FieldCompleted,
            previous.field_completed,
            next.field_completed,
            next.field_completed_by.as_ref(),
        ),
        (
            TrackedField::BackOfficeCompleted,
            previous.back_office_completed,
            next.back_office_completed,
            next.back_office_completed_by.as_ref(),
        ),
    ];

    for (field, old, new, actor) in dimensions {
        if old == new {
            continue;
        }
        detection.events.push(StatusChangeEvent {
            job_id: next.job_id.clone(),
            entity_type: EntityType::Pole,
            entity_id: next.pole_id.clone(),
            field,
            old_value: Some(old.to_string()),
            new_value: Some(new.to_string()),
            changed_at: next.observed_at,
            changed_by: actor.cloned(),
            duration_hours: prior.duration_hours(field, next.observed_at),
        });

        if field == TrackedField::BackOfficeCompleted && new && next.back_office_completed_at.is_none() {
            detection.back_office_completed_at = Some(next.observed_at);
        }
    }

    detection
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeSet;

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::hours(i64::from(hour))
    }

    fn job(status: Option<&str>, at: DateTime<Utc>) -> JobSnapshot {
        JobSnapshot {
            job_id: "J".to_string(),
            status: status.map(ToString::to_string),
            utility: "Acme".to_string(),
            total_poles: 4,
            completed_poles: 0,
            field_complete: 0,
            back_office_complete: 0,
            assigned_users: BTreeSet::from(["maria".to_string()]),
            priority: None,
            target_date: None,
            observed_at: at,
        }
    }

    fn pole(field: bool, back_office: bool, at: DateTime<Utc>) -> PoleSnapshot {
        PoleSnapshot {
            job_id: "J".to_string(),
            pole_id: "P-1".to_string(),
            utility: Some("Acme".to_string()),
            field_completed: field,
            field_completed_by: field.then(|| "fiona".to_string()),
            field_completed_at: None,
            back_office_completed: back_office,
            back_office_completed_by: back_office.then(|| "bo".to_string()),
            back_office_completed_at: None,
            pole_height: None,
            pole_class: None,
            make_ready_status: None,
            observed_at: at,
        }
    }

    fn prior_of<T: Clone>(previous: &T, first: DateTime<Utc>) -> PriorState<T> {
        PriorState {
            previous: Some(previous.clone()),
            first_observed_at: Some(first),
            last_transitions: HashMap::new(),
        }
    }

    #[test]
    fn first_snapshot_yields_no_events() {
        let next = job(Some("Pending Field Collection"), t(0));
        assert!(detect_job_changes(&PriorState::default(), &next).is_empty());
        assert_eq!(
            detect_pole_changes(&PriorState::default(), &pole(true, true, t(0))),
            PoleDetection::default()
        );
    }

    #[test]
    fn status_change_reports_hours_since_first_observation() {
        let first = job(Some("Pending Field Collection"), t(0));
        let next = job(Some("Sent to PE"), t(30));
        let events = detect_job_changes(&prior_of(&first, t(0)), &next);

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.old_value.as_deref(), Some("Pending Field Collection"));
        assert_eq!(event.new_value.as_deref(), Some("Sent to PE"));
        assert_eq!(event.changed_at, t(30));
        assert_eq!(event.changed_by.as_deref(), Some("maria"));
        assert_eq!(event.duration_hours, Some(30.0));
    }

    #[test]
    fn duration_measures_from_previous_transition_of_same_field() {
        let previous = job(Some("QA Review"), t(10));
        let mut prior = prior_of(&previous, t(0));
        prior.last_transitions.insert(TrackedField::Status, t(6));

        let events = detect_job_changes(&prior, &job(Some("Approved"), t(12)));
        assert_eq!(events[0].duration_hours, Some(6.0));
    }

    #[test]
    fn absent_status_is_a_distinct_prior_value() {
        let previous = job(None, t(0));
        let events = detect_job_changes(&prior_of(&previous, t(0)), &job(Some("Sent to PE"), t(1)));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_value, None);
    }

    #[test]
    fn unchanged_status_is_ignored() {
        let previous = job(Some("QA Review"), t(0));
        assert!(detect_job_changes(&prior_of(&previous, t(0)), &job(Some("QA Review"), t(5))).is_empty());
    }

    #[test]
    fn pole_completions_credit_their_own_actor() {
        let previous = pole(false, false, t(0));
        let detection = detect_pole_changes(&prior_of(&previous, t(0)), &pole(true, true, t(8)));

        assert_eq!(detection.events.len(), 2);
        assert_eq!(detection.events[0].field, TrackedField::FieldCompleted);
        assert_eq!(detection.events[0].changed_by.as_deref(), Some("fiona"));
        assert_eq!(detection.events[1].field, TrackedField::BackOfficeCompleted);
        assert_eq!(detection.events[1].changed_by.as_deref(), Some("bo"));
        assert_eq!(detection.events[1].old_value.as_deref(), Some("false"));
        assert_eq!(detection.events[1].new_value.as_deref(), Some("true"));
        assert_eq!(detection.back_office_completed_at, Some(t(8)));
    }

    #[test]
    fn existing_back_office_time_is_not_overwritten() {
        let previous = pole(true, false, t(0));
        let mut next = pole(true, true, t(4));
        next.back_office_completed_at = Some(t(3));

        let detection = detect_pole_changes(&prior_of(&previous, t(0)), &next);
        assert_eq!(detection.events.len(), 1);
        assert_eq!(detection.back_office_completed_at, None);
    }

    #[test]
    fn reopening_is_logged_without_fill() {
        let previous = pole(true, true, t(0));
        let detection = detect_pole_changes(&prior_of(&previous, t(0)), &pole(true, false, t(2)));
        assert_eq!(detection.events.len(), 1);
        assert_eq!(detection.events[0].new_value.as_deref(), Some("false"));
        assert_eq!(detection.back_office_completed_at, None);
    }
}
