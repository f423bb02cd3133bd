use std::collections::{BTreeMap, BTreeSet};

use chrono::{Duration, NaiveDate};

use crate::models::{BurndownMetric, JobSnapshot};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BurndownConfig {
    /// Poles one resource is expected to finish per day.
    pub daily_capacity: f64,
    pub trailing_days: i64,
    /// Floor applied to the trailing rate before extrapolating.
    pub rate_epsilon: f64,
}

impl Default for BurndownConfig {
    fn default() -> Self {
        Self {
            daily_capacity: 30.0,
            trailing_days: 30,
            rate_epsilon: 0.001,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtilityRollup {
    pub utility: String,
    pub total_poles: i64,
    /// Field plus back-office completions, before capping at the total.
    pub reported_completed: i64,
    pub assigned_users: BTreeSet<String>,
}

impl UtilityRollup {
    pub fn completed_poles(&self) -> i64 {
        self.reported_completed.clamp(0, self.total_poles.max(0))
    }
}

/// Groups the day's job snapshots by utility.
pub fn rollup_by_utility(jobs: &[JobSnapshot]) -> Vec<UtilityRollup> {
    let mut rollups: BTreeMap<&str, UtilityRollup> = BTreeMap::new();

    for job in jobs {
        let entry = rollups.entry(job.utility.as_str()).or_insert_with(|| UtilityRollup {
            utility: job.utility.clone(),
            ..UtilityRollup::default()
        });
        entry.total_poles += i64::from(job.total_poles);
        entry.reported_completed += i64::from(job.field_complete) + i64::from(job.back_office_complete);
        entry.assigned_users.extend(job.assigned_users.iter().cloned());
    }

    rollups.into_values().collect()
}

pub fn run_rate(total_poles: i64, completed_poles: i64) -> f64 {
    if total_poles <= 0 {
        return 0.0;
    }
    completed_poles.max(0) as f64 / total_poles as f64
}

pub fn remaining_work(total_poles: i64, completed_poles: i64) -> i64 {
    (total_poles - completed_poles).max(0)
}

/// Completions per day against the oldest prior row inside the trailing window.
pub fn trailing_rate(
    date: NaiveDate,
    completed_poles: i64,
    prior: &[BurndownMetric],
    trailing_days: i64,
) -> f64 {
    let window_start = window_start(date, trailing_days);
    let oldest = prior
        .iter()
        .filter(|metric| metric.date >= window_start && metric.date < date)
        .min_by_key(|metric| metric.date);

    let Some(oldest) = oldest else {
        return 0.0;
    };
    let days = (date - oldest.date).num_days();
    if days <= 0 {
        return 0.0;
    }
    ((completed_poles - oldest.completed_poles) as f64 / days as f64).max(0.0)
}

pub fn projected_completion(
    date: NaiveDate,
    total_poles: i64,
    completed_poles: i64,
    trailing_rate: f64,
    rate_epsilon: f64,
) -> Option<NaiveDate> {
    if total_poles <= 0 || run_rate(total_poles, completed_poles) == 0.0 {
        return None;
    }
    let remaining = remaining_work(total_poles, completed_poles);
    if remaining == 0 {
        return Some(date);
    }

    let rate = if trailing_rate.is_finite() {
        trailing_rate.max(rate_epsilon)
    } else {
        rate_epsilon
    };
    let days = (remaining as f64 / rate).ceil();
    if !days.is_finite() || days > i64::MAX as f64 {
        return None;
    }
    Duration::try_days(days as i64).and_then(|offset| date.checked_add_signed(offset))
}

pub fn required_resources(remaining: i64, daily_capacity: f64) -> i64 {
    if remaining <= 0 || daily_capacity <= 0.0 {
        return 0;
    }
    (remaining as f64 / daily_capacity).ceil() as i64
}

pub fn window_start(date: NaiveDate, trailing_days: i64) -> NaiveDate {
    date - Duration::days(trailing_days.max(1))
}

pub fn compute_metric(
    date: NaiveDate,
    rollup: &UtilityRollup,
    prior: &[BurndownMetric],
    config: &BurndownConfig,
) -> BurndownMetric {
    let total_poles = rollup.total_poles.max(0);
    let completed_poles = rollup.completed_poles();
    let remaining = remaining_work(total_poles, completed_poles);
    let trailing = trailing_rate(date, completed_poles, prior, config.trailing_days);

    BurndownMetric {
        utility: rollup.utility.clone(),
        date,
        total_poles,
        completed_poles,
        run_rate: run_rate(total_poles, completed_poles),
        trailing_rate: trailing,
        projected_completion: projected_completion(
            date,
            total_poles,
            completed_poles,
            trailing,
            config.rate_epsilon,
        ),
        actual_resources: rollup.assigned_users.len() as i64,
        required_resources: required_resources(remaining, config.daily_capacity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, day).unwrap()
    }

    fn prior(date: NaiveDate, completed: i64) -> BurndownMetric {
        BurndownMetric {
            utility: "Acme".to_string(),
            date,
            total_poles: 100,
            completed_poles: completed,
            run_rate: completed as f64 / 100.0,
            trailing_rate: 0.0,
            projected_completion: None,
            actual_resources: 0,
            required_resources: 0,
        }
    }

    fn job(id: &str, utility: &str, total: i32, field: i32, back_office: i32, users: &[&str]) -> JobSnapshot {
        JobSnapshot {
            job_id: id.to_string(),
            status: None,
            utility: utility.to_string(),
            total_poles: total,
            completed_poles: field,
            field_complete: field,
            back_office_complete: back_office,
            assigned_users: users.iter().map(|user| user.to_string()).collect(),
            priority: None,
            target_date: None,
            observed_at: Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap(),
        }
    }

    #[test]
    fn projection_matches_trailing_rate() {
        assert_eq!(projected_completion(d(1), 100, 40, 5.0, 0.001), Some(d(13)));
    }

    #[test]
    fn zero_total_has_zero_rate_and_no_projection() {
        assert_eq!(run_rate(0, 0), 0.0);
        assert_eq!(run_rate(0, 12), 0.0);
        assert_eq!(projected_completion(d(1), 0, 0, 5.0, 0.001), None);
    }

    #[test]
    fn no_completions_means_no_projection() {
        assert_eq!(projected_completion(d(1), 50, 0, 3.0, 0.001), None);
    }

    #[test]
    fn anomalous_completion_is_clamped() {
        assert_eq!(remaining_work(10, 14), 0);
        assert_eq!(required_resources(remaining_work(10, 14), 30.0), 0);
        assert_eq!(projected_completion(d(1), 10, 14, 0.0, 0.001), Some(d(1)));
    }

    #[test]
    fn stalled_rate_falls_back_to_epsilon() {
        let projected = projected_completion(d(1), 100, 99, 0.0, 0.5).unwrap();
        assert_eq!(projected, d(3));
    }

    #[test]
    fn huge_extrapolations_are_undefined_instead_of_overflowing() {
        assert_eq!(projected_completion(d(1), i64::MAX, 1, 0.0, 1e-12), None);
    }

    #[test]
    fn trailing_rate_uses_oldest_row_in_window() {
        let history = vec![prior(d(1), 10), prior(d(5), 30), prior(d(9), 38)];
        assert!((trailing_rate(d(11), 40, &history, 30) - 3.0).abs() < 1e-9);
        assert!((trailing_rate(d(11), 40, &history, 4) - 1.0).abs() < 1e-9);
        assert_eq!(trailing_rate(d(11), 40, &[], 30), 0.0);
    }

    #[test]
    fn trailing_rate_ignores_same_day_and_regressions() {
        assert_eq!(trailing_rate(d(5), 40, &[prior(d(5), 10)], 30), 0.0);
        assert_eq!(trailing_rate(d(6), 5, &[prior(d(5), 10)], 30), 0.0);
    }

    #[test]
    fn rollup_caps_completed_at_total_and_counts_distinct_users() {
        let jobs = vec![
            job("J-1", "Acme", 10, 8, 6, &["ana", "ben"]),
            job("J-2", "Acme", 5, 0, 0, &["ben"]),
            job("J-3", "Zeta", 0, 0, 0, &[]),
        ];
        let rollups = rollup_by_utility(&jobs);

        assert_eq!(rollups.len(), 2);
        assert_eq!(rollups[0].utility, "Acme");
        assert_eq!(rollups[0].total_poles, 15);
        assert_eq!(rollups[0].reported_completed, 14);
        assert_eq!(rollups[0].completed_poles(), 14);
        assert_eq!(rollups[0].assigned_users.len(), 2);

        let over = UtilityRollup {
            utility: "Acme".to_string(),
            total_poles: 10,
            reported_completed: 25,
            assigned_users: BTreeSet::new(),
        };
        assert_eq!(over.completed_poles(), 10);
    }

    #[test]
    fn metric_combines_all_measures() {
        let rollup = UtilityRollup {
            utility: "Acme".to_string(),
            total_poles: 100,
            reported_completed: 40,
            assigned_users: BTreeSet::from(["ana".to_string()]),
        };
        let history = vec![prior(d(1), 20)];
        let metric = compute_metric(d(5), &rollup, &history, &BurndownConfig::default());

        assert_eq!(metric.completed_poles, 40);
        assert!((metric.run_rate - 0.4).abs() < 1e-9);
        assert!((metric.trailing_rate - 5.0).abs() < 1e-9);
        assert_eq!(metric.projected_completion, Some(d(17)));
        assert_eq!(metric.actual_resources, 1);
        assert_eq!(metric.required_resources, 2);
    }
}
