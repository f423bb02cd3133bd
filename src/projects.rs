use std::collections::HashMap;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::burndown::{self, BurndownConfig};
use crate::error::MetricsResult;
use crate::models::{JobSnapshot, Project};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProjectStatus {
    NotStarted,
    Completed,
    BehindSchedule,
    OnTrack,
    AtRisk,
}

impl ProjectStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::NotStarted => "Not Started",
            Self::Completed => "Completed",
            Self::BehindSchedule => "Behind Schedule",
            Self::OnTrack => "On Track",
            Self::AtRisk => "At Risk",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectProgress {
    pub project_id: String,
    pub as_of: NaiveDate,
    pub jobs: usize,
    pub total_poles: i64,
    pub completed_poles: i64,
    pub progress: f64,
    pub current_daily_rate: f64,
    pub required_daily_rate: f64,
    pub projected_completion: Option<NaiveDate>,
    pub status: ProjectStatus,
}

/// Daily rate needed to finish the remaining work by the target date. Once
/// the target is reached, all remaining work is due at once.
pub fn required_daily_rate(remaining: i64, as_of: NaiveDate, target_date: Option<NaiveDate>) -> f64 {
    let Some(target) = target_date else {
        return 0.0;
    };
    if remaining <= 0 {
        return 0.0;
    }
    let days_left = (target - as_of).num_days().max(1);
    remaining as f64 / days_left as f64
}

pub fn classify(
    total_poles: i64,
    progress: f64,
    as_of: NaiveDate,
    target_date: Option<NaiveDate>,
    current_rate: f64,
    required_rate: f64,
) -> ProjectStatus {
    if total_poles <= 0 {
        return ProjectStatus::NotStarted;
    }
    if progress >= 1.0 {
        return ProjectStatus::Completed;
    }
    // Unfinished on or after the target date.
    if target_date.is_some_and(|target| target <= as_of) {
        return ProjectStatus::BehindSchedule;
    }
    if current_rate >= required_rate {
        ProjectStatus::OnTrack
    } else {
        ProjectStatus::AtRisk
    }
}

fn completed_of(job: &JobSnapshot) -> i64 {
    (i64::from(job.field_complete) + i64::from(job.back_office_complete)).clamp(0, i64::from(job.total_poles.max(0)))
}

/// Builds progress from the latest job snapshots now and at the start of the trailing window.
pub fn progress_for(
    project: &Project,
    as_of: NaiveDate,
    current: &[JobSnapshot],
    window_start: &[JobSnapshot],
    config: &BurndownConfig,
) -> ProjectProgress {
    let total_poles: i64 = current.iter().map(|job| i64::from(job.total_poles.max(0))).sum();
    let completed_poles: i64 = current.iter().map(completed_of).sum::<i64>().min(total_poles);

    let earlier: HashMap<&str, i64> = window_start
        .iter()
        .map(|job| (job.job_id.as_str(), completed_of(job)))
        .collect();
    let delta: i64 = current
        .iter()
        .filter_map(|job| earlier.get(job.job_id.as_str()).map(|before| completed_of(job) - before))
        .sum();
    let current_daily_rate = (delta as f64 / config.trailing_days.max(1) as f64).max(0.0);

    let progress = if total_poles > 0 {
        completed_poles as f64 / total_poles as f64
    } else {
        0.0
    };
    let remaining = burndown::remaining_work(total_poles, completed_poles);
    let required = required_daily_rate(remaining, as_of, project.target_date);

    ProjectProgress {
        project_id: project.project_id.clone(),
        as_of,
        jobs: current.len(),
        total_poles,
        completed_poles,
        progress,
        current_daily_rate,
        required_daily_rate: required,
        projected_completion: burndown::projected_completion(
            as_of,
            total_poles,
            completed_poles,
            current_daily_rate,
            config.rate_epsilon,
        ),
        status: classify(
            total_poles,
            progress,
            as_of,
            project.target_date,
            current_daily_rate,
            required,
        ),
    }
}

/// Reads a project tracker export.
pub fn read_projects_csv(path: &Path) -> MetricsResult<Vec<Project>> {
    #[derive(Deserialize)]
    struct CsvRow {
        project_id: String,
        name: String,
        utility: Option<String>,
        zone: Option<String>,
        target_date: Option<NaiveDate>,
        field_resources: Option<i32>,
        back_office_resources: Option<i32>,
    }

    let mut reader = csv::Reader::from_path(path)?;
    let mut projects = Vec::new();

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        projects.push(Project {
            project_id: row.project_id.trim().to_string(),
            name: row.name,
            utility: row.utility.filter(|value| !value.trim().is_empty()),
            zone: row.zone.filter(|value| !value.trim().is_empty()),
            target_date: row.target_date,
            field_resources: row.field_resources.unwrap_or(0),
            back_office_resources: row.back_office_resources.unwrap_or(0),
        });
    }

    Ok(projects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::io::Write;

    fn d(month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, month, day).unwrap()
    }

    fn job(id: &str, total: i32, field: i32, back_office: i32) -> JobSnapshot {
        JobSnapshot {
            job_id: id.to_string(),
            status: None,
            utility: "Acme".to_string(),
            total_poles: total,
            completed_poles: field,
            field_complete: field,
            back_office_complete: back_office,
            assigned_users: Default::default(),
            priority: None,
            target_date: None,
            observed_at: Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
        }
    }

    fn project(target: Option<NaiveDate>) -> Project {
        Project {
            project_id: "PRJ-1".to_string(),
            name: "North Zone".to_string(),
            utility: Some("Acme".to_string()),
            zone: Some("North".to_string()),
            target_date: target,
            field_resources: 2,
            back_office_resources: 1,
        }
    }

    #[test]
    fn classification_follows_progress_and_dates() {
        let today = d(6, 1);
        assert_eq!(classify(0, 0.0, today, None, 0.0, 0.0), ProjectStatus::NotStarted);
        assert_eq!(classify(10, 1.0, today, Some(d(5, 1)), 0.0, 0.0), ProjectStatus::Completed);
        assert_eq!(classify(10, 0.5, today, Some(d(5, 1)), 9.0, 1.0), ProjectStatus::BehindSchedule);
        assert_eq!(classify(10, 0.5, today, Some(today), 9.0, 5.0), ProjectStatus::BehindSchedule);
        assert_eq!(classify(10, 0.5, today, Some(d(7, 1)), 2.0, 1.0), ProjectStatus::OnTrack);
        assert_eq!(classify(10, 0.5, today, Some(d(7, 1)), 0.5, 1.0), ProjectStatus::AtRisk);
    }

    #[test]
    fn required_rate_spreads_remaining_over_days_left() {
        assert!((required_daily_rate(60, d(6, 1), Some(d(6, 11))) - 6.0).abs() < 1e-9);
        assert_eq!(required_daily_rate(60, d(6, 1), Some(d(5, 1))), 60.0);
        assert_eq!(required_daily_rate(60, d(6, 1), Some(d(6, 1))), 60.0);
        assert_eq!(required_daily_rate(0, d(6, 1), Some(d(6, 1))), 0.0);
        assert_eq!(required_daily_rate(60, d(6, 1), None), 0.0);
    }

    #[test]
    fn unfinished_project_due_today_is_behind() {
        let as_of = d(6, 11);
        let current = vec![job("J-1", 100, 40, 0)];
        let progress = progress_for(&project(Some(as_of)), as_of, &current, &[], &BurndownConfig::default());

        assert_eq!(progress.current_daily_rate, 0.0);
        assert_eq!(progress.required_daily_rate, 60.0);
        assert_eq!(progress.status, ProjectStatus::BehindSchedule);
    }

    #[test]
    fn finished_project_due_today_is_completed() {
        let as_of = d(6, 11);
        let current = vec![job("J-1", 100, 70, 30)];
        let progress = progress_for(&project(Some(as_of)), as_of, &current, &[], &BurndownConfig::default());
        assert_eq!(progress.status, ProjectStatus::Completed);
    }

    #[test]
    fn progress_uses_only_jobs_seen_at_window_start_for_rate() {
        let config = BurndownConfig {
            trailing_days: 10,
            ..BurndownConfig::default()
        };
        let current = vec![job("J-1", 50, 20, 10), job("J-2", 50, 10, 0)];
        let earlier = vec![job("J-1", 50, 10, 0)];
        let progress = progress_for(&project(Some(d(6, 21))), d(6, 1), &current, &earlier, &config);

        assert_eq!(progress.total_poles, 100);
        assert_eq!(progress.completed_poles, 40);
        assert!((progress.current_daily_rate - 2.0).abs() < 1e-9);
        assert!((progress.required_daily_rate - 3.0).abs() < 1e-9);
        assert_eq!(progress.status, ProjectStatus::AtRisk);
        assert_eq!(progress.projected_completion, Some(d(7, 1)));
    }

    #[test]
    fn reads_tracker_csv_with_blank_optionals() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "project_id,name,utility,zone,target_date,field_resources,back_office_resources"
        )
        .unwrap();
        writeln!(file, "PRJ-1,North Zone,Acme,North,2024-09-30,3,2").unwrap();
        writeln!(file, "PRJ-2,South Zone,,,,,").unwrap();

        let projects = read_projects_csv(file.path()).unwrap();
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].target_date, Some(d(9, 30)));
        assert_eq!(projects[0].field_resources, 3);
        assert_eq!(projects[1].utility, None);
        assert_eq!(projects[1].back_office_resources, 0);
    }
}
