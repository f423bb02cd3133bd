#![allow(dead_code)]

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use pole_metrics::burndown::BurndownConfig;
use pole_metrics::models::{IngestCycle, JobSnapshot, PoleSnapshot};
use pole_metrics::store::MemoryStore;
use pole_metrics::MetricsEngine;

pub const UTILITY: &str = "Acme Power";

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
}

pub fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, day).unwrap()
}

pub fn engine() -> MetricsEngine<MemoryStore> {
    MetricsEngine::new(MemoryStore::new(), BurndownConfig::default())
}

pub fn engine_with(config: BurndownConfig) -> MetricsEngine<MemoryStore> {
    MetricsEngine::new(MemoryStore::new(), config)
}

pub fn job(job_id: &str, status: Option<&str>, observed_at: DateTime<Utc>) -> JobSnapshot {
    JobSnapshot {
        job_id: job_id.to_string(),
        status: status.map(ToString::to_string),
        utility: UTILITY.to_string(),
        total_poles: 100,
        completed_poles: 0,
        field_complete: 0,
        back_office_complete: 0,
        assigned_users: BTreeSet::from(["maria".to_string(), "ahmed".to_string()]),
        priority: Some(2),
        target_date: None,
        observed_at,
    }
}

pub fn job_progress(job_id: &str, field: i32, back_office: i32, observed_at: DateTime<Utc>) -> JobSnapshot {
    JobSnapshot {
        completed_poles: field,
        field_complete: field,
        back_office_complete: back_office,
        ..job(job_id, Some("In Progress"), observed_at)
    }
}

pub fn pole(job_id: &str, pole_id: &str, observed_at: DateTime<Utc>) -> PoleSnapshot {
    PoleSnapshot {
        job_id: job_id.to_string(),
        pole_id: pole_id.to_string(),
        utility: None,
        field_completed: false,
        field_completed_by: None,
        field_completed_at: None,
        back_office_completed: false,
        back_office_completed_by: None,
        back_office_completed_at: None,
        pole_height: Some("40".to_string()),
        pole_class: Some("3".to_string()),
        make_ready_status: None,
        observed_at,
    }
}

pub fn field_done(mut snapshot: PoleSnapshot, by: &str) -> PoleSnapshot {
    snapshot.field_completed = true;
    snapshot.field_completed_by = Some(by.to_string());
    snapshot.field_completed_at = Some(snapshot.observed_at);
    snapshot
}

pub fn jobs(snapshots: Vec<JobSnapshot>) -> IngestCycle {
    IngestCycle {
        jobs: snapshots,
        poles: Vec::new(),
    }
}

pub fn poles(snapshots: Vec<PoleSnapshot>) -> IngestCycle {
    IngestCycle {
        jobs: Vec::new(),
        poles: snapshots,
    }
}
