use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MetricsError;

/// One observation of a job's state, as delivered by the fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    #[serde(default)]
    pub status: Option<String>,
    pub utility: String,
    #[serde(default)]
    pub total_poles: i32,
    #[serde(default)]
    pub completed_poles: i32,
    #[serde(default)]
    pub field_complete: i32,
    #[serde(default)]
    pub back_office_complete: i32,
    #[serde(default)]
    pub assigned_users: BTreeSet<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub target_date: Option<NaiveDate>,
    pub observed_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn validate(&self) -> Result<(), MetricsError> {
        if self.job_id.trim().is_empty() {
            return Err(MetricsError::InvalidInput("job snapshot without job_id".to_string()));
        }
        if self.utility.trim().is_empty() {
            return Err(MetricsError::InvalidInput(format!(
                "job {} has an empty utility",
                self.job_id
            )));
        }
        let counts = [
            ("total_poles", self.total_poles),
            ("completed_poles", self.completed_poles),
            ("field_complete", self.field_complete),
            ("back_office_complete", self.back_office_complete),
        ];
        if let Some((name, value)) = counts.iter().find(|(_, value)| *value < 0) {
            return Err(MetricsError::InvalidInput(format!(
                "job {} has negative {name} ({value})",
                self.job_id
            )));
        }
        Ok(())
    }

    /// The user credited with a status transition: first assigned user in sort order.
    pub fn status_actor(&self) -> Option<&str> {
        self.assigned_users.iter().next().map(String::as_str)
    }
}

/// One observation of a single pole within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoleSnapshot {
    pub job_id: String,
    pub pole_id: String,
    #[serde(default)]
    pub utility: Option<String>,
    #[serde(default)]
    pub field_completed: bool,
    #[serde(default)]
    pub field_completed_by: Option<String>,
    #[serde(default)]
    pub field_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub back_office_completed: bool,
    #[serde(default)]
    pub back_office_completed_by: Option<String>,
    #[serde(default)]
    pub back_office_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pole_height: Option<String>,
    #[serde(default)]
    pub pole_class: Option<String>,
    #[serde(default)]
    pub make_ready_status: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl PoleSnapshot {
    pub fn validate(&self) -> Result<(), MetricsError> {
        if self.job_id.trim().is_empty() || self.pole_id.trim().is_empty() {
            return Err(MetricsError::InvalidInput(format!(
                "pole snapshot requires job_id and pole_id (got {:?}/{:?})",
                self.job_id, self.pole_id
            )));
        }
        Ok(())
    }
}

/// One polling cycle as handed over by the fetcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestCycle {
    #[serde(default)]
    pub jobs: Vec<JobSnapshot>,
    #[serde(default)]
    pub poles: Vec<PoleSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Job,
    Pole,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Pole => "pole",
        }
    }
}

impl FromStr for EntityType {
    type Err = MetricsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "job" => Ok(Self::Job),
            "pole" => Ok(Self::Pole),
            other => Err(MetricsError::InvalidInput(format!("unknown entity type {other}"))),
        }
    }
}

/// Fields monitored for transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedField {
    Status,
    FieldCompleted,
    BackOfficeCompleted,
}

impl TrackedField {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::FieldCompleted => "field_completed",
            Self::BackOfficeCompleted => "back_office_completed",
        }
    }

    /// Productivity role credited for a completion of this field.
    pub fn role(self) -> Option<Role> {
        match self {
            Self::Status => None,
            Self::FieldCompleted => Some(Role::Field),
            Self::BackOfficeCompleted => Some(Role::BackOffice),
        }
    }
}

impl FromStr for TrackedField {
    type Err = MetricsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "status" => Ok(Self::Status),
            "field_completed" => Ok(Self::FieldCompleted),
            "back_office_completed" => Ok(Self::BackOfficeCompleted),
            other => Err(MetricsError::InvalidInput(format!("unknown tracked field {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Field,
    BackOffice,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Field => "field",
            Self::BackOffice => "back_office",
        }
    }
}

impl FromStr for Role {
    type Err = MetricsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "field" => Ok(Self::Field),
            "back_office" => Ok(Self::BackOffice),
            other => Err(MetricsError::InvalidInput(format!("unknown role {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChangeEvent {
    pub job_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub field: TrackedField,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_at: DateTime<Utc>,
    pub changed_by: Option<String>,
    pub duration_hours: Option<f64>,
}

/// A change-log row on a completion field, joined with the pole's utility.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub event: StatusChangeEvent,
    pub utility: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDailySummary {
    pub user_id: String,
    pub date: NaiveDate,
    pub role: Role,
    pub poles_completed: i64,
    pub utilities: Vec<String>,
    pub jobs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurndownMetric {
    pub utility: String,
    pub date: NaiveDate,
    pub total_poles: i64,
    pub completed_poles: i64,
    pub run_rate: f64,
    pub trailing_rate: f64,
    pub projected_completion: Option<NaiveDate>,
    pub actual_resources: i64,
    pub required_resources: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BurndownHistoryRow {
    pub id: i64,
    pub metric: BurndownMetric,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub project_id: String,
    pub name: String,
    #[serde(default)]
    pub utility: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub target_date: Option<NaiveDate>,
    #[serde(default)]
    pub field_resources: i32,
    #[serde(default)]
    pub back_office_resources: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted { events: usize },
    Duplicate,
}

/// Duplicate groups found for one uniqueness key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateCount {
    pub table: &'static str,
    pub groups: i64,
    pub surplus_rows: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactionStats {
    pub table: &'static str,
    pub removed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneStats {
    pub job_snapshots: u64,
    pub pole_snapshots: u64,
}
