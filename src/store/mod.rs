//! Persistence seam for snapshots, the change log and derived metrics.
//!
//! ## Write semantics
//!
//! `write_job` / `write_pole` are one unit of work each: the snapshot insert,
//! the predecessor lookup, change detection and change-log inserts commit or
//! roll back together. A row that already exists for the same (entity,
//! observation time) key is left untouched and reported as
//! [`WriteOutcome::Duplicate`].
//!
//! Derived tables (`user_daily_summary`, `burndown_metrics`) are written with
//! upsert-replace semantics; `burndown_history` is append-only.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::MetricsResult;
use crate::models::{
    BurndownHistoryRow, BurndownMetric, CompactionStats, DuplicateCount, JobSnapshot, PoleSnapshot,
    ProgressEvent, Project, PruneStats, StatusChangeEvent, UserDailySummary, WriteOutcome,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgMetricsStore;

#[async_trait]
pub trait MetricsStore: Send + Sync + 'static {
    // ── Snapshot store ───────────────────────────────────────────────────────

    /// Insert a job snapshot and log its status transition, if any.
    async fn write_job(&self, snapshot: &JobSnapshot, batch_id: Uuid) -> MetricsResult<WriteOutcome>;

    /// Insert a pole snapshot and log completion transitions, if any.
    async fn write_pole(&self, snapshot: &PoleSnapshot, batch_id: Uuid) -> MetricsResult<WriteOutcome>;

    /// Latest snapshot per job among those observed on `date` (UTC).
    async fn latest_jobs_on(&self, date: NaiveDate) -> MetricsResult<Vec<JobSnapshot>>;

    /// Latest snapshot observed strictly before `before` for each of the given jobs.
    async fn latest_jobs_before(
        &self,
        job_ids: &[String],
        before: DateTime<Utc>,
    ) -> MetricsResult<Vec<JobSnapshot>>;

    /// Delete snapshots observed before `cutoff`, keeping the newest per entity.
    async fn prune_snapshots(&self, cutoff: DateTime<Utc>) -> MetricsResult<PruneStats>;

    // ── Change log ───────────────────────────────────────────────────────────

    /// Completion-field events on `date`, joined with the pole's utility.
    async fn progress_events_on(&self, date: NaiveDate) -> MetricsResult<Vec<ProgressEvent>>;

    /// Events for a job and its poles since `since`, ordered by transition time.
    async fn job_events_since(&self, job_id: &str, since: DateTime<Utc>) -> MetricsResult<Vec<StatusChangeEvent>>;

    /// Job status events in `[start, end)`.
    async fn status_events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<StatusChangeEvent>>;

    // ── Derived metrics ──────────────────────────────────────────────────────

    async fn upsert_daily_summaries(&self, date: NaiveDate, rows: &[UserDailySummary]) -> MetricsResult<()>;

    async fn daily_summaries(&self, start: NaiveDate, end: NaiveDate) -> MetricsResult<Vec<UserDailySummary>>;

    /// Upsert the metric row and append the same measures to history.
    async fn record_burndown(&self, metric: &BurndownMetric) -> MetricsResult<()>;

    async fn burndown_metrics(
        &self,
        utility: Option<&str>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> MetricsResult<Vec<BurndownMetric>>;

    async fn burndown_history(
        &self,
        utility: Option<&str>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> MetricsResult<Vec<BurndownHistoryRow>>;

    // ── Repair ───────────────────────────────────────────────────────────────

    async fn duplicate_counts(&self) -> MetricsResult<Vec<DuplicateCount>>;

    /// Collapse duplicate keys to their newest row and re-assert uniqueness.
    async fn compact(&self) -> MetricsResult<Vec<CompactionStats>>;

    // ── Projects ─────────────────────────────────────────────────────────────

    async fn upsert_project(&self, project: &Project) -> MetricsResult<()>;

    async fn get_project(&self, project_id: &str) -> MetricsResult<Option<Project>>;

    async fn list_projects(&self) -> MetricsResult<Vec<Project>>;

    /// Assign a job to a project, replacing any earlier assignment.
    async fn assign_job(&self, job_id: &str, project_id: &str) -> MetricsResult<()>;

    async fn project_job_ids(&self, project_id: &str) -> MetricsResult<Vec<String>>;
}

/// Half-open UTC bounds of a calendar day.
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = date.and_time(chrono::NaiveTime::MIN).and_utc();
    (start, start + chrono::Duration::days(1))
}

#[cfg(test)]
mod tests {
    use super::day_bounds;
    use chrono::{NaiveDate, TimeZone, Utc};

    #[test]
    fn day_bounds_cover_one_utc_day() {
        let (start, end) = day_bounds(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
    }
}
