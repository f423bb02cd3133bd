use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analysis::{self, StatusFlow};
use crate::burndown::{self, BurndownConfig};
use crate::error::{MetricsError, MetricsResult};
use crate::locks::KeyedLocks;
use crate::models::{
    BurndownHistoryRow, BurndownMetric, CompactionStats, DuplicateCount, IngestCycle, Project, PruneStats,
    StatusChangeEvent, UserDailySummary, WriteOutcome,
};
use crate::projects::{self, ProjectProgress};
use crate::store::{day_bounds, MetricsStore};
use crate::summary;

/// Outcome of one polling cycle. Entities are written independently, so a
/// failed row never blocks the others.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub batch_id: Uuid,
    pub jobs_written: usize,
    pub poles_written: usize,
    pub duplicates: usize,
    pub events_logged: usize,
    pub failures: Vec<IngestFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestFailure {
    pub entity: String,
    pub error: String,
}

/// Orchestrates ingestion, aggregation and queries over a [`MetricsStore`].
pub struct MetricsEngine<S> {
    store: Arc<S>,
    config: BurndownConfig,
    locks: KeyedLocks,
}

impl<S> Clone for MetricsEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config,
            locks: self.locks.clone(),
        }
    }
}

fn check_range(start: NaiveDate, end: NaiveDate) -> MetricsResult<()> {
    if start > end {
        return Err(MetricsError::InvalidInput(format!(
            "start date {start} is after end date {end}"
        )));
    }
    Ok(())
}

fn days_back(now: DateTime<Utc>, days: i64, what: &str) -> MetricsResult<DateTime<Utc>> {
    if days < 0 {
        return Err(MetricsError::InvalidInput(format!("{what} must not be negative (got {days})")));
    }
    Duration::try_days(days)
        .and_then(|span| now.checked_sub_signed(span))
        .ok_or_else(|| MetricsError::InvalidInput(format!("{what} of {days} days is out of range")))
}

impl<S: MetricsStore> MetricsEngine<S> {
    pub fn new(store: S, config: BurndownConfig) -> Self {
        Self {
            store: Arc::new(store),
            config,
            locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Persists one polling cycle. Jobs are written before poles so pole
    /// events can fall back to the job's utility.
    pub async fn ingest(&self, cycle: &IngestCycle) -> IngestReport {
        let mut report = IngestReport {
            batch_id: Uuid::new_v4(),
            ..IngestReport::default()
        };

        for job in &cycle.jobs {
            let entity = format!("job {}", job.job_id);
            let outcome = match job.validate() {
                Ok(()) => self.store.write_job(job, report.batch_id).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(WriteOutcome::Inserted { events }) => {
                    report.jobs_written += 1;
                    report.events_logged += events;
                }
                Ok(WriteOutcome::Duplicate) => {
                    debug!(job_id = %job.job_id, observed_at = %job.observed_at, "job snapshot already stored");
                    report.duplicates += 1;
                }
                Err(err) => {
                    warn!(job_id = %job.job_id, error = %err, "job snapshot rejected");
                    report.failures.push(IngestFailure {
                        entity,
                        error: err.to_string(),
                    });
                }
            }
        }

        for pole in &cycle.poles {
            let entity = format!("pole {}/{}", pole.job_id, pole.pole_id);
            let outcome = match pole.validate() {
                Ok(()) => self.store.write_pole(pole, report.batch_id).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(WriteOutcome::Inserted { events }) => {
                    report.poles_written += 1;
                    report.events_logged += events;
                }
                Ok(WriteOutcome::Duplicate) => {
                    debug!(job_id = %pole.job_id, pole_id = %pole.pole_id, "pole snapshot already stored");
                    report.duplicates += 1;
                }
                Err(err) => {
                    warn!(job_id = %pole.job_id, pole_id = %pole.pole_id, error = %err, "pole snapshot rejected");
                    report.failures.push(IngestFailure {
                        entity,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            batch_id = %report.batch_id,
            jobs = report.jobs_written,
            poles = report.poles_written,
            duplicates = report.duplicates,
            events = report.events_logged,
            failures = report.failures.len(),
            "ingest cycle stored"
        );
        report
    }

    /// Recomputes productivity rows for one UTC day.
    pub async fn summarize(&self, date: NaiveDate) -> MetricsResult<Vec<UserDailySummary>> {
        let _guard = self.locks.acquire(&format!("summary:{date}")).await;

        let events = self.store.progress_events_on(date).await?;
        let rows = summary::summarize_day(date, &events);
        self.store.upsert_daily_summaries(date, &rows).await?;

        info!(%date, events = events.len(), rows = rows.len(), "daily summary computed");
        Ok(rows)
    }

    /// Recomputes per-utility burndown rows for one UTC day.
    ///
    /// Each utility is written on its own. If any utility fails, the others
    /// are still recorded and the date is reported as failed afterwards.
    pub async fn compute_burndown(&self, date: NaiveDate) -> MetricsResult<Vec<BurndownMetric>> {
        let _guard = self.locks.acquire(&format!("burndown:{date}")).await;

        let jobs = self.store.latest_jobs_on(date).await?;
        let window_start = burndown::window_start(date, self.config.trailing_days);
        let mut metrics = Vec::new();
        let mut failed = Vec::new();

        for rollup in burndown::rollup_by_utility(&jobs) {
            match self.record_utility(date, window_start, &rollup).await {
                Ok(metric) => {
                    debug!(
                        %date,
                        utility = %metric.utility,
                        total = metric.total_poles,
                        completed = metric.completed_poles,
                        trailing_rate = metric.trailing_rate,
                        "burndown recorded"
                    );
                    metrics.push(metric);
                }
                Err(err) => {
                    warn!(%date, utility = %rollup.utility, error = %err, "burndown not recorded");
                    failed.push(format!("{}: {err}", rollup.utility));
                }
            }
        }

        info!(
            %date,
            jobs = jobs.len(),
            utilities = metrics.len(),
            failed = failed.len(),
            "burndown computed"
        );
        if !failed.is_empty() {
            return Err(MetricsError::Internal(format!(
                "burndown for {date} failed for {} of {} utilities ({})",
                failed.len(),
                failed.len() + metrics.len(),
                failed.join("; ")
            )));
        }
        Ok(metrics)
    }

    async fn record_utility(
        &self,
        date: NaiveDate,
        window_start: NaiveDate,
        rollup: &burndown::UtilityRollup,
    ) -> MetricsResult<BurndownMetric> {
        let prior = self
            .store
            .burndown_metrics(Some(rollup.utility.as_str()), window_start, date)
            .await?;
        let metric = burndown::compute_metric(date, rollup, &prior, &self.config);
        self.store.record_burndown(&metric).await?;
        Ok(metric)
    }

    /// Status, completion and back-office events for a job and its poles over
    /// the last `days` days.
    pub async fn status_history(
        &self,
        job_id: &str,
        days: i64,
        now: DateTime<Utc>,
    ) -> MetricsResult<Vec<StatusChangeEvent>> {
        let since = days_back(now, days, "history window")?;
        self.store.job_events_since(job_id, since).await
    }

    pub async fn productivity(&self, start: NaiveDate, end: NaiveDate) -> MetricsResult<Vec<UserDailySummary>> {
        check_range(start, end)?;
        self.store.daily_summaries(start, end).await
    }

    pub async fn burndown(
        &self,
        utility: Option<&str>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> MetricsResult<Vec<BurndownMetric>> {
        check_range(start, end)?;
        self.store.burndown_metrics(utility, start, end).await
    }

    pub async fn burndown_history(
        &self,
        utility: Option<&str>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> MetricsResult<Vec<BurndownHistoryRow>> {
        check_range(start, end)?;
        self.store.burndown_history(utility, start, end).await
    }

    pub async fn status_flow(&self, start: NaiveDate, end: NaiveDate) -> MetricsResult<Vec<StatusFlow>> {
        check_range(start, end)?;
        let (from, _) = day_bounds(start);
        let (_, until) = day_bounds(end);
        let events = self.store.status_events_between(from, until).await?;
        Ok(analysis::status_flow(&events))
    }

    pub async fn check_duplicates(&self) -> MetricsResult<Vec<DuplicateCount>> {
        let counts = self.store.duplicate_counts().await?;
        for count in counts.iter().filter(|count| count.groups > 0) {
            warn!(
                table = count.table,
                groups = count.groups,
                surplus_rows = count.surplus_rows,
                "duplicate keys found"
            );
        }
        Ok(counts)
    }

    pub async fn compact(&self) -> MetricsResult<Vec<CompactionStats>> {
        let stats = self.store.compact().await?;
        for table in &stats {
            info!(table = table.table, removed = table.removed, "compaction pass");
        }
        Ok(stats)
    }

    /// Drops snapshots older than the horizon, keeping each entity's newest row.
    pub async fn prune(&self, horizon_days: i64, now: DateTime<Utc>) -> MetricsResult<PruneStats> {
        let cutoff = days_back(now, horizon_days, "retention horizon")?;
        let stats = self.store.prune_snapshots(cutoff).await?;
        info!(
            %cutoff,
            job_snapshots = stats.job_snapshots,
            pole_snapshots = stats.pole_snapshots,
            "snapshots pruned"
        );
        Ok(stats)
    }

    pub async fn upsert_project(&self, project: &Project) -> MetricsResult<()> {
        if project.project_id.trim().is_empty() || project.name.trim().is_empty() {
            return Err(MetricsError::InvalidInput(
                "project requires a project_id and a name".to_string(),
            ));
        }
        if project.field_resources < 0 || project.back_office_resources < 0 {
            return Err(MetricsError::InvalidInput(format!(
                "project {} has negative resources",
                project.project_id
            )));
        }
        self.store.upsert_project(project).await
    }

    pub async fn get_project(&self, project_id: &str) -> MetricsResult<Project> {
        self.store
            .get_project(project_id)
            .await?
            .ok_or_else(|| MetricsError::NotFound(format!("project {project_id}")))
    }

    pub async fn list_projects(&self) -> MetricsResult<Vec<Project>> {
        self.store.list_projects().await
    }

    pub async fn assign_job(&self, job_id: &str, project_id: &str) -> MetricsResult<()> {
        if job_id.trim().is_empty() {
            return Err(MetricsError::InvalidInput("job_id must not be empty".to_string()));
        }
        self.store.assign_job(job_id, project_id).await?;
        info!(job_id, project_id, "job assigned to project");
        Ok(())
    }

    pub async fn import_projects_csv(&self, path: &Path) -> MetricsResult<usize> {
        let projects = projects::read_projects_csv(path)?;
        for project in &projects {
            self.upsert_project(project).await?;
        }
        info!(path = %path.display(), projects = projects.len(), "projects imported");
        Ok(projects.len())
    }

    /// Progress of a project's assigned jobs at the end of `as_of`.
    pub async fn project_progress(&self, project_id: &str, as_of: NaiveDate) -> MetricsResult<ProjectProgress> {
        let project = self.get_project(project_id).await?;
        let job_ids = self.store.project_job_ids(project_id).await?;

        let (_, end_of_day) = day_bounds(as_of);
        let (_, end_of_window_start) = day_bounds(burndown::window_start(as_of, self.config.trailing_days));
        let current = self.store.latest_jobs_before(&job_ids, end_of_day).await?;
        let earlier = self.store.latest_jobs_before(&job_ids, end_of_window_start).await?;

        Ok(projects::progress_for(&project, as_of, &current, &earlier, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn engine() -> MetricsEngine<MemoryStore> {
        MetricsEngine::new(MemoryStore::new(), BurndownConfig::default())
    }

    #[tokio::test]
    async fn reversed_ranges_are_rejected() {
        let engine = engine();
        let start = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let err = engine.productivity(start, end).await.expect_err("reversed range");
        assert!(matches!(err, MetricsError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn negative_history_window_is_rejected() {
        let engine = engine();
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap();
        let err = engine.status_history("J-1", -1, now).await.expect_err("negative days");
        assert!(err.to_string().starts_with("INVALID_INPUT"));
    }

    #[tokio::test]
    async fn unknown_project_is_not_found() {
        let engine = engine();
        let err = engine
            .project_progress("PRJ-404", NaiveDate::from_ymd_opt(2024, 5, 1).unwrap())
            .await
            .expect_err("missing project");
        assert!(matches!(err, MetricsError::NotFound(_)));
    }

    #[tokio::test]
    async fn invalid_rows_are_reported_without_blocking_the_batch() {
        let engine = engine();
        let cycle: IngestCycle = serde_json::from_str(
            r#"{
                "jobs": [
                    {"job_id": "", "utility": "Acme", "observed_at": "2024-05-01T08:00:00Z"},
                    {"job_id": "J-2", "utility": "Acme", "total_poles": 4, "observed_at": "2024-05-01T08:00:00Z"}
                ]
            }"#,
        )
        .unwrap();

        let report = engine.ingest(&cycle).await;
        assert_eq!(report.jobs_written, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("job_id"));
    }
}
