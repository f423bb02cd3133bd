mod common;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use common::*;
use pole_metrics::burndown::BurndownConfig;
use pole_metrics::models::{
    BurndownHistoryRow, BurndownMetric, CompactionStats, DuplicateCount, JobSnapshot, PoleSnapshot, ProgressEvent,
    Project, PruneStats, StatusChangeEvent, UserDailySummary, WriteOutcome,
};
use pole_metrics::store::{MemoryStore, MetricsStore};
use pole_metrics::{MetricsEngine, MetricsError, MetricsResult};
use uuid::Uuid;

/// Memory store whose burndown writes fail for one utility.
struct BrokenUtilityStore {
    inner: MemoryStore,
    broken_utility: String,
}

#[async_trait]
impl MetricsStore for BrokenUtilityStore {
    async fn write_job(&self, snapshot: &JobSnapshot, batch_id: Uuid) -> MetricsResult<WriteOutcome> {
        self.inner.write_job(snapshot, batch_id).await
    }

    async fn write_pole(&self, snapshot: &PoleSnapshot, batch_id: Uuid) -> MetricsResult<WriteOutcome> {
        self.inner.write_pole(snapshot, batch_id).await
    }

    async fn latest_jobs_on(&self, date: NaiveDate) -> MetricsResult<Vec<JobSnapshot>> {
        self.inner.latest_jobs_on(date).await
    }

    async fn latest_jobs_before(
        &self,
        job_ids: &[String],
        before: DateTime<Utc>,
    ) -> MetricsResult<Vec<JobSnapshot>> {
        self.inner.latest_jobs_before(job_ids, before).await
    }

    async fn prune_snapshots(&self, cutoff: DateTime<Utc>) -> MetricsResult<PruneStats> {
        self.inner.prune_snapshots(cutoff).await
    }

    async fn progress_events_on(&self, date: NaiveDate) -> MetricsResult<Vec<ProgressEvent>> {
        self.inner.progress_events_on(date).await
    }

    async fn job_events_since(&self, job_id: &str, since: DateTime<Utc>) -> MetricsResult<Vec<StatusChangeEvent>> {
        self.inner.job_events_since(job_id, since).await
    }

    async fn status_events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> MetricsResult<Vec<StatusChangeEvent>> {
        self.inner.status_events_between(start, end).await
    }

    async fn upsert_daily_summaries(&self, date: NaiveDate, rows: &[UserDailySummary]) -> MetricsResult<()> {
        self.inner.upsert_daily_summaries(date, rows).await
    }

    async fn daily_summaries(&self, start: NaiveDate, end: NaiveDate) -> MetricsResult<Vec<UserDailySummary>> {
        self.inner.daily_summaries(start, end).await
    }

    async fn record_burndown(&self, metric: &BurndownMetric) -> MetricsResult<()> {
        if metric.utility == self.broken_utility {
            return Err(MetricsError::Internal(format!("write refused for {}", metric.utility)));
        }
        self.inner.record_burndown(metric).await
    }

    async fn burndown_metrics(
        &self,
        utility: Option<&str>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> MetricsResult<Vec<BurndownMetric>> {
        self.inner.burndown_metrics(utility, start, end).await
    }

    async fn burndown_history(
        &self,
        utility: Option<&str>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> MetricsResult<Vec<BurndownHistoryRow>> {
        self.inner.burndown_history(utility, start, end).await
    }

    async fn duplicate_counts(&self) -> MetricsResult<Vec<DuplicateCount>> {
        self.inner.duplicate_counts().await
    }

    async fn compact(&self) -> MetricsResult<Vec<CompactionStats>> {
        self.inner.compact().await
    }

    async fn upsert_project(&self, project: &Project) -> MetricsResult<()> {
        self.inner.upsert_project(project).await
    }

    async fn get_project(&self, project_id: &str) -> MetricsResult<Option<Project>> {
        self.inner.get_project(project_id).await
    }

    async fn list_projects(&self) -> MetricsResult<Vec<Project>> {
        self.inner.list_projects().await
    }

    async fn assign_job(&self, job_id: &str, project_id: &str) -> MetricsResult<()> {
        self.inner.assign_job(job_id, project_id).await
    }

    async fn project_job_ids(&self, project_id: &str) -> MetricsResult<Vec<String>> {
        self.inner.project_job_ids(project_id).await
    }
}

fn broken_engine(utility: &str) -> MetricsEngine<BrokenUtilityStore> {
    let store = BrokenUtilityStore {
        inner: MemoryStore::new(),
        broken_utility: utility.to_string(),
    };
    MetricsEngine::new(store, BurndownConfig::default())
}

fn utility_job(job_id: &str, utility: &str, field: i32) -> JobSnapshot {
    JobSnapshot {
        utility: utility.to_string(),
        ..job_progress(job_id, field, 0, at(6, 9))
    }
}

#[tokio::test]
async fn one_failing_utility_does_not_block_the_others() {
    let engine = broken_engine("A-Util");
    engine
        .ingest(&jobs(vec![utility_job("J-A", "A-Util", 10), utility_job("J-B", "B-Util", 30)]))
        .await;

    let err = engine.compute_burndown(date(6)).await.expect_err("A-Util write fails");
    assert!(matches!(err, MetricsError::Internal(_)));
    assert!(err.to_string().contains("A-Util"));

    let stored = engine.burndown(None, date(6), date(6)).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].utility, "B-Util");
    assert_eq!(stored[0].completed_poles, 30);
    assert_eq!(engine.burndown_history(Some("B-Util"), date(6), date(6)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn backfill_marks_a_partially_failed_date() {
    let engine = broken_engine("A-Util");
    engine
        .ingest(&jobs(vec![utility_job("J-A", "A-Util", 10), utility_job("J-B", "B-Util", 30)]))
        .await;

    let report = engine.backfill(date(5), date(7)).await.unwrap();
    let failed: Vec<NaiveDate> = report.failures().map(|day| day.date).collect();
    assert_eq!(failed, vec![date(6)]);
    assert_eq!(report.succeeded(), 2);
    assert_eq!(engine.burndown(Some("B-Util"), date(6), date(6)).await.unwrap().len(), 1);
}
