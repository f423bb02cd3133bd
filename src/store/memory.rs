//! In-process backend holding every table in vectors behind one mutex.
//!
//! Each trait call takes the lock once, so a snapshot write and its change
//! detection are observed atomically, mirroring the Postgres transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::compact::{duplicate_groups, retain_latest};
use crate::detector::{self, PriorState};
use crate::error::{MetricsError, MetricsResult};
use crate::models::{
    BurndownHistoryRow, BurndownMetric, CompactionStats, DuplicateCount, EntityType, JobSnapshot, PoleSnapshot,
    ProgressEvent, Project, PruneStats, StatusChangeEvent, TrackedField, UserDailySummary, WriteOutcome,
};
use crate::store::{day_bounds, MetricsStore};

#[derive(Debug, Clone)]
struct Row<T> {
    id: i64,
    batch_id: Option<Uuid>,
    value: T,
}

#[derive(Debug, Default)]
struct Tables {
    next_id: i64,
    jobs: Vec<Row<JobSnapshot>>,
    poles: Vec<Row<PoleSnapshot>>,
    events: Vec<Row<StatusChangeEvent>>,
    summaries: Vec<Row<UserDailySummary>>,
    burndown: Vec<Row<BurndownMetric>>,
    history: Vec<BurndownHistoryRow>,
    projects: BTreeMap<String, Project>,
    assignments: BTreeMap<String, String>,
}

impl Tables {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn reserve_id(&mut self, id: i64) {
        self.next_id = self.next_id.max(id);
    }

    fn last_transitions(&self, entity_type: EntityType, job_id: &str, entity_id: &str, before: DateTime<Utc>) -> HashMap<TrackedField, DateTime<Utc>> {
        let mut last = HashMap::new();
        for event in self.events.iter().map(|row| &row.value) {
            if event.entity_type != entity_type
                || event.job_id != job_id
                || event.entity_id != entity_id
                || event.changed_at >= before
            {
                continue;
            }
            last.entry(event.field)
                .and_modify(|at: &mut DateTime<Utc>| *at = (*at).max(event.changed_at))
                .or_insert(event.changed_at);
        }
        last
    }

    fn log_events(&mut self, events: Vec<StatusChangeEvent>) -> usize {
        let mut inserted = 0;
        for event in events {
            let exists = self.events.iter().any(|row| same_event_key(&row.value, &event));
            if exists {
                continue;
            }
            let id = self.allocate_id();
            self.events.push(Row {
                id,
                batch_id: None,
                value: event,
            });
            inserted += 1;
        }
        inserted
    }

    fn pole_utility(&self, job_id: &str, pole_id: &str, at: DateTime<Utc>) -> Option<String> {
        let from_pole = self
            .poles
            .iter()
            .map(|row| &row.value)
            .find(|pole| pole.job_id == job_id && pole.pole_id == pole_id && pole.observed_at == at)
            .and_then(|pole| pole.utility.clone());
        from_pole.or_else(|| {
            self.jobs
                .iter()
                .filter(|row| row.value.job_id == job_id && row.value.observed_at <= at)
                .max_by_key(|row| (row.value.observed_at, row.id))
                .map(|row| row.value.utility.clone())
        })
    }
}

fn same_event_key(a: &StatusChangeEvent, b: &StatusChangeEvent) -> bool {
    a.entity_type == b.entity_type && a.entity_id == b.entity_id && a.field == b.field && a.changed_at == b.changed_at
}

fn latest_per_key<'a, T, K>(
    rows: impl Iterator<Item = &'a Row<T>>,
    key_of: impl Fn(&T) -> K,
    at_of: impl Fn(&T) -> DateTime<Utc>,
) -> Vec<T>
where
    T: Clone + 'a,
    K: Ord,
{
    let mut latest: BTreeMap<K, &Row<T>> = BTreeMap::new();
    for row in rows {
        let key = key_of(&row.value);
        let newer = latest
            .get(&key)
            .map_or(true, |current| (at_of(&current.value), current.id) < (at_of(&row.value), row.id));
        if newer {
            latest.insert(key, row);
        }
    }
    latest.into_values().map(|row| row.value.clone()).collect()
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MetricsResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| MetricsError::Internal("memory store mutex poisoned".to_string()))
    }

    /// Insert a job row with an explicit id, bypassing uniqueness and detection.
    ///
    /// Used to reproduce drifted data that predates the unique constraints.
    pub fn force_job_row(&self, id: i64, snapshot: JobSnapshot) -> MetricsResult<()> {
        let mut tables = self.lock()?;
        tables.reserve_id(id);
        tables.jobs.push(Row {
            id,
            batch_id: None,
            value: snapshot,
        });
        Ok(())
    }

    /// Pole counterpart of [`MemoryStore::force_job_row`].
    pub fn force_pole_row(&self, id: i64, snapshot: PoleSnapshot) -> MetricsResult<()> {
        let mut tables = self.lock()?;
        tables.reserve_id(id);
        tables.poles.push(Row {
            id,
            batch_id: None,
            value: snapshot,
        });
        Ok(())
    }

    /// Stored job rows as (insertion id, snapshot), in insertion order.
    pub fn job_rows(&self, job_id: &str) -> MetricsResult<Vec<(i64, JobSnapshot)>> {
        let tables = self.lock()?;
        Ok(tables
            .jobs
            .iter()
            .filter(|row| row.value.job_id == job_id)
            .map(|row| (row.id, row.value.clone()))
            .collect())
    }

    pub fn pole_rows(&self, job_id: &str, pole_id: &str) -> MetricsResult<Vec<PoleSnapshot>> {
        let tables = self.lock()?;
        Ok(tables
            .poles
            .iter()
            .filter(|row| row.value.job_id == job_id && row.value.pole_id == pole_id)
            .map(|row| row.value.clone())
            .collect())
    }

    pub fn events(&self) -> MetricsResult<Vec<StatusChangeEvent>> {
        let tables = self.lock()?;
        Ok(tables.events.iter().map(|row| row.value.clone()).collect())
    }

    /// Batch that wrote each stored job row, in insertion order.
    pub fn job_batches(&self, job_id: &str) -> MetricsResult<Vec<Option<Uuid>>> {
        let tables = self.lock()?;
        Ok(tables
            .jobs
            .iter()
            .filter(|row| row.value.job_id == job_id)
            .map(|row| row.batch_id)
            .collect())
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn write_job(&self, snapshot: &JobSnapshot, batch_id: Uuid) -> MetricsResult<WriteOutcome> {
        let mut tables = self.lock()?;
        let same_entity = |row: &&Row<JobSnapshot>| row.value.job_id == snapshot.job_id;

        if tables
            .jobs
            .iter()
            .filter(same_entity)
            .any(|row| row.value.observed_at == snapshot.observed_at)
        {
            return Ok(WriteOutcome::Duplicate);
        }

        let earlier: Vec<&Row<JobSnapshot>> = tables
            .jobs
            .iter()
            .filter(same_entity)
            .filter(|row| row.value.observed_at < snapshot.observed_at)
            .collect();
        let prior = PriorState {
            previous: earlier
                .iter()
                .max_by_key(|row| (row.value.observed_at, row.id))
                .map(|row| row.value.clone()),
            first_observed_at: earlier.iter().map(|row| row.value.observed_at).min(),
            last_transitions: tables.last_transitions(
                EntityType::Job,
                &snapshot.job_id,
                &snapshot.job_id,
                snapshot.observed_at,
            ),
        };

        let events = detector::detect_job_changes(&prior, snapshot);
        let id = tables.allocate_id();
        tables.jobs.push(Row {
            id,
            batch_id: Some(batch_id),
            value: snapshot.clone(),
        });
        let logged = tables.log_events(events);
        Ok(WriteOutcome::Inserted { events: logged })
    }

    async fn write_pole(&self, snapshot: &PoleSnapshot, batch_id: Uuid) -> MetricsResult<WriteOutcome> {
        let mut tables = self.lock()?;
        let same_entity =
            |row: &&Row<PoleSnapshot>| row.value.job_id == snapshot.job_id && row.value.pole_id == snapshot.pole_id;

        if tables
            .poles
            .iter()
            .filter(same_entity)
            .any(|row| row.value.observed_at == snapshot.observed_at)
        {
            return Ok(WriteOutcome::Duplicate);
        }

        let earlier: Vec<&Row<PoleSnapshot>> = tables
            .poles
            .iter()
            .filter(same_entity)
            .filter(|row| row.value.observed_at < snapshot.observed_at)
            .collect();
        let prior = PriorState {
            previous: earlier
                .iter()
                .max_by_key(|row| (row.value.observed_at, row.id))
                .map(|row| row.value.clone()),
            first_observed_at: earlier.iter().map(|row| row.value.observed_at).min(),
            last_transitions: tables.last_transitions(
                EntityType::Pole,
                &snapshot.job_id,
                &snapshot.pole_id,
                snapshot.observed_at,
            ),
        };

        let detection = detector::detect_pole_changes(&prior, snapshot);
        let mut stored = snapshot.clone();
        if let Some(completed_at) = detection.back_office_completed_at {
            stored.back_office_completed_at = Some(completed_at);
        }
        let id = tables.allocate_id();
        tables.poles.push(Row {
            id,
            batch_id: Some(batch_id),
            value: stored,
        });
        let logged = tables.log_events(detection.events);
        Ok(WriteOutcome::Inserted { events: logged })
    }

    async fn latest_jobs_on(&self, date: NaiveDate) -> MetricsResult<Vec<JobSnapshot>> {
        let (start, end) = day_bounds(date);
        let tables = self.lock()?;
        Ok(latest_per_key(
            tables
                .jobs
                .iter()
                .filter(|row| row.value.observed_at >= start && row.value.observed_at < end),
            |job| job.job_id.clone(),
            |job| job.observed_at,
        ))
    }

    async fn latest_jobs_before(&self, job_ids: &[String], before: DateTime<Utc>) -> MetricsResult<Vec<JobSnapshot>> {
        let tables = self.lock()?;
        Ok(latest_per_key(
            tables
                .jobs
                .iter()
                .filter(|row| row.value.observed_at < before && job_ids.contains(&row.value.job_id)),
            |job| job.job_id.clone(),
            |job| job.observed_at,
        ))
    }

    async fn prune_snapshots(&self, cutoff: DateTime<Utc>) -> MetricsResult<PruneStats> {
        let mut tables = self.lock()?;

        let mut newest_job: HashMap<String, DateTime<Utc>> = HashMap::new();
        for row in &tables.jobs {
            let at = newest_job.entry(row.value.job_id.clone()).or_insert(row.value.observed_at);
            *at = (*at).max(row.value.observed_at);
        }
        let before = tables.jobs.len();
        tables.jobs.retain(|row| {
            row.value.observed_at >= cutoff || Some(&row.value.observed_at) == newest_job.get(&row.value.job_id)
        });
        let job_snapshots = (before - tables.jobs.len()) as u64;

        let mut newest_pole: HashMap<(String, String), DateTime<Utc>> = HashMap::new();
        for row in &tables.poles {
            let key = (row.value.job_id.clone(), row.value.pole_id.clone());
            let at = newest_pole.entry(key).or_insert(row.value.observed_at);
            *at = (*at).max(row.value.observed_at);
        }
        let before = tables.poles.len();
        tables.poles.retain(|row| {
            let key = (row.value.job_id.clone(), row.value.pole_id.clone());
            row.value.observed_at >= cutoff || Some(&row.value.observed_at) == newest_pole.get(&key)
        });
        let pole_snapshots = (before - tables.poles.len()) as u64;

        Ok(PruneStats {
            job_snapshots,
            pole_snapshots,
        })
    }

    async fn progress_events_on(&self, date: NaiveDate) -> MetricsResult<Vec<ProgressEvent>> {
        let (start, end) = day_bounds(date);
        let tables = self.lock()?;
        let mut progress: Vec<ProgressEvent> = tables
            .events
            .iter()
            .map(|row| &row.value)
            .filter(|event| event.field != TrackedField::Status && event.changed_at >= start && event.changed_at < end)
            .map(|event| ProgressEvent {
                event: event.clone(),
                utility: tables.pole_utility(&event.job_id, &event.entity_id, event.changed_at),
            })
            .collect();
        progress.sort_by(|a, b| {
            (a.event.changed_at, &a.event.entity_id, a.event.field).cmp(&(b.event.changed_at, &b.event.entity_id, b.event.field))
        });
        Ok(progress)
    }

    async fn job_events_since(&self, job_id: &str, since: DateTime<Utc>) -> MetricsResult<Vec<StatusChangeEvent>> {
        let tables = self.lock()?;
        let mut events: Vec<StatusChangeEvent> = tables
            .events
            .iter()
            .map(|row| &row.value)
            .filter(|event| event.job_id == job_id && event.changed_at >= since)
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            (a.changed_at, a.entity_type, &a.entity_id, a.field).cmp(&(b.changed_at, b.entity_type, &b.entity_id, b.field))
        });
        Ok(events)
    }

    async fn status_events_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> MetricsResult<Vec<StatusChangeEvent>> {
        let tables = self.lock()?;
        let mut events: Vec<StatusChangeEvent> = tables
            .events
            .iter()
            .map(|row| &row.value)
            .filter(|event| event.field == TrackedField::Status && event.changed_at >= start && event.changed_at < end)
            .cloned()
            .collect();
        events.sort_by(|a, b| (a.changed_at, &a.entity_id).cmp(&(b.changed_at, &b.entity_id)));
        Ok(events)
    }

    async fn upsert_daily_summaries(&self, date: NaiveDate, rows: &[UserDailySummary]) -> MetricsResult<()> {
        let mut tables = self.lock()?;
        for summary in rows.iter().filter(|summary| summary.date == date) {
            let existing = tables.summaries.iter().position(|row| {
                row.value.user_id == summary.user_id && row.value.date == summary.date && row.value.role == summary.role
            });
            match existing {
                Some(index) => tables.summaries[index].value = summary.clone(),
                None => {
                    let id = tables.allocate_id();
                    tables.summaries.push(Row {
                        id,
                        batch_id: None,
                        value: summary.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn daily_summaries(&self, start: NaiveDate, end: NaiveDate) -> MetricsResult<Vec<UserDailySummary>> {
        let tables = self.lock()?;
        let mut rows: Vec<UserDailySummary> = tables
            .summaries
            .iter()
            .map(|row| &row.value)
            .filter(|summary| summary.date >= start && summary.date <= end)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.date, &a.user_id, a.role).cmp(&(b.date, &b.user_id, b.role)));
        Ok(rows)
    }

    async fn record_burndown(&self, metric: &BurndownMetric) -> MetricsResult<()> {
        let mut tables = self.lock()?;
        let existing = tables
            .burndown
            .iter()
            .position(|row| row.value.utility == metric.utility && row.value.date == metric.date);
        match existing {
            Some(index) => tables.burndown[index].value = metric.clone(),
            None => {
                let id = tables.allocate_id();
                tables.burndown.push(Row {
                    id,
                    batch_id: None,
                    value: metric.clone(),
                });
            }
        }

        let id = tables.allocate_id();
        tables.history.push(BurndownHistoryRow {
            id,
            metric: metric.clone(),
            recorded_at: Utc::now(),
        });
        Ok(())
    }

    async fn burndown_metrics(&self, utility: Option<&str>, start: NaiveDate, end: NaiveDate) -> MetricsResult<Vec<BurndownMetric>> {
        let tables = self.lock()?;
        let mut rows: Vec<BurndownMetric> = tables
            .burndown
            .iter()
            .map(|row| &row.value)
            .filter(|metric| utility.map_or(true, |wanted| metric.utility == wanted))
            .filter(|metric| metric.date >= start && metric.date <= end)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (&a.utility, a.date).cmp(&(&b.utility, b.date)));
        Ok(rows)
    }

    async fn burndown_history(
        &self,
        utility: Option<&str>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> MetricsResult<Vec<BurndownHistoryRow>> {
        let tables = self.lock()?;
        let mut rows: Vec<BurndownHistoryRow> = tables
            .history
            .iter()
            .filter(|row| utility.map_or(true, |wanted| row.metric.utility == wanted))
            .filter(|row| row.metric.date >= start && row.metric.date <= end)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (&a.metric.utility, a.metric.date, a.id).cmp(&(&b.metric.utility, b.metric.date, b.id)));
        Ok(rows)
    }

    async fn duplicate_counts(&self) -> MetricsResult<Vec<DuplicateCount>> {
        let tables = self.lock()?;
        let counts = [
            (
                "job_snapshots",
                duplicate_groups(&tables.jobs, |row| (row.value.job_id.clone(), row.value.observed_at)),
            ),
            (
                "pole_snapshots",
                duplicate_groups(&tables.poles, |row| {
                    (row.value.job_id.clone(), row.value.pole_id.clone(), row.value.observed_at)
                }),
            ),
            (
                "status_change_log",
                duplicate_groups(&tables.events, |row| {
                    (row.value.entity_type, row.value.entity_id.clone(), row.value.field, row.value.changed_at)
                }),
            ),
            (
                "user_daily_summary",
                duplicate_groups(&tables.summaries, |row| {
                    (row.value.user_id.clone(), row.value.date, row.value.role)
                }),
            ),
            (
                "burndown_metrics",
                duplicate_groups(&tables.burndown, |row| (row.value.utility.clone(), row.value.date)),
            ),
        ];
        Ok(counts
            .into_iter()
            .map(|(table, (groups, surplus_rows))| DuplicateCount {
                table,
                groups,
                surplus_rows,
            })
            .collect())
    }

    async fn compact(&self) -> MetricsResult<Vec<CompactionStats>> {
        let mut tables = self.lock()?;
        let tables = &mut *tables;
        let stats = vec![
            CompactionStats {
                table: "job_snapshots",
                removed: retain_latest(
                    &mut tables.jobs,
                    |row| (row.value.job_id.clone(), row.value.observed_at),
                    |row| row.id,
                ),
            },
            CompactionStats {
                table: "pole_snapshots",
                removed: retain_latest(
                    &mut tables.poles,
                    |row| (row.value.job_id.clone(), row.value.pole_id.clone(), row.value.observed_at),
                    |row| row.id,
                ),
            },
            CompactionStats {
                table: "status_change_log",
                removed: retain_latest(
                    &mut tables.events,
                    |row| (row.value.entity_type, row.value.entity_id.clone(), row.value.field, row.value.changed_at),
                    |row| row.id,
                ),
            },
            CompactionStats {
                table: "user_daily_summary",
                removed: retain_latest(
                    &mut tables.summaries,
                    |row| (row.value.user_id.clone(), row.value.date, row.value.role),
                    |row| row.id,
                ),
            },
            CompactionStats {
                table: "burndown_metrics",
                removed: retain_latest(
                    &mut tables.burndown,
                    |row| (row.value.utility.clone(), row.value.date),
                    |row| row.id,
                ),
            },
        ];
        Ok(stats)
    }

    async fn upsert_project(&self, project: &Project) -> MetricsResult<()> {
        let mut tables = self.lock()?;
        tables.projects.insert(project.project_id.clone(), project.clone());
        Ok(())
    }

    async fn get_project(&self, project_id: &str) -> MetricsResult<Option<Project>> {
        let tables = self.lock()?;
        Ok(tables.projects.get(project_id).cloned())
    }

    async fn list_projects(&self) -> MetricsResult<Vec<Project>> {
        let tables = self.lock()?;
        let mut projects: Vec<Project> = tables.projects.values().cloned().collect();
        projects.sort_by(|a, b| {
            (a.target_date.is_none(), a.target_date, &a.project_id).cmp(&(b.target_date.is_none(), b.target_date, &b.project_id))
        });
        Ok(projects)
    }

    async fn assign_job(&self, job_id: &str, project_id: &str) -> MetricsResult<()> {
        let mut tables = self.lock()?;
        if !tables.projects.contains_key(project_id) {
            return Err(MetricsError::NotFound(format!("project {project_id}")));
        }
        tables.assignments.insert(job_id.to_string(), project_id.to_string());
        Ok(())
    }

    async fn project_job_ids(&self, project_id: &str) -> MetricsResult<Vec<String>> {
        let tables = self.lock()?;
        Ok(tables
            .assignments
            .iter()
            .filter(|(_, assigned)| assigned.as_str() == project_id)
            .map(|(job_id, _)| job_id.clone())
            .collect())
    }
}
