use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::compact::DEDUP_TARGETS;
use crate::detector::{self, PriorState};
use crate::error::{MetricsError, MetricsResult};
use crate::models::{
    BurndownHistoryRow, BurndownMetric, CompactionStats, DuplicateCount, EntityType, JobSnapshot, PoleSnapshot,
    ProgressEvent, Project, PruneStats, StatusChangeEvent, TrackedField, UserDailySummary, WriteOutcome,
};
use crate::store::{day_bounds, MetricsStore};

const JOB_COLUMNS: &str = "job_id, status, utility, total_poles, completed_poles, field_complete, \
     back_office_complete, assigned_users, priority, target_date, observed_at";

const POLE_COLUMNS: &str = "job_id, pole_id, utility, field_completed, field_completed_by, field_completed_at, \
     back_office_completed, back_office_completed_by, back_office_completed_at, pole_height, pole_class, \
     make_ready_status, observed_at";

const EVENT_COLUMNS: &str =
    "job_id, entity_type, entity_id, field_name, old_value, new_value, changed_at, changed_by, duration_hours";

const METRIC_COLUMNS: &str = "utility, metric_date, total_poles, completed_poles, run_rate, trailing_rate, \
     projected_completion, actual_resources, required_resources";

#[derive(Clone)]
pub struct PgMetricsStore {
    pool: PgPool,
}

impl PgMetricsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> MetricsResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create or upgrade the schema.
    pub async fn migrate(&self) -> MetricsResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Transaction-scoped advisory lock; released on commit or rollback.
async fn lock_key(conn: &mut PgConnection, key: &str) -> MetricsResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(key)
        .execute(conn)
        .await?;
    Ok(())
}

async fn last_transitions(
    conn: &mut PgConnection,
    entity_type: EntityType,
    job_id: &str,
    entity_id: &str,
    before: DateTime<Utc>,
) -> MetricsResult<HashMap<TrackedField, DateTime<Utc>>> {
    let rows = sqlx::query(
        r#"
        SELECT field_name, MAX(changed_at) AS last_changed
        FROM pole_metrics.status_change_log
        WHERE entity_type = $1 AND job_id = $2 AND entity_id = $3 AND changed_at < $4
        GROUP BY field_name
        "#,
    )
    .bind(entity_type.as_str())
    .bind(job_id)
    .bind(entity_id)
    .bind(before)
    .fetch_all(conn)
    .await?;

    let mut last = HashMap::new();
    for row in rows {
        let field: String = row.try_get("field_name")?;
        last.insert(field.parse::<TrackedField>()?, row.try_get("last_changed")?);
    }
    Ok(last)
}

async fn insert_events(conn: &mut PgConnection, events: &[StatusChangeEvent]) -> MetricsResult<usize> {
    let mut inserted = 0usize;
    for event in events {
        let result = sqlx::query(&format!(
            "INSERT INTO pole_metrics.status_change_log ({EVENT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) ON CONFLICT DO NOTHING"
        ))
        .bind(&event.job_id)
        .bind(event.entity_type.as_str())
        .bind(&event.entity_id)
        .bind(event.field.as_str())
        .bind(&event.old_value)
        .bind(&event.new_value)
        .bind(event.changed_at)
        .bind(&event.changed_by)
        .bind(event.duration_hours)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() > 0 {
            inserted += 1;
        }
    }
    Ok(inserted)
}

fn job_from_row(row: &PgRow) -> MetricsResult<JobSnapshot> {
    let assigned_users: Vec<String> = row.try_get("assigned_users")?;
    Ok(JobSnapshot {
        job_id: row.try_get("job_id")?,
        status: row.try_get("status")?,
        utility: row.try_get("utility")?,
        total_poles: row.try_get("total_poles")?,
        completed_poles: row.try_get("completed_poles")?,
        field_complete: row.try_get("field_complete")?,
        back_office_complete: row.try_get("back_office_complete")?,
        assigned_users: assigned_users.into_iter().collect(),
        priority: row.try_get("priority")?,
        target_date: row.try_get("target_date")?,
        observed_at: row.try_get("observed_at")?,
    })
}

fn pole_from_row(row: &PgRow) -> MetricsResult<PoleSnapshot> {
    Ok(PoleSnapshot {
        job_id: row.try_get("job_id")?,
        pole_id: row.try_get("pole_id")?,
        utility: row.try_get("utility")?,
        field_completed: row.try_get("field_completed")?,
        field_completed_by: row.try_get("field_completed_by")?,
        field_completed_at: row.try_get("field_completed_at")?,
        back_office_completed: row.try_get("back_office_completed")?,
        back_office_completed_by: row.try_get("back_office_completed_by")?,
        back_office_completed_at: row.try_get("back_office_completed_at")?,
        pole_height: row.try_get("pole_height")?,
        pole_class: row.try_get("pole_class")?,
        make_ready_status: row.try_get("make_ready_status")?,
        observed_at: row.try_get("observed_at")?,
    })
}

fn event_from_row(row: &PgRow) -> MetricsResult<StatusChangeEvent> {
    let entity_type: String = row.try_get("entity_type")?;
    let field: String = row.try_get("field_name")?;
    Ok(StatusChangeEvent {
        job_id: row.try_get("job_id")?,
        entity_type: entity_type.parse()?,
        entity_id: row.try_get("entity_id")?,
        field: field.parse()?,
        old_value: row.try_get("old_value")?,
        new_value: row.try_get("new_value")?,
        changed_at: row.try_get("changed_at")?,
        changed_by: row.try_get("changed_by")?,
        duration_hours: row.try_get("duration_hours")?,
    })
}

fn metric_from_row(row: &PgRow) -> MetricsResult<BurndownMetric> {
    Ok(BurndownMetric {
        utility: row.try_get("utility")?,
        date: row.try_get("metric_date")?,
        total_poles: row.try_get("total_poles")?,
        completed_poles: row.try_get("completed_poles")?,
        run_rate: row.try_get("run_rate")?,
        trailing_rate: row.try_get("trailing_rate")?,
        projected_completion: row.try_get("projected_completion")?,
        actual_resources: row.try_get("actual_resources")?,
        required_resources: row.try_get("required_resources")?,
    })
}

fn project_from_row(row: &PgRow) -> MetricsResult<Project> {
    Ok(Project {
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        utility: row.try_get("utility")?,
        zone: row.try_get("zone")?,
        target_date: row.try_get("target_date")?,
        field_resources: row.try_get("field_resources")?,
        back_office_resources: row.try_get("back_office_resources")?,
    })
}

#[async_trait]
impl MetricsStore for PgMetricsStore {
    async fn write_job(&self, snapshot: &JobSnapshot, batch_id: Uuid) -> MetricsResult<WriteOutcome> {
        let mut tx = self.pool.begin().await?;
        lock_key(&mut tx, &format!("job:{}", snapshot.job_id)).await?;

        let existing = sqlx::query(
            "SELECT 1 FROM pole_metrics.job_snapshots WHERE job_id = $1 AND observed_at = $2 LIMIT 1",
        )
        .bind(&snapshot.job_id)
        .bind(snapshot.observed_at)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            tx.rollback().await?;
            return Ok(WriteOutcome::Duplicate);
        }

        let previous = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM pole_metrics.job_snapshots \
             WHERE job_id = $1 AND observed_at < $2 \
             ORDER BY observed_at DESC, id DESC LIMIT 1"
        ))
        .bind(&snapshot.job_id)
        .bind(snapshot.observed_at)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| job_from_row(&row))
        .transpose()?;

        let first_observed_at: Option<DateTime<Utc>> = sqlx::query(
            "SELECT MIN(observed_at) AS first_observed_at FROM pole_metrics.job_snapshots \
             WHERE job_id = $1 AND observed_at < $2",
        )
        .bind(&snapshot.job_id)
        .bind(snapshot.observed_at)
        .fetch_one(&mut *tx)
        .await?
        .try_get("first_observed_at")?;

        let prior = PriorState {
            previous,
            first_observed_at,
            last_transitions: last_transitions(
                &mut tx,
                EntityType::Job,
                &snapshot.job_id,
                &snapshot.job_id,
                snapshot.observed_at,
            )
            .await?,
        };
        let events = detector::detect_job_changes(&prior, snapshot);

        let assigned_users: Vec<String> = snapshot.assigned_users.iter().cloned().collect();
        let inserted = sqlx::query(&format!(
            "INSERT INTO pole_metrics.job_snapshots (batch_id, {JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT DO NOTHING RETURNING id"
        ))
        .bind(batch_id)
        .bind(&snapshot.job_id)
        .bind(&snapshot.status)
        .bind(&snapshot.utility)
        .bind(snapshot.total_poles)
        .bind(snapshot.completed_poles)
        .bind(snapshot.field_complete)
        .bind(snapshot.back_office_complete)
        .bind(assigned_users)
        .bind(snapshot.priority)
        .bind(snapshot.target_date)
        .bind(snapshot.observed_at)
        .fetch_optional(&mut *tx)
        .await?;
        if inserted.is_none() {
            tx.rollback().await?;
            return Ok(WriteOutcome::Duplicate);
        }

        let logged = insert_events(&mut tx, &events).await?;
        tx.commit().await?;
        Ok(WriteOutcome::Inserted { events: logged })
    }

    async fn write_pole(&self, snapshot: &PoleSnapshot, batch_id: Uuid) -> MetricsResult<WriteOutcome> {
        let mut tx = self.pool.begin().await?;
        lock_key(&mut tx, &format!("pole:{}:{}", snapshot.job_id, snapshot.pole_id)).await?;

        let existing = sqlx::query(
            "SELECT 1 FROM pole_metrics.pole_snapshots \
             WHERE job_id = $1 AND pole_id = $2 AND observed_at = $3 LIMIT 1",
        )
        .bind(&snapshot.job_id)
        .bind(&snapshot.pole_id)
        .bind(snapshot.observed_at)
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            tx.rollback().await?;
            return Ok(WriteOutcome::Duplicate);
        }

        let previous = sqlx::query(&format!(
            "SELECT {POLE_COLUMNS} FROM pole_metrics.pole_snapshots \
             WHERE job_id = $1 AND pole_id = $2 AND observed_at < $3 \
             ORDER BY observed_at DESC, id DESC LIMIT 1"
        ))
        .bind(&snapshot.job_id)
        .bind(&snapshot.pole_id)
        .bind(snapshot.observed_at)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| pole_from_row(&row))
        .transpose()?;

        let first_observed_at: Option<DateTime<Utc>> = sqlx::query(
            "SELECT MIN(observed_at) AS first_observed_at FROM pole_metrics.pole_snapshots \
             WHERE job_id = $1 AND pole_id = $2 AND observed_at < $3",
        )
        .bind(&snapshot.job_id)
        .bind(&snapshot.pole_id)
        .bind(snapshot.observed_at)
        .fetch_one(&mut *tx)
        .await?
        .try_get("first_observed_at")?;

        let prior = PriorState {
            previous,
            first_observed_at,
            last_transitions: last_transitions(
                &mut tx,
                EntityType::Pole,
                &snapshot.job_id,
                &snapshot.pole_id,
                snapshot.observed_at,
            )
            .await?,
        };
        let detection = detector::detect_pole_changes(&prior, snapshot);
        let back_office_completed_at = detection
            .back_office_completed_at
            .or(snapshot.back_office_completed_at);

        let inserted = sqlx::query(&format!(
            "INSERT INTO pole_metrics.pole_snapshots (batch_id, {POLE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
             ON CONFLICT DO NOTHING RETURNING id"
        ))
        .bind(batch_id)
        .bind(&snapshot.job_id)
        .bind(&snapshot.pole_id)
        .bind(&snapshot.utility)
        .bind(snapshot.field_completed)
        .bind(&snapshot.field_completed_by)
        .bind(snapshot.field_completed_at)
        .bind(snapshot.back_office_completed)
        .bind(&snapshot.back_office_completed_by)
        .bind(back_office_completed_at)
        .bind(&snapshot.pole_height)
        .bind(&snapshot.pole_class)
        .bind(&snapshot.make_ready_status)
        .bind(snapshot.observed_at)
        .fetch_optional(&mut *tx)
        .await?;
        if inserted.is_none() {
            tx.rollback().await?;
            return Ok(WriteOutcome::Duplicate);
        }

        let logged = insert_events(&mut tx, &detection.events).await?;
        tx.commit().await?;
        Ok(WriteOutcome::Inserted { events: logged })
    }

    async fn latest_jobs_on(&self, date: NaiveDate) -> MetricsResult<Vec<JobSnapshot>> {
        let (start, end) = day_bounds(date);
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT ON (job_id) {JOB_COLUMNS} FROM pole_metrics.job_snapshots \
             WHERE observed_at >= $1 AND observed_at < $2 \
             ORDER BY job_id, observed_at DESC, id DESC"
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn latest_jobs_before(&self, job_ids: &[String], before: DateTime<Utc>) -> MetricsResult<Vec<JobSnapshot>> {
        let rows = sqlx::query(&format!(
            "SELECT DISTINCT ON (job_id) {JOB_COLUMNS} FROM pole_metrics.job_snapshots \
             WHERE job_id = ANY($1) AND observed_at < $2 \
             ORDER BY job_id, observed_at DESC, id DESC"
        ))
        .bind(job_ids)
        .bind(before)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn prune_snapshots(&self, cutoff: DateTime<Utc>) -> MetricsResult<PruneStats> {
        let mut tx = self.pool.begin().await?;

        let jobs = sqlx::query(
            r#"
            DELETE FROM pole_metrics.job_snapshots s
            WHERE s.observed_at < $1
              AND s.observed_at < (
                  SELECT MAX(l.observed_at) FROM pole_metrics.job_snapshots l
                  WHERE l.job_id = s.job_id
              )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let poles = sqlx::query(
            r#"
            DELETE FROM pole_metrics.pole_snapshots s
            WHERE s.observed_at < $1
              AND s.observed_at < (
                  SELECT MAX(l.observed_at) FROM pole_metrics.pole_snapshots l
                  WHERE l.job_id = s.job_id AND l.pole_id = s.pole_id
              )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(PruneStats {
            job_snapshots: jobs.rows_affected(),
            pole_snapshots: poles.rows_affected(),
        })
    }

    async fn progress_events_on(&self, date: NaiveDate) -> MetricsResult<Vec<ProgressEvent>> {
        let (start, end) = day_bounds(date);
        let rows = sqlx::query(
            r#"
            SELECT e.job_id, e.entity_type, e.entity_id, e.field_name, e.old_value, e.new_value,
                   e.changed_at, e.changed_by, e.duration_hours,
                   COALESCE(
                       (SELECT p.utility FROM pole_metrics.pole_snapshots p
                        WHERE p.job_id = e.job_id AND p.pole_id = e.entity_id AND p.observed_at = e.changed_at
                        ORDER BY p.id DESC LIMIT 1),
                       (SELECT j.utility FROM pole_metrics.job_snapshots j
                        WHERE j.job_id = e.job_id AND j.observed_at <= e.changed_at
                        ORDER BY j.observed_at DESC, j.id DESC LIMIT 1)
                   ) AS utility
            FROM pole_metrics.status_change_log e
            WHERE e.field_name IN ('field_completed', 'back_office_completed')
              AND e.changed_at >= $1 AND e.changed_at < $2
            ORDER BY e.changed_at, e.entity_id, e.field_name
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(ProgressEvent {
                event: event_from_row(&row)?,
                utility: row.try_get("utility")?,
            });
        }
        Ok(events)
    }

    async fn job_events_since(&self, job_id: &str, since: DateTime<Utc>) -> MetricsResult<Vec<StatusChangeEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM pole_metrics.status_change_log \
             WHERE job_id = $1 AND changed_at >= $2 \
             ORDER BY changed_at, entity_type, entity_id, field_name"
        ))
        .bind(job_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn status_events_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> MetricsResult<Vec<StatusChangeEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM pole_metrics.status_change_log \
             WHERE field_name = 'status' AND changed_at >= $1 AND changed_at < $2 \
             ORDER BY changed_at, entity_id"
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn upsert_daily_summaries(&self, date: NaiveDate, rows: &[UserDailySummary]) -> MetricsResult<()> {
        let mut tx = self.pool.begin().await?;
        lock_key(&mut tx, &format!("summary:{date}")).await?;

        for summary in rows.iter().filter(|summary| summary.date == date) {
            sqlx::query(
                r#"
                INSERT INTO pole_metrics.user_daily_summary
                (user_id, summary_date, role, poles_completed, utilities, jobs)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (user_id, summary_date, role) DO UPDATE
                SET poles_completed = EXCLUDED.poles_completed,
                    utilities = EXCLUDED.utilities,
                    jobs = EXCLUDED.jobs
                "#,
            )
            .bind(&summary.user_id)
            .bind(summary.date)
            .bind(summary.role.as_str())
            .bind(summary.poles_completed)
            .bind(&summary.utilities)
            .bind(&summary.jobs)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn daily_summaries(&self, start: NaiveDate, end: NaiveDate) -> MetricsResult<Vec<UserDailySummary>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, summary_date, role, poles_completed, utilities, jobs
            FROM pole_metrics.user_daily_summary
            WHERE summary_date BETWEEN $1 AND $2
            ORDER BY summary_date, user_id, role
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let role: String = row.try_get("role")?;
            summaries.push(UserDailySummary {
                user_id: row.try_get("user_id")?,
                date: row.try_get("summary_date")?,
                role: role.parse()?,
                poles_completed: row.try_get("poles_completed")?,
                utilities: row.try_get("utilities")?,
                jobs: row.try_get("jobs")?,
            });
        }
        Ok(summaries)
    }

    async fn record_burndown(&self, metric: &BurndownMetric) -> MetricsResult<()> {
        let mut tx = self.pool.begin().await?;
        lock_key(&mut tx, &format!("burndown:{}:{}", metric.utility, metric.date)).await?;

        sqlx::query(&format!(
            "INSERT INTO pole_metrics.burndown_metrics ({METRIC_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (utility, metric_date) DO UPDATE \
             SET total_poles = EXCLUDED.total_poles, \
                 completed_poles = EXCLUDED.completed_poles, \
                 run_rate = EXCLUDED.run_rate, \
                 trailing_rate = EXCLUDED.trailing_rate, \
                 projected_completion = EXCLUDED.projected_completion, \
                 actual_resources = EXCLUDED.actual_resources, \
                 required_resources = EXCLUDED.required_resources"
        ))
        .bind(&metric.utility)
        .bind(metric.date)
        .bind(metric.total_poles)
        .bind(metric.completed_poles)
        .bind(metric.run_rate)
        .bind(metric.trailing_rate)
        .bind(metric.projected_completion)
        .bind(metric.actual_resources)
        .bind(metric.required_resources)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "INSERT INTO pole_metrics.burndown_history ({METRIC_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(&metric.utility)
        .bind(metric.date)
        .bind(metric.total_poles)
        .bind(metric.completed_poles)
        .bind(metric.run_rate)
        .bind(metric.trailing_rate)
        .bind(metric.projected_completion)
        .bind(metric.actual_resources)
        .bind(metric.required_resources)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn burndown_metrics(&self, utility: Option<&str>, start: NaiveDate, end: NaiveDate) -> MetricsResult<Vec<BurndownMetric>> {
        let rows = sqlx::query(&format!(
            "SELECT {METRIC_COLUMNS} FROM pole_metrics.burndown_metrics \
             WHERE ($1::TEXT IS NULL OR utility = $1) AND metric_date BETWEEN $2 AND $3 \
             ORDER BY utility, metric_date"
        ))
        .bind(utility)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(metric_from_row).collect()
    }

    async fn burndown_history(
        &self,
        utility: Option<&str>,
        start: NaiveDate,
        end: NaiveDate,
    ) -> MetricsResult<Vec<BurndownHistoryRow>> {
        let rows = sqlx::query(&format!(
            "SELECT id, recorded_at, {METRIC_COLUMNS} FROM pole_metrics.burndown_history \
             WHERE ($1::TEXT IS NULL OR utility = $1) AND metric_date BETWEEN $2 AND $3 \
             ORDER BY utility, metric_date, id"
        ))
        .bind(utility)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut history = Vec::with_capacity(rows.len());
        for row in rows {
            history.push(BurndownHistoryRow {
                id: row.try_get("id")?,
                metric: metric_from_row(&row)?,
                recorded_at: row.try_get("recorded_at")?,
            });
        }
        Ok(history)
    }

    async fn duplicate_counts(&self) -> MetricsResult<Vec<DuplicateCount>> {
        let mut counts = Vec::with_capacity(DEDUP_TARGETS.len());
        for target in DEDUP_TARGETS {
            let row = sqlx::query(&format!(
                "SELECT COUNT(*)::BIGINT AS duplicate_groups, \
                        COALESCE(SUM(n - 1), 0)::BIGINT AS surplus_rows \
                 FROM (SELECT COUNT(*) AS n FROM pole_metrics.{table} \
                       GROUP BY {keys} HAVING COUNT(*) > 1) dupes",
                table = target.table,
                keys = target.key_columns.join(", "),
            ))
            .fetch_one(&self.pool)
            .await?;

            counts.push(DuplicateCount {
                table: target.table,
                groups: row.try_get("duplicate_groups")?,
                surplus_rows: row.try_get("surplus_rows")?,
            });
        }
        Ok(counts)
    }

    async fn compact(&self) -> MetricsResult<Vec<CompactionStats>> {
        let mut tx = self.pool.begin().await?;
        let mut stats = Vec::with_capacity(DEDUP_TARGETS.len());

        for target in DEDUP_TARGETS {
            let keys = target.key_columns.join(", ");
            sqlx::query(&format!(
                "LOCK TABLE pole_metrics.{} IN SHARE ROW EXCLUSIVE MODE",
                target.table
            ))
            .execute(&mut *tx)
            .await?;

            let removed = sqlx::query(&format!(
                "DELETE FROM pole_metrics.{table} WHERE id IN ( \
                     SELECT id FROM ( \
                         SELECT id, ROW_NUMBER() OVER (PARTITION BY {keys} ORDER BY id DESC) AS rn \
                         FROM pole_metrics.{table} \
                     ) ranked WHERE rn > 1 \
                 )",
                table = target.table,
            ))
            .execute(&mut *tx)
            .await?
            .rows_affected();

            let present: bool = sqlx::query(
                "SELECT EXISTS ( \
                     SELECT 1 FROM pg_constraint c \
                     JOIN pg_namespace n ON n.oid = c.connamespace \
                     WHERE n.nspname = 'pole_metrics' AND c.conname = $1 \
                 ) AS present",
            )
            .bind(target.constraint)
            .fetch_one(&mut *tx)
            .await?
            .try_get("present")?;

            if !present {
                sqlx::query(&format!(
                    "ALTER TABLE pole_metrics.{} ADD CONSTRAINT {} UNIQUE ({keys})",
                    target.table, target.constraint
                ))
                .execute(&mut *tx)
                .await?;
                tracing::info!(table = target.table, constraint = target.constraint, "restored unique constraint");
            }

            stats.push(CompactionStats {
                table: target.table,
                removed,
            });
        }

        tx.commit().await?;
        Ok(stats)
    }

    async fn upsert_project(&self, project: &Project) -> MetricsResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pole_metrics.projects
            (project_id, name, utility, zone, target_date, field_resources, back_office_resources)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (project_id) DO UPDATE
            SET name = EXCLUDED.name,
                utility = EXCLUDED.utility,
                zone = EXCLUDED.zone,
                target_date = EXCLUDED.target_date,
                field_resources = EXCLUDED.field_resources,
                back_office_resources = EXCLUDED.back_office_resources,
                updated_at = NOW()
            "#,
        )
        .bind(&project.project_id)
        .bind(&project.name)
        .bind(&project.utility)
        .bind(&project.zone)
        .bind(project.target_date)
        .bind(project.field_resources)
        .bind(project.back_office_resources)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_project(&self, project_id: &str) -> MetricsResult<Option<Project>> {
        let row = sqlx::query(
            r#"
            SELECT project_id, name, utility, zone, target_date, field_resources, back_office_resources
            FROM pole_metrics.projects
            WHERE project_id = $1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(project_from_row).transpose()
    }

    async fn list_projects(&self) -> MetricsResult<Vec<Project>> {
        let rows = sqlx::query(
            r#"
            SELECT project_id, name, utility, zone, target_date, field_resources, back_office_resources
            FROM pole_metrics.projects
            ORDER BY target_date NULLS LAST, project_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(project_from_row).collect()
    }

    async fn assign_job(&self, job_id: &str, project_id: &str) -> MetricsResult<()> {
        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query("SELECT 1 FROM pole_metrics.projects WHERE project_id = $1 FOR SHARE")
            .bind(project_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            tx.rollback().await?;
            return Err(MetricsError::NotFound(format!("project {project_id}")));
        }

        sqlx::query(
            r#"
            INSERT INTO pole_metrics.project_jobs (job_id, project_id)
            VALUES ($1, $2)
            ON CONFLICT (job_id) DO UPDATE
            SET project_id = EXCLUDED.project_id, assigned_at = NOW()
            "#,
        )
        .bind(job_id)
        .bind(project_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn project_job_ids(&self, project_id: &str) -> MetricsResult<Vec<String>> {
        let rows = sqlx::query("SELECT job_id FROM pole_metrics.project_jobs WHERE project_id = $1 ORDER BY job_id")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("job_id").map_err(MetricsError::from))
            .collect()
    }
}
