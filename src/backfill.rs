use chrono::NaiveDate;
use serde::Serialize;
use tracing::{error, info};

use crate::engine::MetricsEngine;
use crate::error::{MetricsError, MetricsResult};
use crate::store::MetricsStore;

/// Derived rows written for one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyRun {
    pub date: NaiveDate,
    pub summaries: usize,
    pub burndown: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillDay {
    pub date: NaiveDate,
    pub run: Option<DailyRun>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub days: Vec<BackfillDay>,
}

impl BackfillReport {
    pub fn failures(&self) -> impl Iterator<Item = &BackfillDay> {
        self.days.iter().filter(|day| day.error.is_some())
    }

    pub fn succeeded(&self) -> usize {
        self.days.iter().filter(|day| day.run.is_some()).count()
    }
}

impl<S: MetricsStore> MetricsEngine<S> {
    /// Summary first, then burndown, for a single date.
    pub async fn run_daily(&self, date: NaiveDate) -> MetricsResult<DailyRun> {
        let summaries = self.summarize(date).await?;
        let burndown = self.compute_burndown(date).await?;
        Ok(DailyRun {
            date,
            summaries: summaries.len(),
            burndown: burndown.len(),
        })
    }

    /// Replays [`MetricsEngine::run_daily`] over `[start, end]`, oldest first.
    ///
    /// Dates run strictly one after another because each burndown row reads
    /// the rows of earlier dates. A failing date is recorded and the range
    /// continues.
    pub async fn backfill(&self, start: NaiveDate, end: NaiveDate) -> MetricsResult<BackfillReport> {
        if start > end {
            return Err(MetricsError::InvalidInput(format!(
                "backfill start {start} is after end {end}"
            )));
        }

        let mut report = BackfillReport {
            start,
            end,
            days: Vec::new(),
        };

        for date in start.iter_days().take_while(|date| *date <= end) {
            match self.run_daily(date).await {
                Ok(run) => report.days.push(BackfillDay {
                    date,
                    run: Some(run),
                    error: None,
                }),
                Err(err) => {
                    error!(%date, error = %err, "backfill date failed");
                    report.days.push(BackfillDay {
                        date,
                        run: None,
                        error: Some(err.to_string()),
                    });
                }
            }
        }

        info!(
            %start,
            %end,
            days = report.days.len(),
            failed = report.failures().count(),
            "backfill finished"
        );
        Ok(report)
    }
}
