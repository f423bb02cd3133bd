use std::path::PathBuf;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pole_metrics::config::Settings;
use pole_metrics::models::{IngestCycle, Project};
use pole_metrics::store::PgMetricsStore;
use pole_metrics::MetricsEngine;

#[derive(Parser)]
#[command(name = "pole-metrics")]
#[command(about = "Status-change tracking and burndown metrics for pole jobs", long_about = None)]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Store one polling cycle from a JSON document
    Ingest {
        #[arg(long)]
        file: PathBuf,
    },
    /// Recompute per-user productivity for a day (default: yesterday)
    Summarize {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Recompute per-utility burndown for a day (default: yesterday)
    Burndown {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Summary then burndown for a day (default: yesterday)
    RunDaily {
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Replay summary and burndown over an inclusive date range
    Backfill {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
    },
    /// Collapse duplicate rows and restore unique constraints
    Compact,
    /// Report duplicate keys without changing anything
    CheckDuplicates,
    /// Delete snapshots older than the retention horizon
    Prune {
        #[arg(long)]
        days: Option<i64>,
    },
    /// Status and completion transitions for a job
    History {
        #[arg(long)]
        job_id: String,
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Per-user productivity rows
    Productivity {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
    },
    /// Burndown rows, or their full write history
    BurndownReport {
        #[arg(long)]
        utility: Option<String>,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long)]
        history: bool,
    },
    /// Job status transitions grouped by (old, new) status
    StatusFlow {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
    },
    /// Manage projects and their jobs
    #[command(subcommand)]
    Project(ProjectCommands),
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Create or update a project
    Create {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        utility: Option<String>,
        #[arg(long)]
        zone: Option<String>,
        #[arg(long)]
        target_date: Option<NaiveDate>,
        #[arg(long, default_value_t = 0)]
        field_resources: i32,
        #[arg(long, default_value_t = 0)]
        back_office_resources: i32,
    },
    /// Import projects from a tracker CSV export
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Assign a job to a project
    Assign {
        #[arg(long)]
        job_id: String,
        #[arg(long)]
        project_id: String,
    },
    /// Progress and schedule status of a project
    Progress {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    List,
}

fn yesterday() -> anyhow::Result<NaiveDate> {
    Utc::now()
        .date_naive()
        .pred_opt()
        .context("no date before today")
}

fn or_yesterday(date: Option<NaiveDate>) -> anyhow::Result<NaiveDate> {
    date.map_or_else(yesterday, Ok)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.settings.burndown()?;
    let database_url = cli
        .settings
        .database_url()
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let store = PgMetricsStore::connect(database_url, cli.settings.max_connections()?)
        .await
        .context("failed to connect to Postgres")?;

    if let Commands::InitDb = cli.command {
        store.migrate().await?;
        println!("Schema ready.");
        return Ok(());
    }

    let engine = MetricsEngine::new(store, config);

    match cli.command {
        Commands::InitDb => {}
        Commands::Ingest { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let cycle: IngestCycle = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a valid ingest document", file.display()))?;
            let report = engine.ingest(&cycle).await;

            println!(
                "Batch {}: {} jobs, {} poles written, {} duplicates skipped, {} events logged.",
                report.batch_id,
                report.jobs_written,
                report.poles_written,
                report.duplicates,
                report.events_logged
            );
            for failure in &report.failures {
                println!("- {} failed: {}", failure.entity, failure.error);
            }
            if !report.failures.is_empty() {
                anyhow::bail!("{} snapshots were rejected", report.failures.len());
            }
        }
        Commands::Summarize { date } => {
            let date = or_yesterday(date)?;
            let rows = engine.summarize(date).await?;
            println!("Wrote {} productivity rows for {date}.", rows.len());
        }
        Commands::Burndown { date } => {
            let date = or_yesterday(date)?;
            let metrics = engine.compute_burndown(date).await?;
            println!("Wrote {} burndown rows for {date}.", metrics.len());
        }
        Commands::RunDaily { date } => {
            let run = engine.run_daily(or_yesterday(date)?).await?;
            println!(
                "{}: {} productivity rows, {} burndown rows.",
                run.date, run.summaries, run.burndown
            );
        }
        Commands::Backfill { start, end } => {
            let report = engine.backfill(start, end).await?;
            println!(
                "Backfilled {} of {} days from {start} to {end}.",
                report.succeeded(),
                report.days.len()
            );
            let failed: Vec<_> = report.failures().collect();
            for day in &failed {
                println!("- {} failed: {}", day.date, day.error.as_deref().unwrap_or("unknown"));
            }
            if !failed.is_empty() {
                anyhow::bail!("{} backfill dates failed", failed.len());
            }
        }
        Commands::Compact => {
            for stats in engine.compact().await? {
                println!("{}: removed {} duplicate rows", stats.table, stats.removed);
            }
        }
        Commands::CheckDuplicates => {
            let counts = engine.check_duplicates().await?;
            for count in &counts {
                println!(
                    "{}: {} duplicate keys, {} surplus rows",
                    count.table, count.groups, count.surplus_rows
                );
            }
            if counts.iter().any(|count| count.groups > 0) {
                anyhow::bail!("duplicate keys present; run `pole-metrics compact`");
            }
        }
        Commands::Prune { days } => {
            let horizon = days.unwrap_or(cli.settings.retention_days);
            let stats = engine.prune(horizon, Utc::now()).await?;
            println!(
                "Pruned {} job and {} pole snapshots older than {horizon} days.",
                stats.job_snapshots, stats.pole_snapshots
            );
        }
        Commands::History { job_id, days } => {
            let events = engine.status_history(&job_id, days, Utc::now()).await?;
            if events.is_empty() {
                println!("No transitions for {job_id} in the last {days} days.");
                return Ok(());
            }
            for event in events {
                println!(
                    "{} {} {} {}: {} -> {} by {} ({})",
                    event.changed_at.format("%Y-%m-%d %H:%M"),
                    event.entity_type.as_str(),
                    event.entity_id,
                    event.field.as_str(),
                    event.old_value.as_deref().unwrap_or("-"),
                    event.new_value.as_deref().unwrap_or("-"),
                    event.changed_by.as_deref().unwrap_or("unknown"),
                    event
                        .duration_hours
                        .map(|hours| format!("{hours:.1}h"))
                        .unwrap_or_else(|| "n/a".to_string())
                );
            }
        }
        Commands::Productivity { start, end } => {
            let rows = engine.productivity(start, end).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::BurndownReport {
            utility,
            start,
            end,
            history,
        } => {
            let output = if history {
                serde_json::to_string_pretty(&engine.burndown_history(utility.as_deref(), start, end).await?)?
            } else {
                serde_json::to_string_pretty(&engine.burndown(utility.as_deref(), start, end).await?)?
            };
            println!("{output}");
        }
        Commands::StatusFlow { start, end } => {
            let flows = engine.status_flow(start, end).await?;
            if flows.is_empty() {
                println!("No status transitions between {start} and {end}.");
                return Ok(());
            }
            for flow in flows {
                println!(
                    "- {} -> {}: {} ({:.1}%), mean {} in prior status",
                    flow.old_status.as_deref().unwrap_or("(none)"),
                    flow.new_status.as_deref().unwrap_or("(none)"),
                    flow.transitions,
                    flow.share_pct,
                    flow.mean_hours_in_prior
                        .map(|hours| format!("{hours:.1}h"))
                        .unwrap_or_else(|| "n/a".to_string())
                );
            }
        }
        Commands::Project(command) => match command {
            ProjectCommands::Create {
                project_id,
                name,
                utility,
                zone,
                target_date,
                field_resources,
                back_office_resources,
            } => {
                engine
                    .upsert_project(&Project {
                        project_id: project_id.clone(),
                        name,
                        utility,
                        zone,
                        target_date,
                        field_resources,
                        back_office_resources,
                    })
                    .await?;
                println!("Project {project_id} saved.");
            }
            ProjectCommands::Import { csv } => {
                let imported = engine.import_projects_csv(&csv).await?;
                println!("Imported {imported} projects from {}.", csv.display());
            }
            ProjectCommands::Assign { job_id, project_id } => {
                engine.assign_job(&job_id, &project_id).await?;
                println!("Job {job_id} assigned to {project_id}.");
            }
            ProjectCommands::Progress { project_id, date } => {
                let progress = engine.project_progress(&project_id, or_yesterday(date)?).await?;
                println!(
                    "{} as of {}: {}/{} poles ({:.1}%), {:.1}/day vs {:.1}/day required, {}",
                    progress.project_id,
                    progress.as_of,
                    progress.completed_poles,
                    progress.total_poles,
                    progress.progress * 100.0,
                    progress.current_daily_rate,
                    progress.required_daily_rate,
                    progress.status.label()
                );
                if let Some(projected) = progress.projected_completion {
                    println!("Projected completion: {projected}");
                }
            }
            ProjectCommands::List => {
                for project in engine.list_projects().await? {
                    println!(
                        "- {} {} (target {})",
                        project.project_id,
                        project.name,
                        project
                            .target_date
                            .map(|date| date.to_string())
                            .unwrap_or_else(|| "none".to_string())
                    );
                }
            }
        },
    }

    Ok(())
}
