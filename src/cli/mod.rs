//! Command-line interface for tenderwatch.
//!
//! Thin wrappers over the orchestrator: each command builds the production
//! collaborators from the resolved settings, runs one operation and prints
//! its counts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::{FsBlobStore, HttpCompletionEngine, JsonlWorkQueue, OfficeConverter, PncpRegistry, WorkQueue};
use crate::config::Settings;
use crate::core::orchestrator::Collaborators;
use crate::core::{BatchReport, BudgetPeriod, BudgetSource, Orchestrator, RetryPolicy, TriggerOutcome};
use crate::store::Store;
use crate::worker::{Worker, WorkerOptions};

/// tenderwatch - Procurement document analysis pipeline
#[derive(Parser, Debug)]
#[command(name = "tenderwatch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Prepare registry updates published between two dates
    Prepare {
        /// First day (YYYY-MM-DD)
        #[arg(long)]
        start_date: NaiveDate,

        /// Last day, inclusive (YYYY-MM-DD)
        #[arg(long)]
        end_date: NaiveDate,

        /// Items between sleeps
        #[arg(long)]
        batch_size: Option<usize>,

        #[arg(long)]
        sleep_seconds: Option<u64>,

        /// Stop after this many procurements
        #[arg(long)]
        max_messages: Option<usize>,
    },

    /// Trigger the best-ranked pending analyses within a budget
    Rank {
        /// Fixed budget for this run
        #[arg(long, conflicts_with = "auto_budget")]
        budget: Option<f64>,

        /// Derive the budget from donations and spending
        #[arg(long, requires = "budget_period")]
        auto_budget: bool,

        #[arg(long, value_enum)]
        budget_period: Option<BudgetPeriod>,

        /// Share of the budget for procurements without votes
        #[arg(long)]
        zero_vote_budget_percent: Option<f64>,

        #[arg(long)]
        max_messages: Option<usize>,
    },

    /// Trigger one pending analysis
    Trigger {
        /// Analysis ID (UUID)
        analysis_id: String,
    },

    /// Retry failed and stuck analyses
    Retry {
        #[arg(long)]
        initial_backoff_hours: Option<i64>,

        #[arg(long)]
        max_retries: Option<u32>,

        #[arg(long)]
        timeout_hours: Option<i64>,
    },

    /// Consume analysis requests from the work queue
    Worker {
        #[arg(long)]
        max_concurrency: Option<usize>,

        #[arg(long)]
        max_messages: Option<usize>,

        /// Exit when the queue is empty
        #[arg(long)]
        until_idle: bool,
    },

    /// Record a donation in the budget ledger
    Donate {
        amount: f64,

        #[arg(short, long, default_value = "Donation")]
        description: String,
    },

    /// Show a procurement's versions and analyses, or pipeline totals
    Status {
        /// PNCP control number; omit for analysis counts per status
        control_number: Option<String>,
    },

    /// Show resolved configuration
    Config,
}

/// Production collaborators wired from settings
struct Runtime {
    orchestrator: Arc<Orchestrator>,
    queue: Arc<dyn WorkQueue>,
}

impl Runtime {
    fn build(settings: Settings) -> Result<Self> {
        let store = Arc::new(Store::open(&settings.paths.database)?);
        let queue: Arc<dyn WorkQueue> = Arc::new(JsonlWorkQueue::new(
            settings.paths.queue_dir(),
            i64::try_from(settings.worker.visibility_timeout_secs).unwrap_or(i64::MAX),
        ));
        let collaborators = Collaborators {
            registry: Arc::new(PncpRegistry::new(settings.registry.clone())?),
            engine: Arc::new(HttpCompletionEngine::new(
                settings.completion.endpoint.clone(),
                settings.completion.token.clone(),
                settings.completion.timeout_secs,
            )?),
            blobs: Arc::new(FsBlobStore::new(settings.paths.blob_root())),
            queue: Arc::clone(&queue),
            converter: Arc::new(OfficeConverter::new(settings.converter.clone())),
        };
        Ok(Self {
            orchestrator: Arc::new(Orchestrator::new(store, collaborators, settings)),
            queue,
        })
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self, settings: Settings) -> Result<()> {
        match self.command {
            Commands::Config => show_config(&settings),
            Commands::Prepare {
                start_date,
                end_date,
                batch_size,
                sleep_seconds,
                max_messages,
            } => {
                if end_date < start_date {
                    bail!("--end-date {} is before --start-date {}", end_date, start_date);
                }
                let mut batch = settings.batch.clone();
                if let Some(size) = batch_size {
                    batch.batch_size = size;
                }
                if let Some(secs) = sleep_seconds {
                    batch.sleep_seconds = secs;
                }
                if max_messages.is_some() {
                    batch.max_messages = max_messages;
                }
                let runtime = Runtime::build(settings)?;
                let report = runtime
                    .orchestrator
                    .run_pre_analysis(start_date, end_date, &batch)
                    .await?;
                print_report("Pre-analysis", &report);
                Ok(())
            }
            Commands::Rank {
                budget,
                auto_budget,
                budget_period,
                zero_vote_budget_percent,
                max_messages,
            } => {
                let source = match (budget, auto_budget, budget_period) {
                    (Some(amount), false, _) => BudgetSource::Fixed(amount),
                    (None, true, Some(period)) => BudgetSource::Auto(period),
                    _ => bail!("Pass either --budget <amount> or --auto-budget --budget-period <period>"),
                };
                let zero_vote = zero_vote_budget_percent.unwrap_or(settings.batch.zero_vote_percent);
                let max_messages = max_messages.or(settings.batch.max_messages);
                let runtime = Runtime::build(settings)?;
                let run = runtime
                    .orchestrator
                    .run_ranked_analysis(source, zero_vote, max_messages)
                    .await?;
                println!("Budget: {:.2}  Estimated spend: {:.2}", run.budget, run.spent);
                print_report("Ranked run", &run.counts);
                Ok(())
            }
            Commands::Trigger { analysis_id } => {
                let id = Uuid::parse_str(&analysis_id)
                    .with_context(|| format!("Invalid analysis ID: {}", analysis_id))?;
                let runtime = Runtime::build(settings)?;
                match runtime.orchestrator.trigger(id).await? {
                    TriggerOutcome::Triggered { message_id } => {
                        println!("Triggered {} (message {})", id, message_id);
                    }
                    TriggerOutcome::Skipped(reason) => println!("Skipped {}: {}", id, reason),
                }
                Ok(())
            }
            Commands::Retry {
                initial_backoff_hours,
                max_retries,
                timeout_hours,
            } => {
                let defaults = settings.retry.clone();
                let policy = RetryPolicy {
                    initial_backoff_hours: initial_backoff_hours.unwrap_or(defaults.initial_backoff_hours),
                    max_retries: max_retries.unwrap_or(defaults.max_retries),
                    timeout_hours: timeout_hours.unwrap_or(defaults.timeout_hours),
                };
                let runtime = Runtime::build(settings)?;
                let report = runtime.orchestrator.retry_analyses(&policy).await?;
                print_report("Retry", &report);
                Ok(())
            }
            Commands::Worker {
                max_concurrency,
                max_messages,
                until_idle,
            } => {
                let options = WorkerOptions {
                    max_concurrency: max_concurrency.unwrap_or(settings.worker.max_concurrency),
                    max_messages,
                    until_idle,
                    poll_interval: Duration::from_secs(settings.worker.poll_interval_secs),
                };
                let topic = settings.worker.topic.clone();
                let runtime = Runtime::build(settings)?;
                let worker = Worker::new(runtime.orchestrator, runtime.queue, topic, options);
                let report = worker.run().await?;
                print_report("Worker", &report);
                Ok(())
            }
            Commands::Donate { amount, description } => {
                let runtime = Runtime::build(settings)?;
                let entry = runtime.orchestrator.donate(amount, description)?;
                println!("Recorded donation of {:.2} ({})", entry.amount, entry.id);
                Ok(())
            }
            Commands::Status { control_number } => {
                let runtime = Runtime::build(settings)?;
                match control_number {
                    Some(cn) => show_status(&runtime.orchestrator, &cn),
                    None => show_totals(runtime.orchestrator.store()),
                }
            }
        }
    }
}

fn print_report(label: &str, report: &BatchReport) {
    println!(
        "{}: {} succeeded, {} failed, {} skipped",
        label, report.succeeded, report.failed, report.skipped
    );
}

fn show_status(orchestrator: &Orchestrator, control_number: &str) -> Result<()> {
    let Some(status) = orchestrator.overall_status(control_number)? else {
        println!("No versions stored for {}", control_number);
        return Ok(());
    };

    let version = &status.version;
    println!("Procurement: {}", control_number);
    println!("Latest version: {} (votes: {})", version.version_number, version.votes_count);
    if let Some(scores) = &version.scores {
        println!(
            "Priority: {} (quality {}, impact {}, temporal {}, est. cost {:.4}, stable: {})",
            scores.priority_score,
            scores.quality_score,
            scores.potential_impact_score,
            scores.temporal_score,
            scores.estimated_cost,
            scores.is_stable
        );
    }

    println!("\n{:<38} {:<8} {:<28} {:<6} {:>10}", "ANALYSIS", "VERSION", "STATUS", "RETRY", "COST");
    println!("{}", "-".repeat(94));
    for analysis in &status.analyses {
        println!(
            "{:<38} {:<8} {:<28} {:<6} {:>10.4}",
            analysis.id,
            analysis.version_number,
            analysis.status,
            analysis.retry_count,
            analysis.costs.total_cost
        );
    }

    if !status.history.is_empty() {
        println!("\nHistory of the newest analysis:");
        for entry in &status.history {
            println!(
                "  {}  {:<28} {}",
                entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                entry.status,
                entry.details.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}

fn show_totals(store: &Store) -> Result<()> {
    let counts = store.status_counts()?;
    if counts.is_empty() {
        println!("No analyses yet");
        return Ok(());
    }
    for (status, count) in counts {
        println!("{:<28} {:>8}", status, count);
    }
    println!("{:<28} {:>8.2}", "DONATIONS", store.total_donations()?);
    Ok(())
}

fn show_config(settings: &Settings) -> Result<()> {
    println!(
        "Config file: {}",
        settings
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    let rendered = serde_yaml::to_string(settings).context("Failed to render settings")?;
    print!("{}", rendered);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_rank_auto_budget() {
        let cli = Cli::try_parse_from([
            "tenderwatch",
            "rank",
            "--auto-budget",
            "--budget-period",
            "weekly",
            "--zero-vote-budget-percent",
            "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Rank {
                auto_budget,
                budget_period,
                zero_vote_budget_percent,
                ..
            } => {
                assert!(auto_budget);
                assert_eq!(budget_period, Some(BudgetPeriod::Weekly));
                assert_eq!(zero_vote_budget_percent, Some(5.0));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_budget_and_auto_budget_conflict() {
        assert!(Cli::try_parse_from(["tenderwatch", "rank", "--budget", "10", "--auto-budget", "--budget-period", "daily"]).is_err());
    }

    #[test]
    fn test_parse_prepare_dates() {
        let cli = Cli::try_parse_from([
            "tenderwatch",
            "prepare",
            "--start-date",
            "2025-01-01",
            "--end-date",
            "2025-01-03",
            "--max-messages",
            "10",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Prepare {
                max_messages: Some(10),
                ..
            }
        ));
    }
}
