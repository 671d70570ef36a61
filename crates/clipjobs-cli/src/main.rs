//! clipjobs-cli - run simulated clip job plans through the scheduler

mod plan;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use clipjobs_core::core::settings::SETTINGS_FILE;
use clipjobs_core::{
    init_logging, ClipId, ItemModel, JobManager, JobRow, SchedulerSettings, UndoStack,
};
use serde::Serialize;

use crate::plan::{ClipStore, Plan};

/// ClipJobs - dependency ordered background clip jobs
#[derive(Parser, Debug)]
#[command(name = "clipjobs-cli", version, about, long_about = None)]
struct Cli {
    /// Settings file (defaults to the user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a plan of simulated jobs and print the outcome
    Run(RunArgs),
    /// Print the effective settings
    Settings {
        /// Write the normalized settings back to the settings file
        #[arg(long)]
        write: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Plan file (JSON)
    #[arg(long)]
    plan: PathBuf,

    /// Worker count, overriding the settings
    #[arg(long)]
    workers: Option<usize>,

    /// Cancel the named job right after scheduling (repeatable)
    #[arg(long = "cancel", value_name = "NAME")]
    cancel: Vec<String>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

/// Outcome of a plan run
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunReport {
    jobs: Vec<JobRow>,
    history: Vec<String>,
    clips: BTreeMap<String, Vec<String>>,
}

/// Item model logging clip updates
struct TraceItems;

impl ItemModel for TraceItems {
    fn on_item_updated(&self, clip_id: &ClipId) {
        tracing::trace!("Clip {} updated", clip_id);
    }
}

fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("clipjobs").join(SETTINGS_FILE))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings_path = cli.settings.clone().or_else(default_settings_path);
    let settings = settings_path
        .as_deref()
        .map(SchedulerSettings::load)
        .unwrap_or_default();

    init_logging(settings.log_dir.as_deref());

    match cli.command {
        Command::Run(args) => run(args, &settings).await,
        Command::Settings { write } => show_settings(&settings, settings_path.as_deref(), write),
    }
}

async fn run(args: RunArgs, settings: &SchedulerSettings) -> Result<()> {
    let plan = Plan::load(&args.plan)
        .with_context(|| format!("Cannot load plan {}", args.plan.display()))?;

    let mut pool = settings.worker_pool();
    if let Some(workers) = args.workers {
        pool.num_workers = workers.max(1);
    }

    let history = Arc::new(UndoStack::new().with_max_history(settings.max_history_size));
    let manager = JobManager::new(pool, Arc::new(TraceItems), history.clone())?;
    let store = ClipStore::default();

    tracing::info!(
        "Running {} job(s) on {} worker(s)",
        plan.jobs.len(),
        manager.num_workers()
    );

    let mut ids = HashMap::new();
    for job in &plan.jobs {
        let parents = job
            .depends_on
            .iter()
            .map(|name| {
                ids.get(name)
                    .copied()
                    .ok_or_else(|| anyhow!("Unknown dependency {name}"))
            })
            .collect::<Result<Vec<_>>>()?;
        let job_id = manager.start_job(job.request(parents), |clip| job.clip_job(clip, &store))?;
        ids.insert(job.name.clone(), job_id);
    }

    for name in &args.cancel {
        let job_id = ids
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("Unknown job {name}"))?;
        if !manager.cancel_job(job_id)? {
            tracing::warn!("Job {} already done", name);
        }
    }

    for job_id in ids.values() {
        manager.wait_for_job(*job_id).await?;
    }

    let report = RunReport {
        jobs: manager.list_model().rows(),
        history: history.labels(),
        clips: store.snapshot(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!(
        "{:>4}  {:<15} {:<9} {:<7} {:<12} {:<8} DESCRIPTION",
        "ID", "TYPE", "STATUS", "FAILED", "PROGRESS", "CREATED"
    );
    for row in &report.jobs {
        println!("{}", format_row(row));
    }

    println!();
    if report.history.is_empty() {
        println!("History: (empty)");
    } else {
        println!("History: {}", report.history.join(" > "));
    }
    for (clip, results) in &report.clips {
        println!("  {clip}: {}", results.join(", "));
    }
}

/// One table line; CREATED is the UTC time of day the job was registered
fn format_row(row: &JobRow) -> String {
    let progress = row
        .progress
        .iter()
        .map(|p| format!("{p}%"))
        .collect::<Vec<_>>()
        .join(",");
    let created = row.created_at.get(11..19).unwrap_or(&row.created_at);
    format!(
        "{:>4}  {:<15} {:<9} {:<7} {:<12} {:<8} {}",
        row.id,
        format!("{:?}", row.job_type),
        format!("{:?}", row.status),
        if row.failed { "yes" } else { "no" },
        progress,
        created,
        row.description
    )
}

fn show_settings(settings: &SchedulerSettings, path: Option<&Path>, write: bool) -> Result<()> {
    if write {
        let path = path.ok_or_else(|| anyhow!("No settings path available"))?;
        settings
            .save(path)
            .with_context(|| format!("Cannot write settings to {}", path.display()))?;
        tracing::info!("Settings written to {}", path.display());
    }

    println!("{}", serde_json::to_string_pretty(settings)?);
    Ok(())
}
