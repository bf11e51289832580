use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use mediaflow::cache::CacheManager;
use mediaflow::cli::{Cli, Command};
use mediaflow::config::{JobSettings, ResolvedConfig, system_defaults_path};
use mediaflow::manifest::ManifestStore;
use mediaflow::orchestrator::{RunOptions, StageOrchestrator};
use mediaflow::state_machine::{Job, JobStatus};
use mediaflow::ui::{TerminalProgress, manifest_line, print_result};
use mediaflow::{ErrorKind, PipelineError, logging};

const EXIT_INTERNAL: u8 = 1;
const EXIT_STAGE_FAILED: u8 = 3;
const EXIT_INVALID_JOB: u8 = 4;
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match execute(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

async fn execute(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Prepare {
            work_dir,
            workflow,
            inputs,
            overrides,
        } => {
            let overrides: BTreeMap<String, String> = overrides.into_iter().collect();
            let job = Job::prepare(&work_dir, &workflow, inputs, overrides)
                .with_context(|| format!("preparing job in {}", work_dir.display()))?;
            println!("{}", job.id);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            work_dir,
            force,
            defaults,
        } => run(&work_dir, RunOptions { force: force.to_force() }, defaults).await,
        Command::Status { work_dir } => {
            let job = Job::load(&work_dir)?;
            let store = ManifestStore::new(&job.work_dir);
            println!("job {} ({})", job.id, job.workflow);
            for stage in &job.stages {
                match store.get(*stage)? {
                    Some(manifest) => println!("  {}", manifest_line(&manifest)),
                    None => println!("  {:<20} -", stage.name()),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Evict { cache_root } => {
            let root = match cache_root {
                Some(root) => root,
                None => default_cache_root()?,
            };
            let report = CacheManager::new(&root, 0, None).evict_expired()?;
            println!(
                "{}: {} de {} entradas removidas, {} bytes recuperados",
                root.display(),
                report.removed,
                report.scanned,
                report.bytes_reclaimed
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run(work_dir: &Path, options: RunOptions, defaults: Option<PathBuf>) -> Result<ExitCode> {
    let mut job = Job::load(work_dir)?;
    let defaults = system_defaults_path(defaults.as_deref());
    let progress = TerminalProgress::start(&format!("{} ({})", job.id, job.workflow));
    let orchestrator = StageOrchestrator::for_job(&job, &defaults)?.with_observer(Box::new(progress));

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current stage");
            token.cancel();
        }
    });

    let result = orchestrator.run(&mut job, &options).await?;
    info!(job = %result.job_id, duration_ms = result.duration_ms, "done");
    print_result(&result);

    Ok(match result.status {
        JobStatus::Succeeded => ExitCode::SUCCESS,
        JobStatus::Failed => ExitCode::from(EXIT_STAGE_FAILED),
        JobStatus::Interrupted => ExitCode::from(EXIT_INTERRUPTED),
    })
}

/// Cache root as a job without overrides would resolve it.
fn default_cache_root() -> Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    let config = ResolvedConfig::load(&BTreeMap::new(), &cwd, &system_defaults_path(None))?;
    Ok(JobSettings::from_resolved(&config, &cwd)?.cache_root)
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    let Some(err) = err.downcast_ref::<PipelineError>() else {
        return EXIT_INTERNAL;
    };
    match err.kind() {
        ErrorKind::InvalidJob | ErrorKind::Config | ErrorKind::Toml => EXIT_INVALID_JOB,
        ErrorKind::Cancelled => EXIT_INTERRUPTED,
        kind if err.is_stage_failure() => {
            warn!(%kind, "stage failure escaped the run");
            EXIT_STAGE_FAILED
        }
        _ => EXIT_INTERNAL,
    }
}
