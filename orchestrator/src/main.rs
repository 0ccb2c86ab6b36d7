//! Batch-job orchestrator CLI.
//!
//! Maintains job directories produced by cluster rounds (`rerun`, `missing`,
//! `absorb`) and runs the built-in `demo` experiment in any execution mode.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand};

use orchestrator::collect::{CommandRunner, RunOutput};
use orchestrator::core::reconcile::{format_indices, parse_indices};
use orchestrator::core::work_item::{WorkItem, shell_quote};
use orchestrator::distribute::{Orchestrator, RoundOutcome};
use orchestrator::error::OrchestrateError;
use orchestrator::exit_codes;
use orchestrator::io::cache::absorb_job_dir;
use orchestrator::io::clock::SystemClock;
use orchestrator::io::config::{ExecutionMode, OrchestratorConfig, load_config};
use orchestrator::io::confirm::{AnnouncedConfirm, Confirm, TerminalConfirm};
use orchestrator::io::job_dir::JobDir;
use orchestrator::io::scheduler::{SchedulerClient, SlurmScheduler};
use orchestrator::logging;
use orchestrator::rerun::{find_missing, job_dir_of, rerun_failed};

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Run parameter sweeps locally or as Slurm array jobs"
)]
struct Cli {
    /// TOML configuration file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "orchestrator.toml")]
    config: PathBuf,

    /// Approve every confirmation without asking; details are still printed.
    #[arg(long, global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resubmit selected indices of an existing submission script and wait.
    Rerun {
        /// Submission script of the full round (`job_script.sbatch`).
        script: PathBuf,
        /// Comma-separated array indices, e.g. `3,7,12`.
        indices: String,
    },
    /// List array indices of a submission script without output.
    Missing {
        script: PathBuf,
    },
    /// Fold a job directory's per-index outputs into its aggregated cache.
    Absorb {
        job_dir: PathBuf,
    },
    /// Run the built-in three-item experiment.
    Demo {
        /// Override the configured execution mode.
        #[arg(long, value_enum)]
        mode: Option<ExecutionMode>,
        /// Never submit; feed from the cache and existing outputs only.
        #[arg(long)]
        reuse_existing_data: bool,
    },
}

fn main() -> ExitCode {
    logging::init();
    match run() {
        Ok(code) => exit_code(code),
        Err(err) => {
            eprintln!("{err:#}");
            let code = match err.downcast_ref::<OrchestrateError>() {
                Some(OrchestrateError::Declined { .. }) => exit_codes::DECLINED,
                _ => exit_codes::INVALID,
            };
            exit_code(code)
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let confirm: Box<dyn Confirm> = if cli.yes {
        Box::new(AnnouncedConfirm(true))
    } else {
        Box::new(TerminalConfirm)
    };
    match cli.command {
        Command::Rerun { script, indices } => {
            let config = load_config(&cli.config)?;
            cmd_rerun(&config, confirm.as_ref(), &script, &indices)
        }
        Command::Missing { script } => cmd_missing(&script),
        Command::Absorb { job_dir } => cmd_absorb(&job_dir),
        Command::Demo {
            mode,
            reuse_existing_data,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(mode) = mode {
                config.mode = mode;
            }
            config.reuse_existing_data |= reuse_existing_data;
            cmd_demo(&config, confirm.as_ref())
        }
    }
}

fn cmd_rerun(
    config: &OrchestratorConfig,
    confirm: &dyn Confirm,
    script: &Path,
    indices: &str,
) -> Result<i32> {
    let indices = parse_indices(indices).map_err(|err| anyhow!(err))?;
    let scheduler = SlurmScheduler::new(config.scheduler.clone());
    let job_dir = job_dir_of(script);
    let client = SchedulerClient {
        scheduler: &scheduler,
        clock: &SystemClock,
        confirm,
        config: &config.scheduler,
        job_dir: &job_dir,
    };
    let report = rerun_failed(script, &indices, &client)?;
    println!("rerun script: {}", report.script.display());
    println!("job id: {}", report.job_id);
    if report.failed.is_empty() {
        println!("all {} tasks completed", report.states.len());
        return Ok(exit_codes::OK);
    }
    println!(
        "{} tasks failed: {}",
        report.failed.len(),
        format_indices(&report.failed)
    );
    print!("{}", report.report);
    println!(
        "rerun with: {} rerun {} {}",
        shell_quote(&config.rerun_program),
        shell_quote(&script.to_string_lossy()),
        format_indices(&report.failed)
    );
    Ok(exit_codes::ACCEPTED_FAILURES)
}

fn cmd_missing(script: &Path) -> Result<i32> {
    let report = find_missing(script)?;
    println!(
        "{} missing indices: {}",
        report.missing.len(),
        format_indices(&report.missing)
    );
    println!(
        "{} missing or empty indices: {}",
        report.missing_or_empty.len(),
        format_indices(&report.missing_or_empty)
    );
    if report.is_complete() {
        return Ok(exit_codes::OK);
    }
    println!(
        "tip: rerun them: orchestrator rerun {} {}",
        script.display(),
        format_indices(&report.missing_or_empty)
    );
    Ok(exit_codes::MISSING)
}

fn cmd_absorb(job_dir: &Path) -> Result<i32> {
    let dir = JobDir::new(job_dir);
    let inserted = absorb_job_dir(&dir)?;
    println!(
        "absorbed {inserted} new results into {}",
        dir.cache_path().display()
    );
    Ok(exit_codes::OK)
}

/// Two `echo` items around one `sleep`.
fn demo_routine(runner: &mut dyn CommandRunner) -> Result<Vec<RunOutput>> {
    let mut outputs = Vec::new();
    for i in 0..3 {
        let item = if i % 2 == 0 {
            WorkItem::new(["echo".to_string(), i.to_string(), "job finished".to_string()])
        } else {
            WorkItem::new(["sleep", "1"])
        };
        let output = runner.run(&item)?;
        if !output.is_success() {
            bail!("{item} failed with exit code {}", output.exit_code);
        }
        outputs.push(output);
    }
    Ok(outputs)
}

fn cmd_demo(config: &OrchestratorConfig, confirm: &dyn Confirm) -> Result<i32> {
    let scheduler = SlurmScheduler::new(config.scheduler.clone());
    let orchestrator = Orchestrator::new(config, &scheduler, &SystemClock, confirm)?;
    let result = orchestrator.run(demo_routine)?;
    for command in &result.commands {
        println!("{command}");
    }
    for output in result.value.iter().flatten() {
        println!("\n{}", output.stdout);
    }
    match result.outcome {
        RoundOutcome::AllCompleted => Ok(exit_codes::OK),
        RoundOutcome::AcceptedWithFailures {
            failed,
            report,
            rerun_command,
        } => {
            println!("accepted failures: {}", format_indices(&failed));
            print!("{report}");
            println!("rerun with: {rerun_command}");
            Ok(exit_codes::ACCEPTED_FAILURES)
        }
    }
}
