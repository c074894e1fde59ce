mod cli;
mod progress;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::Result;
use ferry_core::config::{self, EngineConfig};
use ferry_core::{
    CleanupPolicy, Disposition, JobOutcome, Location, Orchestrator, SourceItem, TransferJob,
};
use indicatif::{HumanBytes, HumanDuration};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, TransferArgs};
use crate::progress::ProgressView;

const RENDER_TICK: Duration = Duration::from_millis(200);
const EXIT_SUCCESS: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_CANCELLED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(dir) = &cli.config_dir {
        config::set_config_dir(dir);
    }
    let mut config = EngineConfig::load()?;

    let label = match &cli.command {
        Commands::Copy(_) => "copy",
        Commands::Move(_) => "move",
        Commands::Delete(_) => "delete",
        Commands::Mkdir(_) => "mkdir",
    };
    let view = ProgressView::new(label);

    let job = match &cli.command {
        Commands::Copy(args) => transfer_job(&mut config, args, &view, TransferJob::copy),
        Commands::Move(args) => transfer_job(&mut config, args, &view, TransferJob::move_to),
        Commands::Delete(args) => {
            let items = args
                .paths
                .iter()
                .map(|raw| SourceItem {
                    location: Location::parse(raw),
                    is_dir: args.dir,
                })
                .collect();
            TransferJob::delete(items)
        }
        Commands::Mkdir(args) => TransferJob::mkdir(Location::parse(&args.path)),
    };
    config.validate()?;

    let code = run_job(config, job, view, label).await;
    Ok(ExitCode::from(code))
}

fn init_logging(verbosity: u8) {
    let default = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn transfer_job(
    config: &mut EngineConfig,
    args: &TransferArgs,
    view: &ProgressView,
    build: fn(Vec<SourceItem>, Location) -> TransferJob,
) -> TransferJob {
    if let Some(parallel) = args.parallel {
        config.parallelism = parallel;
    }
    let sources = args.sources.iter().map(|raw| source_item(raw)).collect();
    let policy = if args.yes {
        CleanupPolicy::Remove
    } else if args.keep_partials {
        CleanupPolicy::Keep
    } else {
        CleanupPolicy::Prompt(Arc::new(view.prompt()))
    };
    build(sources, Location::parse(&args.destination))
        .with_cleanup(policy)
        .with_extra_flags(args.flags.iter().cloned())
}

/// Local sources are checked on disk; a remote source counts as a directory
/// when it ends with `/` or names the remote's root.
fn source_item(raw: &str) -> SourceItem {
    let location = Location::parse(raw);
    let is_dir = match &location {
        Location::Local(path) => path.is_dir(),
        Location::Remote { path, .. } => path.is_empty() || path.ends_with('/'),
    };
    SourceItem { location, is_dir }
}

async fn run_job(
    config: EngineConfig,
    job: TransferJob,
    mut view: ProgressView,
    label: &str,
) -> u8 {
    let orchestrator = Orchestrator::new(config);
    let handle = orchestrator.submit(job);
    log::info!("{} submitted", handle.id());

    let mut ticker = tokio::time::interval(RENDER_TICK);
    let mut cancel_requested = false;
    let result = handle.result();
    tokio::pin!(result);

    let outcome = loop {
        tokio::select! {
            outcome = &mut result => break outcome,
            _ = ticker.tick() => view.render(&handle.snapshot()),
            signal = tokio::signal::ctrl_c(), if !cancel_requested => {
                cancel_requested = true;
                match signal {
                    Ok(()) => {
                        log::info!("interrupt received, cancelling {}", handle.id());
                        handle.cancel();
                    }
                    Err(err) => log::warn!("cannot listen for Ctrl-C: {err}"),
                }
            }
        }
    };
    view.render(&handle.snapshot());
    view.finish();

    report(label, outcome)
}

fn report(label: &str, outcome: JobOutcome) -> u8 {
    match outcome {
        JobOutcome::Succeeded(summary) => {
            println!(
                "{label} finished: {} item(s), {} in {} files, {} elapsed",
                summary.items,
                HumanBytes(summary.bytes_transferred),
                summary.files_completed,
                HumanDuration(summary.elapsed),
            );
            if summary.errors > 0 {
                println!("rclone reported {} recovered error(s)", summary.errors);
            }
            if summary.parse_anomalies > 0 {
                log::info!("{} unrecognised progress line(s)", summary.parse_anomalies);
            }
            if let Some(path) = summary.transcript {
                println!("Transcript: {}", path.display());
            }
            EXIT_SUCCESS
        }
        JobOutcome::Failed(reason) => {
            eprintln!("{label} failed: {reason}");
            EXIT_FAILURE
        }
        JobOutcome::Cancelled(report) => {
            println!("{label} cancelled ({})", report.reason);
            if !report.cleanup.is_empty() {
                println!(
                    "Partial files: {} removed, {} kept",
                    report.cleanup.removed(),
                    report.cleanup.kept()
                );
                for entry in &report.cleanup.entries {
                    if let Disposition::Failed(err) = &entry.disposition {
                        eprintln!("  could not remove {err}");
                    }
                }
            }
            EXIT_CANCELLED
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{CancelReport, CleanupReport, FailureReason, JobSummary, TerminationReason};

    #[test]
    fn outcomes_map_to_exit_codes() {
        assert_eq!(
            report("copy", JobOutcome::Succeeded(JobSummary::default())),
            EXIT_SUCCESS
        );
        assert_eq!(
            report(
                "copy",
                JobOutcome::Failed(FailureReason::Internal("boom".into()))
            ),
            EXIT_FAILURE
        );
        let cancelled = JobOutcome::Cancelled(CancelReport {
            reason: TerminationReason::UserCancelled,
            cleanup: CleanupReport::default(),
        });
        assert_eq!(report("copy", cancelled), EXIT_CANCELLED);
    }
}
