//! Partial-file cleanup on a remote destination, done through the tool itself.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use eyre::{bail, Result};

use super::command::{delete_file_command, list_partials_command, CleanupTarget, ToolCommand};
use crate::cleanup::{
    candidates_from_listing, CleanupEntry, CleanupReport, Disposition, PartialFileCandidate,
};
use crate::config::EngineConfig;
use crate::errors::{CleanupIoError, ProcessFailure};
use crate::process::{OutputOrigin, ProcessRunner};

/// A listing or a single delete that takes longer than this is abandoned.
const TOOL_STEP_TIMEOUT: Duration = Duration::from_secs(60);

pub(super) async fn scan(
    config: &EngineConfig,
    target: &CleanupTarget,
) -> Result<Vec<PartialFileCandidate>> {
    let command = list_partials_command(config, target);
    let listing = run_captured(config, &command).await?;
    candidates_from_listing(&target.root, &listing, target.is_directory)
}

/// Delete each candidate with its own tool invocation. A file the tool can't
/// remove is recorded and the rest are still attempted.
pub(super) async fn remove(
    config: &EngineConfig,
    candidates: Vec<PartialFileCandidate>,
) -> CleanupReport {
    let mut report = CleanupReport::default();
    for candidate in candidates {
        let command = delete_file_command(config, &candidate.location);
        let disposition = match run_captured(config, &command).await {
            Ok(_) => Disposition::Removed,
            Err(err) => {
                let message = format!("{err:#}");
                if message.contains("object not found") {
                    log::debug!("{} already gone", candidate.location);
                    Disposition::Removed
                } else {
                    log::warn!(
                        "failed to remove partial file {}: {}",
                        candidate.location,
                        message
                    );
                    Disposition::Failed(CleanupIoError {
                        path: PathBuf::from(candidate.location.to_arg()),
                        kind: io::ErrorKind::Other,
                        message,
                    })
                }
            }
        };
        report.entries.push(CleanupEntry {
            candidate,
            disposition,
        });
    }
    report
}

/// Run `command` to completion and return its stdout.
async fn run_captured(config: &EngineConfig, command: &ToolCommand) -> Result<String> {
    log::debug!("running {command}");
    let mut process = ProcessRunner::start(&command.program, &command.args, None)?;
    let Some(mut output) = process.output_chunks() else {
        bail!("output of {command} already taken");
    };

    let finished = tokio::time::timeout(TOOL_STEP_TIMEOUT, async {
        let mut stdout = String::new();
        while let Some(chunk) = output.next().await {
            if chunk.origin == OutputOrigin::Stdout {
                stdout.push_str(&chunk.text);
            }
        }
        (stdout, process.exit_status().await)
    })
    .await;

    let Ok((stdout, status)) = finished else {
        process.terminate(config.terminate_timeout()).await;
        bail!("{command} did not finish within {TOOL_STEP_TIMEOUT:?}");
    };
    if !status.success {
        let failure = ProcessFailure {
            code: status.code,
            stderr_tail: status.stderr_tail,
        };
        bail!("{command}: {failure}");
    }
    Ok(stdout)
}
