//! Error taxonomy for transfer jobs.
//!
//! Failures are sorted by where they stop:
//! - Launch: the tool could not be started at all. Fatal for the job, never retried.
//! - Process: the tool ran and exited unsuccessfully. Surfaced with the stderr tail.
//! - Cleanup: one partial file could not be removed. Reported per file, the batch goes on.
//!
//! Parse anomalies and cancellation timeouts are absorbed where they happen
//! (a diagnostic counter and a forced kill respectively) and never become errors.

use std::io;
use std::path::PathBuf;

/// The external tool could not be started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchError {
    /// Program that was asked for.
    pub program: PathBuf,
    /// OS-level error kind reported by the spawn.
    pub kind: io::ErrorKind,
    /// Raw OS error code, when the platform provided one.
    pub os_code: Option<i32>,
    /// Human-readable OS message.
    pub message: String,
}

impl LaunchError {
    pub fn from_io(program: impl Into<PathBuf>, err: &io::Error) -> Self {
        Self {
            program: program.into(),
            kind: err.kind(),
            os_code: err.raw_os_error(),
            message: err.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == io::ErrorKind::NotFound
    }

    pub fn is_permission_denied(&self) -> bool {
        self.kind == io::ErrorKind::PermissionDenied
    }
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self.kind {
            io::ErrorKind::NotFound => "executable not found".to_string(),
            io::ErrorKind::PermissionDenied => "permission denied".to_string(),
            _ => self.message.clone(),
        };
        write!(f, "failed to launch {}: {}", self.program.display(), reason)
    }
}

impl std::error::Error for LaunchError {}

/// The tool exited without success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessFailure {
    /// Exit code; `None` when the process was ended by a signal.
    pub code: Option<i32>,
    /// Last lines the tool wrote to stderr, progress blocks removed.
    pub stderr_tail: String,
}

impl ProcessFailure {
    /// Last non-empty stderr line, usually the tool's own summary of what went wrong.
    pub fn headline(&self) -> Option<&str> {
        self.stderr_tail
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
    }
}

impl std::fmt::Display for ProcessFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "tool exited with code {code}")?,
            None => write!(f, "tool terminated by signal")?,
        }
        if let Some(line) = self.headline() {
            write!(f, ": {line}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ProcessFailure {}

/// A partial file that could not be deleted during cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupIoError {
    pub path: PathBuf,
    pub kind: io::ErrorKind,
    pub message: String,
}

impl CleanupIoError {
    pub fn from_io(path: impl Into<PathBuf>, err: &io::Error) -> Self {
        Self {
            path: path.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Display for CleanupIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

impl std::error::Error for CleanupIoError {}

/// Why a job ended in failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Launch(LaunchError),
    Process(ProcessFailure),
    /// The monitor itself failed (a panicked task or a misconfigured job).
    Internal(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Launch(err) => write!(f, "{err}"),
            Self::Process(err) => write!(f, "{err}"),
            Self::Internal(message) => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for FailureReason {}

impl From<LaunchError> for FailureReason {
    fn from(err: LaunchError) -> Self {
        Self::Launch(err)
    }
}

impl From<ProcessFailure> for FailureReason {
    fn from(err: ProcessFailure) -> Self {
        Self::Process(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_error_names_missing_executable() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "No such file or directory");
        let err = LaunchError::from_io("/opt/none/rclone", &io_err);
        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "failed to launch /opt/none/rclone: executable not found"
        );
    }

    #[test]
    fn process_failure_headline_skips_blank_lines() {
        let failure = ProcessFailure {
            code: Some(3),
            stderr_tail: "ERROR : a.txt: Failed to copy\nFatal: directory not found\n\n".into(),
        };
        assert_eq!(failure.headline(), Some("Fatal: directory not found"));
        assert_eq!(
            failure.to_string(),
            "tool exited with code 3: Fatal: directory not found"
        );
    }

    #[test]
    fn signal_exit_without_stderr() {
        let failure = ProcessFailure {
            code: None,
            stderr_tail: String::new(),
        };
        assert_eq!(failure.to_string(), "tool terminated by signal");
    }
}
