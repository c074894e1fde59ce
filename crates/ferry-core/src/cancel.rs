use std::time::{Duration, SystemTime};

use crate::job::JobId;
use crate::process::{ProcessHandle, TerminateOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The process ended on its own before it could be signalled.
    Exited,
    UserCancelled,
    ForceKilled,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            TerminationReason::Exited => "exited",
            TerminationReason::UserCancelled => "user-cancelled",
            TerminationReason::ForceKilled => "force-killed",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    Running,
    CancelRequested,
    Terminating,
    Terminated(TerminationReason),
}

impl CancelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CancelState::Terminated(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationRequest {
    pub job_id: JobId,
    pub requested_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelDecision {
    Accepted(CancellationRequest),
    /// A request is already in progress or the job is over.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResolution {
    ProcessAlreadyExited,
    TerminatedBySignal(TerminationReason),
}

impl CancelResolution {
    pub fn reason(self) -> TerminationReason {
        match self {
            CancelResolution::ProcessAlreadyExited => TerminationReason::Exited,
            CancelResolution::TerminatedBySignal(reason) => reason,
        }
    }
}

/// Per-job cancellation state machine:
/// `Running -> CancelRequested -> Terminating -> Terminated(reason)`.
#[derive(Debug)]
pub struct CancellationController {
    job_id: JobId,
    state: CancelState,
    request: Option<CancellationRequest>,
}

impl CancellationController {
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            state: CancelState::Running,
            request: None,
        }
    }

    pub fn state(&self) -> CancelState {
        self.state
    }

    pub fn pending_request(&self) -> Option<&CancellationRequest> {
        self.request.as_ref()
    }

    /// Record a cancellation request. Only a running job accepts one.
    pub fn request(&mut self) -> CancelDecision {
        if self.state != CancelState::Running {
            log::debug!("{}: cancel ignored in state {:?}", self.job_id, self.state);
            return CancelDecision::Ignored;
        }
        let request = CancellationRequest {
            job_id: self.job_id,
            requested_at: SystemTime::now(),
        };
        self.state = CancelState::CancelRequested;
        self.request = Some(request.clone());
        log::info!("{}: cancellation requested", self.job_id);
        CancelDecision::Accepted(request)
    }

    /// The job has no process left. A request that never reached a process
    /// still ends as a user cancellation.
    pub fn mark_exited(&mut self) {
        self.state = match self.state {
            CancelState::Terminated(_) => return,
            CancelState::CancelRequested => CancelState::Terminated(TerminationReason::UserCancelled),
            CancelState::Running | CancelState::Terminating => {
                CancelState::Terminated(TerminationReason::Exited)
            }
        };
    }

    /// Stop `process`, requesting cancellation first if nobody has. Completes
    /// within `timeout` plus the reaping grace of [`ProcessHandle::terminate`].
    /// Once the job is terminal this is a no-op.
    pub async fn cancel(&mut self, process: &ProcessHandle, timeout: Duration) -> CancelResolution {
        if let CancelState::Terminated(reason) = self.state {
            return match reason {
                TerminationReason::Exited => CancelResolution::ProcessAlreadyExited,
                other => CancelResolution::TerminatedBySignal(other),
            };
        }
        if self.state == CancelState::Running {
            self.request();
        }

        self.state = CancelState::Terminating;
        let resolution = match process.terminate(timeout).await {
            TerminateOutcome::AlreadyExited => CancelResolution::ProcessAlreadyExited,
            TerminateOutcome::Exited => {
                CancelResolution::TerminatedBySignal(TerminationReason::UserCancelled)
            }
            TerminateOutcome::ForceKilled => {
                CancelResolution::TerminatedBySignal(TerminationReason::ForceKilled)
            }
        };
        self.state = CancelState::Terminated(resolution.reason());
        log::info!("{}: terminated ({})", self.job_id, resolution.reason());
        resolution
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_running_accepts_requests() {
        let mut ctl = CancellationController::new(JobId(7));
        let CancelDecision::Accepted(req) = ctl.request() else {
            panic!("first request must be accepted");
        };
        assert_eq!(req.job_id, JobId(7));
        assert_eq!(ctl.state(), CancelState::CancelRequested);
        assert_eq!(ctl.request(), CancelDecision::Ignored);
    }

    #[test]
    fn request_after_exit_is_a_no_op() {
        let mut ctl = CancellationController::new(JobId(1));
        ctl.mark_exited();
        assert_eq!(ctl.request(), CancelDecision::Ignored);
        assert_eq!(
            ctl.state(),
            CancelState::Terminated(TerminationReason::Exited)
        );
    }

    #[test]
    fn request_without_a_process_ends_user_cancelled() {
        let mut ctl = CancellationController::new(JobId(5));
        ctl.request();
        ctl.mark_exited();
        assert_eq!(
            ctl.state(),
            CancelState::Terminated(TerminationReason::UserCancelled)
        );
    }

    #[cfg(unix)]
    mod unix {
        use super::super::*;
        use crate::process::ProcessRunner;
        use std::path::Path;
        use std::time::Instant;

        #[tokio::test]
        async fn cooperative_process_is_user_cancelled() {
            let process =
                ProcessRunner::start(Path::new("/bin/sh"), ["-c", "exec sleep 30"], None).unwrap();
            let mut ctl = CancellationController::new(JobId(2));
            let resolution = ctl.cancel(&process, Duration::from_secs(5)).await;
            assert_eq!(
                resolution,
                CancelResolution::TerminatedBySignal(TerminationReason::UserCancelled)
            );
            assert_eq!(
                ctl.state(),
                CancelState::Terminated(TerminationReason::UserCancelled)
            );

            // Later calls change nothing.
            assert_eq!(ctl.request(), CancelDecision::Ignored);
            assert_eq!(ctl.cancel(&process, Duration::from_secs(5)).await, resolution);
        }

        #[tokio::test]
        async fn stubborn_process_is_force_killed_within_bound() {
            let mut process = ProcessRunner::start(
                Path::new("/bin/sh"),
                ["-c", "trap '' TERM; echo ready; exec sleep 30"],
                None,
            )
            .unwrap();
            let mut output = process.output_chunks().unwrap();
            output.next().await.unwrap();

            let timeout = Duration::from_millis(300);
            let started = Instant::now();
            let mut ctl = CancellationController::new(JobId(3));
            let resolution = ctl.cancel(&process, timeout).await;
            assert_eq!(
                resolution,
                CancelResolution::TerminatedBySignal(TerminationReason::ForceKilled)
            );
            assert!(started.elapsed() < timeout + Duration::from_secs(2));
            assert!(ctl.state().is_terminal());
        }

        #[tokio::test]
        async fn exited_process_is_reported() {
            let process = ProcessRunner::start(Path::new("/bin/sh"), ["-c", "true"], None).unwrap();
            process.exit_status().await;
            let mut ctl = CancellationController::new(JobId(4));
            let resolution = ctl.cancel(&process, Duration::from_secs(1)).await;
            assert_eq!(resolution, CancelResolution::ProcessAlreadyExited);
            assert_eq!(
                ctl.state(),
                CancelState::Terminated(TerminationReason::Exited)
            );
        }
    }
}
