//! Job submission and lifecycle.
//!
//! Every submitted job gets its own monitor task. The task runs the job's
//! source items one after another, one tool process at a time, and publishes
//! progress as `Arc<Snapshot>` replacements through a watch channel. Jobs share
//! nothing but the immutable engine configuration.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::aggregator::Snapshot;
use crate::cancel::TerminationReason;
use crate::cleanup::CleanupReport;
use crate::config::EngineConfig;
use crate::errors::FailureReason;
use crate::job::{JobId, TransferJob};

pub mod command;
mod monitor;
mod remote;

pub use command::{plan_item, CleanupTarget, ItemPlan, ToolCommand};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSummary {
    pub items: usize,
    pub bytes_transferred: u64,
    pub files_completed: u64,
    /// Errors the tool reported and recovered from.
    pub errors: u64,
    pub elapsed: Duration,
    pub parse_anomalies: u64,
    pub transcript: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReport {
    pub reason: TerminationReason,
    pub cleanup: CleanupReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded(JobSummary),
    Failed(FailureReason),
    Cancelled(CancelReport),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded(_))
    }
}

pub struct Orchestrator {
    config: Arc<EngineConfig>,
    next_id: AtomicU64,
}

impl Orchestrator {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start `job` in the background. Must be called inside a tokio runtime.
    pub fn submit(&self, job: TransferJob) -> JobHandle {
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let initial = Arc::new(Snapshot {
            items_total: job.sources.len(),
            ..Snapshot::default()
        });
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let monitor = monitor::JobMonitor::new(
            id,
            job,
            Arc::clone(&self.config),
            snapshot_tx,
            cancel_rx,
        );
        tokio::spawn(async move {
            let (outcome, snapshot_tx) = monitor.run().await;
            outcome_tx.send_replace(Some(outcome));
            // Subscribers stop once the snapshot sender is gone, after the outcome is set.
            drop(snapshot_tx);
        });

        JobHandle {
            id,
            snapshot_rx,
            outcome_rx,
            cancel_tx,
        }
    }
}

/// Caller's side of a running job.
pub struct JobHandle {
    id: JobId,
    snapshot_rx: watch::Receiver<Arc<Snapshot>>,
    outcome_rx: watch::Receiver<Option<JobOutcome>>,
    cancel_tx: watch::Sender<bool>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Call `callback` with the current snapshot and every later one until the
    /// job is over. The last delivered snapshot is the final state.
    pub fn subscribe<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(Arc<Snapshot>) + Send + 'static,
    {
        let mut rx = self.snapshot_rx.clone();
        tokio::spawn(async move {
            let current = Arc::clone(&rx.borrow_and_update());
            callback(current);
            while rx.changed().await.is_ok() {
                let next = Arc::clone(&rx.borrow_and_update());
                callback(next);
            }
        })
    }

    /// Raw receiver for consumers that poll on their own tick.
    pub fn watch(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.snapshot_rx.clone()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot_rx.borrow())
    }

    /// Request cancellation. Returns immediately; a finished job ignores it.
    pub fn cancel(&self) {
        if self.is_finished() {
            log::debug!("{}: cancel after completion ignored", self.id);
            return;
        }
        self.cancel_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.outcome_rx.borrow().is_some()
    }

    pub async fn result(&self) -> JobOutcome {
        let mut rx = self.outcome_rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            JobOutcome::Failed(FailureReason::Internal(
                "job monitor stopped without an outcome".into(),
            ))
        })
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}
