use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use super::command::{plan_item, CleanupTarget, ItemPlan};
use super::{remote, CancelReport, JobOutcome, JobSummary};
use crate::aggregator::{ProgressAggregator, Snapshot};
use crate::cancel::{CancelResolution, CancellationController, TerminationReason};
use crate::cleanup::{self, CleanupReport};
use crate::config::EngineConfig;
use crate::errors::{FailureReason, ProcessFailure};
use crate::job::{JobId, TransferJob};
use crate::process::{OutputChunk, OutputOrigin, OutputStream, ProcessHandle, ProcessRunner};
use crate::stats::{classify_line, StatsParser, StatsRecord};
use crate::transcript::{prune_transcripts, Transcript};

/// Output still arriving after the process exited is read for at most this long.
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

enum ItemEnd {
    Completed,
    Stopped(JobOutcome),
}

/// One parser per pipe so interleaved stdout and stderr never mix lines.
#[derive(Default)]
struct Parsers {
    stdout: StatsParser,
    stderr: StatsParser,
}

impl Parsers {
    fn for_origin(&mut self, origin: OutputOrigin) -> &mut StatsParser {
        match origin {
            OutputOrigin::Stdout => &mut self.stdout,
            OutputOrigin::Stderr => &mut self.stderr,
        }
    }

    fn anomalies(&self) -> u64 {
        self.stdout.anomalies() + self.stderr.anomalies()
    }
}

pub(super) struct JobMonitor {
    id: JobId,
    job: TransferJob,
    config: Arc<EngineConfig>,
    snapshots: watch::Sender<Arc<Snapshot>>,
    cancel_rx: watch::Receiver<bool>,
    listen_for_cancel: bool,
    aggregator: ProgressAggregator,
    controller: CancellationController,
    transcript: Option<Transcript>,
    transcript_path: Option<PathBuf>,
    anomaly_base: u64,
    started: Instant,
}

impl JobMonitor {
    pub(super) fn new(
        id: JobId,
        job: TransferJob,
        config: Arc<EngineConfig>,
        snapshots: watch::Sender<Arc<Snapshot>>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        let aggregator = ProgressAggregator::new(config.parallelism, job.sources.len());
        Self {
            id,
            job,
            config,
            snapshots,
            cancel_rx,
            listen_for_cancel: true,
            aggregator,
            controller: CancellationController::new(id),
            transcript: None,
            transcript_path: None,
            anomaly_base: 0,
            started: Instant::now(),
        }
    }

    /// Run every item and return the outcome together with the snapshot sender,
    /// which the caller drops once the outcome is published.
    pub(super) async fn run(mut self) -> (JobOutcome, watch::Sender<Arc<Snapshot>>) {
        let outcome = self.run_items().await;
        match &outcome {
            JobOutcome::Succeeded(summary) => log::info!(
                "{}: {} finished, {} bytes in {:?}",
                self.id,
                self.job.kind.verb(),
                summary.bytes_transferred,
                summary.elapsed
            ),
            JobOutcome::Failed(reason) => log::error!("{}: failed: {}", self.id, reason),
            JobOutcome::Cancelled(report) => log::info!(
                "{}: cancelled ({}), {} partial file(s) removed, {} kept",
                self.id,
                report.reason,
                report.cleanup.removed(),
                report.cleanup.kept()
            ),
        }
        (outcome, self.snapshots)
    }

    async fn run_items(&mut self) -> JobOutcome {
        if let Err(err) = self.job.validate() {
            return JobOutcome::Failed(FailureReason::Internal(format!("{err:#}")));
        }
        log::info!(
            "{}: starting {} with {} item(s)",
            self.id,
            self.job.kind.verb(),
            self.job.sources.len()
        );
        self.open_transcript();

        let mut stopped = None;
        for index in 0..self.job.sources.len() {
            if *self.cancel_rx.borrow() {
                self.controller.request();
                stopped = Some(JobOutcome::Cancelled(CancelReport {
                    reason: TerminationReason::UserCancelled,
                    cleanup: CleanupReport::default(),
                }));
                break;
            }
            if let ItemEnd::Stopped(outcome) = self.run_item(index).await {
                stopped = Some(outcome);
                break;
            }
        }

        let last = self.aggregator.finish();
        self.close_transcript();
        self.controller.mark_exited();
        let outcome = stopped.unwrap_or_else(|| JobOutcome::Succeeded(self.summary(&last)));
        self.publish(last);
        outcome
    }

    async fn run_item(&mut self, index: usize) -> ItemEnd {
        let snapshot = self.aggregator.begin_item();
        self.publish(snapshot);

        let plan = match plan_item(&self.config, &self.job, &self.job.sources[index]) {
            Ok(plan) => plan,
            Err(err) => {
                return ItemEnd::Stopped(JobOutcome::Failed(FailureReason::Internal(format!(
                    "{err:#}"
                ))))
            }
        };
        log::debug!("{}: running {}", self.id, plan.command);
        if let Some(transcript) = self.transcript.as_mut() {
            transcript.note(&plan.command.to_string());
        }

        let mut process = match ProcessRunner::start(&plan.command.program, &plan.command.args, None) {
            Ok(process) => process,
            Err(err) => return ItemEnd::Stopped(JobOutcome::Failed(err.into())),
        };
        let Some(mut output) = process.output_chunks() else {
            return ItemEnd::Stopped(JobOutcome::Failed(FailureReason::Internal(
                "process output already taken".into(),
            )));
        };

        let mut parsers = Parsers::default();
        let mut output_open = true;
        loop {
            tokio::select! {
                chunk = output.next(), if output_open => match chunk {
                    Some(chunk) => self.consume(&mut parsers, chunk),
                    None => output_open = false,
                },
                changed = self.cancel_rx.changed(), if self.listen_for_cancel => match changed {
                    Ok(()) => {
                        if *self.cancel_rx.borrow_and_update() {
                            return self.cancel_item(&process, &mut output, &mut parsers, &plan).await;
                        }
                    }
                    // The handle is gone; nobody can cancel any more.
                    Err(_) => self.listen_for_cancel = false,
                },
                status = process.exit_status() => {
                    if output_open {
                        self.drain(&mut output, &mut parsers).await;
                    }
                    self.finish_parsers(&mut parsers);
                    if status.success {
                        return ItemEnd::Completed;
                    }
                    let failure = ProcessFailure {
                        code: status.code,
                        stderr_tail: strip_progress(&status.stderr_tail),
                    };
                    return ItemEnd::Stopped(JobOutcome::Failed(failure.into()));
                }
            }
        }
    }

    async fn cancel_item(
        &mut self,
        process: &ProcessHandle,
        output: &mut OutputStream,
        parsers: &mut Parsers,
        plan: &ItemPlan,
    ) -> ItemEnd {
        let resolution = self
            .controller
            .cancel(process, self.config.terminate_timeout())
            .await;
        self.drain(output, parsers).await;
        self.finish_parsers(parsers);

        let cleanup = match (resolution, &plan.cleanup) {
            (CancelResolution::TerminatedBySignal(_), Some(target)) => {
                self.clean_up(target).await
            }
            (CancelResolution::TerminatedBySignal(_), None)
            | (CancelResolution::ProcessAlreadyExited, _) => CleanupReport::default(),
        };

        ItemEnd::Stopped(JobOutcome::Cancelled(CancelReport {
            reason: resolution.reason(),
            cleanup,
        }))
    }

    async fn clean_up(&self, target: &CleanupTarget) -> CleanupReport {
        let scanned = match target.root.local_path() {
            Some(root) => {
                let root = root.to_path_buf();
                let is_directory = target.is_directory;
                match tokio::task::spawn_blocking(move || cleanup::scan(&root, is_directory)).await
                {
                    Ok(scanned) => scanned,
                    Err(err) => {
                        log::warn!("{}: partial-file scan task failed: {}", self.id, err);
                        return CleanupReport::default();
                    }
                }
            }
            None => remote::scan(&self.config, target).await,
        };
        let mut candidates = match scanned {
            Ok(candidates) => candidates,
            Err(err) => {
                log::warn!("{}: partial-file scan failed: {:#}", self.id, err);
                return CleanupReport::default();
            }
        };
        if let Some(name) = &target.original_name {
            candidates.retain(|candidate| &candidate.original_name == name);
        }
        log::info!(
            "{}: {} partial file(s) under {}",
            self.id,
            candidates.len(),
            target.root
        );

        if target.root.local_path().is_some() {
            return cleanup::apply_policy(&self.job.cleanup, candidates).await;
        }
        if !cleanup::confirm_removal(&self.job.cleanup, &candidates).await {
            return cleanup::keep_candidates(candidates);
        }
        remote::remove(&self.config, candidates).await
    }

    fn consume(&mut self, parsers: &mut Parsers, chunk: OutputChunk) {
        if let Some(transcript) = self.transcript.as_mut() {
            transcript.record(&chunk);
        }
        let records = parsers.for_origin(chunk.origin).parse(&chunk.text);
        self.apply(records, parsers.anomalies());
    }

    fn finish_parsers(&mut self, parsers: &mut Parsers) {
        let mut records = parsers.stdout.finish();
        records.extend(parsers.stderr.finish());
        self.apply(records, parsers.anomalies());
        self.anomaly_base += parsers.anomalies();
    }

    fn apply(&mut self, records: Vec<StatsRecord>, item_anomalies: u64) {
        let anomalies = self.anomaly_base + item_anomalies;
        let anomalies_changed = self.aggregator.parse_anomalies() != anomalies;
        self.aggregator.set_parse_anomalies(anomalies);

        let mut latest = None;
        for record in records {
            latest = Some(self.aggregator.apply(record));
        }
        if latest.is_none() && anomalies_changed {
            latest = Some(self.aggregator.snapshot());
        }
        if let Some(snapshot) = latest {
            self.publish(snapshot);
        }
    }

    async fn drain(&mut self, output: &mut OutputStream, parsers: &mut Parsers) {
        let deadline = tokio::time::Instant::now() + OUTPUT_DRAIN;
        loop {
            match tokio::time::timeout_at(deadline, output.next()).await {
                Ok(Some(chunk)) => self.consume(parsers, chunk),
                Ok(None) => break,
                Err(_) => {
                    log::debug!("{}: output still open {:?} after exit", self.id, OUTPUT_DRAIN);
                    break;
                }
            }
        }
    }

    fn publish(&self, snapshot: Snapshot) {
        self.snapshots.send_replace(Arc::new(snapshot));
    }

    fn open_transcript(&mut self) {
        let Some(dir) = self.config.transcript_dir.as_deref() else {
            return;
        };
        match Transcript::create(dir, self.job.kind.verb()) {
            Ok(transcript) => {
                log::debug!("{}: transcript at {}", self.id, transcript.path().display());
                self.transcript_path = Some(transcript.path().to_path_buf());
                self.transcript = Some(transcript);
            }
            Err(err) => log::warn!("{}: transcript disabled: {:#}", self.id, err),
        }
    }

    fn close_transcript(&mut self) {
        let Some(transcript) = self.transcript.take() else {
            return;
        };
        transcript.finish();
        if let Some(dir) = self.config.transcript_dir.as_deref() {
            if let Err(err) = prune_transcripts(dir, self.config.transcript_retention) {
                log::warn!("{}: failed to prune transcripts: {:#}", self.id, err);
            }
        }
    }

    fn summary(&self, last: &Snapshot) -> JobSummary {
        JobSummary {
            items: self.job.sources.len(),
            bytes_transferred: last.global.bytes_transferred,
            files_completed: last.global.files_completed,
            errors: last.global.errors,
            elapsed: self.started.elapsed(),
            parse_anomalies: last.parse_anomalies,
            transcript: self.transcript_path.clone(),
        }
    }
}

/// Stats blocks end up on stderr too; keep only the tool's own messages.
fn strip_progress(stderr_tail: &str) -> String {
    let mut kept = String::new();
    for line in stderr_tail.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.ends_with("NOTICE:") || classify_line(line).is_progress() {
            continue;
        }
        kept.push_str(line);
        kept.push('\n');
    }
    kept
}
