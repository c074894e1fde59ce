//! Launching and supervising the external transfer tool.
//!
//! A started process is split across three tasks: one reader per pipe, which
//! decode output and forward it as [`OutputChunk`]s, and a reaper that owns the
//! child, publishes its exit through a watch channel and carries out force-kill
//! requests. The [`ProcessHandle`] only talks to those tasks, so any number of
//! callers can wait on or terminate the same process.

use std::collections::VecDeque;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

use crate::errors::LaunchError;

pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Stderr lines kept for failure reports.
pub const STDERR_TAIL_LINES: usize = 64;

const READ_BUFFER: usize = 8 * 1024;
const REAP_GRACE: Duration = Duration::from_secs(2);
const STDERR_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputOrigin {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub origin: OutputOrigin,
    pub text: String,
}

/// Decoded output of both pipes, in arrival order. Ends once both pipes close.
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::UnboundedReceiver<OutputChunk>,
}

impl OutputStream {
    pub async fn next(&mut self) -> Option<OutputChunk> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatusInfo {
    pub success: bool,
    /// `None` when the process was ended by a signal.
    pub code: Option<i32>,
    pub stderr_tail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The process had already exited before the call.
    AlreadyExited,
    /// The process exited within the timeout after the graceful signal.
    Exited,
    /// The timeout elapsed and the process was killed.
    ForceKilled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RawExit {
    success: bool,
    code: Option<i32>,
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

pub struct ProcessRunner;

impl ProcessRunner {
    /// Spawn `program` with piped stdout/stderr. Must be called inside a tokio runtime.
    pub fn start<I, S>(
        program: &Path,
        args: I,
        working_dir: Option<&Path>,
    ) -> Result<ProcessHandle, LaunchError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| LaunchError::from_io(program, &err))?;
        let pid = child.id();
        log::debug!("started {} (pid {:?})", program.display(), pid);

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let tail: StderrTail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let (stderr_done_tx, stderr_done_rx) = watch::channel(false);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_pipe(stdout, OutputOrigin::Stdout, chunk_tx.clone(), None));
        }
        match child.stderr.take() {
            Some(stderr) => {
                let tail = Arc::clone(&tail);
                let tx = chunk_tx.clone();
                tokio::spawn(async move {
                    pump_pipe(stderr, OutputOrigin::Stderr, tx, Some(tail)).await;
                    stderr_done_tx.send_replace(true);
                });
            }
            None => {
                stderr_done_tx.send_replace(true);
            }
        }
        drop(chunk_tx);

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        tokio::spawn(reap(child, kill_rx, exit_tx));

        Ok(ProcessHandle {
            program: program.to_path_buf(),
            pid,
            output: Some(OutputStream { rx: chunk_rx }),
            exit_rx,
            kill_tx,
            stderr_done_rx,
            tail,
        })
    }
}

pub struct ProcessHandle {
    program: PathBuf,
    pid: Option<u32>,
    output: Option<OutputStream>,
    exit_rx: watch::Receiver<Option<RawExit>>,
    kill_tx: mpsc::UnboundedSender<()>,
    stderr_done_rx: watch::Receiver<bool>,
    tail: StderrTail,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the output stream. Only the first call returns it.
    pub fn output_chunks(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Wait for the process to exit. The stderr tail includes everything the
    /// process wrote before its pipe closed, waiting at most one second for it.
    pub async fn exit_status(&self) -> ExitStatusInfo {
        let mut exit_rx = self.exit_rx.clone();
        let raw = match exit_rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(RawExit {
                success: false,
                code: None,
            }),
            Err(_) => {
                log::warn!("reaper for {} stopped without an exit status", self.program.display());
                RawExit {
                    success: false,
                    code: None,
                }
            }
        };

        let mut stderr_done = self.stderr_done_rx.clone();
        let _ = tokio::time::timeout(STDERR_DRAIN, stderr_done.wait_for(|done| *done)).await;

        self.status_info(raw)
    }

    pub fn try_exit_status(&self) -> Option<ExitStatusInfo> {
        let raw = (*self.exit_rx.borrow())?;
        Some(self.status_info(raw))
    }

    /// Ask the process to stop, escalating to a kill after `timeout`.
    ///
    /// Safe to call in any state and from several callers. Returns within
    /// `timeout` plus a short reaping grace.
    pub async fn terminate(&self, timeout: Duration) -> TerminateOutcome {
        if self.has_exited() {
            return TerminateOutcome::AlreadyExited;
        }

        self.signal_graceful();
        if self.wait_exit(timeout).await {
            return TerminateOutcome::Exited;
        }

        log::warn!(
            "{} did not exit within {:?}, killing it",
            self.program.display(),
            timeout
        );
        self.force_kill();
        if !self.wait_exit(REAP_GRACE).await {
            log::warn!("{} not reaped after kill", self.program.display());
        }
        TerminateOutcome::ForceKilled
    }

    pub fn force_kill(&self) {
        // The reaper is gone once the child is reaped; nothing left to kill then.
        let _ = self.kill_tx.send(());
    }

    #[cfg(unix)]
    fn signal_graceful(&self) {
        let Some(pid) = self.pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
            self.force_kill();
            return;
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            log::debug!(
                "SIGTERM to pid {} failed: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(unix))]
    fn signal_graceful(&self) {
        self.force_kill();
    }

    async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut exit_rx = self.exit_rx.clone();
        let waited = tokio::time::timeout(timeout, exit_rx.wait_for(Option::is_some)).await;
        matches!(waited, Ok(Ok(_)))
    }

    fn status_info(&self, raw: RawExit) -> ExitStatusInfo {
        let tail = self.tail.lock();
        let mut stderr_tail = String::new();
        for line in tail.iter() {
            stderr_tail.push_str(line);
            stderr_tail.push('\n');
        }
        ExitStatusInfo {
            success: raw.success,
            code: raw.code,
            stderr_tail,
        }
    }
}

async fn reap(
    mut child: Child,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
    exit_tx: watch::Sender<Option<RawExit>>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            request = kill_rx.recv() => match request {
                Some(()) => {
                    if let Err(err) = child.start_kill() {
                        log::debug!("kill request failed: {err}");
                    }
                }
                // Every handle is gone and nobody will wait on the process any more.
                None => {
                    log::debug!("process handle dropped, killing child");
                    if let Err(err) = child.start_kill() {
                        log::debug!("kill after handle drop failed: {err}");
                    }
                    break child.wait().await;
                }
            },
        }
    };

    let raw = match status {
        Ok(status) => RawExit {
            success: status.success(),
            code: status.code(),
        },
        Err(err) => {
            log::warn!("failed to wait for child process: {err}");
            RawExit {
                success: false,
                code: None,
            }
        }
    };
    exit_tx.send_replace(Some(raw));
}

async fn pump_pipe<R>(
    mut pipe: R,
    origin: OutputOrigin,
    tx: mpsc::UnboundedSender<OutputChunk>,
    tail: Option<StderrTail>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0_u8; READ_BUFFER];
    let mut pending = Vec::new();
    let mut partial_line = String::new();

    loop {
        let (text, eof) = match pipe.read(&mut buf).await {
            Ok(0) => {
                let rest = String::from_utf8_lossy(&pending).into_owned();
                pending.clear();
                (rest, true)
            }
            Ok(n) => (decode_utf8(&mut pending, &buf[..n]), false),
            Err(err) => {
                log::debug!("{origin:?} read failed: {err}");
                break;
            }
        };

        if let Some(tail) = &tail {
            record_tail(tail, &mut partial_line, &text, eof);
        }
        // The receiver may be gone when nobody consumes output; keep draining the pipe.
        if !text.is_empty() {
            let _ = tx.send(OutputChunk { origin, text });
        }
        if eof {
            break;
        }
    }
}

/// Decode `bytes` after any bytes held back from the previous read. An
/// incomplete multi-byte sequence at the end is held back again; invalid
/// sequences become U+FFFD.
fn decode_utf8(pending: &mut Vec<u8>, bytes: &[u8]) -> String {
    pending.extend_from_slice(bytes);
    let mut out = String::with_capacity(pending.len());
    let mut start = 0;
    loop {
        match std::str::from_utf8(&pending[start..]) {
            Ok(valid) => {
                out.push_str(valid);
                start = pending.len();
                break;
            }
            Err(err) => {
                let valid_end = start + err.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[start..valid_end]));
                match err.error_len() {
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        start = valid_end + len;
                    }
                    None => {
                        start = valid_end;
                        break;
                    }
                }
            }
        }
    }
    pending.drain(..start);
    out
}

fn record_tail(tail: &StderrTail, partial_line: &mut String, text: &str, eof: bool) {
    partial_line.push_str(text);
    let mut tail = tail.lock();
    while let Some(newline) = partial_line.find('\n') {
        let line: String = partial_line.drain(..=newline).collect();
        push_tail_line(&mut tail, line.trim_end_matches(['\n', '\r']));
    }
    if eof && !partial_line.is_empty() {
        let line = std::mem::take(partial_line);
        push_tail_line(&mut tail, line.trim_end_matches('\r'));
    }
}

fn push_tail_line(tail: &mut VecDeque<String>, line: &str) {
    if tail.len() == STDERR_TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(line.to_string());
}
