//! Per-job transcripts of raw tool output.
//!
//! Each job writes `<verb>_<YYYYmmdd_HHMMSS_micros>.log` into the transcript
//! directory. Old transcripts are pruned so only the newest few remain.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use eyre::{Context, Result};

use crate::process::{OutputChunk, OutputOrigin};

pub const TRANSCRIPT_EXTENSION: &str = "log";

pub struct Transcript {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl std::fmt::Debug for Transcript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcript")
            .field("path", &self.path)
            .field("open", &self.writer.is_some())
            .finish()
    }
}

impl Transcript {
    pub fn create(dir: &Path, verb: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("create transcript directory {}", dir.display()))?;
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%6f");
        let path = dir.join(format!("{verb}_{stamp}.{TRANSCRIPT_EXTENSION}"));
        let file = File::create(&path)
            .wrap_err_with(|| format!("create transcript {}", path.display()))?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    /// Append a marker line, such as the command line of the next item.
    pub fn note(&mut self, line: &str) {
        self.write_with(|w| writeln!(w, "=== {line}"));
    }

    pub fn record(&mut self, chunk: &OutputChunk) {
        // Stdout is rare enough from the tool that tagging it is more useful than noisy.
        if chunk.origin == OutputOrigin::Stdout {
            self.write_with(|w| {
                for line in chunk.text.split_inclusive('\n') {
                    write!(w, "[stdout] {line}")?;
                }
                Ok(())
            });
        } else {
            self.write_with(|w| w.write_all(chunk.text.as_bytes()));
        }
    }

    pub fn finish(mut self) {
        self.write_with(|w| w.flush());
    }

    fn write_with<F>(&mut self, op: F)
    where
        F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
    {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        if let Err(err) = op(writer) {
            log::warn!(
                "transcript {} disabled after write failure: {}",
                self.path.display(),
                err
            );
            self.writer = None;
        }
    }
}

/// Remove all but the `keep` most recent transcripts in `dir`. Returns how
/// many were removed. A missing directory has nothing to prune.
pub fn prune_transcripts(dir: &Path, keep: usize) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }

    let mut logs: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir).wrap_err_with(|| format!("read {}", dir.display()))? {
        let entry = entry.wrap_err_with(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        let is_log = path
            .extension()
            .is_some_and(|ext| ext == TRANSCRIPT_EXTENSION);
        if !is_log || !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        logs.push((modified, path));
    }

    if logs.len() <= keep {
        return Ok(0);
    }

    // Newest first; names embed the timestamp, so they break mtime ties.
    logs.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    let mut removed = 0;
    for (_, path) in logs.into_iter().skip(keep) {
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) => log::warn!("failed to prune transcript {}: {}", path.display(), err),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn transcript_keeps_raw_output() {
        let temp = tempfile::tempdir().unwrap();
        let mut transcript = Transcript::create(&temp.path().join("logs"), "copy").unwrap();
        let path = transcript.path().to_path_buf();
        transcript.note("rclone copy a b");
        transcript.record(&OutputChunk {
            origin: OutputOrigin::Stderr,
            text: "Transferred: 1 / 1, 100%\n".into(),
        });
        transcript.record(&OutputChunk {
            origin: OutputOrigin::Stdout,
            text: "hello\n".into(),
        });
        transcript.finish();

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("copy_"));
        assert!(name.ends_with(".log"));
        let body = fs::read_to_string(&path).unwrap();
        assert_eq!(
            body,
            "=== rclone copy a b\nTransferred: 1 / 1, 100%\n[stdout] hello\n"
        );
    }

    #[test]
    fn prune_keeps_newest() {
        let temp = tempfile::tempdir().unwrap();
        let base = SystemTime::now() - Duration::from_secs(600);
        for i in 0..7u64 {
            let path = temp.path().join(format!("copy_{i}.log"));
            let file = File::create(&path).unwrap();
            file.set_modified(base + Duration::from_secs(i * 10)).unwrap();
        }
        fs::write(temp.path().join("notes.txt"), b"keep me").unwrap();

        let removed = prune_transcripts(temp.path(), 5).unwrap();
        assert_eq!(removed, 2);
        assert!(!temp.path().join("copy_0.log").exists());
        assert!(!temp.path().join("copy_1.log").exists());
        assert!(temp.path().join("copy_6.log").exists());
        assert!(temp.path().join("notes.txt").exists());

        assert_eq!(prune_transcripts(temp.path(), 5).unwrap(), 0);
        assert_eq!(prune_transcripts(&temp.path().join("absent"), 5).unwrap(), 0);
    }
}
