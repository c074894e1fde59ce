//! Finding and removing partial files left by an interrupted transfer.
//!
//! The tool writes each file to `<name>.<token>.partial` next to its final
//! location and renames it once complete, so a cancelled transfer can leave
//! those behind anywhere under the destination. Local destinations are walked
//! here; remote ones are listed through the tool and read with
//! [`candidates_from_listing`].

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, FixedOffset};
use eyre::{Context, Result};
use serde::Deserialize;
use walkdir::WalkDir;

use crate::errors::CleanupIoError;
use crate::job::Location;

pub const PARTIAL_SUFFIX: &str = ".partial";

const TOKEN_MIN: usize = 6;
const TOKEN_MAX: usize = 16;

/// The parts of a partial file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialName<'a> {
    pub original: &'a str,
    pub token: &'a str,
}

/// Match `<original>.<token>.partial`.
///
/// The token has to look generated: 6 to 16 ASCII alphanumerics that contain a
/// digit, mix letter case, or form an 8-digit hex number. A plain word such as
/// `notes.backup.partial` is left alone.
pub fn match_partial_name(name: &str) -> Option<PartialName<'_>> {
    let stem = name.strip_suffix(PARTIAL_SUFFIX)?;
    let (original, token) = stem.rsplit_once('.')?;
    if original.is_empty() || !looks_generated(token) {
        return None;
    }
    Some(PartialName { original, token })
}

fn looks_generated(token: &str) -> bool {
    if !(TOKEN_MIN..=TOKEN_MAX).contains(&token.len())
        || !token.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return false;
    }
    let has_digit = token.chars().any(|c| c.is_ascii_digit());
    let mixed_case = token.chars().any(|c| c.is_ascii_lowercase())
        && token.chars().any(|c| c.is_ascii_uppercase());
    let hex8 = token.len() == 8 && token.chars().all(|c| c.is_ascii_hexdigit());
    has_digit || mixed_case || hex8
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialFileCandidate {
    pub location: Location,
    /// Path below the scanned root.
    pub relative_path: PathBuf,
    pub size: u64,
    pub modified: Option<SystemTime>,
    /// The `.<token>.partial` suffix that matched.
    pub matched_pattern: String,
    /// Name the file would have had once complete.
    pub original_name: String,
}

/// Look for partial files under `root`.
///
/// A single-file transfer only looks at `root` itself; a directory transfer
/// descends into every subdirectory. A missing root yields no candidates.
pub fn scan(root: &Path, was_directory_transfer: bool) -> Result<Vec<PartialFileCandidate>> {
    if !root.is_dir() {
        log::debug!("cleanup root {} is not a directory", root.display());
        return Ok(Vec::new());
    }

    let max_depth = if was_directory_transfer { usize::MAX } else { 1 };
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false);

    let mut candidates = Vec::new();
    for next in walker {
        let entry = match next {
            Ok(entry) => entry,
            Err(err) => {
                log::debug!("skipping unreadable entry during cleanup scan: {err}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(partial) = match_partial_name(name) else {
            continue;
        };

        let path = entry.path();
        let metadata = entry
            .metadata()
            .wrap_err_with(|| format!("stat partial file {}", path.display()))?;
        let relative_path = path
            .strip_prefix(root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| PathBuf::from(name));

        candidates.push(PartialFileCandidate {
            location: Location::Local(path.to_path_buf()),
            relative_path,
            size: metadata.len(),
            modified: metadata.modified().ok(),
            matched_pattern: format!(".{}{}", partial.token, PARTIAL_SUFFIX),
            original_name: partial.original.to_string(),
        });
    }

    candidates.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(candidates)
}

/// One entry of the tool's `lsjson` output.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    path: String,
    name: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    mod_time: Option<String>,
    #[serde(default)]
    is_dir: bool,
}

/// Read partial files out of a JSON listing of `root`, whose entry paths are
/// relative to `root`. Mirrors [`scan`]: without `was_directory_transfer`
/// only entries directly under `root` count.
pub fn candidates_from_listing(
    root: &Location,
    listing: &str,
    was_directory_transfer: bool,
) -> Result<Vec<PartialFileCandidate>> {
    let entries: Vec<ListEntry> =
        serde_json::from_str(listing).wrap_err_with(|| format!("parse listing of {root}"))?;

    let mut candidates = Vec::new();
    for entry in entries {
        if entry.is_dir || (!was_directory_transfer && entry.path.contains('/')) {
            continue;
        }
        let Some(partial) = match_partial_name(&entry.name) else {
            continue;
        };
        let modified = entry
            .mod_time
            .as_deref()
            .and_then(|raw| DateTime::<FixedOffset>::parse_from_rfc3339(raw).ok())
            .map(SystemTime::from);

        candidates.push(PartialFileCandidate {
            location: root.join(&entry.path),
            relative_path: PathBuf::from(&entry.path),
            size: u64::try_from(entry.size).unwrap_or(0),
            modified,
            matched_pattern: format!(".{}{}", partial.token, PARTIAL_SUFFIX),
            original_name: partial.original.to_string(),
        });
    }

    candidates.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(candidates)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Removed,
    Kept,
    Failed(CleanupIoError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupEntry {
    pub candidate: PartialFileCandidate,
    pub disposition: Disposition,
}

/// What happened to each partial file found after a cancellation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub entries: Vec<CleanupEntry>,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn removed(&self) -> usize {
        self.count(|d| matches!(d, Disposition::Removed))
    }

    pub fn kept(&self) -> usize {
        self.count(|d| matches!(d, Disposition::Kept))
    }

    pub fn failures(&self) -> impl Iterator<Item = &CleanupIoError> {
        self.entries.iter().filter_map(|entry| match &entry.disposition {
            Disposition::Failed(err) => Some(err),
            _ => None,
        })
    }

    pub fn extend(&mut self, other: CleanupReport) {
        self.entries.extend(other.entries);
    }

    fn count(&self, pred: impl Fn(&Disposition) -> bool) -> usize {
        self.entries
            .iter()
            .filter(|entry| pred(&entry.disposition))
            .count()
    }
}

/// Delete every local candidate. A file that cannot be removed is recorded and
/// the rest are still attempted. Remote candidates are left to the tool.
pub fn remove_candidates(candidates: Vec<PartialFileCandidate>) -> CleanupReport {
    let entries = candidates
        .into_iter()
        .map(|candidate| {
            let disposition = match candidate.location.local_path() {
                Some(path) => remove_local(path),
                None => Disposition::Failed(CleanupIoError {
                    path: PathBuf::from(candidate.location.to_arg()),
                    kind: io::ErrorKind::Unsupported,
                    message: "remote file cannot be removed from the local filesystem".into(),
                }),
            };
            CleanupEntry {
                candidate,
                disposition,
            }
        })
        .collect();
    CleanupReport { entries }
}

fn remove_local(path: &Path) -> Disposition {
    match fs::remove_file(path) {
        Ok(()) => Disposition::Removed,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            log::debug!("{} already gone", path.display());
            Disposition::Removed
        }
        Err(err) => {
            log::warn!("failed to remove partial file {}: {}", path.display(), err);
            Disposition::Failed(CleanupIoError::from_io(path, &err))
        }
    }
}

pub fn keep_candidates(candidates: Vec<PartialFileCandidate>) -> CleanupReport {
    CleanupReport {
        entries: candidates
            .into_iter()
            .map(|candidate| CleanupEntry {
                candidate,
                disposition: Disposition::Kept,
            })
            .collect(),
    }
}

/// Asks the user whether the listed partial files should be deleted.
///
/// Called from a blocking thread, so implementations may wait on stdin.
pub trait CleanupPrompt: Send + Sync {
    fn confirm(&self, candidates: &[PartialFileCandidate]) -> bool;
}

#[derive(Clone, Default)]
pub enum CleanupPolicy {
    #[default]
    Keep,
    Remove,
    Prompt(Arc<dyn CleanupPrompt>),
}

impl fmt::Debug for CleanupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupPolicy::Keep => f.write_str("Keep"),
            CleanupPolicy::Remove => f.write_str("Remove"),
            CleanupPolicy::Prompt(_) => f.write_str("Prompt(..)"),
        }
    }
}

/// Whether `policy` wants `candidates` deleted. A prompt runs on the
/// blocking pool; a prompt that fails to answer keeps the files.
pub async fn confirm_removal(policy: &CleanupPolicy, candidates: &[PartialFileCandidate]) -> bool {
    if candidates.is_empty() {
        return false;
    }
    match policy {
        CleanupPolicy::Keep => false,
        CleanupPolicy::Remove => true,
        CleanupPolicy::Prompt(prompt) => {
            let prompt = Arc::clone(prompt);
            let listed = candidates.to_vec();
            match tokio::task::spawn_blocking(move || prompt.confirm(&listed)).await {
                Ok(answer) => answer,
                Err(err) => {
                    log::warn!("cleanup prompt failed, keeping partial files: {err}");
                    false
                }
            }
        }
    }
}

/// Resolve local `candidates` according to `policy`. Filesystem work and the
/// prompt run on the blocking pool.
pub async fn apply_policy(
    policy: &CleanupPolicy,
    candidates: Vec<PartialFileCandidate>,
) -> CleanupReport {
    if candidates.is_empty() {
        return CleanupReport::default();
    }
    if !confirm_removal(policy, &candidates).await {
        return keep_candidates(candidates);
    }

    let fallback = candidates.clone();
    match tokio::task::spawn_blocking(move || remove_candidates(candidates)).await {
        Ok(report) => report,
        Err(err) => {
            log::warn!("cleanup task failed, keeping partial files: {err}");
            keep_candidates(fallback)
        }
    }
}
