use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use eyre::{bail, Result};

use crate::cleanup::CleanupPolicy;

/// Identifier of a submitted job, unique within one orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Copy,
    Move,
    Delete,
    Mkdir,
}

impl JobKind {
    pub fn verb(self) -> &'static str {
        match self {
            JobKind::Copy => "copy",
            JobKind::Move => "move",
            JobKind::Delete => "delete",
            JobKind::Mkdir => "mkdir",
        }
    }
}

/// A path the tool understands: a local path or `remote:path` on a configured remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local(PathBuf),
    Remote { remote: String, path: String },
}

impl Location {
    /// Interpret `raw` the way the tool does: `name:path` addresses a remote,
    /// anything else (including `C:\...` drive paths) is local.
    pub fn parse(raw: &str) -> Self {
        if let Some((remote, path)) = raw.split_once(':') {
            let is_remote_name = remote.chars().count() > 1
                && !remote.contains(['/', '\\'])
                && !remote.starts_with('.');
            if is_remote_name {
                return Location::Remote {
                    remote: remote.to_string(),
                    path: path.to_string(),
                };
            }
        }
        Location::Local(PathBuf::from(raw))
    }

    pub fn local_path(&self) -> Option<&Path> {
        match self {
            Location::Local(path) => Some(path),
            Location::Remote { .. } => None,
        }
    }

    /// Final path component, if there is one.
    pub fn file_name(&self) -> Option<String> {
        match self {
            Location::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            Location::Remote { path, .. } => path
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .map(str::to_string),
        }
    }

    pub fn join(&self, name: &str) -> Location {
        match self {
            Location::Local(path) => Location::Local(path.join(name)),
            Location::Remote { remote, path } => {
                let trimmed = path.trim_end_matches('/');
                let joined = if trimmed.is_empty() {
                    name.to_string()
                } else {
                    format!("{trimmed}/{name}")
                };
                Location::Remote {
                    remote: remote.clone(),
                    path: joined,
                }
            }
        }
    }

    /// Command-line form.
    pub fn to_arg(&self) -> OsString {
        match self {
            Location::Local(path) => path.clone().into_os_string(),
            Location::Remote { remote, path } => OsString::from(format!("{remote}:{path}")),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::Remote { remote, path } => write!(f, "{remote}:{path}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceItem {
    pub location: Location,
    pub is_dir: bool,
}

impl SourceItem {
    pub fn file(location: Location) -> Self {
        Self {
            location,
            is_dir: false,
        }
    }

    pub fn dir(location: Location) -> Self {
        Self {
            location,
            is_dir: true,
        }
    }
}

/// One user-initiated operation. Each source item runs as its own tool process.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub kind: JobKind,
    pub sources: Vec<SourceItem>,
    pub destination: Option<Location>,
    /// Flags appended after the configured ones for this job only.
    pub extra_flags: Vec<String>,
    /// What to do with partial files left behind by a cancelled transfer.
    pub cleanup: CleanupPolicy,
}

impl TransferJob {
    pub fn copy(sources: Vec<SourceItem>, destination: Location) -> Self {
        Self::transfer(JobKind::Copy, sources, destination)
    }

    pub fn move_to(sources: Vec<SourceItem>, destination: Location) -> Self {
        Self::transfer(JobKind::Move, sources, destination)
    }

    pub fn delete(targets: Vec<SourceItem>) -> Self {
        Self {
            kind: JobKind::Delete,
            sources: targets,
            destination: None,
            extra_flags: Vec::new(),
            cleanup: CleanupPolicy::Keep,
        }
    }

    pub fn mkdir(location: Location) -> Self {
        Self {
            kind: JobKind::Mkdir,
            sources: vec![SourceItem::dir(location)],
            destination: None,
            extra_flags: Vec::new(),
            cleanup: CleanupPolicy::Keep,
        }
    }

    fn transfer(kind: JobKind, sources: Vec<SourceItem>, destination: Location) -> Self {
        Self {
            kind,
            sources,
            destination: Some(destination),
            extra_flags: Vec::new(),
            cleanup: CleanupPolicy::Keep,
        }
    }

    pub fn with_cleanup(mut self, cleanup: CleanupPolicy) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_extra_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_flags.extend(flags.into_iter().map(Into::into));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            bail!("{} job has no source items", self.kind.verb());
        }
        match self.kind {
            JobKind::Copy | JobKind::Move if self.destination.is_none() => {
                bail!("{} job needs a destination", self.kind.verb())
            }
            JobKind::Mkdir if self.sources.len() != 1 => {
                bail!("mkdir takes exactly one path")
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_and_local_locations() {
        assert_eq!(
            Location::parse("gdrive:backups/2024"),
            Location::Remote {
                remote: "gdrive".into(),
                path: "backups/2024".into()
            }
        );
        assert_eq!(
            Location::parse("s3:"),
            Location::Remote {
                remote: "s3".into(),
                path: String::new()
            }
        );
        assert_eq!(
            Location::parse("C:\\Users\\me"),
            Location::Local(PathBuf::from("C:\\Users\\me"))
        );
        assert_eq!(
            Location::parse("./odd:name"),
            Location::Local(PathBuf::from("./odd:name"))
        );
        assert_eq!(
            Location::parse("/tmp/plain"),
            Location::Local(PathBuf::from("/tmp/plain"))
        );
    }

    #[test]
    fn remote_join_and_name() {
        let dest = Location::parse("gdrive:backups/");
        let joined = dest.join("photos");
        assert_eq!(joined.to_string(), "gdrive:backups/photos");
        assert_eq!(joined.file_name().as_deref(), Some("photos"));
        assert_eq!(Location::parse("gdrive:").join("a").to_string(), "gdrive:a");
        assert_eq!(Location::parse("gdrive:").file_name(), None);
    }

    #[test]
    fn transfer_jobs_need_a_destination() {
        let mut job = TransferJob::copy(
            vec![SourceItem::file(Location::parse("/tmp/a"))],
            Location::parse("/tmp/b"),
        );
        assert!(job.validate().is_ok());
        job.destination = None;
        assert!(job.validate().is_err());

        let empty = TransferJob::delete(Vec::new());
        assert!(empty.validate().is_err());
    }
}
