//! Tool command lines for one source item, and for cleaning up after one.
//!
//! `[tool] [--config <file>] [configured flags] [job flags] [stats flags] <verb> <args>`

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

use eyre::{eyre, Result};

use crate::config::EngineConfig;
use crate::job::{JobKind, Location, SourceItem, TransferJob};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Where a cancelled item may have left partial files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupTarget {
    pub root: Location,
    pub is_directory: bool,
    /// For a single file, only partials of this name belong to the item.
    pub original_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemPlan {
    pub command: ToolCommand,
    /// `None` for non-transfer jobs.
    pub cleanup: Option<CleanupTarget>,
}

/// `--config` and the configured flags, which every invocation carries.
fn base_args(config: &EngineConfig) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    if let Some(tool_config) = &config.tool_config {
        args.push(config.flags.config.clone().into());
        args.push(tool_config.clone().into_os_string());
    }
    args.extend(config.extra_flags.iter().map(OsString::from));
    args
}

pub fn plan_item(config: &EngineConfig, job: &TransferJob, item: &SourceItem) -> Result<ItemPlan> {
    let mut args = base_args(config);
    args.extend(job.extra_flags.iter().map(OsString::from));

    let mut cleanup = None;
    match job.kind {
        JobKind::Copy | JobKind::Move => {
            let destination = job
                .destination
                .as_ref()
                .ok_or_else(|| eyre!("{} job has no destination", job.kind.verb()))?;
            let target = item_destination(item, destination);

            args.push(config.flags.stats.clone().into());
            args.push(config.stats_interval.clone().into());
            args.extend(config.flags.stats_log_level.iter().map(OsString::from));
            args.push(config.flags.transfers.clone().into());
            args.push(config.parallelism.to_string().into());

            args.push(job.kind.verb().into());
            args.push(item.location.to_arg());
            args.push(target.to_arg());

            cleanup = Some(CleanupTarget {
                root: target,
                is_directory: item.is_dir,
                original_name: if item.is_dir {
                    None
                } else {
                    item.location.file_name()
                },
            });
        }
        JobKind::Delete => {
            args.push(if item.is_dir { "purge" } else { "delete" }.into());
            args.push(item.location.to_arg());
        }
        JobKind::Mkdir => {
            args.push("mkdir".into());
            args.push(item.location.to_arg());
        }
    }

    Ok(ItemPlan {
        command: ToolCommand {
            program: config.tool_path.clone(),
            args,
        },
        cleanup,
    })
}

/// List the files under a remote cleanup root as JSON. Only a directory
/// transfer is listed recursively.
pub fn list_partials_command(config: &EngineConfig, target: &CleanupTarget) -> ToolCommand {
    let mut args = base_args(config);
    args.push("lsjson".into());
    args.push("--files-only".into());
    if target.is_directory {
        args.push("-R".into());
    }
    args.push(target.root.to_arg());
    ToolCommand {
        program: config.tool_path.clone(),
        args,
    }
}

pub fn delete_file_command(config: &EngineConfig, file: &Location) -> ToolCommand {
    let mut args = base_args(config);
    args.push("deletefile".into());
    args.push(file.to_arg());
    ToolCommand {
        program: config.tool_path.clone(),
        args,
    }
}

/// A directory lands under its own name inside the destination; a file is
/// copied into the destination directory.
fn item_destination(item: &SourceItem, destination: &Location) -> Location {
    if item.is_dir {
        if let Some(name) = item.location.file_name() {
            return destination.join(&name);
        }
    }
    destination.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(plan: &ItemPlan) -> Vec<String> {
        plan.command
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn copy_directory_keeps_its_name() {
        let config = EngineConfig {
            tool_config: Some(PathBuf::from("/etc/rclone.conf")),
            extra_flags: vec!["--fast-list".into()],
            parallelism: 4,
            ..EngineConfig::default()
        };
        let job = TransferJob::copy(
            vec![SourceItem::dir(Location::parse("/data/photos"))],
            Location::parse("/backup"),
        )
        .with_extra_flags(["--dry-run"]);

        let plan = plan_item(&config, &job, &job.sources[0]).unwrap();
        assert_eq!(plan.command.program, PathBuf::from("rclone"));
        assert_eq!(
            args_of(&plan),
            vec![
                "--config",
                "/etc/rclone.conf",
                "--fast-list",
                "--dry-run",
                "--stats",
                "1s",
                "--stats-log-level",
                "NOTICE",
                "--transfers",
                "4",
                "copy",
                "/data/photos",
                "/backup/photos",
            ]
        );
        let cleanup = plan.cleanup.unwrap();
        assert_eq!(cleanup.root, Location::parse("/backup/photos"));
        assert!(cleanup.is_directory);
        assert_eq!(cleanup.original_name, None);
    }

    #[test]
    fn single_file_goes_into_destination() {
        let config = EngineConfig::default();
        let job = TransferJob::move_to(
            vec![SourceItem::file(Location::parse("gdrive:docs/report.pdf"))],
            Location::parse("/home/me/Downloads"),
        );
        let plan = plan_item(&config, &job, &job.sources[0]).unwrap();
        let args = args_of(&plan);
        assert_eq!(
            &args[args.len() - 3..],
            &["move", "gdrive:docs/report.pdf", "/home/me/Downloads"]
        );
        let cleanup = plan.cleanup.unwrap();
        assert!(!cleanup.is_directory);
        assert_eq!(cleanup.original_name.as_deref(), Some("report.pdf"));
    }

    #[test]
    fn remote_destination_is_cleaned_through_the_tool() {
        let config = EngineConfig {
            tool_config: Some(PathBuf::from("/etc/rclone.conf")),
            extra_flags: vec!["--fast-list".into()],
            ..EngineConfig::default()
        };
        let job = TransferJob::copy(
            vec![SourceItem::dir(Location::parse("/data/photos"))],
            Location::parse("s3:bucket"),
        )
        .with_extra_flags(["--dry-run"]);
        let plan = plan_item(&config, &job, &job.sources[0]).unwrap();
        assert!(args_of(&plan).ends_with(&["s3:bucket/photos".to_string()]));

        let cleanup = plan.cleanup.unwrap();
        assert_eq!(cleanup.root, Location::parse("s3:bucket/photos"));
        let listing = list_partials_command(&config, &cleanup);
        assert_eq!(
            listing.to_string(),
            "rclone --config /etc/rclone.conf --fast-list lsjson --files-only -R s3:bucket/photos"
        );

        let removal =
            delete_file_command(&config, &Location::parse("s3:bucket/photos/a.jpg.Ab12Cd.partial"));
        assert_eq!(
            removal.to_string(),
            "rclone --config /etc/rclone.conf --fast-list deletefile s3:bucket/photos/a.jpg.Ab12Cd.partial"
        );
    }

    #[test]
    fn single_file_listing_is_not_recursive() {
        let target = CleanupTarget {
            root: Location::parse("gdrive:inbox"),
            is_directory: false,
            original_name: Some("report.pdf".into()),
        };
        let listing = list_partials_command(&EngineConfig::default(), &target);
        assert_eq!(listing.to_string(), "rclone lsjson --files-only gdrive:inbox");
    }

    #[test]
    fn delete_and_mkdir_verbs() {
        let config = EngineConfig::default();
        let job = TransferJob::delete(vec![
            SourceItem::dir(Location::parse("remote:old")),
            SourceItem::file(Location::parse("remote:a.txt")),
        ]);
        let purge = plan_item(&config, &job, &job.sources[0]).unwrap();
        assert_eq!(args_of(&purge), vec!["purge", "remote:old"]);
        let delete = plan_item(&config, &job, &job.sources[1]).unwrap();
        assert_eq!(args_of(&delete), vec!["delete", "remote:a.txt"]);

        let job = TransferJob::mkdir(Location::parse("remote:new"));
        let mkdir = plan_item(&config, &job, &job.sources[0]).unwrap();
        assert_eq!(args_of(&mkdir), vec!["mkdir", "remote:new"]);
        assert_eq!(mkdir.command.to_string(), "rclone mkdir remote:new");
    }
}
