use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(about = "Drive rclone transfers with live per-file progress")]
#[command(after_help = "Run '<command> --help' for detailed options on each command.")]
pub struct Cli {
    /// Override the configuration directory for this invocation
    #[arg(long, global = true, value_name = "PATH")]
    pub config_dir: Option<PathBuf>,
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Copy files or directories to a destination
    Copy(TransferArgs),
    /// Move files or directories to a destination (source removed afterwards)
    Move(TransferArgs),
    /// Delete files, or whole directories with --dir
    Delete(DeleteArgs),
    /// Create a directory
    Mkdir(MkdirArgs),
}

#[derive(Args, Clone, Debug)]
pub struct TransferArgs {
    /// Source paths or remote:path specs, followed by the destination
    #[arg(required = true, num_args = 1..)]
    pub sources: Vec<String>,
    /// Destination directory
    pub destination: String,
    /// Number of files transferred in parallel (defaults to the configured value)
    #[arg(long, value_name = "N")]
    pub parallel: Option<usize>,
    /// Remove partial files left by a cancelled transfer without asking
    #[arg(long, short = 'y')]
    pub yes: bool,
    /// Keep partial files left by a cancelled transfer without asking
    #[arg(long, conflicts_with = "yes")]
    pub keep_partials: bool,
    /// Extra flag passed to rclone as-is (repeatable)
    #[arg(long = "flag", value_name = "FLAG", allow_hyphen_values = true)]
    pub flags: Vec<String>,
}

#[derive(Args, Clone, Debug)]
pub struct DeleteArgs {
    /// Paths or remote:path specs to delete
    #[arg(required = true, num_args = 1..)]
    pub paths: Vec<String>,
    /// Treat the paths as directories and purge them with their contents
    #[arg(long)]
    pub dir: bool,
}

#[derive(Args, Clone, Debug)]
pub struct MkdirArgs {
    /// Directory path or remote:path spec
    pub path: String,
}
