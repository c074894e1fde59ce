use directories::{BaseDirs, ProjectDirs};
use eyre::{bail, eyre, Context, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

static CONFIG_DIR_OVERRIDE: Lazy<RwLock<Option<PathBuf>>> = Lazy::new(|| RwLock::new(None));

pub const CONFIG_FILE_NAME: &str = "ferry.toml";
pub const DEFAULT_PARALLELISM: usize = 6;
pub const DEFAULT_TERMINATE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_TRANSCRIPT_RETENTION: usize = 5;

const TOOL_PATH_ENV: &str = "RCLONE_PATH";
const TOOL_CONFIG_ENV: &str = "RCLONE_CONFIG";

/// Override the configuration directory for the current process.
/// Subsequent calls replace the previous override.
pub fn set_config_dir<P: AsRef<Path>>(path: P) {
    *CONFIG_DIR_OVERRIDE.write() = Some(path.as_ref().to_path_buf());
}

/// Clear any previously configured override.
pub fn clear_config_dir_override() {
    CONFIG_DIR_OVERRIDE.write().take();
}

/// Return the current override path, if one has been set.
pub fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE.read().clone()
}

/// Resolve the configuration directory.
/// Priority: explicit override -> platform standard -> ~/.config/ferry
pub fn config_dir() -> Result<PathBuf> {
    if let Some(path) = CONFIG_DIR_OVERRIDE.read().clone() {
        return Ok(path);
    }

    if let Some(proj) = ProjectDirs::from("com", "Ferry", "Ferry") {
        return Ok(proj.config_dir().to_path_buf());
    }

    if let Some(base) = BaseDirs::new() {
        return Ok(base.home_dir().join(".config").join("ferry"));
    }

    Err(eyre!(
        "unable to determine configuration directory for ferry (no override and no platform default)"
    ))
}

/// Flag spellings of the wrapped tool. These belong to the tool's CLI surface,
/// so they are configuration rather than engine constants.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ToolFlags {
    /// Points the tool at its own config file.
    pub config: String,
    /// Enables periodic stats blocks; takes the interval as its value.
    pub stats: String,
    /// Extra arguments that make stats blocks visible without raising verbosity.
    pub stats_log_level: Vec<String>,
    /// Caps the number of files in flight; takes the parallelism as its value.
    pub transfers: String,
}

impl Default for ToolFlags {
    fn default() -> Self {
        Self {
            config: "--config".into(),
            stats: "--stats".into(),
            stats_log_level: vec!["--stats-log-level".into(), "NOTICE".into()],
            transfers: "--transfers".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Transfer tool executable
    pub tool_path: PathBuf,
    /// Tool configuration file passed through `flags.config`
    pub tool_config: Option<PathBuf>,
    /// Flags prepended to every invocation
    pub extra_flags: Vec<String>,
    /// Files transferred concurrently; also the slot table capacity
    pub parallelism: usize,
    /// Stats block interval, in the tool's duration syntax
    pub stats_interval: String,
    /// Ceiling on graceful termination before a forced kill
    pub terminate_timeout_ms: u64,
    /// Directory for per-job output transcripts (disabled when unset)
    pub transcript_dir: Option<PathBuf>,
    /// Transcripts kept after pruning
    pub transcript_retention: usize,
    pub flags: ToolFlags,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tool_path: PathBuf::from("rclone"),
            tool_config: None,
            extra_flags: Vec::new(),
            parallelism: DEFAULT_PARALLELISM,
            stats_interval: "1s".into(),
            terminate_timeout_ms: DEFAULT_TERMINATE_TIMEOUT_MS,
            transcript_dir: None,
            transcript_retention: DEFAULT_TRANSCRIPT_RETENTION,
            flags: ToolFlags::default(),
        }
    }
}

impl EngineConfig {
    /// Load `ferry.toml` from the configuration directory (defaults when the
    /// file is absent), then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = config_dir()?.join(CONFIG_FILE_NAME);
        let config = if path.exists() {
            Self::load_from(&path)?
        } else {
            log::debug!("no config at {}, using defaults", path.display());
            Self::default()
        };
        let config = config.with_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file: {}", path.display()))?;

        let config: EngineConfig = toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply `RCLONE_PATH` / `RCLONE_CONFIG` through `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(TOOL_PATH_ENV).filter(|v| !v.trim().is_empty()) {
            self.tool_path = PathBuf::from(path);
        }
        if let Some(path) = lookup(TOOL_CONFIG_ENV).filter(|v| !v.trim().is_empty()) {
            self.tool_config = Some(PathBuf::from(path));
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.tool_path.as_os_str().is_empty() {
            bail!("tool_path must not be empty");
        }
        if self.parallelism == 0 {
            bail!("parallelism must be at least 1");
        }
        if self.stats_interval.trim().is_empty() {
            bail!("stats_interval must not be empty");
        }
        Ok(())
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}
