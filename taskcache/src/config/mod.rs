//! Configuration for the `taskcache` binary.
//!
//! Each setting is taken from the first layer that provides it:
//! command-line flag, `TASKCACHE_*` environment variable, the TOML file at
//! `<config dir>/taskcache/config.toml`, then the built-in value.
//!
//! The TOML file is optional unless named with `--config`.

use std::path::{Path, PathBuf};

use taskcache_proto::task::MAX_TASK_TITLE_LENGTH;

use crate::lists::DEFAULT_LISTS;
use crate::sync::SyncOptions;

/// Why a configuration could not be built.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The TOML file exists (or was named explicitly) but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    ReadFile {
        /// File that was read.
        path: PathBuf,
        /// I/O failure.
        source: std::io::Error,
    },

    /// The TOML file is not valid for [`ConfigFile`].
    #[error("invalid taskcache config: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// On-disk layout. Every key is optional.
// ---------------------------------------------------------------------------

/// `config.toml` as written by the user.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    storage: StorageFileConfig,
    remote: RemoteFileConfig,
    tasks: TasksFileConfig,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    dir: Option<PathBuf>,
}

/// `[remote]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RemoteFileConfig {
    dir: Option<PathBuf>,
    offline: Option<bool>,
}

/// `[tasks]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TasksFileConfig {
    max_title_len: Option<usize>,
    default_lists: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// Effective settings
// ---------------------------------------------------------------------------

/// Settings after every layer has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Directory holding the persisted task cache.
    pub storage_dir: PathBuf,
    /// Directory holding the loopback server's data.
    pub remote_dir: PathBuf,
    /// Run without a server; every call fails as offline.
    pub offline: bool,
    /// Maximum task title length in characters.
    pub max_title_len: usize,
    /// Lists that always exist.
    pub default_lists: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("taskcache");
        Self {
            storage_dir: base.join("cache"),
            remote_dir: base.join("remote"),
            offline: false,
            max_title_len: MAX_TASK_TITLE_LENGTH,
            default_lists: DEFAULT_LISTS.iter().map(ToString::to_string).collect(),
        }
    }
}

impl CacheConfig {
    /// Reads the TOML file (if any) and layers `cli` over it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a present or `--config` file cannot be
    /// read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = read_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Flag (or env var), then file, then built-in value.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let builtin = Self::default();

        Self {
            storage_dir: cli
                .storage_dir
                .clone()
                .or_else(|| file.storage.dir.clone())
                .unwrap_or(builtin.storage_dir),
            remote_dir: cli
                .remote_dir
                .clone()
                .or_else(|| file.remote.dir.clone())
                .unwrap_or(builtin.remote_dir),
            offline: cli.offline || file.remote.offline.unwrap_or(builtin.offline),
            max_title_len: file
                .tasks
                .max_title_len
                .unwrap_or(builtin.max_title_len),
            default_lists: file
                .tasks
                .default_lists
                .clone()
                .filter(|lists| !lists.is_empty())
                .unwrap_or(builtin.default_lists),
        }
    }

    /// Synchronizer tunables derived from this configuration.
    #[must_use]
    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            max_title_len: self.max_title_len,
            default_lists: self.default_lists.clone(),
        }
    }
}

/// Global flags and the command to run.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Offline-first task list with server reconciliation")]
pub struct CliArgs {
    /// TOML config file to use instead of the per-user one.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory holding the persisted task cache.
    #[arg(long, env = "TASKCACHE_STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,

    /// Directory holding the local server's data.
    #[arg(long, env = "TASKCACHE_REMOTE_DIR")]
    pub remote_dir: Option<PathBuf>,

    /// Work without a server.
    #[arg(long)]
    pub offline: bool,

    /// `tracing` filter directive, e.g. `info` or `taskcache=debug`.
    #[arg(long, default_value = "warn", env = "TASKCACHE_LOG")]
    pub log_level: String,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// What to do. Defaults to `list`.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Task commands.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show tasks.
    List {
        /// Only this list.
        #[arg(long)]
        list: Option<String>,
    },
    /// Add a task.
    Add {
        /// Task title.
        title: String,
        /// Target list (default: the first configured list).
        #[arg(long)]
        list: Option<String>,
    },
    /// Flip a task's completion flag.
    Toggle {
        /// Task id.
        id: String,
    },
    /// Move a task to another list.
    Move {
        /// Task id.
        id: String,
        /// Destination list.
        list: String,
    },
    /// Rename a task.
    Rename {
        /// Task id.
        id: String,
        /// New title.
        title: String,
    },
    /// Replace a task's notes.
    Notes {
        /// Task id.
        id: String,
        /// New notes.
        text: String,
    },
    /// Delete a task.
    Delete {
        /// Task id.
        id: String,
    },
    /// Edit a task's checklist.
    #[command(subcommand)]
    Subtask(SubtaskCommand),
    /// Show known lists.
    Lists,
    /// Send creates for tasks added while offline.
    Sync,
}

/// Checklist commands.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum SubtaskCommand {
    /// Append a subtask.
    Add {
        /// Parent task id.
        task: String,
        /// Subtask title.
        title: String,
    },
    /// Flip a subtask's completion flag.
    Toggle {
        /// Parent task id.
        task: String,
        /// Subtask id.
        subtask: String,
    },
    /// Remove a subtask.
    Remove {
        /// Parent task id.
        task: String,
        /// Subtask id.
        subtask: String,
    },
}

/// Per-user config file location, if the platform has a config dir.
fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("taskcache").join("config.toml"))
}

/// Parses `explicit` or, without one, the per-user file.
///
/// Only the per-user file may be absent; it then reads as empty.
fn read_config_file(explicit: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => match user_config_path() {
            Some(path) => (path, false),
            None => return Ok(ConfigFile::default()),
        },
    };
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(source) if !required && source.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file, using built-in settings");
            return Ok(ConfigFile::default());
        }
        Err(source) => return Err(ConfigError::ReadFile { path, source }),
    };
    Ok(toml::from_str(&text)?)
}
