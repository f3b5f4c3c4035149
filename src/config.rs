// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Settings of a run are persisted into the repository they were used on, so
//! later inspection of the repository can interpret it with the same schedule
//! and limits that shaped it.

use crate::{
    repository::Repository,
    schedule::{ScheduleRegistry, DEFAULT_SCHEDULE_FILE},
};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::PathBuf,
    str::FromStr,
};
use tracing::debug;

/// Name of settings file inside repository.
pub const SETTINGS_FILE: &str = ".snapkeep.settings";

/// Default location of the `rsync` binary.
pub const DEFAULT_RSYNC_PATH: &str = "/usr/bin/rsync";

/// Settings of snapshot creation and retention.
///
/// # General Layout
///
/// ```toml
/// rsync_path = "/usr/bin/rsync"
/// rsync_opts = ["--one-file-system"]
/// origin = "$HOME/"
/// schedule = "longterm"
/// max_keep = 10
/// no_purge = false
/// sched_file = "/etc/snapkeep.schedules"
/// min_perc_space = 0.0
/// min_gib_space = 0
/// ```
///
/// Every field is optional. Path-like fields undergo shell expansion.
#[derive(Debug, PartialEq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Path to `rsync` binary.
    pub rsync_path: PathBuf,

    /// Extra options passed to `rsync`.
    pub rsync_opts: Vec<String>,

    /// Source of snapshots, in any form `rsync` accepts.
    pub origin: String,

    /// Name of retention schedule.
    pub schedule: String,

    /// Maximum number of snapshots in oldest tier, zero for unbounded.
    pub max_keep: usize,

    /// Keep obsolete snapshots until free space runs low.
    pub no_purge: bool,

    /// Additional schedule definitions.
    pub sched_file: PathBuf,

    /// Minimum free space in percent of filesystem size.
    pub min_perc_space: f64,

    /// Minimum free space in gibibytes.
    pub min_gib_space: u64,
}

impl Settings {
    /// Check settings against available schedules.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::UnknownSchedule`] if schedule is not registered.
    /// - Return [`ConfigError::UnusableSchedule`] if schedule has fewer than
    ///   two tiers or a zero-length first tier.
    pub fn validate(&self, registry: &ScheduleRegistry) -> Result<()> {
        let schedule = registry
            .get(&self.schedule)
            .ok_or_else(|| ConfigError::UnknownSchedule(self.schedule.clone()))?;

        match schedule.tiers() {
            [first, _, ..] if !first.is_zero() => Ok(()),
            _ => Err(ConfigError::UnusableSchedule(self.schedule.clone())),
        }
    }

    /// Read settings persisted in repository.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if settings file cannot be read.
    /// - Return [`ConfigError::Deserialize`] if settings file is malformed.
    pub fn load(repo: &Repository) -> Result<Self> {
        let path = settings_path(repo);
        debug!("read settings from {}", path.display());
        std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Read { path, source })?
            .parse()
    }

    /// Persist settings in repository.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Serialize`] if settings cannot be serialized.
    /// - Return [`ConfigError::Write`] if settings file cannot be written.
    pub fn save(&self, repo: &Repository) -> Result<()> {
        let path = settings_path(repo);
        debug!("write settings to {}", path.display());
        let data = toml::ser::to_string_pretty(self)?;
        std::fs::write(&path, data).map_err(|source| ConfigError::Write { path, source })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rsync_path: DEFAULT_RSYNC_PATH.into(),
            rsync_opts: Vec::new(),
            origin: "/tmp/snapkeep_test/".into(),
            schedule: "longterm".into(),
            max_keep: 0,
            no_purge: false,
            sched_file: DEFAULT_SCHEDULE_FILE.into(),
            min_perc_space: 0.0,
            min_gib_space: 0,
        }
    }
}

impl FromStr for Settings {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut settings: Settings = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on path-like fields.
        settings.origin = expand(&settings.origin)?;
        settings.rsync_path = expand(&settings.rsync_path.to_string_lossy())?.into();
        settings.sched_file = expand(&settings.sched_file.to_string_lossy())?.into();

        Ok(settings)
    }
}

impl Display for Settings {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand(data: &str) -> Result<String> {
    Ok(shellexpand::full(data)
        .map_err(ConfigError::ShellExpansion)?
        .into_owned())
}

fn settings_path(repo: &Repository) -> PathBuf {
    repo.root().join(SETTINGS_FILE)
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Schedule name is not registered.
    #[error("no such schedule: {0}")]
    UnknownSchedule(String),

    /// Schedule cannot pace snapshot creation.
    #[error("schedule {0} needs at least two tiers and a non-zero first tier")]
    UnusableSchedule(String),

    /// Failed to read settings file.
    #[error("cannot read settings file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write settings file.
    #[error("cannot write settings file {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
