// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Snapshot repository on disk.
//!
//! # Repository Layout
//!
//! ```text
//! <repository>/
//! ├── .pid                  lock file of the running instance
//! ├── .snapkeep.settings    settings of the last run
//! └── .data/
//!     ├── 1400337531-1400337532-complete/
//!     ├── 1400337711-1400337712-obsolete/
//!     └── 1400337721-0-incomplete/
//! ```
//!
//! There is no index of any kind. The data directory listing _is_ the state of
//! the repository, so every query performs a fresh scan.

use crate::{
    clock::Clock,
    snapshot::{Complete, Incomplete, Retired, Snapshot, SnapshotSet, TransitionError},
};

use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// Name of subdirectory holding snapshots.
pub const DATA_SUBDIR: &str = ".data";

/// Snapshot repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    /// Construct new repository handle.
    ///
    /// Nothing is checked or created on disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Top-level directory of repository.
    pub fn root(&self) -> &Path {
        self.root.as_path()
    }

    /// Directory holding the snapshots.
    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_SUBDIR)
    }

    /// Full path of snapshot directory with given name.
    pub fn path_of(&self, name: impl AsRef<str>) -> PathBuf {
        self.data_dir().join(name.as_ref())
    }

    /// Create data directory if missing.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError::Init`] if directory cannot be created.
    pub fn init(&self) -> Result<()> {
        let data_dir = self.data_dir();
        debug!("create repository data directory {}", data_dir.display());
        std::fs::create_dir_all(&data_dir).map_err(|source| RepositoryError::Init {
            path: data_dir,
            source,
        })
    }

    /// List all snapshots of repository.
    ///
    /// Entries that are not directories are ignored. Directories whose name
    /// cannot be parsed, or whose start time lies in the future of `clock`, are
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError::NotInitialized`] if data directory cannot be
    ///   listed.
    pub fn scan(&self, clock: &dyn Clock) -> Result<SnapshotSet> {
        let data_dir = self.data_dir();
        let entries = std::fs::read_dir(&data_dir).map_err(|source| {
            RepositoryError::NotInitialized {
                path: data_dir.clone(),
                source,
            }
        })?;

        let now = clock.now();
        let mut snapshots = Vec::new();
        for entry in entries.flatten() {
            if !entry.file_type().is_ok_and(|kind| kind.is_dir()) {
                continue;
            }

            let name = entry.file_name();
            let name = name.to_string_lossy();
            let snapshot = match Snapshot::from_name(&name) {
                Ok(snapshot) => snapshot,
                Err(error) => {
                    warn!("{error}");
                    continue;
                }
            };

            if snapshot.start() > now {
                warn!("ignoring snapshot with start time in future: {name}");
                continue;
            }

            snapshots.push(snapshot);
        }

        Ok(SnapshotSet::new(snapshots))
    }

    /// Youngest complete snapshot, used as base for the next one.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError::NotInitialized`] if data directory cannot be
    ///   listed.
    pub fn last_good(&self, clock: &dyn Clock) -> Result<Option<Complete>> {
        let last_good = self.scan(clock)?.last_good().cloned();
        if last_good.is_none() {
            info!("could not find suitable base snapshot");
        }

        Ok(last_good)
    }

    /// Youngest incomplete snapshot, left over by an interrupted copy.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError::NotInitialized`] if data directory cannot be
    ///   listed.
    pub fn last_incomplete(&self, clock: &dyn Clock) -> Result<Option<Incomplete>> {
        Ok(self.scan(clock)?.last_incomplete().cloned())
    }

    /// Snapshots left obsolete or half-purged by a previous run.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError::NotInitialized`] if data directory cannot be
    ///   listed.
    pub fn find_dangling(&self, clock: &dyn Clock) -> Result<Vec<Retired>> {
        let dangling = self.scan(clock)?.retired();
        for snapshot in &dangling {
            debug!("found dangling snapshot: {snapshot}");
        }

        Ok(dangling)
    }

    /// Delete retired snapshot from disk.
    ///
    /// Marks the snapshot as purging first, such that a crash in the middle of
    /// deletion leaves a recognizable directory behind. Failure to delete is
    /// only logged, the directory will be picked up again by the next run.
    ///
    /// # Errors
    ///
    /// - Return [`RepositoryError::Transition`] if snapshot cannot be marked as
    ///   purging.
    #[instrument(skip(self, snapshot), level = "debug")]
    pub fn purge(&self, snapshot: Retired) -> Result<()> {
        let purging = match snapshot {
            Retired::Obsolete(obsolete) => obsolete.purging(self)?,
            Retired::Purging(purging) => purging,
        };

        let name = purging.name();
        info!("purging {name}");
        match std::fs::remove_dir_all(self.path_of(&name)) {
            Ok(()) => info!("finished purging {name}"),
            Err(error) => warn!("error when purging {name:?} (ignored): {error}"),
        }

        Ok(())
    }

    pub(crate) fn rename(&self, from: &str, to: &str) -> Result<(), TransitionError> {
        if from == to {
            return Ok(());
        }

        let from = self.path_of(from);
        let to = self.path_of(to);
        debug!("rename snapshot {} -> {}", from.display(), to.display());
        std::fs::rename(&from, &to).map_err(|source| TransitionError::Rename { from, to, source })
    }
}

/// Repository error types.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Data directory cannot be listed.
    #[error("repository {path:?} does not exist")]
    NotInitialized {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Data directory cannot be created.
    #[error("cannot create repository {path:?}")]
    Init {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Snapshot state transition failed.
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Friendly result alias :3
type Result<T, E = RepositoryError> = std::result::Result<T, E>;
