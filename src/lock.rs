// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Single instance lock through a PID file.

use std::{
    fs::OpenOptions,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Name of lock file inside repository.
pub const PID_FILE: &str = ".pid";

/// Exclusive claim on a repository.
///
/// Holds a file containing the PID of the owning process. The file is created
/// atomically, and removed again when the lock is released or dropped.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
    released: bool,
}

impl PidLock {
    /// Claim repository at `root`.
    ///
    /// # Errors
    ///
    /// - Return [`LockError::Held`] if lock file already exists.
    /// - Return [`LockError::Write`] if lock file cannot be written.
    pub fn acquire(root: impl AsRef<Path>) -> Result<Self> {
        let path = root.as_ref().join(PID_FILE);
        let pid = std::process::id();
        debug!("write pid {pid} to pid file {}", path.display());

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(error) if error.kind() == ErrorKind::AlreadyExists => {
                return Err(LockError::Held { path });
            }
            Err(source) => return Err(LockError::Write { path, source }),
        };

        let lock = Self {
            path,
            released: false,
        };
        file.write_all(pid.to_string().as_bytes())
            .map_err(|source| LockError::Write {
                path: lock.path.clone(),
                source,
            })?;

        Ok(lock)
    }

    /// Path of lock file.
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// Release lock, removing lock file.
    ///
    /// # Errors
    ///
    /// - Return [`LockError::Remove`] if lock file cannot be removed.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        debug!("delete pid file {}", self.path.display());
        std::fs::remove_file(&self.path).map_err(|source| LockError::Remove {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        if let Err(error) = std::fs::remove_file(&self.path) {
            warn!("could not remove pid file {}: {error}", self.path.display());
        }
    }
}

/// PID lock error types.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another instance claimed the repository.
    #[error("pid file {path:?} already exists, is snapkeep running already?")]
    Held { path: PathBuf },

    /// Lock file could not be created.
    #[error("could not write pid file {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Lock file could not be removed.
    #[error("could not remove pid file {path:?}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Friendly result alias :3
type Result<T, E = LockError> = std::result::Result<T, E>;
