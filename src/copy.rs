// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Supervision of the external copy process.
//!
//! Snapshots are materialized by `rsync`. Unchanged files are hard linked
//! against the previous complete snapshot through `--link-dest`, so every
//! snapshot looks like a full copy while only costing the space of what
//! changed.

use crate::{
    clock::Clock,
    pipeline::Shutdown,
    repository::{Repository, RepositoryError},
    snapshot::{Complete, Incomplete, TransitionError},
};

use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{
    ffi::OsString,
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::Arc,
};
use tokio::{process::Command, sync::watch};
use tracing::{debug, error, info, instrument, warn};

/// Exit code of `rsync` when source files vanished during transfer.
pub const RSYNC_VANISHED: i32 = 24;

/// Runs `rsync` to turn the repository's next snapshot into a complete one.
#[derive(Clone)]
pub struct CopySupervisor {
    repo: Repository,
    rsync_path: PathBuf,
    rsync_opts: Vec<String>,
    origin: String,
    clock: Arc<dyn Clock>,
}

impl CopySupervisor {
    /// Construct new copy supervisor.
    pub fn new(
        repo: Repository,
        rsync_path: impl Into<PathBuf>,
        rsync_opts: impl IntoIterator<Item = impl Into<String>>,
        origin: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            rsync_path: rsync_path.into(),
            rsync_opts: rsync_opts.into_iter().map(Into::into).collect(),
            origin: origin.into(),
            clock,
        }
    }

    /// Argument list of `rsync` copying origin into `destination`.
    pub fn copy_args(&self, base: Option<&Complete>, destination: &Incomplete) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--delete".into(), "-a".into()];
        args.extend(self.rsync_opts.iter().map(OsString::from));
        if let Some(base) = base {
            let mut link_dest = OsString::from("--link-dest=");
            link_dest.push(self.repo.path_of(base.name()));
            args.push(link_dest);
        }
        args.push(self.origin.as_str().into());
        args.push(self.repo.path_of(destination.name()).into());
        args
    }

    /// Create new complete snapshot, using `base` for hard links.
    ///
    /// Reuses the youngest incomplete snapshot left over by an interrupted
    /// copy, if there is one. Otherwise starts a new one. A copy that fails
    /// leaves its snapshot incomplete for the next attempt.
    ///
    /// An immediate shutdown published on `shutdown` while the copy runs is
    /// forwarded to `rsync` as the same signal.
    ///
    /// # Errors
    ///
    /// - Return [`CopyError::Killed`] if copy was stopped by shutdown request.
    /// - Return [`CopyError::Spawn`] if `rsync` could not be started.
    /// - Return [`CopyError::Failed`] if `rsync` exited with an error.
    /// - Return [`CopyError::Repository`] or [`CopyError::Transition`] if the
    ///   snapshot directory could not be located or renamed.
    #[instrument(skip(self, base, shutdown), level = "debug")]
    pub async fn create_snapshot(
        &self,
        base: Option<&Complete>,
        shutdown: &mut watch::Receiver<Shutdown>,
    ) -> Result<Complete> {
        if let Shutdown::Immediate(signal) = *shutdown.borrow_and_update() {
            return Err(CopyError::Killed { signal });
        }

        let clock = self.clock.as_ref();
        let snapshot = match self.repo.last_incomplete(clock)? {
            Some(incomplete) => {
                debug!("reuse incomplete snapshot {}", incomplete.name());
                incomplete.restart(&self.repo, clock)?
            }
            None => Incomplete::new(clock),
        };

        let args = self.copy_args(base, &snapshot);
        debug!("run {} {args:?}", self.rsync_path.display());
        let mut child = Command::new(&self.rsync_path)
            .args(&args)
            .current_dir(self.repo.data_dir())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| CopyError::Spawn {
                program: self.rsync_path.clone(),
                source,
            })?;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status.map_err(|source| CopyError::Spawn {
                    program: self.rsync_path.clone(),
                    source,
                })?,
                changed = shutdown.changed() => {
                    // INVARIANT: Without a publisher the copy runs to completion.
                    if changed.is_err() {
                        break child.wait().await.map_err(|source| CopyError::Spawn {
                            program: self.rsync_path.clone(),
                            source,
                        })?;
                    }

                    let Shutdown::Immediate(signal) = *shutdown.borrow_and_update() else {
                        continue;
                    };

                    debug!("stop rsync with signal {signal}");
                    if let Some(pid) = child.id() {
                        if let Err(error) = kill(Pid::from_raw(pid as i32), signal) {
                            error!("failed to signal rsync: {error}");
                        }
                    }
                    if let Err(error) = child.wait().await {
                        warn!("failed to reap rsync: {error}");
                    }

                    return Err(CopyError::Killed { signal });
                }
            }
        };

        match status.code() {
            Some(0) => {}
            Some(RSYNC_VANISHED) => {
                warn!("some files vanished before they could be copied, going on");
            }
            _ => return Err(CopyError::Failed { status }),
        }

        let complete = snapshot.complete(&self.repo, clock)?;
        info!("snapshot complete: {complete}");

        Ok(complete)
    }
}

/// Copy error types.
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    /// Copy process could not be started or awaited.
    #[error("could not run {program:?}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Copy process exited with an error.
    #[error("rsync failed: {status}")]
    Failed { status: ExitStatus },

    /// Copy process was stopped by request.
    #[error("rsync killed by request with {signal}")]
    Killed { signal: Signal },

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl CopyError {
    /// Check if copy error leaves repository in a state that cannot be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transition(_) | Self::Repository(_))
    }
}

/// Friendly result alias :3
type Result<T, E = CopyError> = std::result::Result<T, E>;
