// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Long running snapshot pipeline.
//!
//! # Tasks
//!
//! The pipeline is made of a handful of tasks talking through channels:
//!
//! ```text
//!              last good                     trigger
//! pacing gate <----------- creation cycle <------------ pacing gate
//!                               |
//!                               | obsolete              check space
//!                               v                          |
//!                        purge consumer        free space fallback
//! ```
//!
//! 1. The __pacing gate__ holds back the next snapshot until the first tier
//!    duration passed since the start of the last good one.
//! 2. The __creation cycle__ runs the copy, then sieves the repository.
//! 3. The __purge consumer__ deletes whatever the sieve marked obsolete.
//! 4. The __free space fallback__ only runs when purging is suppressed. It
//!    deletes obsolete snapshots, oldest first, while free space is short.
//!
//! The dispatcher itself waits for shutdown requests, or a fatal error from
//! any task.

mod shutdown;

pub use shutdown::{Shutdown, SignalListener};

use crate::{
    clock::Clock,
    config::Settings,
    copy::{CopyError, CopySupervisor},
    lock::{LockError, PidLock},
    prune::Pruner,
    repository::{Repository, RepositoryError},
    schedule::Schedule,
    snapshot::{Complete, Retired, StateMask, TransitionError},
    space::{check_free_space, SpaceProbe, StatvfsProbe},
};

use nix::sys::signal::Signal;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::JoinHandle,
};
use tracing::{debug, error, info, instrument, warn};

/// Grace period before the first snapshot of a run.
pub const INITIAL_WAIT: Duration = Duration::from_secs(30);

/// Pause after a failed copy before trying again.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// How a run of the pipeline came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Stopped during initial wait, before touching the repository.
    EarlyExit,

    /// Stopped right away, interrupting any running copy.
    Immediate(Signal),

    /// Stopped after the current creation cycle finished.
    Graceful,
}

/// Snapshot pipeline over a single repository.
pub struct Pipeline {
    repo: Repository,
    settings: Settings,
    schedule: Schedule,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn SpaceProbe>,
    no_wait: bool,
}

impl Pipeline {
    /// Construct new pipeline.
    ///
    /// Runs [`INITIAL_WAIT`] before the first snapshot, and queries free space
    /// through `statvfs(3)`.
    pub fn new(
        repo: Repository,
        settings: Settings,
        schedule: Schedule,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            settings,
            schedule,
            clock,
            probe: Arc::new(StatvfsProbe),
            no_wait: false,
        }
    }

    /// Skip initial wait.
    pub fn no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    /// Use custom free space probe.
    pub fn with_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Run pipeline until a shutdown signal arrives.
    ///
    /// # Errors
    ///
    /// - Return [`PipelineError::Signal`] if signal handlers cannot be
    ///   registered.
    /// - Return [`PipelineError`] if any task fails fatally.
    pub async fn run(self) -> Result<RunOutcome> {
        let mut listener = SignalListener::new().map_err(PipelineError::Signal)?;
        let (tx, rx) = mpsc::channel(1);
        let forward = tokio::spawn(async move {
            loop {
                let request = listener.recv().await;
                debug!("got shutdown request {request:?}");
                if tx.send(request).await.is_err() {
                    return;
                }
            }
        });

        let outcome = self.run_with(rx).await;
        forward.abort();
        outcome
    }

    /// Run pipeline until a shutdown request arrives on `requests`.
    ///
    /// # Errors
    ///
    /// - Return [`PipelineError::Lock`] if repository is claimed already.
    /// - Return [`PipelineError`] if any task fails fatally.
    #[instrument(skip(self, requests), level = "debug")]
    pub async fn run_with(self, mut requests: mpsc::Receiver<Shutdown>) -> Result<RunOutcome> {
        if !self.no_wait {
            info!("waiting {INITIAL_WAIT:?} before making snapshots");
            tokio::select! {
                _ = tokio::time::sleep(INITIAL_WAIT) => {}
                signal = next_immediate(&mut requests) => {
                    info!("early exit on {signal}");
                    return Ok(RunOutcome::EarlyExit);
                }
            }
        }

        self.repo.init()?;
        let lock = PidLock::acquire(self.repo.root())?;
        if let Err(error) = self.settings.save(&self.repo) {
            warn!("{error}");
        }

        let clock = self.clock.as_ref();
        let last_good = self.repo.last_good(clock)?;
        if let Some(last_good) = &last_good {
            debug!("last good snapshot from disk: {last_good}");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(Shutdown::Running);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (last_good_tx, last_good_rx) = mpsc::channel(1);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (space_tx, space_rx) = mpsc::channel(1);

        let gate = tokio::spawn(pace(
            self.schedule.tiers().first().copied().unwrap_or_default(),
            self.clock.clone(),
            last_good_rx,
            trigger_tx,
            shutdown_rx.clone(),
        ));
        let _ = last_good_tx.send(last_good.clone()).await;

        // INVARIANT: Leftovers of previous runs are deleted before anything new.
        for snapshot in self.repo.find_dangling(clock)? {
            let _ = queue_tx.send(snapshot);
        }

        let copy = CopySupervisor::new(
            self.repo.clone(),
            self.settings.rsync_path.clone(),
            self.settings.rsync_opts.clone(),
            self.settings.origin.clone(),
            self.clock.clone(),
        );
        let cycle = CreationCycle {
            copy,
            pruner: Pruner::new(
                self.repo.clone(),
                self.schedule.clone(),
                self.settings.max_keep,
            ),
            clock: self.clock.clone(),
            last_good,
            queue: queue_tx,
            space: self.settings.no_purge.then_some(space_tx),
        };
        let mut creation = tokio::spawn(cycle.run(trigger_rx, last_good_tx, shutdown_rx.clone()));
        debug!("started snapshot creation task");

        let mut purge = tokio::spawn(purge_obsolete(
            self.repo.clone(),
            self.settings.no_purge,
            queue_rx,
        ));
        debug!("started purge task");

        let reclaim = self.settings.no_purge.then(|| {
            debug!("started free space task");
            tokio::spawn(reclaim_space(
                self.repo.clone(),
                self.clock.clone(),
                self.probe.clone(),
                self.settings.min_perc_space,
                self.settings.min_gib_space,
                space_rx,
            ))
        });

        let outcome = self
            .dispatch(&mut requests, &shutdown_tx, &mut creation, &mut purge)
            .await;

        gate.abort();
        purge.abort();
        if let Some(reclaim) = reclaim {
            reclaim.abort();
        }

        let outcome = outcome?;
        if let Err(error) = lock.release() {
            warn!("{error}");
        }

        Ok(outcome)
    }

    async fn dispatch(
        &self,
        requests: &mut mpsc::Receiver<Shutdown>,
        shutdown: &watch::Sender<Shutdown>,
        creation: &mut JoinHandle<Result<()>>,
        purge: &mut JoinHandle<Result<()>>,
    ) -> Result<RunOutcome> {
        let mut purge_done = false;
        loop {
            tokio::select! {
                request = next_request(requests) => match request {
                    Shutdown::Immediate(signal) => {
                        info!("immediate exit on {signal}");
                        shutdown.send_replace(request);
                        creation.await??;
                        return Ok(RunOutcome::Immediate(signal));
                    }
                    Shutdown::Graceful => {
                        info!("graceful exit");
                        shutdown.send_replace(request);
                        return finish_gracefully(requests, shutdown, creation).await;
                    }
                    Shutdown::Running => continue,
                },
                result = &mut *creation => {
                    result??;
                    warn!("snapshot creation stopped without shutdown request");
                    return Ok(RunOutcome::Graceful);
                }
                result = &mut *purge, if !purge_done => {
                    result??;
                    purge_done = true;
                }
            }
        }
    }
}

struct CreationCycle {
    copy: CopySupervisor,
    pruner: Pruner,
    clock: Arc<dyn Clock>,
    last_good: Option<Complete>,
    queue: UnboundedSender<Retired>,
    space: Option<mpsc::Sender<()>>,
}

impl CreationCycle {
    async fn run(
        mut self,
        mut trigger: mpsc::Receiver<()>,
        last_good_tx: mpsc::Sender<Option<Complete>>,
        mut shutdown: watch::Receiver<Shutdown>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                received = trigger.recv() => if received.is_none() {
                    return Ok(());
                },
                _ = stopped(&mut shutdown) => {
                    debug!("exit snapshot creation task");
                    return Ok(());
                }
            }

            match self.copy.create_snapshot(self.last_good.as_ref(), &mut shutdown).await {
                Ok(complete) => self.last_good = Some(complete),
                Err(CopyError::Killed { signal }) => {
                    info!("snapshot creation stopped by {signal}");
                    return Ok(());
                }
                Err(error) if error.is_fatal() => return Err(error.into()),
                Err(error) => {
                    error!("snapshot creation failed, the partial transfer will be reused: {error}");
                    pause(RETRY_DELAY, &mut shutdown).await;
                }
            }

            debug!("pruning");
            let pruner = self.pruner.clone();
            let clock = self.clock.clone();
            let queue = self.queue.clone();
            let marked =
                tokio::task::spawn_blocking(move || pruner.prune(clock.as_ref(), &queue)).await??;
            debug!("marked {marked} snapshots obsolete");

            if let Some(space) = &self.space {
                debug!("checking space constraints");
                let _ = space.try_send(());
            }

            if !shutdown.borrow().is_running() {
                debug!("exit snapshot creation task after finished cycle");
                return Ok(());
            }

            if last_good_tx.send(self.last_good.clone()).await.is_err() {
                return Ok(());
            }
        }
    }
}

async fn pace(
    period: Duration,
    clock: Arc<dyn Clock>,
    mut last_good: mpsc::Receiver<Option<Complete>>,
    trigger: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<Shutdown>,
) {
    while let Some(snapshot) = last_good.recv().await {
        if let Some(snapshot) = snapshot {
            let gap = (clock.now() - snapshot.start()).to_std().unwrap_or_default();
            let wait = period.saturating_sub(gap);
            if !wait.is_zero() {
                info!("wait {wait:?} before next snapshot");
                if !pause(wait, &mut shutdown).await {
                    return;
                }
            }
        }

        if trigger.send(()).await.is_err() {
            return;
        }
    }
}

async fn purge_obsolete(
    repo: Repository,
    no_purge: bool,
    mut queue: UnboundedReceiver<Retired>,
) -> Result<()> {
    while let Some(snapshot) = queue.recv().await {
        if no_purge {
            debug!("keeping {snapshot} until space runs short");
            continue;
        }

        let repo = repo.clone();
        tokio::task::spawn_blocking(move || repo.purge(snapshot)).await??;
    }

    Ok(())
}

async fn reclaim_space(
    repo: Repository,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn SpaceProbe>,
    min_perc: f64,
    min_gib: u64,
    mut check: mpsc::Receiver<()>,
) -> Result<()> {
    while check.recv().await.is_some() {
        let repo = repo.clone();
        let clock = clock.clone();
        let probe = probe.clone();
        tokio::task::spawn_blocking(move || {
            free_space(&repo, clock.as_ref(), probe.as_ref(), min_perc, min_gib)
        })
        .await??;
    }

    Ok(())
}

/// Purge obsolete snapshots, oldest first, until free space suffices.
pub(crate) fn free_space(
    repo: &Repository,
    clock: &dyn Clock,
    probe: &dyn SpaceProbe,
    min_perc: f64,
    min_gib: u64,
) -> Result<(), RepositoryError> {
    let mut tried = HashSet::new();
    while !check_free_space(probe, repo.root(), min_perc, min_gib) {
        let snapshots = match repo.scan(clock) {
            Ok(snapshots) => snapshots,
            Err(error) => {
                warn!("cannot free space: {error}");
                return Ok(());
            }
        };

        if snapshots.len() < 2 {
            info!("less than 2 snapshots found, not freeing space");
            return Ok(());
        }

        let Some(oldest) = snapshots
            .filter(StateMask::OBSOLETE, StateMask::NONE)
            .retired()
            .into_iter()
            .find(|snapshot| !tried.contains(&snapshot.start()))
        else {
            warn!("free space is short, but no obsolete snapshots are left");
            return Ok(());
        };

        info!("free space is short, purging {oldest}");
        tried.insert(oldest.start());
        repo.purge(oldest)?;
    }

    Ok(())
}

/// Wait for the current creation cycle, still honoring immediate requests.
async fn finish_gracefully(
    requests: &mut mpsc::Receiver<Shutdown>,
    shutdown: &watch::Sender<Shutdown>,
    creation: &mut JoinHandle<Result<()>>,
) -> Result<RunOutcome> {
    let mut outcome = RunOutcome::Graceful;
    loop {
        tokio::select! {
            result = &mut *creation => {
                result??;
                return Ok(outcome);
            }
            request = next_request(requests), if outcome == RunOutcome::Graceful => {
                if let Shutdown::Immediate(signal) = request {
                    info!("immediate exit on {signal}");
                    shutdown.send_replace(request);
                    outcome = RunOutcome::Immediate(signal);
                }
            }
        }
    }
}

async fn next_request(requests: &mut mpsc::Receiver<Shutdown>) -> Shutdown {
    match requests.recv().await {
        Some(request) => request,
        None => std::future::pending().await,
    }
}

async fn next_immediate(requests: &mut mpsc::Receiver<Shutdown>) -> Signal {
    loop {
        if let Shutdown::Immediate(signal) = next_request(requests).await {
            return signal;
        }
    }
}

async fn stopped(shutdown: &mut watch::Receiver<Shutdown>) {
    let _ = shutdown.wait_for(|state| !state.is_running()).await;
}

/// Sleep for `duration`, returning false if shutdown was requested first.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<Shutdown>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = stopped(shutdown) => false,
    }
}

/// Pipeline error types.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Signal handlers could not be registered.
    #[error("cannot listen for signals")]
    Signal(#[source] std::io::Error),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Copy(#[from] CopyError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Pipeline task panicked or was cancelled.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// Friendly result alias :3
type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::SkewClock,
        snapshot::{Snapshot, State},
        space::{SpaceUsage, GIB},
    };
    use pretty_assertions::assert_eq;
    use std::{path::Path, sync::Mutex};

    /// Reports free space growing with every deleted snapshot.
    struct ShrinkingRepository {
        repo: Repository,
        free_per_missing: u64,
        total: usize,
        queries: Mutex<usize>,
    }

    impl SpaceProbe for ShrinkingRepository {
        fn usage(&self, _: &Path) -> nix::Result<SpaceUsage> {
            *self.queries.lock().unwrap() += 1;
            let left = std::fs::read_dir(self.repo.data_dir()).unwrap().count();
            Ok(SpaceUsage {
                size: 100 * GIB,
                free: (self.total - left) as u64 * self.free_per_missing,
            })
        }
    }

    fn mock_repository(names: &[&str]) -> anyhow::Result<(tempfile::TempDir, Repository)> {
        let root = tempfile::tempdir()?;
        let repo = Repository::new(root.path());
        repo.init()?;
        for name in names {
            std::fs::create_dir(repo.path_of(name))?;
        }

        Ok((root, repo))
    }

    #[test]
    fn free_space_leaves_purging_snapshots_alone() -> anyhow::Result<()> {
        let (_root, repo) = mock_repository(&[
            "1400337531-1400337532-purging",
            "1400337611-1400337612-complete",
            "1400337651-1400337652-obsolete",
            "1400337691-1400337692-complete",
        ])?;
        let probe = ShrinkingRepository {
            repo: repo.clone(),
            free_per_missing: GIB,
            total: 4,
            queries: Mutex::new(0),
        };
        let clock = SkewClock::starting_at(1400337722);

        free_space(&repo, &clock, &probe, 0.0, 1)?;

        assert!(repo.path_of("1400337531-1400337532-purging").exists());
        assert!(!repo.path_of("1400337651-1400337652-obsolete").exists());
        assert!(!repo.path_of("1400337651-1400337652-purging").exists());

        Ok(())
    }

    #[test]
    fn free_space_purges_oldest_obsolete_first() -> anyhow::Result<()> {
        let (_root, repo) = mock_repository(&[
            "1400337531-1400337532-obsolete",
            "1400337611-1400337612-complete",
            "1400337651-1400337652-obsolete",
            "1400337671-1400337672-obsolete",
            "1400337691-1400337692-complete",
        ])?;
        let probe = ShrinkingRepository {
            repo: repo.clone(),
            free_per_missing: GIB,
            total: 5,
            queries: Mutex::new(0),
        };
        let clock = SkewClock::starting_at(1400337722);

        free_space(&repo, &clock, &probe, 0.0, 2)?;

        let left = repo
            .scan(&clock)?
            .iter()
            .map(|snapshot| (snapshot.start().timestamp(), snapshot.state()))
            .collect::<Vec<_>>();
        assert_eq!(
            left,
            [
                (1400337611, State::Complete),
                (1400337671, State::Obsolete),
                (1400337691, State::Complete),
            ]
        );

        Ok(())
    }

    #[test]
    fn free_space_stops_without_candidates() -> anyhow::Result<()> {
        let (_root, repo) = mock_repository(&[
            "1400337611-1400337612-complete",
            "1400337691-1400337692-complete",
        ])?;
        let probe = ShrinkingRepository {
            repo: repo.clone(),
            free_per_missing: GIB,
            total: 2,
            queries: Mutex::new(0),
        };
        let clock = SkewClock::starting_at(1400337722);

        free_space(&repo, &clock, &probe, 0.0, 1)?;
        assert_eq!(repo.scan(&clock)?.len(), 2);
        assert_eq!(*probe.queries.lock().unwrap(), 1);

        Ok(())
    }

    #[tokio::test]
    async fn early_exit_leaves_repository_untouched() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let repo = Repository::new(root.path().join("repo"));
        let pipeline = Pipeline::new(
            repo.clone(),
            Settings::default(),
            Schedule::new([Duration::from_secs(10), Duration::from_secs(100)]),
            Arc::new(SkewClock::starting_at(1400337722)),
        );

        let (tx, rx) = mpsc::channel(1);
        tx.send(Shutdown::Immediate(Signal::SIGINT)).await?;
        assert_eq!(pipeline.run_with(rx).await?, RunOutcome::EarlyExit);
        assert!(!repo.root().exists());

        Ok(())
    }

    #[tokio::test]
    async fn pace_waits_for_first_tier() -> anyhow::Result<()> {
        let clock: Arc<dyn Clock> = Arc::new(SkewClock::starting_at(1400337722));
        let (last_good_tx, last_good_rx) = mpsc::channel(1);
        let (trigger_tx, mut trigger_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(Shutdown::Running);
        let gate = tokio::spawn(pace(
            Duration::from_secs(3600),
            clock,
            last_good_rx,
            trigger_tx,
            shutdown_rx,
        ));

        last_good_tx.send(None).await?;
        assert_eq!(trigger_rx.recv().await, Some(()));

        let Snapshot::Complete(recent) = Snapshot::from_name("1400337700-1400337701-complete")?
        else {
            panic!("expected complete snapshot");
        };
        last_good_tx.send(Some(recent)).await?;
        let triggered =
            tokio::time::timeout(Duration::from_millis(200), trigger_rx.recv()).await;
        assert!(triggered.is_err());

        gate.abort();
        Ok(())
    }
}
