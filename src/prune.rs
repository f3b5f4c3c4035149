// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Tiered retention sieve.
//!
//! Each tier of a schedule keeps snapshots spaced at least one tier duration
//! apart. Whenever the two youngest complete snapshots of a tier sit closer
//! than that, the youngest one is marked obsolete. The oldest tier is
//! additionally capped at a maximum number of snapshots, dropping the oldest
//! one first. After any change the whole schedule is swept again, starting
//! from the oldest tier, until nothing changes anymore.
//!
//! The first tier is never sieved, since it only holds the snapshots that have
//! not aged into the retention scheme yet.

use crate::{
    clock::Clock,
    repository::Repository,
    schedule::Schedule,
    snapshot::{whole_seconds, Complete, Retired, StateMask, TransitionError},
};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument, warn};

/// Retention sieve over a repository.
#[derive(Debug, Clone)]
pub struct Pruner {
    repo: Repository,
    schedule: Schedule,
    max_keep: usize,
}

impl Pruner {
    /// Construct new pruner.
    ///
    /// A `max_keep` of zero keeps an unbounded number of snapshots in the
    /// oldest tier.
    pub fn new(repo: Repository, schedule: Schedule, max_keep: usize) -> Self {
        Self {
            repo,
            schedule,
            max_keep,
        }
    }

    /// Mark snapshots obsolete until the schedule is satisfied.
    ///
    /// Every snapshot marked obsolete is sent to `queue` in the order it was
    /// marked. Returns number of snapshots marked obsolete.
    ///
    /// A repository that cannot be scanned, or holds less than two snapshots,
    /// is left alone.
    ///
    /// # Errors
    ///
    /// - Return [`TransitionError`] if a snapshot cannot be marked obsolete.
    #[instrument(skip(self, clock, queue), level = "debug")]
    pub fn prune(
        &self,
        clock: &dyn Clock,
        queue: &UnboundedSender<Retired>,
    ) -> Result<usize, TransitionError> {
        let mut marked = 0;
        while let Sweep::Changed = self.sweep(clock, queue, &mut marked)? {
            debug!("sieve changed repository, sweeping again");
        }

        Ok(marked)
    }

    fn sweep(
        &self,
        clock: &dyn Clock,
        queue: &UnboundedSender<Retired>,
        marked: &mut usize,
    ) -> Result<Sweep, TransitionError> {
        // INVARIANT: Schedules always end with a forever tier that is never swept.
        let Some(oldest) = self.schedule.len().checked_sub(2) else {
            return Ok(Sweep::Settled);
        };

        for index in (1..=oldest).rev() {
            let snapshots = match self.repo.scan(clock) {
                Ok(snapshots) => snapshots,
                Err(error) => {
                    warn!("cannot prune: {error}");
                    return Ok(Sweep::Abandoned);
                }
            };

            if snapshots.len() < 2 {
                info!("less than 2 snapshots found, not pruning");
                return Ok(Sweep::Abandoned);
            }

            let now = whole_seconds(clock.now());
            let mut interval = snapshots
                .filter(StateMask::COMPLETE, StateMask::OBSOLETE)
                .tier(&self.schedule, index, now)
                .completes();
            if interval.len() <= 2 {
                continue;
            }

            let mut changed = false;
            if index == oldest && self.max_keep != 0 && interval.len() > self.max_keep {
                debug!("{} snapshots in oldest tier", interval.len());
                let snapshot = interval.remove(0);
                info!("mark oldest as obsolete: {snapshot}");
                self.mark_obsolete(snapshot, queue)?;
                *marked += 1;
                changed = true;
            }

            let youngest = interval.len() - 1;
            let distance = interval[youngest].start() - interval[youngest - 1].start();
            if distance.to_std().unwrap_or_default() < self.schedule.span(index) {
                let snapshot = interval.remove(youngest);
                info!("mark as obsolete: {snapshot}");
                self.mark_obsolete(snapshot, queue)?;
                *marked += 1;
                changed = true;
            }

            if changed {
                return Ok(Sweep::Changed);
            }
        }

        Ok(Sweep::Settled)
    }

    fn mark_obsolete(
        &self,
        snapshot: Complete,
        queue: &UnboundedSender<Retired>,
    ) -> Result<(), TransitionError> {
        let obsolete = snapshot.obsolete(&self.repo)?;
        if let Err(error) = queue.send(obsolete.into()) {
            debug!("purge queue closed, leaving {} for next run", error.0);
        }

        Ok(())
    }
}

enum Sweep {
    Changed,
    Settled,
    Abandoned,
}
