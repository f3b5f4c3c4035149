// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Time source abstraction.
//!
//! Everything that depends on the current time reads it through a [`Clock`],
//! never through ambient calls to the system time. This keeps retention
//! decisions reproducible under test, where a [`SkewClock`] can be placed at
//! an arbitrary point in the past and moved forward on demand.

use chrono::{DateTime, TimeDelta, Utc};
use std::time::Duration;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current point in time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock of the host system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Real time shifted into the past by a fixed skew.
///
/// Time keeps passing at its normal rate, but starts from whatever unix time
/// the clock was created with. Use [`SkewClock::advance`] to jump forward.
#[derive(Debug, Clone, Copy)]
pub struct SkewClock {
    skew: TimeDelta,
}

impl SkewClock {
    /// Construct new clock whose current time is `unix_secs`.
    pub fn starting_at(unix_secs: i64) -> Self {
        let start = DateTime::from_timestamp(unix_secs, 0).unwrap_or(DateTime::UNIX_EPOCH);
        Self {
            skew: Utc::now() - start,
        }
    }

    /// Move the clock forward.
    pub fn advance(&mut self, by: Duration) {
        self.skew -= TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
    }

    /// Move the clock backward.
    pub fn rewind(&mut self, by: Duration) {
        self.skew += TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
    }
}

impl Clock for SkewClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() - self.skew
    }
}
