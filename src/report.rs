// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Tier listing of a repository.

use crate::{
    clock::Clock,
    schedule::Schedule,
    snapshot::{whole_seconds, SnapshotSet, StateMask},
};

use chrono::TimeZone;
use std::{
    fmt::{Display, Write},
    time::Duration,
};

/// Options of tier listing.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListOptions {
    /// Maximum number of snapshots in oldest tier, zero for unbounded.
    pub max_keep: usize,

    /// Include tier index, distance, state, and name of each snapshot.
    pub verbose: bool,

    /// Include snapshots of every state, not just complete ones.
    pub show_all: bool,
}

/// Render snapshots grouped by tier, oldest tier first.
///
/// Each tier opens with a header stating how far back it reaches, followed by
/// how many snapshots it holds versus how many it aims to hold.
pub fn render<Tz>(
    snapshots: &SnapshotSet,
    schedule: &Schedule,
    options: ListOptions,
    clock: &dyn Clock,
    tz: &Tz,
) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut out = String::new();
    let Some(oldest) = schedule.len().checked_sub(2) else {
        return out;
    };

    let include = if options.show_all {
        StateMask::ANY
    } else {
        StateMask::COMPLETE
    };
    let snapshots = snapshots.filter(include, StateMask::NONE);
    let now = whole_seconds(clock.now());

    for index in (0..=oldest).rev() {
        let tier = snapshots.tier(schedule, index, now);
        let tier = tier.iter().collect::<Vec<_>>();

        // INVARIANT: Writing into a string cannot fail.
        let _ = if index == oldest {
            match options.max_keep {
                0 => writeln!(out, "### From past, {}/∞", tier.len()),
                max_keep => writeln!(out, "### From past, {}/{max_keep}", tier.len()),
            }
        } else {
            writeln!(
                out,
                "### From {} ago, {}/{}",
                compound(schedule.offset(index + 1)),
                tier.len(),
                schedule.goal(index).unwrap_or_default()
            )
        };

        let span = compound(schedule.span(index));
        for (position, snapshot) in tier.iter().enumerate() {
            let start = snapshot
                .start()
                .with_timezone(tz)
                .format("%Y-%m-%d %A %H:%M:%S");
            let duration = snapshot
                .end()
                .filter(|end| *end > snapshot.start())
                .and_then(|end| (end - snapshot.start()).to_std().ok())
                .unwrap_or_default();
            let distance = tier
                .get(position + 1)
                .and_then(|next| (next.start() - snapshot.start()).to_std().ok())
                .unwrap_or_default();

            let _ = if options.verbose {
                writeln!(
                    out,
                    "{index} {start} ({}, {span}/{}, {}) \"{}\"",
                    compound(duration),
                    compound(distance),
                    snapshot.state(),
                    snapshot.name()
                )
            } else {
                writeln!(out, "{start} ({}, {span})", compound(duration))
            };
        }
    }

    out
}

/// Format duration in hours, minutes, and seconds, e.g. `1h0m5s`.
pub fn compound(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, secs / 60 % 60, secs % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
