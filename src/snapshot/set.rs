// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Ordered collections of snapshots.
//!
//! A [`SnapshotSet`] is always derived from a fresh listing of the data
//! directory. It is never cached, and never written back. Filtering produces
//! new sets, leaving the original untouched.

use crate::{
    schedule::Schedule,
    snapshot::{Complete, Incomplete, Retired, Snapshot, State, Timestamp},
};

use chrono::{DateTime, TimeDelta, Utc};
use std::{ops::BitOr, time::Duration};

/// Bit mask over snapshot states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMask(u8);

impl StateMask {
    pub const NONE: Self = Self(0);
    pub const INCOMPLETE: Self = Self(1);
    pub const COMPLETE: Self = Self(1 << 1);
    pub const OBSOLETE: Self = Self(1 << 2);
    pub const PURGING: Self = Self(1 << 3);
    pub const ANY: Self = Self(0b1111);

    /// Check if mask covers given state.
    pub fn contains(self, state: State) -> bool {
        self.0 & Self::from(state).0 != 0
    }
}

impl From<State> for StateMask {
    fn from(state: State) -> Self {
        match state {
            State::Incomplete => Self::INCOMPLETE,
            State::Complete => Self::COMPLETE,
            State::Obsolete => Self::OBSOLETE,
            State::Purging => Self::PURGING,
        }
    }
}

impl BitOr for StateMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Snapshots ordered by start time, oldest first.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SnapshotSet {
    snapshots: Vec<Snapshot>,
}

impl SnapshotSet {
    /// Construct new set, sorting snapshots by start time.
    pub fn new(snapshots: impl IntoIterator<Item = Snapshot>) -> Self {
        let mut snapshots = snapshots.into_iter().collect::<Vec<_>>();
        snapshots.sort_by_key(Snapshot::start);
        Self { snapshots }
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.iter()
    }

    /// Keep snapshots whose state is in `include` but not in `exclude`.
    pub fn filter(&self, include: StateMask, exclude: StateMask) -> Self {
        self.retain(|snapshot| {
            include.contains(snapshot.state()) && !exclude.contains(snapshot.state())
        })
    }

    /// Keep snapshots that started strictly between `after` and `before`.
    pub fn period(&self, after: Timestamp, before: Timestamp) -> Self {
        self.retain(|snapshot| snapshot.start() > after && snapshot.start() < before)
    }

    /// Keep snapshots that fall into tier `index` of `schedule`.
    ///
    /// # Panics
    ///
    /// - Will panic if `index` is the last tier of the schedule or beyond.
    pub fn tier(&self, schedule: &Schedule, index: usize, now: Timestamp) -> Self {
        self.period(
            ago(now, schedule.offset(index + 1)),
            ago(now, schedule.offset(index)),
        )
    }

    /// Youngest snapshot of set.
    pub fn last(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    /// Youngest complete snapshot of set.
    pub fn last_good(&self) -> Option<&Complete> {
        self.snapshots.iter().rev().find_map(|snapshot| match snapshot {
            Snapshot::Complete(complete) => Some(complete),
            _ => None,
        })
    }

    /// Youngest incomplete snapshot of set.
    pub fn last_incomplete(&self) -> Option<&Incomplete> {
        self.snapshots.iter().rev().find_map(|snapshot| match snapshot {
            Snapshot::Incomplete(incomplete) => Some(incomplete),
            _ => None,
        })
    }

    /// All complete snapshots, oldest first.
    pub fn completes(&self) -> Vec<Complete> {
        self.snapshots
            .iter()
            .filter_map(|snapshot| match snapshot {
                Snapshot::Complete(complete) => Some(complete.clone()),
                _ => None,
            })
            .collect()
    }

    /// All snapshots waiting for deletion, oldest first.
    pub fn retired(&self) -> Vec<Retired> {
        self.snapshots
            .iter()
            .filter_map(|snapshot| match snapshot {
                Snapshot::Obsolete(obsolete) => Some(Retired::from(obsolete.clone())),
                Snapshot::Purging(purging) => Some(Retired::from(purging.clone())),
                _ => None,
            })
            .collect()
    }

    fn retain(&self, keep: impl Fn(&Snapshot) -> bool) -> Self {
        Self {
            snapshots: self.snapshots.iter().filter(|&snapshot| keep(snapshot)).cloned().collect(),
        }
    }
}

impl IntoIterator for SnapshotSet {
    type Item = Snapshot;
    type IntoIter = std::vec::IntoIter<Snapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.snapshots.into_iter()
    }
}

impl<'set> IntoIterator for &'set SnapshotSet {
    type Item = &'set Snapshot;
    type IntoIter = std::slice::Iter<'set, Snapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.snapshots.iter()
    }
}

fn ago(now: Timestamp, duration: Duration) -> Timestamp {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{LONG, SECOND};
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    fn snapshots() -> SnapshotSet {
        SnapshotSet::new(
            [
                "1400337721-0-incomplete",
                "1400337531-1400337532-complete",
                "1400337611-1400337612-complete",
                "1400337651-1400337652-purging",
                "1400337671-1400337672-complete",
                "1400337691-1400337692-complete",
                "1400337706-1400337707-complete",
                "1400337711-1400337712-obsolete",
                "1400337716-1400337717-complete",
            ]
            .into_iter()
            .map(|name| Snapshot::from_name(name).unwrap()),
        )
    }

    fn names(set: &SnapshotSet) -> Vec<String> {
        set.iter().map(ToString::to_string).collect()
    }

    #[test_case(StateMask::PURGING, StateMask::NONE, &["1400337651-1400337652 Purging"]; "purging only")]
    #[test_case(
        StateMask::PURGING | StateMask::OBSOLETE,
        StateMask::NONE,
        &["1400337651-1400337652 Purging", "1400337711-1400337712 Obsolete"];
        "purging or obsolete"
    )]
    #[test_case(
        StateMask::ANY,
        StateMask::COMPLETE,
        &[
            "1400337651-1400337652 Purging",
            "1400337711-1400337712 Obsolete",
            "1400337721-0 Incomplete",
        ];
        "anything but complete"
    )]
    #[test]
    fn snapshot_set_filter(include: StateMask, exclude: StateMask, expect: &[&str]) {
        pretty_assertions::assert_eq!(names(&snapshots().filter(include, exclude)), expect);
    }

    #[test]
    fn snapshot_set_sorted_by_start() {
        let set = snapshots();
        let starts = set.iter().map(Snapshot::start).collect::<Vec<_>>();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn snapshot_set_last_good_skips_incomplete() {
        let set = snapshots();
        assert_eq!(
            set.last().map(ToString::to_string),
            Some("1400337721-0 Incomplete".into())
        );
        assert_eq!(
            set.last_good().map(ToString::to_string),
            Some("1400337716-1400337717 Complete".into())
        );
        assert_eq!(
            set.last_incomplete().map(Incomplete::name),
            Some("1400337721-0-incomplete".into())
        );
    }

    #[test]
    fn snapshot_set_period_is_exclusive() {
        let set = snapshots();
        let after = DateTime::from_timestamp(1400337611, 0).unwrap();
        let before = DateTime::from_timestamp(1400337691, 0).unwrap();
        assert_eq!(
            names(&set.period(after, before)),
            ["1400337651-1400337652 Purging", "1400337671-1400337672 Complete"]
        );
    }

    #[test]
    fn snapshot_set_tier() {
        let schedule = Schedule::new([SECOND * 5, SECOND * 20, SECOND * 40, SECOND * 80, LONG]);
        let now = DateTime::from_timestamp(1400337722, 0).unwrap();
        let set = snapshots().filter(StateMask::COMPLETE, StateMask::NONE);

        assert_eq!(
            names(&set.tier(&schedule, 0, now)),
            ["1400337706-1400337707 Complete", "1400337716-1400337717 Complete"]
        );
        assert_eq!(
            names(&set.tier(&schedule, 3, now)),
            ["1400337531-1400337532 Complete"]
        );
    }

    #[test]
    fn snapshot_set_retired() {
        let retired = snapshots()
            .retired()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        assert_eq!(
            retired,
            ["1400337651-1400337652 Purging", "1400337711-1400337712 Obsolete"]
        );
    }
}
