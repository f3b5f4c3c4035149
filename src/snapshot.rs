// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Snapshot representation and state machine.
//!
//! A __snapshot__ is one directory below the data directory of a repository.
//! The state of a snapshot is encoded directly into the name of its
//! directory:
//!
//! ```text
//! {start}-{end}-{state}
//! ```
//!
//! Where `start` and `end` are unix timestamps in seconds, and `state` is one
//! of "incomplete", "complete", "obsolete", or "purging". The end time is
//! always `0` for incomplete snapshots. Thus, the repository can always be
//! reconstructed by simply listing the data directory, no matter how the
//! previous run ended.
//!
//! # State Machine
//!
//! ```text
//! Incomplete ──► Complete ──► Obsolete ──► Purging ──► (deleted)
//!   │    ▲
//!   └────┘ restart
//! ```
//!
//! Every state has its own type, and every transition consumes the old state
//! and hands back the new one after renaming the directory on disk. Invalid
//! transitions simply do not exist.

pub mod set;

pub use set::{SnapshotSet, StateMask};

use crate::{clock::Clock, repository::Repository};

use chrono::{DateTime, Utc};
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    num::ParseIntError,
    path::PathBuf,
};

/// Point in time with whole second precision.
pub type Timestamp = DateTime<Utc>;

/// Possible states of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Copy in progress, or interrupted.
    Incomplete,

    /// Copy finished successfully.
    Complete,

    /// Retired by retention policy, awaiting deletion.
    Obsolete,

    /// Deletion in progress.
    Purging,
}

impl State {
    /// Tag used for state in directory names.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::Complete => "complete",
            Self::Obsolete => "obsolete",
            Self::Purging => "purging",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "incomplete" => Some(Self::Incomplete),
            "complete" => Some(Self::Complete),
            "obsolete" => Some(Self::Obsolete),
            "purging" => Some(Self::Purging),
            _ => None,
        }
    }
}

impl Display for State {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(match self {
            Self::Incomplete => "Incomplete",
            Self::Complete => "Complete",
            Self::Obsolete => "Obsolete",
            Self::Purging => "Purging",
        })
    }
}

/// Snapshot whose copy has not finished yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Incomplete {
    start: Timestamp,
}

/// Snapshot whose copy finished successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Complete {
    start: Timestamp,
    end: Timestamp,
}

/// Snapshot retired by retention policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Obsolete {
    start: Timestamp,
    end: Timestamp,
}

/// Snapshot whose directory is being deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Purging {
    start: Timestamp,
    end: Timestamp,
}

impl Incomplete {
    /// Construct new incomplete snapshot starting now.
    ///
    /// Nothing is written to disk. The copy tool creates the directory.
    pub fn new(clock: &dyn Clock) -> Self {
        Self {
            start: whole_seconds(clock.now()),
        }
    }

    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Directory name of snapshot.
    pub fn name(&self) -> String {
        dir_name(self.start, None, State::Incomplete)
    }

    /// Finish snapshot.
    ///
    /// Stamps the end time, making sure that the snapshot lasts at least one
    /// second.
    ///
    /// # Errors
    ///
    /// - Return [`TransitionError::EndBeforeStart`] if clock went backwards.
    /// - Return [`TransitionError::Rename`] if directory cannot be renamed.
    pub fn complete(self, repo: &Repository, clock: &dyn Clock) -> Result<Complete> {
        let now = whole_seconds(clock.now());
        if now < self.start {
            return Err(TransitionError::EndBeforeStart {
                name: self.name(),
                end: now.timestamp(),
            });
        }

        let end = if now == self.start {
            now + chrono::TimeDelta::seconds(1)
        } else {
            now
        };
        let next = Complete {
            start: self.start,
            end,
        };
        repo.rename(&self.name(), &next.name())?;

        Ok(next)
    }

    /// Reuse snapshot for another copy attempt.
    ///
    /// Refreshes the start time so that partially transferred data of an
    /// interrupted run can be picked up by the copy tool again.
    ///
    /// # Errors
    ///
    /// - Return [`TransitionError::Rename`] if directory cannot be renamed.
    pub fn restart(self, repo: &Repository, clock: &dyn Clock) -> Result<Incomplete> {
        let next = Incomplete {
            start: whole_seconds(clock.now()),
        };
        repo.rename(&self.name(), &next.name())?;

        Ok(next)
    }
}

impl Complete {
    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Directory name of snapshot.
    pub fn name(&self) -> String {
        dir_name(self.start, Some(self.end), State::Complete)
    }

    /// Retire snapshot.
    ///
    /// # Errors
    ///
    /// - Return [`TransitionError::Rename`] if directory cannot be renamed.
    pub fn obsolete(self, repo: &Repository) -> Result<Obsolete> {
        let next = Obsolete {
            start: self.start,
            end: self.end,
        };
        repo.rename(&self.name(), &next.name())?;

        Ok(next)
    }
}

impl Obsolete {
    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Directory name of snapshot.
    pub fn name(&self) -> String {
        dir_name(self.start, Some(self.end), State::Obsolete)
    }

    /// Mark snapshot for deletion.
    ///
    /// # Errors
    ///
    /// - Return [`TransitionError::Rename`] if directory cannot be renamed.
    pub fn purging(self, repo: &Repository) -> Result<Purging> {
        let next = Purging {
            start: self.start,
            end: self.end,
        };
        repo.rename(&self.name(), &next.name())?;

        Ok(next)
    }
}

impl Purging {
    pub fn start(&self) -> Timestamp {
        self.start
    }

    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Directory name of snapshot.
    pub fn name(&self) -> String {
        dir_name(self.start, Some(self.end), State::Purging)
    }
}

/// Snapshot in any state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    Incomplete(Incomplete),
    Complete(Complete),
    Obsolete(Obsolete),
    Purging(Purging),
}

impl Snapshot {
    /// Reconstruct snapshot from its directory name.
    ///
    /// # Errors
    ///
    /// - Return [`ParseNameError`] if name does not describe a valid snapshot.
    pub fn from_name(name: &str) -> Result<Self, ParseNameError> {
        let (start, end, state) = parse_name(name)?;
        Ok(match state {
            State::Incomplete => Self::Incomplete(Incomplete { start }),
            State::Complete => Self::Complete(Complete { start, end }),
            State::Obsolete => Self::Obsolete(Obsolete { start, end }),
            State::Purging => Self::Purging(Purging { start, end }),
        })
    }

    pub fn start(&self) -> Timestamp {
        match self {
            Self::Incomplete(snapshot) => snapshot.start,
            Self::Complete(snapshot) => snapshot.start,
            Self::Obsolete(snapshot) => snapshot.start,
            Self::Purging(snapshot) => snapshot.start,
        }
    }

    /// End time, if the copy of the snapshot ever finished.
    pub fn end(&self) -> Option<Timestamp> {
        match self {
            Self::Incomplete(_) => None,
            Self::Complete(snapshot) => Some(snapshot.end),
            Self::Obsolete(snapshot) => Some(snapshot.end),
            Self::Purging(snapshot) => Some(snapshot.end),
        }
    }

    pub fn state(&self) -> State {
        match self {
            Self::Incomplete(_) => State::Incomplete,
            Self::Complete(_) => State::Complete,
            Self::Obsolete(_) => State::Obsolete,
            Self::Purging(_) => State::Purging,
        }
    }

    /// Directory name of snapshot.
    pub fn name(&self) -> String {
        dir_name(self.start(), self.end(), self.state())
    }
}

impl Display for Snapshot {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let end = self.end().map_or(0, |end| end.timestamp());
        write!(fmt, "{}-{end} {}", self.start().timestamp(), self.state())
    }
}

impl From<Complete> for Snapshot {
    fn from(snapshot: Complete) -> Self {
        Self::Complete(snapshot)
    }
}

impl Display for Complete {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        Snapshot::from(self.clone()).fmt(fmt)
    }
}

/// Snapshot waiting for deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retired {
    Obsolete(Obsolete),
    Purging(Purging),
}

impl Retired {
    pub fn start(&self) -> Timestamp {
        match self {
            Self::Obsolete(snapshot) => snapshot.start,
            Self::Purging(snapshot) => snapshot.start,
        }
    }

    /// Directory name of snapshot.
    pub fn name(&self) -> String {
        match self {
            Self::Obsolete(snapshot) => snapshot.name(),
            Self::Purging(snapshot) => snapshot.name(),
        }
    }
}

impl From<Obsolete> for Retired {
    fn from(snapshot: Obsolete) -> Self {
        Self::Obsolete(snapshot)
    }
}

impl From<Purging> for Retired {
    fn from(snapshot: Purging) -> Self {
        Self::Purging(snapshot)
    }
}

impl From<Retired> for Snapshot {
    fn from(snapshot: Retired) -> Self {
        match snapshot {
            Retired::Obsolete(snapshot) => Self::Obsolete(snapshot),
            Retired::Purging(snapshot) => Self::Purging(snapshot),
        }
    }
}

impl Display for Retired {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        Snapshot::from(self.clone()).fmt(fmt)
    }
}

/// Split snapshot directory name into start time, end time, and state.
///
/// # Errors
///
/// - Return [`ParseNameError::Malformed`] if name does not have three fields.
/// - Return [`ParseNameError::Timestamp`] if a timestamp is not an integer.
/// - Return [`ParseNameError::NonCanonical`] if a timestamp carries a sign
///   or leading zeros.
/// - Return [`ParseNameError::OutOfRange`] if a timestamp cannot be
///   represented.
/// - Return [`ParseNameError::UnknownState`] if state tag is not recognized.
/// - Return [`ParseNameError::IncompleteWithEnd`] if an incomplete snapshot
///   claims to have an end time.
pub fn parse_name(name: &str) -> Result<(Timestamp, Timestamp, State), ParseNameError> {
    let fields = name.split('-').collect::<Vec<_>>();
    let [start, end, tag] = fields.as_slice() else {
        return Err(ParseNameError::Malformed(name.into()));
    };

    let start = parse_timestamp(name, start)?;
    let end = parse_timestamp(name, end)?;
    let state = State::from_tag(tag).ok_or_else(|| ParseNameError::UnknownState(name.into()))?;

    if state == State::Incomplete && end.timestamp() != 0 {
        return Err(ParseNameError::IncompleteWithEnd(name.into()));
    }

    Ok((start, end, state))
}

fn parse_timestamp(name: &str, field: &str) -> Result<Timestamp, ParseNameError> {
    let secs = field
        .parse::<i64>()
        .map_err(|source| ParseNameError::Timestamp {
            name: name.into(),
            source,
        })?;
    if secs.to_string() != field {
        return Err(ParseNameError::NonCanonical(name.into()));
    }
    DateTime::from_timestamp(secs, 0).ok_or_else(|| ParseNameError::OutOfRange(name.into()))
}

fn dir_name(start: Timestamp, end: Option<Timestamp>, state: State) -> String {
    let end = end.map_or(0, |end| end.timestamp());
    format!("{}-{end}-{}", start.timestamp(), state.tag())
}

/// Drop everything below one second.
pub(crate) fn whole_seconds(time: Timestamp) -> Timestamp {
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or(time)
}

/// Snapshot name parsing error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseNameError {
    #[error("malformed snapshot name: {0}")]
    Malformed(String),

    #[error("invalid timestamp in snapshot name {name}")]
    Timestamp {
        name: String,
        #[source]
        source: ParseIntError,
    },

    #[error("timestamp out of range in snapshot name {0}")]
    OutOfRange(String),

    /// Timestamp would be renamed to a different spelling than on disk.
    #[error("non-canonical timestamp in snapshot name {0}")]
    NonCanonical(String),

    #[error("could not parse state: {0}")]
    UnknownState(String),

    #[error("incomplete state but non-zero end time: {0}")]
    IncompleteWithEnd(String),
}

/// State transition error types.
///
/// A failed transition leaves the repository in a state that the retention
/// logic cannot account for. Callers treat these as fatal.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    /// Snapshot directory cannot be renamed.
    #[error("cannot rename snapshot {from:?} to {to:?}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Clock reports a time before the start of the snapshot.
    #[error("end time {end} of snapshot {name} before its start time")]
    EndBeforeStart { name: String, end: i64 },
}

/// Friendly result alias :3
type Result<T, E = TransitionError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SkewClock;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::time::Duration;

    fn at(secs: i64) -> Timestamp {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test_case("1400337531-1400337532-complete", 1400337531, 1400337532, State::Complete; "complete")]
    #[test_case("1400337651-1400337652-purging", 1400337651, 1400337652, State::Purging; "purging")]
    #[test_case("1400337721-1400337722-obsolete", 1400337721, 1400337722, State::Obsolete; "obsolete")]
    #[test_case("1400534523-0-incomplete", 1400534523, 0, State::Incomplete; "incomplete")]
    #[test]
    fn parse_name_accepts(name: &str, start: i64, end: i64, state: State) {
        pretty_assertions::assert_eq!(parse_name(name), Ok((at(start), at(end), state)));
    }

    #[test_case("1400337531-1400337532-completeXXX"; "unknown state")]
    #[test_case("-1400337652-purging"; "missing start")]
    #[test_case("1400337721-1400337722-incomplete"; "incomplete with end")]
    #[test_case("1400337721.0-1400337722-incomplete"; "fractional start")]
    #[test_case("1400337721-complete"; "too few fields")]
    #[test_case("1400337721-1400337722-complete-extra"; "too many fields")]
    #[test_case("+1400337721-1400337722-complete"; "explicit sign")]
    #[test_case("01400337721-1400337722-complete"; "leading zero start")]
    #[test_case("1400337721-001400337722-obsolete"; "leading zero end")]
    #[test]
    fn parse_name_rejects(name: &str) {
        assert!(parse_name(name).is_err());
    }

    #[test]
    fn snapshot_name_round_trip() -> anyhow::Result<()> {
        for name in [
            "1400337531-1400337532-complete",
            "1400337531-1400337532-obsolete",
            "1400337531-1400337532-purging",
            "1400337531-0-incomplete",
        ] {
            assert_eq!(Snapshot::from_name(name)?.name(), name);
        }

        Ok(())
    }

    #[test]
    fn snapshot_display() -> anyhow::Result<()> {
        let snapshot = Snapshot::from_name("1400268377-1400268387-complete")?;
        assert_eq!(snapshot.to_string(), "1400268377-1400268387 Complete");
        Ok(())
    }

    #[test]
    fn snapshot_walks_through_lifecycle() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let repo = Repository::new(root.path());
        repo.init()?;
        let mut clock = SkewClock::starting_at(1400337722);

        let incomplete = Incomplete::new(&clock);
        std::fs::create_dir(repo.path_of(incomplete.name()))?;
        assert_eq!(incomplete.name(), "1400337722-0-incomplete");

        clock.advance(Duration::from_secs(10));
        let incomplete = incomplete.restart(&repo, &clock)?;
        assert_eq!(incomplete.name(), "1400337732-0-incomplete");
        assert!(repo.path_of("1400337732-0-incomplete").is_dir());

        clock.advance(Duration::from_secs(5));
        let complete = incomplete.complete(&repo, &clock)?;
        assert_eq!(complete.name(), "1400337732-1400337737-complete");

        let obsolete = complete.obsolete(&repo)?;
        assert_eq!(obsolete.name(), "1400337732-1400337737-obsolete");

        let purging = obsolete.purging(&repo)?;
        assert_eq!(purging.name(), "1400337732-1400337737-purging");
        assert!(repo.path_of(purging.name()).is_dir());

        Ok(())
    }

    #[test]
    fn snapshot_lasts_at_least_one_second() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let repo = Repository::new(root.path());
        repo.init()?;
        let clock = SkewClock::starting_at(1400337722);

        let incomplete = Incomplete::new(&clock);
        std::fs::create_dir(repo.path_of(incomplete.name()))?;
        let complete = incomplete.complete(&repo, &clock)?;
        assert_eq!(complete.end() - complete.start(), chrono::TimeDelta::seconds(1));

        Ok(())
    }

    #[test]
    fn snapshot_end_before_start_fails() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let repo = Repository::new(root.path());
        repo.init()?;
        let mut clock = SkewClock::starting_at(1400337722);

        let incomplete = Incomplete::new(&clock);
        std::fs::create_dir(repo.path_of(incomplete.name()))?;
        clock.rewind(Duration::from_secs(60));
        let result = incomplete.complete(&repo, &clock);
        assert!(matches!(result, Err(TransitionError::EndBeforeStart { .. })));

        Ok(())
    }

    #[test]
    fn snapshot_rename_of_missing_directory_fails() {
        let root = tempfile::tempdir().unwrap();
        let repo = Repository::new(root.path());
        let snapshot = Complete {
            start: at(1400337531),
            end: at(1400337532),
        };
        let result = snapshot.obsolete(&repo);
        assert!(matches!(result, Err(TransitionError::Rename { .. })));
    }
}
