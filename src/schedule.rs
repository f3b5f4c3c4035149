// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Retention schedules.
//!
//! A __schedule__ is an ordered list of tier durations. The duration of a
//! tier is the distance that snapshots inside that tier are kept apart, while
//! the duration of the _next_ tier is how long the tier itself lasts. Thus a
//! schedule `[1h, 1d, 1w, long]` keeps hourly snapshots for one day, daily
//! snapshots for one week, and weekly snapshots forever.
//!
//! # External Schedules
//!
//! Schedules can be supplied through a file mapping schedule names to a list
//! of tiers. Each tier is a small table of unit to count pairs that are summed
//! together:
//!
//! ```json
//! {
//!     "custom": [ { "h": 6 }, { "d": 1, "h": 12 }, { "w": 2 }, { "l": 1 } ]
//! }
//! ```
//!
//! The `l` (or `long`) unit makes the tier last effectively forever and stops
//! accumulating the rest of the tier. Unknown units are ignored.

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, instrument};

pub const SECOND: Duration = Duration::from_secs(1);
pub const MINUTE: Duration = Duration::from_secs(60);
pub const HOUR: Duration = Duration::from_secs(60 * 60);
pub const DAY: Duration = Duration::from_secs(24 * 60 * 60);
pub const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const MONTH: Duration = Duration::from_secs(4 * 7 * 24 * 60 * 60);
pub const YEAR: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Duration standing in for "forever" in the last tier of a schedule.
pub const LONG: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Default location of the external schedule file.
pub const DEFAULT_SCHEDULE_FILE: &str = "/etc/snapkeep.schedules";

/// Ordered list of tier durations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    tiers: Vec<Duration>,
}

impl Schedule {
    /// Construct new schedule from tier durations.
    pub fn new(tiers: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            tiers: tiers.into_iter().collect(),
        }
    }

    /// Tier durations in order.
    pub fn tiers(&self) -> &[Duration] {
        &self.tiers
    }

    /// Number of tiers.
    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    /// Check if schedule has no tiers at all.
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Duration of tier `index`, i.e., the snapshot distance inside of it.
    pub fn span(&self, index: usize) -> Duration {
        self.tiers[index]
    }

    /// How long ago tier `index` starts, relative to now.
    ///
    /// # Panics
    ///
    /// - Will panic if `index` is out of bounds.
    pub fn offset(&self, index: usize) -> Duration {
        self.tiers[1..=index]
            .iter()
            .fold(Duration::ZERO, |acc, tier| acc.saturating_add(*tier))
    }

    /// Target number of snapshots kept in tier `index`.
    ///
    /// Returns `None` for the last tier, which lasts forever and thus has no
    /// meaningful goal.
    pub fn goal(&self, index: usize) -> Option<u64> {
        let next = self.tiers.get(index + 1)?;
        let span = self.tiers[index].as_secs().max(1);
        Some(next.as_secs() / span)
    }
}

impl Display for Schedule {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let tiers = self
            .tiers
            .iter()
            .map(|tier| humanize(*tier))
            .collect::<Vec<_>>();
        write!(fmt, "[{}]", tiers.join(" "))
    }
}

/// Render duration in the largest whole unit that fits, e.g., "6h" or "4w".
pub fn humanize(duration: Duration) -> String {
    const UNITS: [(Duration, &str); 8] = [
        (LONG, "long"),
        (YEAR, "y"),
        (MONTH, "M"),
        (WEEK, "w"),
        (DAY, "d"),
        (HOUR, "h"),
        (MINUTE, "m"),
        (SECOND, "s"),
    ];

    let secs = duration.as_secs();
    if secs == 0 {
        return "0s".into();
    }

    for (unit, suffix) in UNITS {
        let unit = unit.as_secs();
        if suffix == "long" {
            if secs == unit {
                return suffix.into();
            }
            continue;
        }

        if secs % unit == 0 {
            return format!("{}{suffix}", secs / unit);
        }
    }

    format!("{secs}s")
}

/// Input format of external schedule sources.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleFormat {
    #[default]
    Json,
    Toml,
}

impl ScheduleFormat {
    /// Pick format by file extension, falling back to JSON.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        match path.as_ref().extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::Toml,
            _ => Self::Json,
        }
    }
}

type RawTier = BTreeMap<String, u64>;

/// Named collection of schedules.
///
/// Starts out with the built-in schedules, and can be extended with external
/// schedules. Entries are merged by name such that later loads win.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRegistry {
    schedules: BTreeMap<String, Schedule>,
}

impl Default for ScheduleRegistry {
    fn default() -> Self {
        let mut schedules = BTreeMap::new();
        schedules.insert(
            "longterm".into(),
            Schedule::new([HOUR * 6, DAY, WEEK, MONTH, LONG]),
        );
        schedules.insert(
            "shortterm".into(),
            Schedule::new([MINUTE * 10, HOUR * 2, DAY, WEEK, MONTH, LONG]),
        );

        Self { schedules }
    }
}

impl ScheduleRegistry {
    /// Construct registry with built-in schedules only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookup schedule by name.
    pub fn get(&self, name: impl AsRef<str>) -> Option<&Schedule> {
        self.schedules.get(name.as_ref())
    }

    /// Lookup schedule by name, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// - Return [`ScheduleError::Unknown`] if no schedule has that name.
    pub fn require(&self, name: impl AsRef<str>) -> Result<&Schedule> {
        self.get(name.as_ref())
            .ok_or_else(|| ScheduleError::Unknown(name.as_ref().into()))
    }

    /// Add or replace a schedule.
    pub fn insert(&mut self, name: impl Into<String>, schedule: Schedule) {
        self.schedules.insert(name.into(), schedule);
    }

    /// Names of all schedules in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.schedules.keys().map(String::as_str)
    }

    /// Listing of name to schedule pairs in sorted order.
    pub fn list(&self) -> impl Iterator<Item = (&str, &Schedule)> {
        self.schedules
            .iter()
            .map(|(name, schedule)| (name.as_str(), schedule))
    }

    /// Merge schedules parsed from `source` into registry.
    ///
    /// # Errors
    ///
    /// - Return [`ScheduleError::Json`] or [`ScheduleError::Toml`] if the
    ///   source cannot be parsed.
    pub fn merge_from_str(&mut self, source: &str, format: ScheduleFormat) -> Result<()> {
        let raw: BTreeMap<String, Vec<RawTier>> = match format {
            ScheduleFormat::Json => serde_json::from_str(source)?,
            ScheduleFormat::Toml => toml::from_str(source)?,
        };

        for (name, tiers) in raw {
            let schedule = Schedule::new(tiers.iter().map(tier_duration));
            debug!("load schedule {name}: {schedule}");
            self.insert(name, schedule);
        }

        Ok(())
    }

    /// Merge schedules from external file into registry.
    ///
    /// A missing file at [`DEFAULT_SCHEDULE_FILE`] is silently accepted.
    ///
    /// # Errors
    ///
    /// - Return [`ScheduleError::Read`] if file cannot be read.
    /// - Return [`ScheduleError::Json`] or [`ScheduleError::Toml`] if file
    ///   cannot be parsed.
    #[instrument(skip(self, path), level = "debug")]
    pub fn load_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if path == Path::new(DEFAULT_SCHEDULE_FILE) && !path.exists() {
            debug!("no schedule file at default location {}", path.display());
            return Ok(());
        }

        let source = std::fs::read_to_string(path).map_err(|source| ScheduleError::Read {
            path: path.into(),
            source,
        })?;
        self.merge_from_str(&source, ScheduleFormat::from_path(path))
    }
}

impl Display for ScheduleRegistry {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for (name, schedule) in self.list() {
            writeln!(fmt, "{name}: {schedule}")?;
        }

        Ok(())
    }
}

fn tier_duration(tier: &RawTier) -> Duration {
    let mut duration = Duration::ZERO;
    for (unit, count) in tier {
        let unit = match unit.as_str() {
            "s" | "second" => SECOND,
            "m" | "minute" => MINUTE,
            "h" | "hour" => HOUR,
            "d" | "day" => DAY,
            "w" | "week" => WEEK,
            "M" | "month" => MONTH,
            "y" | "year" => YEAR,
            // INVARIANT: Forever swallows whatever else the tier specifies.
            "l" | "long" => return LONG,
            _ => continue,
        };
        let count = u32::try_from(*count).unwrap_or(u32::MAX);
        duration = duration.saturating_add(unit.saturating_mul(count));
    }

    duration
}

/// Schedule error types.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    /// No schedule registered under given name.
    #[error("no such schedule: {0}")]
    Unknown(String),

    /// Schedule file could not be read.
    #[error("cannot read schedule file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Schedule source is not valid JSON.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Schedule source is not valid TOML.
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

/// Friendly result alias :3
type Result<T, E = ScheduleError> = std::result::Result<T, E>;
