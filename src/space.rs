// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Free space constraints of the repository filesystem.

use nix::sys::statvfs::statvfs;
use std::path::Path;
use tracing::{debug, warn};

/// Number of bytes in a gibibyte.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Size and free space of a filesystem in bytes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SpaceUsage {
    pub size: u64,
    pub free: u64,
}

/// Query filesystem usage of a path.
pub trait SpaceProbe: Send + Sync {
    /// Report usage of filesystem holding `path`.
    ///
    /// # Errors
    ///
    /// - Return [`nix::Error`] if filesystem cannot be queried.
    fn usage(&self, path: &Path) -> nix::Result<SpaceUsage>;
}

/// Probe backed by `statvfs(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn usage(&self, path: &Path) -> nix::Result<SpaceUsage> {
        let stats = statvfs(path)?;
        let fragment = stats.fragment_size() as u64;
        Ok(SpaceUsage {
            size: fragment.saturating_mul(stats.blocks() as u64),
            free: fragment.saturating_mul(stats.blocks_free() as u64),
        })
    }
}

/// Check that filesystem holding `path` satisfies free space constraints.
///
/// Fails if free space drops below `min_gib` gibibytes, or below `min_perc`
/// percent of the filesystem size. Passes without querying the filesystem if
/// neither constraint is set. A failed query also passes, since reporting
/// a shortage that may not exist would delete snapshots for nothing.
pub fn check_free_space(probe: &dyn SpaceProbe, path: &Path, min_perc: f64, min_gib: u64) -> bool {
    if min_perc <= 0.0 && min_gib == 0 {
        return true;
    }

    debug!("check free space in {}", path.display());
    let usage = match probe.usage(path) {
        Ok(usage) => usage,
        Err(error) => {
            warn!("could not check free space: {error}");
            return true;
        }
    };

    debug!(
        "filesystem has {:.2} GiB, {:.2} GiB of them free",
        usage.size as f64 / GIB as f64,
        usage.free as f64 / GIB as f64
    );

    let free_perc = if usage.size == 0 {
        0.0
    } else {
        100.0 * usage.free as f64 / usage.size as f64
    };

    usage.free / GIB >= min_gib && free_perc >= min_perc
}
