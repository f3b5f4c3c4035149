// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Incremental snapshots with tiered retention.
//!
//! A __repository__ is a plain directory that receives periodic snapshots of
//! some __origin__. Each snapshot is a full directory tree produced by
//! `rsync`, hard linked against the snapshot before it, so unchanged files
//! cost nothing.
//!
//! # Tiered Retention
//!
//! A __schedule__ is a list of durations `[t0, t1, ..., tn]`. Snapshots are
//! taken every `t0`. Tier `i` covers a span of `t(i+1)` going back from where
//! tier `i - 1` ends, and keeps its snapshots spaced at least `ti` apart. The
//! last tier reaches back forever, and can be capped at a maximum number of
//! snapshots. Applied over time, this thins history out the older it gets,
//! much like grandfather-father-son backup rotation.
//!
//! # See Also
//!
//! 1. [rsync(1)](https://download.samba.org/pub/rsync/rsync.1)

pub mod clock;
pub mod config;
pub mod copy;
pub mod lock;
pub mod pipeline;
pub mod prune;
pub mod report;
pub mod repository;
pub mod schedule;
pub mod snapshot;
pub mod space;
