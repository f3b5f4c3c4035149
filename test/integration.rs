// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::RepoFixture;

use anyhow::Result;
use indoc::indoc;
use nix::sys::signal::Signal;
use pretty_assertions::assert_eq;
use snapkeep::{
    config::Settings,
    lock::PID_FILE,
    pipeline::{PipelineError, RunOutcome, Shutdown},
    snapshot::State,
    space::{SpaceProbe, SpaceUsage, GIB},
};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;

async fn request_after(
    delay: Duration,
    request: Shutdown,
) -> Result<(mpsc::Receiver<Shutdown>, tokio::task::JoinHandle<()>)> {
    requests_at(vec![(delay, request)]).await
}

/// Send each request once its delay, counted from now, has passed.
async fn requests_at(
    schedule: Vec<(Duration, Shutdown)>,
) -> Result<(mpsc::Receiver<Shutdown>, tokio::task::JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel(schedule.len().max(1));
    let start = tokio::time::Instant::now();
    let sender = tokio::spawn(async move {
        for (delay, request) in schedule {
            tokio::time::sleep_until(start + delay).await;
            let _ = tx.send(request).await;
        }
        // INVARIANT: Keep channel open until the pipeline is done.
        tx.closed().await;
    });

    Ok((rx, sender))
}

#[tokio::test]
async fn pipeline_graceful_exit() -> Result<()> {
    let fixture = RepoFixture::new("exit 0")?;
    let (rx, sender) = request_after(Duration::from_millis(2500), Shutdown::Graceful).await?;

    let outcome = fixture.pipeline(fixture.settings()).run_with(rx).await?;
    sender.abort();

    assert_eq!(outcome, RunOutcome::Graceful);
    let states = fixture.states()?;
    assert!(states.len() >= 2, "expected repeated snapshots, got {states:?}");
    assert!(states.iter().all(|state| *state == State::Complete));
    assert!(!fixture.root().join(PID_FILE).exists());

    let settings = Settings::load(fixture.repo())?;
    assert_eq!(settings.schedule, "testing");

    Ok(())
}

#[tokio::test]
async fn pipeline_immediate_exit_interrupts_copy() -> Result<()> {
    let fixture = RepoFixture::new("exec sleep 30")?;
    let (rx, sender) = request_after(
        Duration::from_millis(500),
        Shutdown::Immediate(Signal::SIGTERM),
    )
    .await?;

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        fixture.pipeline(fixture.settings()).run_with(rx),
    )
    .await??;
    sender.abort();

    assert_eq!(outcome, RunOutcome::Immediate(Signal::SIGTERM));
    assert_eq!(fixture.states()?, [State::Incomplete]);
    assert!(!fixture.root().join(PID_FILE).exists());

    Ok(())
}

#[tokio::test]
async fn pipeline_immediate_exit_during_graceful_finish() -> Result<()> {
    let fixture = RepoFixture::new("exec sleep 30")?;
    let (rx, sender) = requests_at(vec![
        (Duration::from_millis(300), Shutdown::Graceful),
        (Duration::from_millis(600), Shutdown::Immediate(Signal::SIGTERM)),
    ])
    .await?;

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        fixture.pipeline(fixture.settings()).run_with(rx),
    )
    .await??;
    sender.abort();

    assert_eq!(outcome, RunOutcome::Immediate(Signal::SIGTERM));
    assert_eq!(fixture.states()?, [State::Incomplete]);
    assert!(!fixture.root().join(PID_FILE).exists());

    Ok(())
}

#[tokio::test]
async fn pipeline_recovers_from_failed_copy() -> Result<()> {
    let fixture = RepoFixture::new(indoc! {r#"
        marker="$0.failed"
        if [ ! -e "$marker" ]; then
            touch "$marker"
            exit 3
        fi
    "#})?;
    let (rx, sender) = request_after(Duration::from_millis(2500), Shutdown::Graceful).await?;

    let outcome = fixture.pipeline(fixture.settings()).run_with(rx).await?;
    sender.abort();

    assert_eq!(outcome, RunOutcome::Graceful);
    assert!(fixture.rsync().with_extension("failed").exists());
    let states = fixture.states()?;
    assert!(!states.is_empty());
    assert!(states.iter().all(|state| *state == State::Complete), "{states:?}");

    Ok(())
}

#[tokio::test]
async fn pipeline_purges_dangling_snapshots() -> Result<()> {
    let fixture = RepoFixture::new("exit 0")?;
    fixture.mkdir("1400337651-1400337652-purging")?;
    fixture.mkdir("1400337711-1400337712-obsolete")?;
    fixture.mkdir("1400337716-1400337717-complete")?;
    let (rx, sender) = request_after(Duration::from_millis(1500), Shutdown::Graceful).await?;

    fixture.pipeline(fixture.settings()).run_with(rx).await?;
    sender.abort();

    let states = fixture.states()?;
    assert!(states.iter().all(|state| *state == State::Complete));
    assert!(states.len() >= 2);

    Ok(())
}

#[tokio::test]
async fn pipeline_keeps_obsolete_without_purge() -> Result<()> {
    let fixture = RepoFixture::new("exit 0")?;
    fixture.mkdir("1400337711-1400337712-obsolete")?;
    let (rx, sender) = request_after(Duration::from_millis(1500), Shutdown::Graceful).await?;

    let settings = Settings {
        no_purge: true,
        ..fixture.settings()
    };
    fixture.pipeline(settings).run_with(rx).await?;
    sender.abort();

    let states = fixture.states()?;
    assert_eq!(states.first(), Some(&State::Obsolete));

    Ok(())
}

#[tokio::test]
async fn pipeline_refuses_claimed_repository() -> Result<()> {
    let fixture = RepoFixture::new("exit 0")?;
    std::fs::write(fixture.root().join(PID_FILE), "1")?;
    let (_tx, rx) = mpsc::channel(1);

    let result = fixture.pipeline(fixture.settings()).run_with(rx).await;
    assert!(matches!(result, Err(PipelineError::Lock(_))));
    assert!(fixture.root().join(PID_FILE).exists());
    assert!(fixture.states()?.is_empty());

    Ok(())
}

/// Reports a full filesystem while obsolete snapshots are left.
struct FullDisk {
    freed: AtomicBool,
    repo_data: PathBuf,
}

impl SpaceProbe for FullDisk {
    fn usage(&self, _: &Path) -> nix::Result<SpaceUsage> {
        let obsolete_left = std::fs::read_dir(&self.repo_data)
            .map_err(|_| nix::Error::EIO)?
            .flatten()
            .any(|entry| entry.file_name().to_string_lossy().ends_with("-obsolete"));
        if !obsolete_left {
            self.freed.store(true, Ordering::SeqCst);
        }

        let free = if self.freed.load(Ordering::SeqCst) { 50 * GIB } else { 0 };
        Ok(SpaceUsage {
            size: 100 * GIB,
            free,
        })
    }
}

#[tokio::test]
async fn pipeline_reclaims_space_without_purge() -> Result<()> {
    let fixture = RepoFixture::new("exit 0")?;
    fixture.mkdir("1400337651-1400337652-obsolete")?;
    fixture.mkdir("1400337711-1400337712-obsolete")?;
    let probe = Arc::new(FullDisk {
        freed: AtomicBool::new(false),
        repo_data: fixture.repo().data_dir(),
    });
    let settings = Settings {
        no_purge: true,
        min_gib_space: 10,
        ..fixture.settings()
    };
    let (rx, sender) = request_after(Duration::from_millis(1500), Shutdown::Graceful).await?;

    fixture
        .pipeline(settings)
        .with_probe(probe.clone())
        .run_with(rx)
        .await?;
    sender.abort();

    assert!(probe.freed.load(Ordering::SeqCst));
    let states = fixture.states()?;
    assert!(states.iter().all(|state| *state == State::Complete));

    Ok(())
}
