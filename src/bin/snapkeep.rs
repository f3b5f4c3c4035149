// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use snapkeep::{
    clock::SystemClock,
    config::{Settings, DEFAULT_RSYNC_PATH},
    pipeline::{Pipeline, RunOutcome},
    report,
    repository::Repository,
    schedule::{ScheduleRegistry, DEFAULT_SCHEDULE_FILE},
};

use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use std::{path::PathBuf, process::exit, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_REPOSITORY: &str = "/tmp/snapkeep_dest";

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  snapkeep run [options]\n  snapkeep list [options]\n  snapkeep scheds [options]",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn no_log_date(&self) -> bool {
        matches!(&self.command, Command::Run(opts) if opts.no_log_date)
    }

    async fn run(self) -> Result<()> {
        match self.command {
            Command::Run(opts) => run_run(opts).await,
            Command::List(opts) => run_list(opts),
            Command::Scheds(opts) => run_scheds(opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Periodically create snapshots and prune old ones.
    #[command(override_usage = "snapkeep run [options]")]
    Run(RunOptions),

    /// List snapshots of repository by tier.
    #[command(override_usage = "snapkeep list [options]")]
    List(ListOptions),

    /// List available schedules.
    #[command(override_usage = "snapkeep scheds [options]")]
    Scheds(SchedsOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RunOptions {
    /// Path to rsync binary.
    #[arg(long, value_name = "path", default_value = DEFAULT_RSYNC_PATH)]
    pub rsync_path: PathBuf,

    /// Additional options passed to rsync, separated by spaces.
    #[arg(long, value_name = "options", allow_hyphen_values = true, default_value = "")]
    pub rsync_opts: String,

    /// Source of snapshots.
    #[arg(long, value_name = "path", default_value = "/tmp/snapkeep_test/")]
    pub origin: String,

    /// Repository to store snapshots in.
    #[arg(short, long, value_name = "path", default_value = DEFAULT_REPOSITORY)]
    pub repository: PathBuf,

    /// Name of retention schedule.
    #[arg(long, value_name = "name", default_value = "longterm")]
    pub schedule: String,

    /// Maximum number of snapshots in oldest tier, zero to keep all.
    #[arg(long, value_name = "count", default_value_t = 0)]
    pub max_keep: usize,

    /// Keep obsolete snapshots until free space runs short.
    #[arg(long)]
    pub no_purge: bool,

    /// Start first snapshot right away.
    #[arg(long)]
    pub no_wait: bool,

    /// Omit timestamps from log output.
    #[arg(long)]
    pub no_log_date: bool,

    /// File with additional schedule definitions.
    #[arg(long, value_name = "path", default_value = DEFAULT_SCHEDULE_FILE)]
    pub sched_file: PathBuf,

    /// Minimum free space in percent of filesystem size.
    #[arg(long, value_name = "percent", default_value_t = 0.0)]
    pub min_perc_space: f64,

    /// Minimum free space in gibibytes.
    #[arg(long, value_name = "gib", default_value_t = 0)]
    pub min_gib_space: u64,
}

impl RunOptions {
    fn to_settings(&self) -> Result<Settings> {
        let settings = Settings {
            rsync_path: self.rsync_path.clone(),
            rsync_opts: self
                .rsync_opts
                .split_whitespace()
                .map(ToString::to_string)
                .collect(),
            origin: self.origin.clone(),
            schedule: self.schedule.clone(),
            max_keep: self.max_keep,
            no_purge: self.no_purge,
            sched_file: self.sched_file.clone(),
            min_perc_space: self.min_perc_space,
            min_gib_space: self.min_gib_space,
        };

        // INVARIANT: Expand path-like fields the same way persisted settings are.
        Ok(settings.to_string().parse()?)
    }
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ListOptions {
    /// Repository to list.
    #[arg(short, long, value_name = "path", default_value = DEFAULT_REPOSITORY)]
    pub repository: PathBuf,

    /// Show tier, distance, state, and name of each snapshot.
    #[arg(short, long)]
    pub verbose: bool,

    /// Show snapshots in every state.
    #[arg(short, long)]
    pub all: bool,

    /// Override schedule persisted in repository.
    #[arg(long, value_name = "name")]
    pub schedule: Option<String>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SchedsOptions {
    /// File with additional schedule definitions.
    #[arg(long, value_name = "path", default_value = DEFAULT_SCHEDULE_FILE)]
    pub sched_file: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let layer = fmt::layer().compact().with_target(false);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_default();
    if cli.no_log_date() {
        tracing_subscriber::registry()
            .with(layer.without_time())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(layer)
            .with(filter)
            .init();
    }

    if let Err(error) = cli.run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run_run(opts: RunOptions) -> Result<()> {
    let settings = opts.to_settings()?;
    let mut registry = ScheduleRegistry::new();
    registry.load_file(&settings.sched_file)?;
    settings.validate(&registry)?;
    let schedule = registry.require(&settings.schedule)?.clone();

    info!(
        "snapkeep {} started with pid {}",
        env!("CARGO_PKG_VERSION"),
        std::process::id()
    );
    info!(
        "### Repository: {}, Origin: {}, Schedule: {}",
        opts.repository.display(),
        settings.origin,
        settings.schedule
    );

    let repo = Repository::new(&opts.repository);
    let pipeline = Pipeline::new(repo, settings, schedule, Arc::new(SystemClock));
    match pipeline.no_wait(opts.no_wait).run().await? {
        RunOutcome::EarlyExit => info!("-> Early exit"),
        RunOutcome::Immediate(signal) => info!("-> Immediate exit ({signal})"),
        RunOutcome::Graceful => info!("-> Graceful exit"),
    }

    Ok(())
}

fn run_list(opts: ListOptions) -> Result<()> {
    let repo = Repository::new(&opts.repository);
    let mut settings = Settings::load(&repo).unwrap_or_else(|error| {
        warn!("{error}, falling back to default settings");
        Settings::default()
    });
    if let Some(schedule) = opts.schedule {
        settings.schedule = schedule;
    }

    let mut registry = ScheduleRegistry::new();
    registry.load_file(&settings.sched_file)?;
    let schedule = registry.require(&settings.schedule)?;

    let snapshots = repo.scan(&SystemClock)?;
    let options = report::ListOptions {
        max_keep: settings.max_keep,
        verbose: opts.verbose,
        show_all: opts.all,
    };
    print!(
        "{}",
        report::render(&snapshots, schedule, options, &SystemClock, &Local)
    );

    Ok(())
}

fn run_scheds(opts: SchedsOptions) -> Result<()> {
    let mut registry = ScheduleRegistry::new();
    registry.load_file(&opts.sched_file)?;
    print!("{registry}");

    Ok(())
}
