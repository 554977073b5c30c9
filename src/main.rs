mod api;
mod clock;
mod daemon;
mod diagnostics;
mod playback;
mod schedule;
mod trigger;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use crate::api::ApiServerConfig;
use crate::clock::{Clock, SystemClock};
use crate::daemon::{Daemon, DaemonOptions};
use crate::playback::{ActivityFlag, AudioOutput, HeadlessOutput, PlaybackQueue};
use crate::schedule::model::TimeDisplayMode;
use crate::schedule::store::JsonScheduleStore;

const DEFAULT_LOG_FILTER: &str = "selftalker=info";

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum AudioBackend {
    Headless,
    Rodio,
}

#[derive(Parser, Debug)]
#[command(name = "selftalker", version, about = "Plays recorded audio clips on repeating schedules")]
struct Cli {
    #[arg(long, default_value = "schedules.json")]
    store: PathBuf,

    #[arg(long, default_value = "127.0.0.1")]
    api_bind: String,

    #[arg(long, default_value_t = 8099)]
    api_port: u16,

    #[arg(long)]
    no_api: bool,

    #[arg(long, value_enum, default_value_t = AudioBackend::Headless)]
    audio_backend: AudioBackend,

    /// Start without the precise-timing capability; schedules stay unarmed
    /// until it is granted through the API.
    #[arg(long)]
    deny_precise_timing: bool,

    /// Print a summary of the schedule file and exit.
    #[arg(long)]
    check: bool,

    /// Show trigger times in 12-hour format in `--check` output.
    #[arg(long)]
    twelve_hour: bool,

    /// Play the given files as one batch and exit.
    #[arg(long, num_args = 1..)]
    play: Vec<PathBuf>,

    /// Tracing directives; overrides RUST_LOG.
    #[arg(long)]
    log_filter: Option<String>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_filter.as_deref())?;

    if cli.check {
        let store = JsonScheduleStore::open(&cli.store)
            .with_context(|| format!("failed to load {}", cli.store.display()))?;
        let mode = if cli.twelve_hour {
            TimeDisplayMode::Hour12
        } else {
            TimeDisplayMode::Hour24
        };
        return diagnostics::run_check(&store, SystemClock.now_ms(), mode);
    }

    let output = build_output(cli.audio_backend)?;
    if !cli.play.is_empty() {
        return play_once(output, &cli.play);
    }

    let api = (!cli.no_api).then(|| ApiServerConfig {
        bind_addr: cli.api_bind.clone(),
        port: cli.api_port,
    });
    let daemon = Daemon::start(
        DaemonOptions {
            store_path: cli.store,
            api,
            precise_timing_allowed: !cli.deny_precise_timing,
        },
        output,
    )?;
    daemon.run()
}

fn init_tracing(directives: Option<&str>) -> Result<()> {
    let filter = match directives {
        Some(directives) => EnvFilter::try_new(directives).with_context(|| format!("invalid --log-filter {directives:?}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
    Ok(())
}

fn build_output(backend: AudioBackend) -> Result<Box<dyn AudioOutput>> {
    match backend {
        AudioBackend::Headless => Ok(Box::new(HeadlessOutput)),
        #[cfg(feature = "rodio")]
        AudioBackend::Rodio => Ok(Box::new(playback::rodio_output::RodioOutput)),
        #[cfg(not(feature = "rodio"))]
        AudioBackend::Rodio => anyhow::bail!("the rodio audio backend requires building with `--features rodio`"),
    }
}

fn play_once(output: Box<dyn AudioOutput>, paths: &[PathBuf]) -> Result<()> {
    let queue = PlaybackQueue::start(output, Arc::new(ActivityFlag::new()));
    queue.enqueue(paths.iter().map(|path| path.display().to_string()).collect());
    while !queue.wait_until_idle(Duration::from_secs(1)) {}

    let session = queue.session();
    println!(
        "Played {} file(s), {} failed",
        session.files_completed, session.files_failed
    );
    Ok(())
}
