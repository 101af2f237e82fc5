use std::{
    io::{self, Write},
    path::PathBuf,
    sync::Arc,
};

use clap::Parser;
use opsec_source::{
    DeliveryError, Event, OpsecError, OpsecSource, PollStatus, SourceConfig, SourceMetrics,
};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "opsec-source")]
#[command(about = "Stream fw1-loggrabber audit lines to stdout as JSON records")]
struct Cli {
    /// TOML file with the source settings.
    #[arg(long, conflicts_with = "config_path")]
    config: Option<PathBuf>,
    /// Directory holding `lea.conf` and `fw1-loggrabber.conf`.
    #[arg(long)]
    config_path: Option<PathBuf>,
    /// fw1-loggrabber binary to launch.
    #[arg(long)]
    binary: Option<PathBuf>,
    /// Extra arguments for the binary.
    #[arg(last = true)]
    args: Vec<String>,
}

#[derive(Debug, Error)]
enum Error {
    #[error("either --config or --config-path is required")]
    MissingConfig,
    #[error(transparent)]
    Source(#[from] OpsecError),
    #[error("failed to wait for Ctrl-C: {0}")]
    Signal(#[source] io::Error),
}

/// Writes each record as one line on stdout.
struct StdoutSink {
    out: io::Stdout,
}

impl opsec_source::EventSink for StdoutSink {
    fn deliver(&mut self, event: Event) -> Result<(), DeliveryError> {
        let mut out = self.out.lock();
        out.write_all(event.body())
            .and_then(|()| out.write_all(b"\n"))
            .and_then(|()| out.flush())
            .map_err(|err| DeliveryError::with_source("failed writing record to stdout", err))
    }
}

fn load_config(cli: &Cli) -> Result<SourceConfig, Error> {
    let mut config = match (&cli.config, &cli.config_path) {
        (Some(file), _) => SourceConfig::load(file)?,
        (None, Some(dir)) => SourceConfig::new(dir),
        (None, None) => return Err(Error::MissingConfig),
    };
    if let Some(binary) = &cli.binary {
        config.binary = binary.clone();
    }
    config.args.extend(cli.args.iter().cloned());
    Ok(config)
}

/// Polls `source` until a fatal fault or until `shutdown` completes.
///
/// `shutdown` is checked before every poll so a steady stream of records cannot starve it.
async fn pump(
    source: &mut OpsecSource,
    mut shutdown: JoinHandle<io::Result<()>>,
) -> Result<(), Error> {
    let backoff = source.backoff();
    loop {
        if shutdown.is_finished() {
            return interrupted((&mut shutdown).await);
        }
        match source.process() {
            Ok(PollStatus::Ready) => tokio::task::yield_now().await,
            Ok(PollStatus::Backoff) => {
                tokio::select! {
                    biased;
                    joined = &mut shutdown => return interrupted(joined),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
            Err(err) if err.is_fatal() => {
                shutdown.abort();
                return Err(Error::from(err));
            }
            Err(err) => warn!("record skipped: {err}"),
        }
    }
}

fn interrupted(joined: Result<io::Result<()>, JoinError>) -> Result<(), Error> {
    joined
        .map_err(io::Error::other)
        .and_then(|signal| signal)
        .map_err(Error::Signal)?;
    info!("interrupted, stopping");
    Ok(())
}

async fn run(cli: Cli) -> Result<(), Error> {
    // Registered up front so a Ctrl-C during startup is caught.
    let shutdown = tokio::spawn(tokio::signal::ctrl_c());
    let config = load_config(&cli)?;
    let metrics = Arc::new(SourceMetrics::new());
    let mut source = OpsecSource::builder(config)
        .metrics(metrics.clone())
        .build(StdoutSink { out: io::stdout() })?;

    source.start()?;
    let outcome = pump(&mut source, shutdown).await;

    if let Err(err) = source.stop().await {
        error!("failed to stop loggrabber: {err}");
    }
    match serde_json::to_string(&metrics.snapshot()) {
        Ok(snapshot) => info!(metrics = %snapshot, "final metrics"),
        Err(err) => warn!("failed to serialize metrics: {err}"),
    }
    outcome
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            std::process::ExitCode::FAILURE
        }
    }
}
