//! Log Tailer - resumable log file tailing with offset checkpoints.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use log_tailer::api::ChannelHandler;
use log_tailer::config::{Config, ConfigError, ConfigLoader};
use log_tailer::metrics::Metrics;
use log_tailer::positions::{PositionStore, Positions, PositionsError};
use log_tailer::tail::{SessionContext, TailSession};

/// Entries buffered between sessions and the stdout writer.
const ENTRY_CHANNEL_CAPACITY: usize = 1024;

#[derive(Parser)]
#[command(
    name = "log-tailer",
    about = "Tail log files and resume where you left off",
    version
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StoreArgs {
    /// Config file (defaults to .log-tailer.toml or the user config dir).
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Positions file, overriding the config.
    #[arg(long)]
    positions_file: Option<PathBuf>,
    /// Checkpoint interval in milliseconds, overriding the config.
    #[arg(long)]
    sync_period_ms: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Tail files, printing each line as JSON until Ctrl-C.
    Tail {
        #[command(flatten)]
        store: StoreArgs,
        /// Files to tail.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Print stored read positions.
    Positions {
        #[command(flatten)]
        store: StoreArgs,
    },
    /// Forget stored positions so the files are read from the start.
    Forget {
        #[command(flatten)]
        store: StoreArgs,
        /// Files to forget.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Positions(#[from] PositionsError),

    #[error("Failed to set up metrics: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("None of the requested files could be tailed")]
    NothingToTail,

    #[error("Failed to wait for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // stdout carries entries, logs go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(store: &StoreArgs) -> Result<Config, ConfigError> {
    let loader = match &store.config {
        Some(path) => ConfigLoader::with_path(path.clone()),
        None => ConfigLoader::new(),
    };
    let mut config = loader.load()?;

    if let Some(path) = &store.positions_file {
        config.positions.filename.clone_from(path);
    }
    if let Some(sync_period_ms) = store.sync_period_ms {
        config.positions.sync_period_ms = sync_period_ms;
    }
    config.validate()?;
    Ok(config)
}

async fn run_tail(store: &StoreArgs, paths: Vec<PathBuf>) -> Result<(), CliError> {
    let config = load_config(store)?;
    let positions = Arc::new(Positions::open(&config.positions)?);
    let sync_cancel = CancellationToken::new();
    let sync_task = positions.spawn_sync(sync_cancel.clone());
    let metrics = Arc::new(Metrics::new()?);

    // Cancelled when stdout goes away, e.g. the reader of a pipe exits.
    let output_closed = CancellationToken::new();
    let (handler, mut entries) = ChannelHandler::new(ENTRY_CHANNEL_CAPACITY);
    let printer = tokio::spawn({
        let output_closed = output_closed.clone();
        async move {
            let stdout = std::io::stdout();
            while let Some(entry) = entries.recv().await {
                let json = match serde_json::to_string(&entry) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode entry");
                        continue;
                    }
                };
                if let Err(e) = writeln!(stdout.lock(), "{json}") {
                    tracing::info!(error = %e, "Output closed, shutting down");
                    output_closed.cancel();
                    break;
                }
            }
        }
    });

    let ctx = SessionContext {
        handler: Arc::new(handler),
        positions: Arc::clone(&positions) as Arc<dyn PositionStore>,
        metrics: Arc::clone(&metrics),
        settings: config.tail.clone(),
    };

    let mut sessions = Vec::with_capacity(paths.len());
    for path in paths {
        match TailSession::start(&ctx, &path).await {
            Ok(session) => sessions.push(session),
            Err(e) => tracing::error!(
                path = %path.display(),
                error = %e,
                "Failed to start tailing file"
            ),
        }
    }
    drop(ctx);

    let result = if sessions.is_empty() {
        Err(CliError::NothingToTail)
    } else {
        tracing::info!(files = sessions.len(), "Tailing files, press Ctrl-C to stop");
        tokio::select! {
            signal = tokio::signal::ctrl_c() => signal.map_err(CliError::from),
            () = output_closed.cancelled() => Ok(()),
        }
    };

    for session in &mut sessions {
        if let Err(e) = session.stop().await {
            tracing::warn!(path = %session.path().display(), error = %e, "Tail stopped with error");
        }
        if !session.path().exists() {
            tracing::info!(path = %session.path().display(), "File is gone, forgetting position");
            session.cleanup();
        }
    }
    drop(sessions);

    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "Entry writer failed");
    }

    sync_cancel.cancel();
    if let Err(e) = sync_task.await {
        tracing::error!(error = %e, "Positions sync task failed");
    }

    match serde_json::to_string(&metrics.snapshot()) {
        Ok(snapshot) => tracing::info!(metrics = %snapshot, "Final metrics"),
        Err(e) => tracing::debug!(error = %e, "Failed to encode metrics"),
    }
    match metrics.render() {
        Ok(text) => tracing::debug!("Final metrics in exposition format:\n{text}"),
        Err(e) => tracing::debug!(error = %e, "Failed to render metrics"),
    }

    result
}

fn run_positions(store: &StoreArgs) -> Result<(), CliError> {
    let config = load_config(store)?;
    let positions = Positions::open(&config.positions)?;
    for (path, offset) in positions.snapshot() {
        println!("{offset}\t{}", path.display());
    }
    Ok(())
}

fn run_forget(store: &StoreArgs, paths: &[PathBuf]) -> Result<(), CliError> {
    let config = load_config(store)?;
    let positions = Positions::open(&config.positions)?;
    for path in paths {
        positions.remove(path);
        tracing::info!(path = %path.display(), "Forgot position");
    }
    positions.save()?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Tail { store, paths } => run_tail(&store, paths).await,
        Commands::Positions { store } => run_positions(&store),
        Commands::Forget { store, paths } => run_forget(&store, &paths),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "log-tailer failed");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
