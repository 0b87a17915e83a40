use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use mediaflow::events::JsonLinesSink;
use mediaflow::{
    Engine, EngineConfig, OperationHandle, SettingsStore, SharedSink, TerminalOutcome,
};

/// How long to wait for queued events to reach stdout on exit.
const EVENT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "mediaflow")]
#[command(author, version, about = "Drive yt-dlp and ffmpeg with live JSON progress events", long_about = None)]
struct Cli {
    /// Directory holding bundled tool binaries
    #[arg(long, global = true)]
    bin_dir: Option<PathBuf>,

    /// Settings file (defaults to the per-user config dir)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Override the download directory from the settings
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print video info and available formats as JSON
    Analyze { url: String },

    /// List the entries of a playlist
    PlaylistItems { url: String },

    /// Download a single item
    Download {
        url: String,

        /// yt-dlp format selector
        #[arg(short, long, default_value = "best")]
        format: String,

        /// yt-dlp output template
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Download a playlist, optionally a range of it
    Playlist {
        url: String,

        #[arg(short, long, default_value = "best")]
        format: String,

        #[arg(short, long)]
        output: Option<String>,

        /// First item (1-based)
        #[arg(long)]
        start: Option<u32>,

        /// Last item (inclusive)
        #[arg(long)]
        end: Option<u32>,
    },

    /// Convert a local file with ffmpeg
    Convert {
        source: PathBuf,

        /// Target extension, e.g. mp3 or mp4
        #[arg(long)]
        to: String,
    },

    /// Show tool locations and versions
    Tools,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let store = match cli.settings {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::open_default(),
    };
    let mut settings = store.load();
    if let Some(dir) = cli.download_dir {
        settings.download_dir = dir;
    }

    let config = EngineConfig::discover(cli.bin_dir.as_deref());
    let (sink, writer) = JsonLinesSink::spawn(tokio::io::stdout());
    let sink: SharedSink = Arc::new(sink);
    let engine = Arc::new(Engine::new(config, settings, sink));

    let code = execute(engine, cli.command).await;

    // The writer finishes once the engine and every operation let go of the sink.
    if tokio::time::timeout(EVENT_FLUSH_TIMEOUT, writer).await.is_err() {
        log::warn!("Timed out flushing events");
    }
    code
}

async fn execute(engine: Arc<Engine>, command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Analyze { url } => {
            let info = engine.analyze(&url).await?;
            print_json(&info)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::PlaylistItems { url } => {
            let entries = engine.playlist_items(&url).await?;
            print_json(&serde_json::json!({ "entries": entries }))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Download {
            url,
            format,
            output,
        } => {
            let handle = engine.download(&url, &format, output.as_deref()).await?;
            follow(engine, handle).await
        }
        Commands::Playlist {
            url,
            format,
            output,
            start,
            end,
        } => {
            let handle = engine
                .download_playlist(&url, &format, output.as_deref(), start, end)
                .await?;
            follow(engine, handle).await
        }
        Commands::Convert { source, to } => {
            let handle = engine.convert(&source, &to).await?;
            follow(engine, handle).await
        }
        Commands::Tools => {
            print_json(&engine.tool_status().await)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Wait for the operation, turning Ctrl-C into a cancel.
async fn follow(engine: Arc<Engine>, handle: OperationHandle) -> Result<ExitCode> {
    let category = handle.category();
    let waiter = handle.wait();
    tokio::pin!(waiter);

    let outcome = loop {
        tokio::select! {
            outcome = &mut waiter => break outcome,
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                log::info!("Interrupted, cancelling {}", category);
                if let Err(e) = engine.cancel(category).await {
                    log::warn!("{}", e);
                }
            }
        }
    };

    Ok(match outcome {
        TerminalOutcome::Completed(_) => ExitCode::SUCCESS,
        TerminalOutcome::Failed(_) => ExitCode::FAILURE,
        TerminalOutcome::Cancelled => ExitCode::from(130),
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", text);
    Ok(())
}
