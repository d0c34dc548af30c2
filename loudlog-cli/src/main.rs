//! `loudlog` -- continuous audio loudness logger.
//!
//! - `loudlog record` -- capture until Ctrl+C, logging loudness and archiving audio.
//! - `loudlog list-devices` -- print the input devices `--device` can select.
//! - `loudlog flush` -- ask rrdcached to write pending updates for the store.

mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info, warn};

use loudlog_core::{
    audio::{device::list_input_devices, CpalCapture},
    engine::PipelineConfig,
    store::memory::MemoryStore,
    Recorder, TimeSeriesStore,
};
use settings::{default_settings_path, load_settings, save_settings, SettingsOverrides};

/// Continuous audio loudness logger.
#[derive(Parser)]
#[command(name = "loudlog", about = "Continuous audio loudness logger", version)]
struct Cli {
    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (defaults to the user data directory).
    #[arg(long, global = true, env = "LOUDLOG_SETTINGS")]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture, measure and archive until interrupted.
    Record(RecordArgs),

    /// List audio input devices.
    ListDevices,

    /// Flush the rrdcached cache for the store file.
    Flush(FlushArgs),
}

#[derive(Args)]
struct RecordArgs {
    #[command(flatten)]
    overrides: SettingsOverrides,

    /// Measure and archive without writing to the time-series store.
    #[arg(long)]
    dry_run: bool,

    /// Write the effective settings back to the settings file before starting.
    #[arg(long)]
    save: bool,
}

#[derive(Args)]
struct FlushArgs {
    /// Time-series store file.
    #[arg(long, env = "LOUDLOG_STORE")]
    store: Option<PathBuf>,

    /// rrdcached address.
    #[arg(long, env = "LOUDLOG_DAEMON")]
    daemon: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ───────────────────────────────────────────────────────────
    let fallback = if cli.verbose { "loudlog=debug" } else { "loudlog=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .init();

    let settings_path = cli.settings.unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    debug!(path = %settings_path.display(), "settings loaded");

    match cli.command {
        Commands::Record(args) => {
            args.overrides.apply(&mut settings);
            if args.save {
                save_settings(&settings_path, &settings).with_context(|| {
                    format!("failed to save settings to {}", settings_path.display())
                })?;
                info!(path = %settings_path.display(), "settings saved");
            }
            info!(
                device = settings.device.as_deref().unwrap_or("default"),
                sample_rate = settings.sample_rate,
                block_secs = settings.block_secs,
                store = %settings.store_path.display(),
                archive = %settings.archive_dir.display(),
                batch_secs = settings.batch_duration().as_secs_f64(),
                file_secs = settings.archive_file_span().as_secs_f64(),
                "loudlog starting"
            );
            record(settings.pipeline_config(), args.dry_run).await
        }
        Commands::ListDevices => {
            let devices = list_input_devices();
            if devices.is_empty() {
                println!("no input devices found");
            }
            for device in devices {
                println!("{device}");
            }
            Ok(())
        }
        Commands::Flush(args) => {
            if let Some(store) = args.store {
                settings.store_path = store;
            }
            if let Some(daemon) = args.daemon {
                settings.store_daemon = Some(daemon);
            }
            settings.normalize();
            let config = settings.pipeline_config();
            if config.store_daemon.is_none() {
                warn!("no rrdcached daemon configured; updates are already on disk");
            }
            config
                .rrdtool_store()
                .flush()
                .with_context(|| format!("flush of {} failed", config.store.path.display()))?;
            info!(path = %config.store.path.display(), "store flushed");
            Ok(())
        }
    }
}

async fn record(config: PipelineConfig, dry_run: bool) -> anyhow::Result<()> {
    let recorder = Arc::new(Recorder::new(config));

    let started = if dry_run {
        info!("dry run: measurements are not written to the store");
        recorder.start_with(
            |config: &PipelineConfig| CpalCapture::open(&config.capture_config()),
            MemoryStore::new(),
        )
    } else {
        recorder.start()
    };
    started.context("failed to start recording")?;

    let stopper = Arc::clone(&recorder);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; finishing the current block");
            if let Err(e) = stopper.stop() {
                debug!("stop after interrupt: {e}");
            }
        }
    });

    let result = recorder.wait().await;
    info!(diagnostics = ?recorder.diagnostics_snapshot(), "recording finished");
    result.context("recording pipeline failed")
}
