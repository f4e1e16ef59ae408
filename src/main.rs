//! `sandtable`: command-line front end for the sand table motion core.
//!
//! ```bash
//! sandtable ports
//! sandtable connect
//! sandtable run patterns/star.thr
//! sandtable playlist a.thr b.thr --clear-mode adaptive --run-mode indefinite --shuffle
//! sandtable --simulate run star.thr
//! ```
//!
//! Settings come from `sandtable.toml` (see `--config`) plus `SANDTABLE_*`
//! environment variables. `--simulate` drives an in-process GRBL controller
//! instead of real hardware.

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use table_core::{NoVisual, Settings, SharedState};
use table_engine::{
    load_pattern, ClearMode, MotionEngine, PatternMetadata, PlaylistOptions, RunMode,
    SessionHandle,
};
use table_grbl::ports::order_candidates;
use table_grbl::{list_ports, ConnectionManager, MockConfig, MockController};
use tokio::signal;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "sandtable")]
#[command(about = "Drive a polar sand table over GRBL or FluidNC", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = "sandtable.toml")]
    config: PathBuf,

    /// Use a simulated controller instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    /// Debug logging with span timings
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports in connection preference order
    Ports,

    /// Connect, initialise the controller and print the table status
    Connect,

    /// Connect and run operator homing
    Home,

    /// Draw one pattern file
    Run {
        /// Pattern file, absolute or relative to the pattern directory
        pattern: String,
    },

    /// Draw a list of patterns
    Playlist {
        /// Pattern files in playlist order
        #[arg(required = true)]
        files: Vec<String>,

        /// Playlist name shown in status
        #[arg(long, default_value = "cli")]
        name: String,

        /// Seconds to wait between patterns
        #[arg(long, default_value_t = 0)]
        pause_time: u64,

        /// none, random, adaptive, clear_from_in, clear_from_out, clear_sideway
        #[arg(long, default_value = "none")]
        clear_mode: ClearMode,

        /// single or indefinite
        #[arg(long, default_value = "single")]
        run_mode: RunMode,

        /// Shuffle patterns every pass
        #[arg(long)]
        shuffle: bool,
    },

    /// Parse a pattern file and print its summary
    Parse {
        /// Pattern file
        file: PathBuf,
    },

    /// Print the persisted machine state
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;

    let mut tracing_config =
        logging::TracingConfig::from_settings(&settings.logging).map_err(anyhow::Error::msg)?;
    if cli.verbose {
        tracing_config = logging::TracingConfig::new(Level::DEBUG)
            .with_format(tracing_config.format)
            .with_span_events(true);
    }
    logging::init(tracing_config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Ports => print_ports(&settings),
        Commands::Parse { file } => parse_pattern(file).await,
        Commands::Status => print_state(&settings),
        Commands::Connect => {
            let (engine, _mock) = open_engine(settings, cli.simulate).await?;
            println!("{}", serde_json::to_string_pretty(&engine.status())?);
            engine.manager().disconnect().await?;
            Ok(())
        }
        Commands::Home => {
            let (engine, _mock) = open_engine(settings, cli.simulate).await?;
            engine.home().await.context("homing")?;
            info!("Homing complete");
            engine.manager().disconnect().await?;
            Ok(())
        }
        Commands::Run { pattern } => {
            let (engine, _mock) = open_engine(settings, cli.simulate).await?;
            let handle = engine.start_pattern(&pattern)?;
            drive(&engine, handle).await
        }
        Commands::Playlist {
            files,
            name,
            pause_time,
            clear_mode,
            run_mode,
            shuffle,
        } => {
            let (engine, _mock) = open_engine(settings, cli.simulate).await?;
            let handle = engine.start_playlist(PlaylistOptions {
                name,
                files,
                pause_time: Duration::from_secs(pause_time),
                clear_mode,
                run_mode,
                shuffle,
            })?;
            drive(&engine, handle).await
        }
    }
}

fn print_ports(settings: &Settings) -> Result<()> {
    let state = SharedState::load(&settings.state.path);
    let last = state.read(|s| s.last_port.clone());
    let available = list_ports();
    let ordered = order_candidates(
        settings.connection.port.as_deref(),
        last.as_deref(),
        &available,
        &settings.connection.deprioritized_ports,
    );
    if ordered.is_empty() {
        println!(
            "No serial ports; would try {}:{}",
            settings.connection.socket_host, settings.connection.socket_port
        );
    }
    for port in ordered {
        println!("{}", port);
    }
    Ok(())
}

async fn parse_pattern(file: PathBuf) -> Result<()> {
    let points = load_pattern(&file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let meta = PatternMetadata::from_points(&points);
    println!("{}", serde_json::to_string_pretty(&meta)?);
    Ok(())
}

fn print_state(settings: &Settings) -> Result<()> {
    let state = SharedState::load(&settings.state.path);
    println!("{}", serde_json::to_string_pretty(&state.snapshot())?);
    Ok(())
}

/// Connect (or attach the simulator) and build the engine.
async fn open_engine(
    settings: Settings,
    simulate: bool,
) -> Result<(MotionEngine, Option<MockController>)> {
    let state = SharedState::load(&settings.state.path);
    let manager = Arc::new(ConnectionManager::new(settings, state.clone()));

    let mock = if simulate {
        info!("Using simulated controller");
        let (transport, mock) = MockController::spawn(MockConfig::grbl(), state);
        manager
            .connect_with(Box::new(transport))
            .await
            .context("initialising simulated controller")?;
        Some(mock)
    } else {
        manager
            .connect()
            .await
            .context("connecting to the table controller")?;
        None
    };

    Ok((MotionEngine::new(manager, Arc::new(NoVisual)), mock))
}

/// Follow a session to its end, logging progress. Ctrl-C stops it.
async fn drive(engine: &MotionEngine, mut handle: SessionHandle) -> Result<()> {
    let background = engine.spawn_background();
    let mut updates = engine.subscribe_status();
    let mut stopping = false;

    let outcome = loop {
        tokio::select! {
            joined = &mut handle => break joined.context("session task failed")?,
            _ = signal::ctrl_c(), if !stopping => {
                warn!("Interrupted, stopping");
                engine.stop()?;
                stopping = true;
            }
            update = updates.recv() => {
                if let Ok(snapshot) = update {
                    if let (Some(file), Some(progress)) = (snapshot.current_file, snapshot.progress) {
                        info!(
                            file = %file,
                            percent = format!("{:.1}", progress.percent()),
                            remaining_secs = ?progress.remaining_secs.map(|s| s.round()),
                            "Drawing"
                        );
                    }
                }
            }
        }
    };

    for task in background {
        task.abort();
    }
    let result = outcome.context("pattern session failed");
    if let Err(e) = engine.manager().disconnect().await {
        warn!(error = %e, "Disconnect failed");
    }
    let outcome = result?;
    info!(?outcome, "Done");
    Ok(())
}
