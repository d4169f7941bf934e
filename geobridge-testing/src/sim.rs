use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Parser, Subcommand};
use futures::StreamExt;
use geobridge_logic::{
    Geolocation, GeolocationSettings, Location, LocationAdapterBuilder, PlatformEvent,
    PositionResult,
};
use geobridge_test_shared::*;
use log::{info, warn};

#[derive(Parser)]
struct Cli {
    /// JSON file with the platform events to replay, a random walk is generated otherwise
    #[arg(long)]
    script: Option<PathBuf>,

    /// Number of steps in the generated random walk
    #[arg(long, default_value_t = 20)]
    steps: usize,

    /// Average milliseconds between random walk steps
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// JSON file with geolocation settings, defaults are used for anything missing
    #[arg(long)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the raw location adapter and print every callback
    Adapter {
        /// Stop the adapter after this many milliseconds instead of at the end of the script
        #[arg(long)]
        stop_after: Option<u64>,
    },
    /// Print the current position once
    Current,
    /// Print position updates as they come in
    Watch {
        /// How many updates to print before quitting
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

const ORIGIN: (f64, f64) = (43.0389, -76.1350);

fn emit(output: impl Into<SimOutput>) {
    match serde_json::to_string(&output.into()) {
        Ok(line) => println!("{line}"),
        Err(why) => warn!("Failed to encode output: {why:?}"),
    }
}

fn position_output(res: PositionResult) -> SimOutput {
    match res {
        Ok(fix) => SimOutput::Position(fix),
        Err(why) => SimOutput::Failed(why.to_string()),
    }
}

fn read_settings(path: Option<&Path>) -> Result<GeolocationSettings> {
    let Some(path) = path else {
        return Ok(GeolocationSettings::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings at {}", path.display()))?;
    serde_json::from_str(&raw).context("Failed to parse settings")
}

async fn run_adapter(
    platform: ScriptedPlatform,
    interval: Duration,
    stop_after: Option<u64>,
) -> Result {
    let run_for = stop_after
        .map(Duration::from_millis)
        .unwrap_or_else(|| script_duration(platform.steps()) + Duration::from_millis(100));

    let adapter = LocationAdapterBuilder::new()
        .on_location(|loc| emit(PlatformEvent::Location(loc)))
        .on_authorization(|granted| emit(PlatformEvent::Authorization(granted)))
        .on_error(|err| emit(PlatformEvent::Error(err)))
        .interval(interval)
        .build(platform)?;

    adapter.start();
    emit(SimOutput::Started);

    tokio::time::sleep(run_for).await;

    adapter.stop();
    emit(SimOutput::Stopped);

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result {
    colog::init();

    let cli = Cli::parse();

    let steps = match &cli.script {
        Some(path) => read_script(path)?,
        None => {
            let origin = Location::new(ORIGIN.0, ORIGIN.1);
            random_walk(origin, cli.steps, cli.interval_ms)
        }
    };

    info!("Replaying {} platform events", steps.len());

    let platform = ScriptedPlatform::new(steps)?;

    match cli.command {
        Commands::Adapter { stop_after } => {
            let interval = Duration::from_millis(cli.interval_ms);
            run_adapter(platform, interval, stop_after).await?
        }
        Commands::Current => {
            let settings = read_settings(cli.settings.as_deref())?;
            let geo = Geolocation::new(platform, settings);
            emit(position_output(geo.current_position().await));
        }
        Commands::Watch { count } => {
            let settings = read_settings(cli.settings.as_deref())?;
            let geo = Geolocation::new(platform, settings);
            let wait = geo.settings().fix_timeout();
            let mut updates = geo.watch_position().take(count);
            loop {
                match tokio::time::timeout(wait, updates.next()).await {
                    Ok(Some(res)) => emit(position_output(res)),
                    Ok(None) => break,
                    Err(_) => {
                        emit(SimOutput::Failed("No update before the fix timeout".into()));
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
