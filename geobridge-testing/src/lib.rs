use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::Utc;
use geobridge_logic::{EventSink, Location, PlatformEvent, PlatformLocation};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

pub mod prelude {
    pub use anyhow::{Context, anyhow, bail};
    pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
}

pub use prelude::*;

/// One event a [ScriptedPlatform] reports, after waiting `delay_ms` since the previous one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub delay_ms: u64,
    pub event: PlatformEvent,
}

impl Step {
    pub fn new(delay_ms: u64, event: impl Into<PlatformEvent>) -> Self {
        Self {
            delay_ms,
            event: event.into(),
        }
    }
}

pub fn parse_script(raw: &str) -> Result<Vec<Step>> {
    serde_json::from_str(raw).context("Failed to parse script")
}

pub fn read_script(path: &Path) -> Result<Vec<Step>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script at {}", path.display()))?;
    parse_script(&raw)
}

/// Total time a script takes to play out
pub fn script_duration(steps: &[Step]) -> Duration {
    Duration::from_millis(steps.iter().map(|s| s.delay_ms).sum())
}

const WALK_STEP_DEGREES: f64 = 0.0005;

/// A script of someone wandering around `origin`, granting access first and now and then
/// losing their fix
pub fn random_walk(origin: Location, steps: usize, interval_ms: u64) -> Vec<Step> {
    let mut here = origin;

    let walk = (0..steps).map(move |_| {
        let delay_ms = interval_ms / 2 + rand::random_range(0..=interval_ms);
        if rand::random_range(0..10) == 0 {
            return Step::new(delay_ms, PlatformEvent::Location(None));
        }
        here.lat += rand::random_range(-WALK_STEP_DEGREES..WALK_STEP_DEGREES);
        here.long += rand::random_range(-WALK_STEP_DEGREES..WALK_STEP_DEGREES);
        here.accuracy = Some(rand::random_range(3.0..25.0));
        Step::new(delay_ms, PlatformEvent::Location(Some(here)))
    });

    std::iter::once(Step::new(0, PlatformEvent::Authorization(true)))
        .chain(walk)
        .collect()
}

/// A stand-in platform location service that replays a script on the tokio runtime.
///
/// Every start replays the script from the top, fixes are stamped with the time they're
/// replayed at.
pub struct ScriptedPlatform {
    steps: Arc<Vec<Step>>,
    runtime: Handle,
    running: Mutex<Option<CancellationToken>>,
}

impl ScriptedPlatform {
    /// Needs to be called from within a tokio runtime
    pub fn new(steps: Vec<Step>) -> Result<Self> {
        let runtime = Handle::try_current().context("Scripted platform needs a tokio runtime")?;
        Ok(Self {
            steps: Arc::new(steps),
            runtime,
            running: Mutex::new(None),
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    async fn replay(steps: Arc<Vec<Step>>, sink: EventSink, cancel: CancellationToken) {
        for (i, step) in steps.iter().enumerate() {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Script cancelled before step {i}");
                    return;
                }

                _ = tokio::time::sleep(Duration::from_millis(step.delay_ms)) => {}
            }

            let event = match step.event.clone() {
                PlatformEvent::Location(Some(fix)) => {
                    PlatformEvent::Location(Some(fix.with_timestamp(Utc::now())))
                }
                other => other,
            };

            if !sink.send(event) {
                debug!("Step {i} was not delivered");
            }
        }
        debug!("Script finished");
    }
}

impl PlatformLocation for ScriptedPlatform {
    fn request_start(&self, sink: EventSink, interval: Duration) -> Result {
        debug!("Replaying script, fixes were asked for every {interval:?}");
        let cancel = CancellationToken::new();
        let mut running = self
            .running
            .lock()
            .map_err(|_| anyhow!("Scripted platform state poisoned"))?;
        if let Some(previous) = running.replace(cancel.clone()) {
            previous.cancel();
        }
        self.runtime.spawn(Self::replay(self.steps.clone(), sink, cancel));
        Ok(())
    }

    fn request_stop(&self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(cancel) = running.take() {
                cancel.cancel();
            }
        }
    }
}

/// A line of output from the simulator
#[derive(Debug, Clone, Serialize)]
pub enum SimOutput {
    Started,
    Stopped,
    /// Raw callback from the adapter
    Callback(PlatformEvent),
    /// A position from the geolocation service
    Position(Location),
    /// The geolocation service couldn't produce a position
    Failed(String),
}

impl From<PlatformEvent> for SimOutput {
    fn from(value: PlatformEvent) -> Self {
        SimOutput::Callback(value)
    }
}
