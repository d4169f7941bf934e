use std::time::Duration;

use serde::{Deserialize, Serialize};

const fn max_cached_secs() -> u64 {
    if let Some(secs) = option_env!("GEOBRIDGE_MAX_CACHED_SECS") {
        const_str::parse!(secs, u64)
    } else {
        30
    }
}

const fn max_fallback_secs() -> u64 {
    if let Some(secs) = option_env!("GEOBRIDGE_MAX_FALLBACK_SECS") {
        const_str::parse!(secs, u64)
    } else {
        60
    }
}

const fn fix_timeout_ms() -> u64 {
    if let Some(ms) = option_env!("GEOBRIDGE_FIX_TIMEOUT_MS") {
        const_str::parse!(ms, u64)
    } else {
        10000
    }
}

const MAX_CACHED_SECS: u64 = max_cached_secs();
const MAX_FALLBACK_SECS: u64 = max_fallback_secs();
const FIX_TIMEOUT_MS: u64 = fix_timeout_ms();
const LINGER_MS: u64 = 1000;
const UPDATE_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Tuning for [crate::Geolocation]
pub struct GeolocationSettings {
    /// A fix younger than this is handed out without asking the platform again
    pub max_cached_secs: u64,
    /// Oldest fix allowed as a fallback when a new one can't be obtained
    pub max_fallback_secs: u64,
    /// How long to wait for the platform to come up with a fix
    pub fix_timeout_ms: u64,
    /// How long to keep the platform running after the last watcher goes away
    pub linger_ms: u64,
    /// How often the platform is asked to report a fix while running
    pub update_interval_ms: u64,
}

impl GeolocationSettings {
    pub fn max_cached_time(&self) -> Duration {
        Duration::from_secs(self.max_cached_secs)
    }

    pub fn max_fallback_time(&self) -> Duration {
        Duration::from_secs(self.max_fallback_secs)
    }

    pub fn fix_timeout(&self) -> Duration {
        Duration::from_millis(self.fix_timeout_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }
}

impl Default for GeolocationSettings {
    fn default() -> Self {
        Self {
            max_cached_secs: MAX_CACHED_SECS,
            max_fallback_secs: MAX_FALLBACK_SECS,
            fix_timeout_ms: FIX_TIMEOUT_MS,
            linger_ms: LINGER_MS,
            update_interval_ms: UPDATE_INTERVAL_MS,
        }
    }
}
