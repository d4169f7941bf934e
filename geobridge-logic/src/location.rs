use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Convenience alias for UTC DT
pub type UtcDT = DateTime<Utc>;

/// A "part" of a location
pub type LocationComponent = f64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
/// A single position estimate as reported by the platform location service.
/// Forwarded as-is, nothing in this crate interprets the values.
pub struct Location {
    /// Latitude
    pub lat: LocationComponent,
    /// Longitude
    pub long: LocationComponent,
    /// Horizontal accuracy in meters, optional as not every provider reports it
    pub accuracy: Option<LocationComponent>,
    /// Altitude in meters
    pub altitude: Option<LocationComponent>,
    /// The course in degrees from true north, optional as GPS can't always determine
    pub heading: Option<LocationComponent>,
    /// Ground speed in meters per second
    pub speed: Option<LocationComponent>,
    /// When the platform took this fix
    #[serde(default = "Utc::now")]
    pub timestamp: UtcDT,
}

impl Location {
    /// A bare fix with only coordinates, taken now
    pub fn new(lat: LocationComponent, long: LocationComponent) -> Self {
        Self {
            lat,
            long,
            accuracy: None,
            altitude: None,
            heading: None,
            speed: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: UtcDT) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// How old this fix is relative to `now`, zero if the fix claims to be from the future
    pub fn age(&self, now: UtcDT) -> std::time::Duration {
        (now - self.timestamp).to_std().unwrap_or_default()
    }
}
