mod adapter;
mod geolocation;
mod location;
mod platform;
mod settings;
#[cfg(test)]
mod tests;

pub use adapter::{
    AdapterState, DEFAULT_UPDATE_INTERVAL, EventSink, LocationAdapter, LocationAdapterBuilder,
    LocationObserver,
};
pub use geolocation::{Geolocation, GeolocationError, PositionResult, PositionStream};
pub use location::{Location, LocationComponent, UtcDT};
pub use platform::{PlatformError, PlatformEvent, PlatformLocation};
pub use settings::GeolocationSettings;

pub mod prelude {
    use anyhow::Error as AnyhowError;
    use std::result::Result as StdResult;
    pub type Result<T = (), E = AnyhowError> = StdResult<T, E>;
    pub use anyhow::Context;
}
