use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{adapter::EventSink, location::Location, prelude::*};

/// An error reported by the platform location service, forwarded verbatim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct PlatformError {
    /// Human readable description, as the platform worded it
    pub message: String,
    /// Platform specific error code, if the platform has one
    pub code: Option<i64>,
}

impl PlatformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }
}

/// A single notification coming out of the platform location service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlatformEvent {
    /// A new fix, or `None` if the platform doesn't have one yet
    Location(Option<Location>),
    /// Whether the user has granted location access
    Authorization(bool),
    /// Something went wrong in the platform
    Error(PlatformError),
}

/// The capability a platform location service has to provide.
///
/// Implementors may call into the [EventSink] from any thread and at any time between
/// [PlatformLocation::request_start] and [PlatformLocation::request_stop]. Events sent into a
/// sink after its session ended are dropped, so implementors don't need to synchronize the
/// last few events with a stop request.
///
/// Start and stop requests for one adapter never overlap. `request_stop` must not wait for a
/// sink call that's still running to return.
pub trait PlatformLocation: Send + Sync {
    /// Begin monitoring location (negotiating permissions if needed), delivering everything
    /// that happens into `sink`, with fixes roughly every `interval`. Should not block on user
    /// interaction.
    fn request_start(&self, sink: EventSink, interval: Duration) -> Result;
    /// Stop monitoring, must be safe to call when not started
    fn request_stop(&self);
}

impl<P: PlatformLocation + ?Sized> PlatformLocation for Arc<P> {
    fn request_start(&self, sink: EventSink, interval: Duration) -> Result {
        (**self).request_start(sink, interval)
    }

    fn request_stop(&self) {
        (**self).request_stop()
    }
}
