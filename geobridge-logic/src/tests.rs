use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::bail;

use crate::{
    EventSink, Location, LocationObserver, PlatformError, PlatformEvent, PlatformLocation,
    prelude::*,
};

/// Platform that does nothing on its own, tests push events through it by hand
#[derive(Default)]
pub struct MockPlatform {
    sink: Mutex<Option<EventSink>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    refuse_start: AtomicBool,
    running: AtomicBool,
    start_delay: Duration,
    greeting: Option<PlatformEvent>,
    interval: Mutex<Option<Duration>>,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A platform that fails every start request, as if location services were switched off
    pub fn refusing() -> Arc<Self> {
        let platform = Self::default();
        platform.refuse_start.store(true, Ordering::SeqCst);
        Arc::new(platform)
    }

    /// A platform that takes `delay` to come up on every start request
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            start_delay: delay,
            ..Default::default()
        })
    }

    /// A platform that sends `event` from inside every start request, on the caller's thread
    pub fn greeting(event: PlatformEvent) -> Arc<Self> {
        Arc::new(Self {
            greeting: Some(event),
            ..Default::default()
        })
    }

    /// The sink from the latest start request, kept around after stop on purpose
    pub fn sink(&self) -> Option<EventSink> {
        self.sink.lock().unwrap().clone()
    }

    pub fn emit(&self, event: PlatformEvent) -> bool {
        self.sink().is_some_and(|sink| sink.send(event))
    }

    pub fn emit_fix(&self, location: Location) -> bool {
        self.emit(PlatformEvent::Location(Some(location)))
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    /// Whether the last request was a successful start
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Interval asked for in the latest start request
    pub fn interval(&self) -> Option<Duration> {
        *self.interval.lock().unwrap()
    }
}

impl PlatformLocation for MockPlatform {
    fn request_start(&self, sink: EventSink, interval: Duration) -> Result {
        *self.interval.lock().unwrap() = Some(interval);
        if self.refuse_start.load(Ordering::SeqCst) {
            bail!("Location services are disabled");
        }
        if !self.start_delay.is_zero() {
            thread::sleep(self.start_delay);
        }
        *self.sink.lock().unwrap() = Some(sink.clone());
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        if let Some(event) = self.greeting.clone() {
            sink.send(event);
        }
        Ok(())
    }

    fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Observer that remembers every call it got, in order
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<PlatformEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<PlatformEvent> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: PlatformEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl LocationObserver for RecordingObserver {
    fn on_location(&self, location: Option<Location>) {
        self.push(PlatformEvent::Location(location));
    }

    fn on_authorization(&self, granted: bool) {
        self.push(PlatformEvent::Authorization(granted));
    }

    fn on_error(&self, error: PlatformError) {
        self.push(PlatformEvent::Error(error));
    }
}
