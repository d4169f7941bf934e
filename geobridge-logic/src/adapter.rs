use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak},
    thread::{self, ThreadId},
    time::Duration,
};

use log::{debug, error, info};
use uuid::Uuid;

use crate::{
    location::Location,
    platform::{PlatformError, PlatformEvent, PlatformLocation},
    prelude::*,
};

/// Receives everything the platform location service reports.
///
/// Methods are called on whatever thread the platform delivers events on. The adapter itself
/// never calls into the observer from within [LocationAdapter::start] or
/// [LocationAdapter::stop]. Calls for one adapter never overlap.
pub trait LocationObserver: Send + Sync {
    /// A new fix, `None` when the platform has no fix yet
    fn on_location(&self, location: Option<Location>);
    /// Location access was granted or revoked
    fn on_authorization(&self, granted: bool);
    /// The platform reported an error, monitoring is left running
    fn on_error(&self, error: PlatformError);
}

impl<O: LocationObserver + ?Sized> LocationObserver for Arc<O> {
    fn on_location(&self, location: Option<Location>) {
        (**self).on_location(location)
    }

    fn on_authorization(&self, granted: bool) {
        (**self).on_authorization(granted)
    }

    fn on_error(&self, error: PlatformError) {
        (**self).on_error(error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Stopped,
    Started,
}

#[derive(Default)]
struct Gate {
    started: bool,
    /// Bumped on every start and stop, sinks from older sessions are dead
    generation: u64,
    session: Option<Uuid>,
    /// Thread currently inside an observer call, how deep it's nested and the session it's
    /// delivering for
    delivering: Option<(ThreadId, usize, u64)>,
}

/// Which thread is running `start` or `stop`, and how deep
type LifecycleOwner = Option<(ThreadId, usize)>;

struct Shared {
    gate: Mutex<Gate>,
    idle: Condvar,
    /// Orders platform start and stop requests, reentrant so an observer called while the
    /// platform is starting can still stop the adapter
    lifecycle: Mutex<LifecycleOwner>,
    lifecycle_free: Condvar,
    observer: Box<dyn LocationObserver>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, gate: MutexGuard<'a, Gate>) -> MutexGuard<'a, Gate> {
        self.idle.wait(gate).unwrap_or_else(PoisonError::into_inner)
    }

    fn enter_lifecycle(&self) -> Lifecycle<'_> {
        let me = thread::current().id();
        let mut owner = self
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        loop {
            match *owner {
                None => {
                    *owner = Some((me, 1));
                    break;
                }
                Some((thread, depth)) if thread == me => {
                    *owner = Some((thread, depth + 1));
                    break;
                }
                Some(_) => {
                    owner = self
                        .lifecycle_free
                        .wait(owner)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }

        Lifecycle(self)
    }

    fn deliver(&self, generation: u64, event: PlatformEvent) -> bool {
        let me = thread::current().id();
        let mut gate = self.lock();

        while matches!(gate.delivering, Some((owner, _, _)) if owner != me) {
            gate = self.wait(gate);
        }

        if !gate.started || gate.generation != generation {
            return false;
        }

        gate.delivering = match gate.delivering {
            Some((owner, depth, outer)) => Some((owner, depth + 1, outer)),
            None => Some((me, 1, generation)),
        };
        drop(gate);

        let _delivery = Delivery(self);

        match event {
            PlatformEvent::Location(location) => self.observer.on_location(location),
            PlatformEvent::Authorization(granted) => self.observer.on_authorization(granted),
            PlatformEvent::Error(error) => self.observer.on_error(error),
        }

        true
    }
}

/// Marks the end of an observer call, even if the observer panics
struct Delivery<'a>(&'a Shared);

impl Drop for Delivery<'_> {
    fn drop(&mut self) {
        let mut gate = self.0.lock();
        gate.delivering = match gate.delivering {
            Some((owner, depth, outer)) if depth > 1 => Some((owner, depth - 1, outer)),
            _ => None,
        };
        if gate.delivering.is_none() {
            self.0.idle.notify_all();
        }
    }
}

/// Held for the duration of a `start` or `stop`
struct Lifecycle<'a>(&'a Shared);

impl Drop for Lifecycle<'_> {
    fn drop(&mut self) {
        let mut owner = self
            .0
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *owner = match *owner {
            Some((thread, depth)) if depth > 1 => Some((thread, depth - 1)),
            _ => None,
        };
        if owner.is_none() {
            self.0.lifecycle_free.notify_all();
        }
    }
}

/// Handle given to a [PlatformLocation] to push events to the adapter that started it.
///
/// A sink is bound to one monitoring session, once that session is stopped (or the adapter
/// is dropped) everything sent into it is discarded.
#[derive(Clone)]
pub struct EventSink {
    shared: Weak<Shared>,
    generation: u64,
}

impl EventSink {
    /// Forward an event to the observer, returns whether it was delivered
    pub fn send(&self, event: PlatformEvent) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.deliver(self.generation, event))
    }

    pub fn location(&self, location: Option<Location>) -> bool {
        self.send(PlatformEvent::Location(location))
    }

    pub fn authorization(&self, granted: bool) -> bool {
        self.send(PlatformEvent::Authorization(granted))
    }

    pub fn error(&self, error: PlatformError) -> bool {
        self.send(PlatformEvent::Error(error))
    }

    /// Whether the session this sink belongs to is still running
    pub fn is_live(&self) -> bool {
        self.shared.upgrade().is_some_and(|shared| {
            let gate = shared.lock();
            gate.started && gate.generation == self.generation
        })
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Update interval asked of the platform unless told otherwise
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Bridges a platform location service to a [LocationObserver].
///
/// Starts out stopped, [LocationAdapter::start] begins monitoring and
/// [LocationAdapter::stop] ends it. Once `stop` returns, no observer call is still running
/// on another thread and none will be made until the next `start`. Dropping the adapter
/// stops it.
///
/// `start` and `stop` may be called from any thread, platform start and stop requests are
/// issued in the same order the calls were made.
pub struct LocationAdapter<P: PlatformLocation> {
    platform: P,
    interval: Duration,
    shared: Arc<Shared>,
}

impl<P: PlatformLocation> LocationAdapter<P> {
    pub fn new(platform: P, observer: impl LocationObserver + 'static) -> Self {
        Self {
            platform,
            interval: DEFAULT_UPDATE_INTERVAL,
            shared: Arc::new(Shared {
                gate: Mutex::new(Gate::default()),
                idle: Condvar::new(),
                lifecycle: Mutex::new(None),
                lifecycle_free: Condvar::new(),
                observer: Box::new(observer),
            }),
        }
    }

    /// How often the platform should report a fix, applies from the next start
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> AdapterState {
        if self.shared.lock().started {
            AdapterState::Started
        } else {
            AdapterState::Stopped
        }
    }

    pub fn is_started(&self) -> bool {
        self.state() == AdapterState::Started
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Begin monitoring location. Does nothing if already started.
    ///
    /// If the platform refuses to start, the refusal is reported once through
    /// [LocationObserver::on_error] from a separate thread and the adapter stays started, it's
    /// up to the caller to call [LocationAdapter::stop].
    pub fn start(&self) {
        let _lifecycle = self.shared.enter_lifecycle();
        let mut gate = self.shared.lock();

        if gate.started {
            debug!("Location adapter already started");
            return;
        }

        gate.started = true;
        gate.generation += 1;
        let generation = gate.generation;
        let session = Uuid::new_v4();
        gate.session = Some(session);

        let sink = EventSink {
            shared: Arc::downgrade(&self.shared),
            generation,
        };

        drop(gate);

        info!("Starting location updates (session {session})");

        let res = self.platform.request_start(sink.clone(), self.interval);

        let gate = self.shared.lock();
        if gate.generation != generation {
            // An observer stopped this session while the platform was still starting, the
            // platform may have come up after that stop request
            if !gate.started {
                drop(gate);
                debug!("Session {session} stopped while starting, stopping platform again");
                self.platform.request_stop();
            }
            return;
        }
        drop(gate);

        if let Err(why) = res {
            error!("Platform failed to start location updates: {why:?}");
            let error = PlatformError::new(format!("{why:#}"));
            let reported = thread::Builder::new()
                .name("location-start-error".into())
                .spawn(move || {
                    sink.error(error);
                });
            if let Err(why) = reported {
                error!("Failed to report platform start failure: {why:?}");
            }
        }
    }

    /// Stop monitoring location, safe to call at any time and any number of times.
    ///
    /// Waits for an observer call running on another thread to finish. Called from within an
    /// observer method it returns without waiting for that call.
    pub fn stop(&self) {
        let me = thread::current().id();
        let lifecycle = self.shared.enter_lifecycle();
        let mut gate = self.shared.lock();

        if !gate.started {
            return;
        }

        let stopped = gate.generation;
        gate.started = false;
        gate.generation += 1;
        let session = gate.session.take();

        drop(gate);

        self.platform.request_stop();

        // Let an observer that's still running start a new session instead of waiting on us
        drop(lifecycle);

        let mut gate = self.shared.lock();
        while matches!(
            gate.delivering,
            Some((owner, _, generation)) if owner != me && generation <= stopped
        ) {
            gate = self.shared.wait(gate);
        }
        drop(gate);

        if let Some(session) = session {
            info!("Stopped location updates (session {session})");
        }
    }
}

impl<P: PlatformLocation> Drop for LocationAdapter<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

type LocationFn = Box<dyn Fn(Option<Location>) + Send + Sync>;
type AuthorizationFn = Box<dyn Fn(bool) + Send + Sync>;
type ErrorFn = Box<dyn Fn(PlatformError) + Send + Sync>;

/// Observer made of three plain callbacks
struct Callbacks {
    on_location: LocationFn,
    on_authorization: AuthorizationFn,
    on_error: ErrorFn,
}

impl LocationObserver for Callbacks {
    fn on_location(&self, location: Option<Location>) {
        (self.on_location)(location)
    }

    fn on_authorization(&self, granted: bool) {
        (self.on_authorization)(granted)
    }

    fn on_error(&self, error: PlatformError) {
        (self.on_error)(error)
    }
}

/// Builds a [LocationAdapter] out of three callbacks, all of which are required
#[derive(Default)]
pub struct LocationAdapterBuilder {
    on_location: Option<LocationFn>,
    on_authorization: Option<AuthorizationFn>,
    on_error: Option<ErrorFn>,
    interval: Option<Duration>,
}

impl LocationAdapterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_location(mut self, f: impl Fn(Option<Location>) + Send + Sync + 'static) -> Self {
        self.on_location = Some(Box::new(f));
        self
    }

    pub fn on_authorization(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_authorization = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(PlatformError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn build<P: PlatformLocation>(self, platform: P) -> Result<LocationAdapter<P>> {
        let callbacks = Callbacks {
            on_location: self
                .on_location
                .context("Location adapter needs a location callback")?,
            on_authorization: self
                .on_authorization
                .context("Location adapter needs an authorization callback")?,
            on_error: self
                .on_error
                .context("Location adapter needs an error callback")?,
        };

        Ok(LocationAdapter::new(platform, callbacks)
            .with_interval(self.interval.unwrap_or(DEFAULT_UPDATE_INTERVAL)))
    }
}
