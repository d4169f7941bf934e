use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use log::{debug, error, warn};
use tokio::{
    runtime::Handle,
    sync::broadcast::{self, error::RecvError},
};
use tokio_util::sync::CancellationToken;

use crate::{
    adapter::{LocationAdapter, LocationObserver},
    location::Location,
    platform::{PlatformError, PlatformLocation},
    settings::GeolocationSettings,
};

/// What a caller of [Geolocation] gets for every platform event
pub type PositionResult = Result<Location, GeolocationError>;

/// Stream of results handed out by [Geolocation::watch_position]
pub type PositionStream = BoxStream<'static, PositionResult>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeolocationError {
    #[error("Location is null")]
    NoFix,
    #[error("Location access denied")]
    AccessDenied,
    #[error("Location error: {0}")]
    Platform(PlatformError),
    #[error("Timed out waiting for a location fix")]
    Timeout,
    #[error("Location updates closed")]
    Closed,
}

const UPDATE_CAPACITY: usize = 16;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fan-out of adapter events to everyone watching
struct Feed {
    updates: broadcast::Sender<PositionResult>,
    /// Held while publishing so subscribing and replaying can't miss or repeat an update
    latest: Mutex<Option<PositionResult>>,
    last_fix: Mutex<Option<Location>>,
}

impl Feed {
    fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            updates,
            latest: Mutex::new(None),
            last_fix: Mutex::new(None),
        }
    }

    fn publish(&self, result: PositionResult) {
        let mut latest = lock(&self.latest);
        if let Ok(fix) = &result {
            *lock(&self.last_fix) = Some(*fix);
        }
        *latest = Some(result.clone());
        // No receivers is fine, the result is still kept as the latest
        self.updates.send(result).ok();
    }

    fn subscribe(&self) -> (broadcast::Receiver<PositionResult>, Option<PositionResult>) {
        let latest = lock(&self.latest);
        (self.updates.subscribe(), latest.clone())
    }

    fn last_fix(&self) -> Option<Location> {
        *lock(&self.last_fix)
    }
}

struct FeedObserver(Arc<Feed>);

impl LocationObserver for FeedObserver {
    fn on_location(&self, location: Option<Location>) {
        match location {
            Some(fix) => self.0.publish(Ok(fix)),
            None => {
                debug!("Platform has no location fix yet");
                self.0.publish(Err(GeolocationError::NoFix));
            }
        }
    }

    fn on_authorization(&self, granted: bool) {
        if granted {
            debug!("Location access granted");
        } else {
            warn!("Location access denied");
            self.0.publish(Err(GeolocationError::AccessDenied));
        }
    }

    fn on_error(&self, error: PlatformError) {
        error!("Location error: {error}");
        self.0.publish(Err(GeolocationError::Platform(error)));
    }
}

#[derive(Default)]
struct Watchers {
    count: usize,
    pending_stop: Option<CancellationToken>,
}

struct Inner<P: PlatformLocation> {
    adapter: LocationAdapter<P>,
    feed: Arc<Feed>,
    settings: GeolocationSettings,
    watchers: Mutex<Watchers>,
}

impl<P: PlatformLocation + 'static> Inner<P> {
    fn acquire(self: &Arc<Self>) -> Subscription<P> {
        let mut watchers = lock(&self.watchers);
        watchers.count += 1;
        if let Some(pending) = watchers.pending_stop.take() {
            debug!("Watcher came back, keeping location updates running");
            pending.cancel();
        }
        if watchers.count == 1 {
            self.adapter.start();
        }
        Subscription(self.clone())
    }

    fn release(self: &Arc<Self>) {
        let mut watchers = lock(&self.watchers);
        watchers.count = watchers.count.saturating_sub(1);
        if watchers.count > 0 {
            return;
        }

        let linger = self.settings.linger();

        match Handle::try_current() {
            Ok(handle) if !linger.is_zero() => {
                let token = CancellationToken::new();
                watchers.pending_stop = Some(token.clone());
                let inner = Arc::downgrade(self);
                handle.spawn(Self::stop_after(inner, token, linger));
            }
            _ => self.adapter.stop(),
        }
    }

    async fn stop_after(inner: Weak<Self>, token: CancellationToken, linger: std::time::Duration) {
        tokio::select! {
            biased;

            _ = token.cancelled() => {}

            _ = tokio::time::sleep(linger) => {
                if let Some(inner) = inner.upgrade() {
                    let mut watchers = lock(&inner.watchers);
                    if watchers.count == 0 && !token.is_cancelled() {
                        watchers.pending_stop = None;
                        debug!("No more watchers, stopping location updates");
                        inner.adapter.stop();
                    }
                }
            }
        }
    }
}

/// Keeps the platform running while alive
struct Subscription<P: PlatformLocation + 'static>(Arc<Inner<P>>);

impl<P: PlatformLocation + 'static> Drop for Subscription<P> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Async access to a platform location service.
///
/// All callers share one [LocationAdapter], it runs while someone is waiting on a position
/// and for a short while afterwards (see [GeolocationSettings::linger_ms]).
pub struct Geolocation<P: PlatformLocation + 'static> {
    inner: Arc<Inner<P>>,
}

impl<P: PlatformLocation + 'static> Clone for Geolocation<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: PlatformLocation + 'static> Geolocation<P> {
    pub fn new(platform: P, settings: GeolocationSettings) -> Self {
        let feed = Arc::new(Feed::new());
        let adapter = LocationAdapter::new(platform, FeedObserver(feed.clone()))
            .with_interval(settings.update_interval());
        Self {
            inner: Arc::new(Inner {
                adapter,
                feed,
                settings,
                watchers: Mutex::new(Watchers::default()),
            }),
        }
    }

    pub fn settings(&self) -> &GeolocationSettings {
        &self.inner.settings
    }

    pub fn is_running(&self) -> bool {
        self.inner.adapter.is_started()
    }

    /// The last fix the platform gave us, however old
    pub fn last_known(&self) -> Option<Location> {
        self.inner.feed.last_fix()
    }

    /// Get where we are now.
    ///
    /// Hands out the last fix if it's recent enough, otherwise waits for the platform. If the
    /// platform fails (or takes too long) a somewhat older fix is used as a fallback.
    pub async fn current_position(&self) -> PositionResult {
        let settings = &self.inner.settings;
        let now = Utc::now();

        if let Some(fix) = self
            .last_known()
            .filter(|fix| fix.age(now) < settings.max_cached_time())
        {
            debug!("Returning cached location");
            return Ok(fix);
        }

        let (mut rx, _) = self.inner.feed.subscribe();
        let subscription = self.inner.acquire();

        let res = tokio::time::timeout(settings.fix_timeout(), next_result(&mut rx))
            .await
            .unwrap_or(Err(GeolocationError::Timeout));

        drop(subscription);

        match res {
            Ok(fix) => Ok(fix),
            Err(why) => {
                let now = Utc::now();
                match self
                    .last_known()
                    .filter(|fix| fix.age(now) < settings.max_fallback_time())
                {
                    Some(fix) => {
                        warn!("No current location available ({why}), returning last known location");
                        Ok(fix)
                    }
                    None => {
                        warn!("No current location available and no recent fallback: {why}");
                        Err(why)
                    }
                }
            }
        }
    }

    /// Watch every update the platform reports.
    ///
    /// The first item is the most recent result, if there's been one. Location updates run
    /// as long as at least one returned stream is alive.
    pub fn watch_position(&self) -> PositionStream {
        let (rx, replay) = self.inner.feed.subscribe();
        let subscription = self.inner.acquire();

        let live = stream::unfold((rx, subscription), |(mut rx, subscription)| async move {
            match next_result(&mut rx).await {
                Err(GeolocationError::Closed) => None,
                res => Some((res, (rx, subscription))),
            }
        });

        stream::iter(replay).chain(live).boxed()
    }
}

async fn next_result(rx: &mut broadcast::Receiver<PositionResult>) -> PositionResult {
    loop {
        match rx.recv().await {
            Ok(res) => return res,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Location watcher fell behind, skipped {skipped} updates");
            }
            Err(RecvError::Closed) => return Err(GeolocationError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;
    use tokio::{task::yield_now, test};

    use super::*;
    use crate::{platform::PlatformEvent, tests::MockPlatform};

    type TestGeolocation = Geolocation<Arc<MockPlatform>>;

    fn mk_geolocation() -> (TestGeolocation, Arc<MockPlatform>) {
        tokio::time::pause();
        let platform = MockPlatform::new();
        let geo = Geolocation::new(platform.clone(), GeolocationSettings::default());
        (geo, platform)
    }

    fn fix_aged(secs: i64) -> Location {
        Location::new(42.0, -71.0).with_timestamp(Utc::now() - TimeDelta::seconds(secs))
    }

    /// Get the platform to remember `fix` as the last known location
    async fn seed_fix(geo: &TestGeolocation, platform: &MockPlatform, fix: Location) {
        let mut stream = geo.watch_position();
        assert!(platform.emit_fix(fix));
        assert_eq!(stream.next().await, Some(Ok(fix)));
    }

    #[test]
    async fn test_current_position_waits_for_fix() {
        let (geo, platform) = mk_geolocation();

        let task = tokio::spawn({
            let geo = geo.clone();
            async move { geo.current_position().await }
        });
        yield_now().await;

        assert_eq!(platform.starts(), 1);
        let fix = Location::new(1.0, 2.0);
        assert!(platform.emit_fix(fix));

        let res = task.await.expect("Task panicked");
        assert_eq!(res, Ok(fix));
        assert_eq!(geo.last_known(), Some(fix));
    }

    #[test]
    async fn test_current_position_uses_cache() {
        let (geo, platform) = mk_geolocation();
        let fix = fix_aged(5);
        seed_fix(&geo, &platform, fix).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!geo.is_running());

        let res = geo.current_position().await;
        assert_eq!(res, Ok(fix));
        assert_eq!(platform.starts(), 1, "Platform restarted despite a fresh cache");
    }

    #[test]
    async fn test_current_position_falls_back() {
        let (geo, platform) = mk_geolocation();
        let fix = fix_aged(45);
        seed_fix(&geo, &platform, fix).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let task = tokio::spawn({
            let geo = geo.clone();
            async move { geo.current_position().await }
        });
        yield_now().await;

        assert_eq!(platform.starts(), 2, "Stale cache didn't ask the platform");
        platform.emit(PlatformEvent::Error(PlatformError::new("kCLErrorDomain 0")));

        let res = task.await.expect("Task panicked");
        assert_eq!(res, Ok(fix));
    }

    #[test]
    async fn test_current_position_fallback_too_old() {
        let (geo, platform) = mk_geolocation();
        seed_fix(&geo, &platform, fix_aged(90)).await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let task = tokio::spawn({
            let geo = geo.clone();
            async move { geo.current_position().await }
        });
        yield_now().await;

        let err = PlatformError::new("kCLErrorDomain 1").with_code(1);
        platform.emit(PlatformEvent::Error(err.clone()));

        let res = task.await.expect("Task panicked");
        assert_eq!(res, Err(GeolocationError::Platform(err)));
    }

    #[test]
    async fn test_current_position_timeout() {
        let (geo, platform) = mk_geolocation();

        let res = geo.current_position().await;

        assert_eq!(res, Err(GeolocationError::Timeout));
        assert_eq!(platform.starts(), 1);
    }

    #[test]
    async fn test_watch_is_shared() {
        let (geo, platform) = mk_geolocation();

        let mut a = geo.watch_position();
        let mut b = geo.watch_position();
        assert_eq!(platform.starts(), 1, "Each watcher started the platform");

        let fix = Location::new(3.0, 4.0);
        platform.emit_fix(fix);

        assert_eq!(a.next().await, Some(Ok(fix)));
        assert_eq!(b.next().await, Some(Ok(fix)));

        drop(a);
        drop(b);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(geo.is_running(), "Stopped before the linger ran out");
        assert_eq!(platform.stops(), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!geo.is_running());
        assert_eq!(platform.stops(), 1);
    }

    #[test]
    async fn test_rewatch_during_linger() {
        let (geo, platform) = mk_geolocation();

        let stream = geo.watch_position();
        drop(stream);
        tokio::time::sleep(Duration::from_millis(500)).await;

        let _stream = geo.watch_position();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(geo.is_running());
        assert_eq!(platform.starts(), 1);
        assert_eq!(platform.stops(), 0);
    }

    #[test]
    async fn test_watch_replays_latest() {
        let (geo, platform) = mk_geolocation();

        let _first = geo.watch_position();
        let fix = Location::new(5.0, 6.0);
        platform.emit_fix(fix);

        let mut late = geo.watch_position();
        assert_eq!(late.next().await, Some(Ok(fix)));
    }

    #[test]
    async fn test_event_mapping() {
        let (geo, platform) = mk_geolocation();
        let mut stream = geo.watch_position();

        platform.emit(PlatformEvent::Authorization(true));
        platform.emit(PlatformEvent::Authorization(false));
        platform.emit(PlatformEvent::Location(None));

        assert_eq!(stream.next().await, Some(Err(GeolocationError::AccessDenied)));
        assert_eq!(stream.next().await, Some(Err(GeolocationError::NoFix)));
        assert_eq!(geo.last_known(), None);
    }

    #[test]
    async fn test_zero_linger_stops_immediately() {
        let platform = MockPlatform::new();
        let settings = GeolocationSettings {
            linger_ms: 0,
            ..Default::default()
        };
        let geo = Geolocation::new(platform.clone(), settings);

        let stream = geo.watch_position();
        assert!(geo.is_running());
        drop(stream);

        assert!(!geo.is_running());
        assert_eq!(platform.stops(), 1);
    }

    #[test]
    async fn test_update_interval_reaches_platform() {
        let platform = MockPlatform::new();
        let settings = GeolocationSettings {
            update_interval_ms: 250,
            ..Default::default()
        };
        let geo = Geolocation::new(platform.clone(), settings);

        let _stream = geo.watch_position();

        assert_eq!(platform.interval(), Some(Duration::from_millis(250)));
    }
}
