//! Location resolution: one-shot fixes, reverse geocoding, continuous tracking.
//!
//! Every live-update registration is owned by a [`Subscription`] guard. The
//! guard unsubscribes when dropped, so a fix, a timeout and cancellation of
//! the awaiting task all release the registration exactly once.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_core::Config;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::geocode::{Address, ReverseGeocoder};
use crate::types::{GeoCoordinate, LocationError, WeatherError};

#[derive(Debug, Clone)]
pub struct LocationSettings {
    /// Upper bound on waiting for a live fix
    pub fix_timeout: Duration,
    /// Fastest rate at which a source may deliver fixes
    pub min_update_interval: Duration,
    /// Preferred update rate while tracking
    pub update_interval: Duration,
}

impl Default for LocationSettings {
    fn default() -> Self {
        Self {
            fix_timeout: Duration::from_secs(30),
            min_update_interval: Duration::from_secs(5),
            update_interval: Duration::from_secs(10),
        }
    }
}

impl From<&Config> for LocationSettings {
    fn from(config: &Config) -> Self {
        Self {
            fix_timeout: Duration::from_secs(config.location.fix_timeout_secs),
            min_update_interval: Duration::from_secs(config.location.min_update_interval_secs),
            update_interval: Duration::from_secs(config.location.update_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accuracy {
    High,
    Balanced,
}

/// Parameters for a live-update registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateRequest {
    pub accuracy: Accuracy,
    pub interval: Duration,
    pub min_interval: Duration,
}

impl UpdateRequest {
    fn from_settings(settings: &LocationSettings) -> Self {
        Self {
            accuracy: Accuracy::High,
            interval: settings.update_interval,
            min_interval: settings.min_update_interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Platform position service.
///
/// `subscribe` and `unsubscribe` are synchronous so that a registration can be
/// released from `Drop`.
#[async_trait]
pub trait PositionSource: Send + Sync {
    /// Cached position, if the platform has one.
    async fn last_known(&self) -> Result<Option<GeoCoordinate>, LocationError>;

    /// Start delivering fixes into `sink` until unsubscribed.
    fn subscribe(
        &self,
        request: UpdateRequest,
        sink: mpsc::Sender<GeoCoordinate>,
    ) -> Result<SubscriptionId, LocationError>;

    fn unsubscribe(&self, id: SubscriptionId);
}

/// Live-update registration, released on drop.
struct Subscription {
    source: Arc<dyn PositionSource>,
    id: SubscriptionId,
}

impl Subscription {
    fn open(
        source: &Arc<dyn PositionSource>,
        request: UpdateRequest,
        sink: mpsc::Sender<GeoCoordinate>,
    ) -> Result<Self, LocationError> {
        let id = source.subscribe(request, sink)?;
        tracing::debug!("Opened location subscription {:?}", id);
        Ok(Self {
            source: Arc::clone(source),
            id,
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        tracing::debug!("Releasing location subscription {:?}", self.id);
        self.source.unsubscribe(self.id);
    }
}

/// Progress of the most recent `get_current_location` call.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationState {
    Idle,
    RequestingLastKnown,
    RequestingLive,
    Resolved(GeoCoordinate),
    TimedOut,
}

impl LocationState {
    fn is_pending(&self) -> bool {
        matches!(self, Self::RequestingLastKnown | Self::RequestingLive)
    }
}

/// Returns the state to `Idle` if a request ends without settling it,
/// including when the awaiting future is dropped.
struct PendingRequest<'a> {
    state: &'a watch::Sender<LocationState>,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.state.send_if_modified(|state| {
            if state.is_pending() {
                *state = LocationState::Idle;
                true
            } else {
                false
            }
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&GeoCoordinate) + Send + Sync>;
type ListenerList = Arc<RwLock<Vec<(ListenerId, Listener)>>>;

/// Running tracking session. Field order matters: the loop is cancelled
/// before the registration is released.
struct Tracking {
    generation: u64,
    _cancel: DropGuard,
    _subscription: Subscription,
}

type TrackingSlot = Arc<Mutex<Option<Tracking>>>;

pub struct LocationProvider {
    source: Arc<dyn PositionSource>,
    geocoder: Arc<dyn ReverseGeocoder>,
    settings: LocationSettings,
    state: watch::Sender<LocationState>,
    current: Arc<watch::Sender<Option<GeoCoordinate>>>,
    listeners: ListenerList,
    next_listener: AtomicU64,
    tracking: TrackingSlot,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for LocationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationProvider")
            .field("settings", &self.settings)
            .field("state", &*self.state.borrow())
            .field("tracking", &self.is_tracking())
            .finish_non_exhaustive()
    }
}

impl LocationProvider {
    pub fn new(
        source: Arc<dyn PositionSource>,
        geocoder: Arc<dyn ReverseGeocoder>,
        settings: LocationSettings,
    ) -> Self {
        let (state, _) = watch::channel(LocationState::Idle);
        let (current, _) = watch::channel(None);
        Self {
            source,
            geocoder,
            settings,
            state,
            current: Arc::new(current),
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_listener: AtomicU64::new(1),
            tracking: Arc::new(Mutex::new(None)),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &LocationSettings {
        &self.settings
    }

    pub fn state(&self) -> watch::Receiver<LocationState> {
        self.state.subscribe()
    }

    /// Most recently known position, from any fix, tracking update or
    /// explicit `set_current`.
    pub fn current(&self) -> watch::Receiver<Option<GeoCoordinate>> {
        self.current.subscribe()
    }

    pub fn set_current(&self, coord: GeoCoordinate) {
        self.current.send_replace(Some(coord));
    }

    /// Resolve the device position.
    ///
    /// Tries the last known position first, then waits for the first live fix
    /// for at most `fix_timeout`. Dropping the returned future releases any
    /// live registration immediately.
    pub async fn get_current_location(&self) -> Result<GeoCoordinate, WeatherError> {
        self.state.send_replace(LocationState::RequestingLastKnown);
        let _pending = PendingRequest { state: &self.state };

        match self.source.last_known().await {
            Ok(Some(coord)) => {
                tracing::info!("Using last known position {}", coord);
                return Ok(self.resolve(coord));
            }
            Ok(None) => tracing::debug!("No last known position"),
            Err(LocationError::PermissionDenied) => {
                return Err(LocationError::PermissionDenied.into());
            }
            Err(e) => tracing::debug!("Last known position unavailable: {}", e),
        }

        self.state.send_replace(LocationState::RequestingLive);

        let (tx, mut rx) = mpsc::channel(1);
        let subscription =
            Subscription::open(&self.source, UpdateRequest::from_settings(&self.settings), tx)?;

        let outcome = tokio::time::timeout(self.settings.fix_timeout, rx.recv()).await;
        drop(subscription);

        match outcome {
            Ok(Some(coord)) => {
                tracing::info!("Received live position {}", coord);
                Ok(self.resolve(coord))
            }
            Ok(None) => {
                tracing::warn!("Position source closed the live-update channel");
                Err(LocationError::NoFix.into())
            }
            Err(_) => {
                tracing::warn!(
                    "No position fix within {}s",
                    self.settings.fix_timeout.as_secs()
                );
                self.state.send_replace(LocationState::TimedOut);
                Err(LocationError::Timeout.into())
            }
        }
    }

    /// Reverse-geocode `coord` to a place name.
    pub async fn get_city_name(&self, coord: &GeoCoordinate) -> Result<String, WeatherError> {
        let addresses = self.geocoder.reverse(coord).await?;

        addresses
            .iter()
            .find_map(Address::place_name)
            .map(|name| {
                tracing::info!("Reverse geocoded {} to {}", coord, name);
                name.to_string()
            })
            .ok_or_else(|| {
                LocationError::Geocoding(format!("no place name for {}", coord)).into()
            })
    }

    /// Begin pushing position updates to listeners. Restarts tracking if it
    /// is already running. Must be called within a Tokio runtime.
    pub fn start_tracking(&self) -> Result<(), WeatherError> {
        let mut tracking = self.tracking.lock();
        // Release the previous registration before opening a new one
        tracking.take();

        let (tx, mut rx) = mpsc::channel(16);
        let subscription =
            Subscription::open(&self.source, UpdateRequest::from_settings(&self.settings), tx)?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let listeners = Arc::clone(&self.listeners);
        let current = Arc::clone(&self.current);
        let slot = Arc::clone(&self.tracking);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    fix = rx.recv() => match fix {
                        Some(coord) => {
                            current.send_replace(Some(coord.clone()));
                            notify_listeners(&listeners, &coord);
                        }
                        None => {
                            tracing::warn!("Position source closed the tracking channel");
                            end_session(&slot, generation);
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Location tracking loop exited");
        });

        *tracking = Some(Tracking {
            generation,
            _cancel: token.drop_guard(),
            _subscription: subscription,
        });
        tracing::info!("Location tracking started");
        Ok(())
    }

    pub fn stop_tracking(&self) {
        if self.tracking.lock().take().is_some() {
            tracing::info!("Location tracking stopped");
        }
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.lock().is_some()
    }

    pub fn add_listener(
        &self,
        listener: impl Fn(&GeoCoordinate) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn resolve(&self, coord: GeoCoordinate) -> GeoCoordinate {
        self.current.send_replace(Some(coord.clone()));
        self.state.send_replace(LocationState::Resolved(coord.clone()));
        coord
    }
}

/// Clear the tracking slot if it still holds session `generation`.
fn end_session(slot: &TrackingSlot, generation: u64) {
    let ended = {
        let mut tracking = slot.lock();
        match tracking.as_ref() {
            Some(session) if session.generation == generation => tracking.take(),
            _ => None,
        }
    };
    if ended.is_some() {
        tracing::info!("Location tracking ended by the position source");
    }
}

/// Call every listener with `coord`. A panicking listener is logged and
/// skipped; the rest still run.
fn notify_listeners(listeners: &ListenerList, coord: &GeoCoordinate) {
    let snapshot: Vec<_> = listeners.read().clone();
    for (id, listener) in snapshot {
        if panic::catch_unwind(AssertUnwindSafe(|| listener(coord))).is_err() {
            tracing::error!("Location listener {:?} panicked", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeGeocoder, FakePositionSource};

    fn provider(source: Arc<FakePositionSource>, geocoder: FakeGeocoder) -> Arc<LocationProvider> {
        Arc::new(LocationProvider::new(
            source,
            Arc::new(geocoder),
            LocationSettings::default(),
        ))
    }

    async fn wait_for_subscribers(source: &FakePositionSource, count: usize) {
        for _ in 0..100 {
            if source.active() == count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {} active subscriptions, found {}", count, source.active());
    }

    #[tokio::test]
    async fn test_last_known_skips_live_request() {
        let source = Arc::new(FakePositionSource::with_last_known(GeoCoordinate::new(52.52, 13.4)));
        let provider = provider(source.clone(), FakeGeocoder::empty());

        let coord = provider.get_current_location().await.unwrap();

        assert_eq!(coord, GeoCoordinate::new(52.52, 13.4));
        assert_eq!(source.subscribe_calls(), 0);
        assert_eq!(*provider.current().borrow(), Some(coord.clone()));
        assert_eq!(*provider.state().borrow(), LocationState::Resolved(coord));
    }

    #[tokio::test]
    async fn test_first_live_fix_resolves_and_unsubscribes() {
        let source = Arc::new(FakePositionSource::default());
        let provider = provider(source.clone(), FakeGeocoder::empty());

        let task = tokio::spawn({
            let provider = provider.clone();
            async move { provider.get_current_location().await }
        });

        wait_for_subscribers(&source, 1).await;
        assert_eq!(*provider.state().borrow(), LocationState::RequestingLive);
        assert_eq!(source.requests()[0].accuracy, Accuracy::High);
        assert_eq!(source.requests()[0].min_interval, Duration::from_secs(5));

        assert_eq!(source.push_fix(GeoCoordinate::new(48.85, 2.35)), 1);
        let coord = task.await.unwrap().unwrap();

        assert_eq!(coord, GeoCoordinate::new(48.85, 2.35));
        assert_eq!(source.active(), 0);
        assert_eq!(source.unsubscribe_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_request_times_out() {
        let source = Arc::new(FakePositionSource::default());
        let provider = provider(source.clone(), FakeGeocoder::empty());

        let started = tokio::time::Instant::now();
        let err = provider.get_current_location().await.unwrap_err();

        assert!(matches!(err, WeatherError::Location(LocationError::Timeout)));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(source.active(), 0);
        assert_eq!(*provider.state().borrow(), LocationState::TimedOut);
    }

    #[tokio::test]
    async fn test_cancellation_releases_subscription() {
        let source = Arc::new(FakePositionSource::default());
        let provider = provider(source.clone(), FakeGeocoder::empty());

        let task = tokio::spawn({
            let provider = provider.clone();
            async move { provider.get_current_location().await }
        });

        wait_for_subscribers(&source, 1).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert_eq!(source.active(), 0);
        assert_eq!(source.unsubscribe_calls(), 1);
        // Nobody is listening any more
        assert_eq!(source.push_fix(GeoCoordinate::new(1.0, 1.0)), 0);
    }

    #[tokio::test]
    async fn test_cancelled_request_returns_to_idle() {
        let source = Arc::new(FakePositionSource::default());
        let provider = provider(source.clone(), FakeGeocoder::empty());

        let task = tokio::spawn({
            let provider = provider.clone();
            async move { provider.get_current_location().await }
        });

        wait_for_subscribers(&source, 1).await;
        assert_eq!(*provider.state().borrow(), LocationState::RequestingLive);

        task.abort();
        let _ = task.await;
        assert_eq!(*provider.state().borrow(), LocationState::Idle);
    }

    #[tokio::test]
    async fn test_closed_live_channel_is_no_fix() {
        let source = Arc::new(FakePositionSource::default());
        let provider = provider(source.clone(), FakeGeocoder::empty());

        let task = tokio::spawn({
            let provider = provider.clone();
            async move { provider.get_current_location().await }
        });

        wait_for_subscribers(&source, 1).await;
        source.close_all();
        let err = task.await.unwrap().unwrap_err();

        assert!(matches!(err, WeatherError::Location(LocationError::NoFix)));
        assert_eq!(*provider.state().borrow(), LocationState::Idle);
        assert_eq!(source.unsubscribe_calls(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_is_surfaced() {
        let source = Arc::new(FakePositionSource::denied());
        let provider = provider(source.clone(), FakeGeocoder::empty());

        let err = provider.get_current_location().await.unwrap_err();

        assert!(matches!(
            err,
            WeatherError::Location(LocationError::PermissionDenied)
        ));
        assert_eq!(source.subscribe_calls(), 0);
    }

    #[tokio::test]
    async fn test_city_name_uses_first_candidate_with_a_name() {
        let geocoder = FakeGeocoder::with(vec![
            Address::default(),
            Address {
                sub_admin_area: Some("King County".to_string()),
                sub_locality: Some("Belltown".to_string()),
                ..Address::default()
            },
        ]);
        let provider = provider(Arc::new(FakePositionSource::default()), geocoder);

        let name = provider
            .get_city_name(&GeoCoordinate::new(47.6, -122.3))
            .await
            .unwrap();
        assert_eq!(name, "King County");
    }

    #[tokio::test]
    async fn test_city_name_without_candidates_is_location_error() {
        let provider = provider(Arc::new(FakePositionSource::default()), FakeGeocoder::empty());

        let err = provider
            .get_city_name(&GeoCoordinate::new(0.0, 0.0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WeatherError::Location(LocationError::Geocoding(_))
        ));
    }

    #[tokio::test]
    async fn test_tracking_isolates_panicking_listener() {
        let source = Arc::new(FakePositionSource::default());
        let provider = provider(source.clone(), FakeGeocoder::empty());

        let seen = Arc::new(Mutex::new(Vec::new()));
        provider.add_listener(|_| panic!("listener failure"));
        provider.add_listener({
            let seen = seen.clone();
            move |coord: &GeoCoordinate| seen.lock().push(coord.clone())
        });

        provider.start_tracking().unwrap();
        assert_eq!(source.active(), 1);

        source.push_fix(GeoCoordinate::new(1.0, 1.0));
        for _ in 0..100 {
            if !seen.lock().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        source.push_fix(GeoCoordinate::new(2.0, 2.0));
        for _ in 0..100 {
            if seen.lock().len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(
            *seen.lock(),
            vec![GeoCoordinate::new(1.0, 1.0), GeoCoordinate::new(2.0, 2.0)]
        );
        assert_eq!(*provider.current().borrow(), Some(GeoCoordinate::new(2.0, 2.0)));

        provider.stop_tracking();
        assert!(!provider.is_tracking());
        assert_eq!(source.active(), 0);
    }

    #[tokio::test]
    async fn test_restart_tracking_keeps_single_subscription() {
        let source = Arc::new(FakePositionSource::default());
        let provider = provider(source.clone(), FakeGeocoder::empty());

        provider.start_tracking().unwrap();
        provider.start_tracking().unwrap();

        assert_eq!(source.active(), 1);
        assert_eq!(source.subscribe_calls(), 2);
    }

    #[tokio::test]
    async fn test_tracking_ends_when_source_closes_channel() {
        let source = Arc::new(FakePositionSource::default());
        let provider = provider(source.clone(), FakeGeocoder::empty());

        provider.start_tracking().unwrap();
        assert!(provider.is_tracking());

        source.close_all();
        for _ in 0..100 {
            if !provider.is_tracking() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(!provider.is_tracking());
        assert_eq!(source.unsubscribe_calls(), 1);

        // A fresh session can be started afterwards
        provider.start_tracking().unwrap();
        assert!(provider.is_tracking());
        assert_eq!(source.active(), 1);
    }

    #[test]
    fn test_remove_listener() {
        let provider = provider(Arc::new(FakePositionSource::default()), FakeGeocoder::empty());
        let id = provider.add_listener(|_| {});
        assert!(provider.remove_listener(id));
        assert!(!provider.remove_listener(id));
    }
}
