//! Periodic weather refresh for the current location.

use std::sync::Arc;
use std::time::Duration;

use nimbus_core::Config;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::engine::WeatherRetrievalEngine;
use crate::types::{GeoCoordinate, WeatherError, WeatherSnapshot};

/// Receives the outcome of every scheduled refresh.
pub type RefreshSink = Arc<dyn Fn(Result<WeatherSnapshot, WeatherError>) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub interval: Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

impl From<&Config> for RefreshSettings {
    fn from(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.refresh.interval_secs),
        }
    }
}

struct RunningLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Cancellable refresh loop.
///
/// Every `interval`, and immediately whenever the network becomes usable
/// again, the current location (if any) is fetched through the engine and the
/// outcome handed to the sink.
///
/// The sink is invoked while holding a delivery lock that `stop` also takes,
/// so once `stop` returns no further results are delivered. The sink must not
/// call back into the scheduler.
pub struct RefreshScheduler {
    engine: WeatherRetrievalEngine,
    location: watch::Receiver<Option<GeoCoordinate>>,
    network: Option<watch::Receiver<bool>>,
    settings: RefreshSettings,
    sink: RefreshSink,
    delivery: Arc<Mutex<()>>,
    running: Mutex<Option<RunningLoop>>,
}

impl std::fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("settings", &self.settings)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl RefreshScheduler {
    pub fn new(
        engine: WeatherRetrievalEngine,
        location: watch::Receiver<Option<GeoCoordinate>>,
        settings: RefreshSettings,
        sink: RefreshSink,
    ) -> Self {
        Self {
            engine,
            location,
            network: None,
            settings,
            sink,
            delivery: Arc::new(Mutex::new(())),
            running: Mutex::new(None),
        }
    }

    /// Also refresh as soon as this flag goes from false to true.
    pub fn with_network(mut self, network: watch::Receiver<bool>) -> Self {
        self.network = Some(network);
        self
    }

    /// Start the loop, replacing any loop already running. Must be called
    /// within a Tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if let Some(previous) = running.take() {
            self.halt(previous);
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.engine.clone(),
            self.location.clone(),
            self.network.clone(),
            self.settings.interval,
            Arc::clone(&self.sink),
            Arc::clone(&self.delivery),
            token.clone(),
        ));

        *running = Some(RunningLoop { token, handle });
        tracing::info!(
            "Auto-refresh started ({}s interval)",
            self.settings.interval.as_secs()
        );
    }

    /// Cancel the loop. Blocks until a delivery already in progress has
    /// finished.
    pub fn stop(&self) {
        let previous = self.running.lock().take();
        if let Some(previous) = previous {
            self.halt(previous);
            tracing::info!("Auto-refresh stopped");
        }
    }

    fn halt(&self, previous: RunningLoop) {
        previous.token.cancel();
        previous.handle.abort();
        // Wait out an in-flight sink call; later ones see the cancelled token
        drop(self.delivery.lock());
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn network_change(network: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    match network {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

async fn run_loop(
    engine: WeatherRetrievalEngine,
    location: watch::Receiver<Option<GeoCoordinate>>,
    mut network: Option<watch::Receiver<bool>>,
    interval: Duration,
    sink: RefreshSink,
    delivery: Arc<Mutex<()>>,
    token: CancellationToken,
) {
    // interval_at() panics on a zero period
    let interval = interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut online = network
        .as_mut()
        .map(|rx| *rx.borrow_and_update())
        .unwrap_or(true);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
            change = network_change(&mut network) => match change {
                Some(usable) => {
                    let recovered = usable && !online;
                    online = usable;
                    if !recovered {
                        continue;
                    }
                    tracing::info!("Network recovered; refreshing weather");
                }
                None => {
                    network = None;
                    continue;
                }
            },
        }

        let current = location.borrow().clone();
        let Some(coord) = current else {
            tracing::debug!("No current location; skipping refresh");
            continue;
        };

        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = engine.fetch_by_coordinate(&coord) => result,
        };

        if let Err(e) = &result {
            tracing::warn!("Scheduled refresh for {} failed: {}", coord, e);
        }
        {
            let _delivering = delivery.lock();
            if token.is_cancelled() {
                break;
            }
            sink(result);
        }
    }

    tracing::debug!("Refresh loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::WeatherCache;
    use crate::testing::{weather_body, FakeApi, FakeResponse};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Harness {
        api: Arc<FakeApi>,
        location: watch::Sender<Option<GeoCoordinate>>,
        network: watch::Sender<bool>,
        delivered: Arc<AtomicUsize>,
        scheduler: RefreshScheduler,
    }

    fn harness(responses: usize) -> Harness {
        let api = Arc::new(FakeApi::new(
            (0..responses)
                .map(|i| FakeResponse::Body(weather_body("Berlin", 10.0 + i as f64)))
                .collect(),
        ));
        // Zero TTL so every tick reaches the client
        let cache = Arc::new(WeatherCache::new(Duration::ZERO));
        let engine = WeatherRetrievalEngine::with_cache(api.clone(), cache);

        let (location, location_rx) = watch::channel(None);
        let (network, network_rx) = watch::channel(true);
        let delivered = Arc::new(AtomicUsize::new(0));
        let sink: RefreshSink = {
            let delivered = delivered.clone();
            Arc::new(move |_: Result<WeatherSnapshot, WeatherError>| {
                delivered.fetch_add(1, Ordering::SeqCst);
            })
        };

        let scheduler =
            RefreshScheduler::new(engine, location_rx, RefreshSettings::default(), sink)
                .with_network(network_rx);

        Harness {
            api,
            location,
            network,
            delivered,
            scheduler,
        }
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_every_interval() {
        let h = harness(10);
        h.location.send_replace(Some(GeoCoordinate::new(52.52, 13.4)));
        h.scheduler.start();

        advance(59).await;
        assert_eq!(h.api.calls(), 0);

        advance(2).await;
        assert_eq!(h.api.calls(), 1);

        advance(60).await;
        assert_eq!(h.api.calls(), 2);
        assert_eq!(h.delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_location_no_fetch() {
        let h = harness(10);
        h.scheduler.start();

        advance(180).await;
        assert_eq!(h.api.calls(), 0);
        assert_eq!(h.delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_loop() {
        let h = harness(10);
        h.location.send_replace(Some(GeoCoordinate::new(52.52, 13.4)));

        h.scheduler.start();
        advance(30).await;
        h.scheduler.start();

        // The first loop would have fired at 60s
        advance(40).await;
        assert_eq!(h.api.calls(), 0);

        advance(21).await;
        assert_eq!(h.api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_loop() {
        let h = harness(10);
        h.location.send_replace(Some(GeoCoordinate::new(52.52, 13.4)));

        h.scheduler.start();
        advance(61).await;
        h.scheduler.stop();
        assert!(!h.scheduler.is_running());

        advance(600).await;
        assert_eq!(h.api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_recovery_triggers_refresh() {
        let h = harness(10);
        h.location.send_replace(Some(GeoCoordinate::new(52.52, 13.4)));
        h.scheduler.start();

        h.network.send_replace(false);
        advance(1).await;
        assert_eq!(h.api.calls(), 0);

        h.network.send_replace(true);
        advance(1).await;
        assert_eq!(h.api.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_location_change_is_followed() {
        let h = harness(10);
        h.location.send_replace(Some(GeoCoordinate::new(52.52, 13.4)));
        h.scheduler.start();
        advance(61).await;

        h.location.send_replace(Some(GeoCoordinate::new(48.85, 2.35)));
        advance(60).await;

        assert_eq!(
            h.api.coordinates(),
            vec![GeoCoordinate::new(52.52, 13.4), GeoCoordinate::new(48.85, 2.35)]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_waits_for_in_flight_delivery() {
        let api = Arc::new(FakeApi::new(
            (0..50)
                .map(|i| FakeResponse::Body(weather_body("Berlin", i as f64)))
                .collect(),
        ));
        let engine =
            WeatherRetrievalEngine::with_cache(api, Arc::new(WeatherCache::new(Duration::ZERO)));
        let (_location, location_rx) = watch::channel(Some(GeoCoordinate::new(52.52, 13.4)));

        let entered = Arc::new(AtomicBool::new(false));
        let delivered = Arc::new(AtomicUsize::new(0));
        let sink: RefreshSink = {
            let entered = entered.clone();
            let delivered = delivered.clone();
            Arc::new(move |_: Result<WeatherSnapshot, WeatherError>| {
                entered.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                delivered.fetch_add(1, Ordering::SeqCst);
            })
        };

        let scheduler = RefreshScheduler::new(
            engine,
            location_rx,
            RefreshSettings {
                interval: Duration::from_millis(10),
            },
            sink,
        );
        scheduler.start();

        for _ in 0..1000 {
            if entered.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(entered.load(Ordering::SeqCst));

        scheduler.stop();
        let after_stop = delivered.load(Ordering::SeqCst);
        assert!(after_stop >= 1, "stop returned while a delivery was running");

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), after_stop);
    }
}
