//! Weather service facade for the presentation layer.
//!
//! Owns the engine, location provider, refresh scheduler and connectivity
//! probe, and publishes tri-state values for weather, location and city name.
//! Network work runs on the Tokio runtime; the watch values are the only
//! shared state observers see.

use std::sync::Arc;

use nimbus_core::Config;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::client::{ClientSettings, Forecast, WeatherClient};
use crate::engine::{EngineSettings, WeatherRetrievalEngine};
use crate::geocode::NominatimGeocoder;
use crate::location::{LocationProvider, LocationSettings, PositionSource};
use crate::network::{ConnectivityProbe, NetworkMonitor, ProbeSettings};
use crate::position::{FixedPositionSource, GeoIpPositionSource};
use crate::refresh::{RefreshScheduler, RefreshSettings, RefreshSink};
use crate::state::UiState;
use crate::types::{GeoCoordinate, WeatherError, WeatherSnapshot};

pub const EMPTY_CITY_MESSAGE: &str = "City name cannot be empty";

pub struct WeatherService {
    engine: WeatherRetrievalEngine,
    location: Arc<LocationProvider>,
    network: Option<Arc<NetworkMonitor>>,
    scheduler: RefreshScheduler,
    weather: Arc<watch::Sender<UiState<WeatherSnapshot>>>,
    location_state: watch::Sender<UiState<GeoCoordinate>>,
    city_name: watch::Sender<UiState<String>>,
    probe: Mutex<Option<DropGuard>>,
}

impl std::fmt::Debug for WeatherService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherService")
            .field("engine", &self.engine)
            .field("location", &self.location)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl WeatherService {
    pub fn new(
        engine: WeatherRetrievalEngine,
        location: Arc<LocationProvider>,
        network: Option<Arc<NetworkMonitor>>,
        refresh: RefreshSettings,
    ) -> Self {
        let (weather, _) = watch::channel(UiState::Loading);
        let weather = Arc::new(weather);
        let (location_state, _) = watch::channel(UiState::Loading);
        let (city_name, _) = watch::channel(UiState::Loading);

        let sink: RefreshSink = {
            let weather = Arc::clone(&weather);
            Arc::new(move |result: Result<WeatherSnapshot, WeatherError>| {
                weather.send_replace(UiState::from(result));
            })
        };

        let mut scheduler = RefreshScheduler::new(engine.clone(), location.current(), refresh, sink);
        if let Some(monitor) = &network {
            scheduler = scheduler.with_network(monitor.watch());
        }

        Self {
            engine,
            location,
            network,
            scheduler,
            weather,
            location_state,
            city_name,
            probe: Mutex::new(None),
        }
    }

    /// Build the production stack from configuration and start the
    /// connectivity probe. Must be called within a Tokio runtime.
    pub fn from_config(config: &Config) -> Result<Self, WeatherError> {
        let client = WeatherClient::new(ClientSettings::from(config))?;
        let engine = WeatherRetrievalEngine::new(Arc::new(client), EngineSettings::from(config));

        let source: Arc<dyn PositionSource> = match FixedPositionSource::from_config(config) {
            Some(fixed) => {
                tracing::info!("Using configured position");
                Arc::new(fixed)
            }
            None => Arc::new(GeoIpPositionSource::from_config(config)?),
        };
        let geocoder = NominatimGeocoder::from_config(config)?;
        let location = Arc::new(LocationProvider::new(
            source,
            Arc::new(geocoder),
            LocationSettings::from(config),
        ));

        let monitor = Arc::new(NetworkMonitor::default());
        let probe = ConnectivityProbe::new(ProbeSettings::from(config))
            .map_err(WeatherError::unknown)?;

        let service = Self::new(
            engine,
            location,
            Some(Arc::clone(&monitor)),
            RefreshSettings::from(config),
        );

        let token = CancellationToken::new();
        probe.spawn(monitor, token.clone());
        *service.probe.lock() = Some(token.drop_guard());

        Ok(service)
    }

    pub fn weather(&self) -> watch::Receiver<UiState<WeatherSnapshot>> {
        self.weather.subscribe()
    }

    pub fn location_state(&self) -> watch::Receiver<UiState<GeoCoordinate>> {
        self.location_state.subscribe()
    }

    pub fn city_name(&self) -> watch::Receiver<UiState<String>> {
        self.city_name.subscribe()
    }

    pub fn engine(&self) -> &WeatherRetrievalEngine {
        &self.engine
    }

    pub fn location(&self) -> &LocationProvider {
        &self.location
    }

    pub fn network(&self) -> Option<&NetworkMonitor> {
        self.network.as_deref()
    }

    /// Fetch weather for `coord` and make it the location auto-refresh follows.
    pub async fn fetch_by_coordinate(&self, coord: GeoCoordinate) -> UiState<WeatherSnapshot> {
        self.weather.send_replace(UiState::Loading);
        self.location.set_current(coord.clone());

        let state = UiState::from(self.engine.fetch_by_coordinate(&coord).await);
        self.weather.send_replace(state.clone());
        state
    }

    /// Fetch weather for a city. Blank input is rejected without a request.
    pub async fn fetch_by_city(&self, city: &str) -> UiState<WeatherSnapshot> {
        if city.trim().is_empty() {
            let state = UiState::Error(EMPTY_CITY_MESSAGE.to_string());
            self.weather.send_replace(state.clone());
            return state;
        }

        self.weather.send_replace(UiState::Loading);

        let result = self.engine.fetch_by_city(city).await;
        if let Ok(snapshot) = &result {
            self.city_name
                .send_replace(UiState::Success(snapshot.city_name.clone()));
            if let Some(coord) = &snapshot.coordinate {
                self.location.set_current(coord.clone());
                self.location_state
                    .send_replace(UiState::Success(coord.clone()));
            }
        }

        let state = UiState::from(result);
        self.weather.send_replace(state.clone());
        state
    }

    /// Resolve the device position, name it, then fetch its weather.
    ///
    /// A geocoding failure is not fatal; the city name falls back to the
    /// coordinate text.
    pub async fn fetch_current_location(&self) -> UiState<WeatherSnapshot> {
        self.location_state.send_replace(UiState::Loading);
        self.weather.send_replace(UiState::Loading);

        let coord = match self.location.get_current_location().await {
            Ok(coord) => coord,
            Err(e) => {
                tracing::error!("Could not resolve current location: {}", e);
                let message = e.user_message();
                self.location_state
                    .send_replace(UiState::Error(message.clone()));
                let state = UiState::Error(message);
                self.weather.send_replace(state.clone());
                return state;
            }
        };
        self.location_state
            .send_replace(UiState::Success(coord.clone()));

        self.city_name.send_replace(UiState::Loading);
        let name = match self.location.get_city_name(&coord).await {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!("Reverse geocoding failed, using coordinates: {}", e);
                coord.display_fallback()
            }
        };
        self.city_name.send_replace(UiState::Success(name.clone()));

        self.fetch_by_coordinate(GeoCoordinate::named(coord.latitude, coord.longitude, name))
            .await
    }

    /// Forecast for the current location, if one is known.
    pub async fn forecast(&self) -> Option<Result<Forecast, WeatherError>> {
        let current = self.location.current().borrow().clone();
        match current {
            Some(coord) => Some(self.engine.forecast_by_coordinate(&coord).await),
            None => None,
        }
    }

    pub fn start_auto_refresh(&self) {
        self.scheduler.start();
    }

    pub fn stop_auto_refresh(&self) {
        self.scheduler.stop();
    }

    pub fn is_auto_refreshing(&self) -> bool {
        self.scheduler.is_running()
    }

    pub fn clear_cache(&self) {
        self.engine.clear_cache();
    }

    /// Stop every background task. Safe to call more than once.
    pub fn shutdown(&self) {
        self.scheduler.stop();
        self.location.stop_tracking();
        if self.probe.lock().take().is_some() {
            tracing::debug!("Connectivity probe cancelled");
        }
        tracing::info!("Weather service shut down");
    }
}

impl Drop for WeatherService {
    fn drop(&mut self) {
        self.scheduler.stop();
        self.location.stop_tracking();
    }
}
