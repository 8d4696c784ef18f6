//! In-crate fakes for the platform and API traits.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use nimbus_core::NetworkError;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::client::{classify_status, Forecast, Lookup, WeatherApi};
use crate::geocode::{Address, ReverseGeocoder};
use crate::location::{PositionSource, SubscriptionId, UpdateRequest};
use crate::parse::parse_current;
use crate::types::{GeoCoordinate, LocationError, WeatherError, WeatherSnapshot};

/// Current-weather body as the API would return it, located in Berlin.
pub(crate) fn weather_body(name: &str, temperature: f64) -> Value {
    json!({
        "coord": {"lon": 13.41, "lat": 52.52},
        "weather": [{"id": 800, "main": "Clear", "description": "clear sky", "icon": "01d"}],
        "main": {
            "temp": temperature, "feels_like": temperature - 0.5,
            "temp_min": temperature - 2.0, "temp_max": temperature + 2.0,
            "pressure": 1015, "humidity": 60
        },
        "wind": {"speed": 3.6, "deg": 250},
        "clouds": {"all": 0},
        "dt": 1717243200,
        "sys": {"country": "DE", "sunrise": 1717210000, "sunset": 1717270000},
        "timezone": 7200,
        "name": name
    })
}

pub(crate) fn sample_snapshot(name: &str, temperature: f64) -> WeatherSnapshot {
    parse_current(&weather_body(name, temperature), None).unwrap()
}

pub(crate) enum FakeResponse {
    Body(Value),
    Status(u16),
    NetworkDown,
}

/// Scripted `WeatherApi`. Responses are consumed in order; once they run
/// out every call fails with a connection error.
#[derive(Default)]
pub(crate) struct FakeApi {
    responses: Mutex<VecDeque<FakeResponse>>,
    calls: AtomicUsize,
    cities: Mutex<Vec<String>>,
    coordinates: Mutex<Vec<GeoCoordinate>>,
}

impl FakeApi {
    pub(crate) fn new(responses: Vec<FakeResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_city(&self) -> Option<String> {
        self.cities.lock().last().cloned()
    }

    pub(crate) fn coordinates(&self) -> Vec<GeoCoordinate> {
        self.coordinates.lock().clone()
    }

    fn next(&self, lookup: Lookup<'_>) -> Result<Value, WeatherError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.responses.lock().pop_front() {
            Some(FakeResponse::Body(body)) => Ok(body),
            Some(FakeResponse::Status(code)) => Err(classify_status(
                StatusCode::from_u16(code).unwrap(),
                lookup,
            )),
            Some(FakeResponse::NetworkDown) | None => Err(WeatherError::Network(
                NetworkError::ConnectionFailed("connection refused".to_string()),
            )),
        }
    }
}

#[async_trait]
impl WeatherApi for FakeApi {
    async fn current_by_coordinate(&self, coord: &GeoCoordinate) -> Result<Value, WeatherError> {
        self.coordinates.lock().push(coord.clone());
        self.next(Lookup::Coordinate)
    }

    async fn current_by_city(&self, city: &str) -> Result<Value, WeatherError> {
        self.cities.lock().push(city.to_string());
        self.next(Lookup::City(city))
    }

    async fn forecast_by_coordinate(
        &self,
        _coord: &GeoCoordinate,
    ) -> Result<Forecast, WeatherError> {
        Ok(Forecast {
            city_name: "Berlin".to_string(),
            country: "DE".to_string(),
            entries: Vec::new(),
        })
    }
}

/// `PositionSource` that records registrations and delivers fixes on demand.
#[derive(Default)]
pub(crate) struct FakePositionSource {
    last_known: Option<GeoCoordinate>,
    deny: bool,
    sinks: Mutex<HashMap<SubscriptionId, mpsc::Sender<GeoCoordinate>>>,
    requests: Mutex<Vec<UpdateRequest>>,
    next_id: AtomicU64,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
}

impl FakePositionSource {
    pub(crate) fn with_last_known(coord: GeoCoordinate) -> Self {
        Self {
            last_known: Some(coord),
            ..Self::default()
        }
    }

    pub(crate) fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// Registrations currently open.
    pub(crate) fn active(&self) -> usize {
        self.sinks.lock().len()
    }

    pub(crate) fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn unsubscribe_calls(&self) -> usize {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<UpdateRequest> {
        self.requests.lock().clone()
    }

    /// Drop every delivery channel, as a source that stops producing fixes.
    pub(crate) fn close_all(&self) {
        self.sinks.lock().clear();
    }

    /// Deliver a fix to every open registration; returns how many accepted it.
    pub(crate) fn push_fix(&self, coord: GeoCoordinate) -> usize {
        self.sinks
            .lock()
            .values()
            .filter(|sink| sink.try_send(coord.clone()).is_ok())
            .count()
    }
}

#[async_trait]
impl PositionSource for FakePositionSource {
    async fn last_known(&self) -> Result<Option<GeoCoordinate>, LocationError> {
        if self.deny {
            return Err(LocationError::PermissionDenied);
        }
        Ok(self.last_known.clone())
    }

    fn subscribe(
        &self,
        request: UpdateRequest,
        sink: mpsc::Sender<GeoCoordinate>,
    ) -> Result<SubscriptionId, LocationError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.deny {
            return Err(LocationError::PermissionDenied);
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.requests.lock().push(request);
        self.sinks.lock().insert(id, sink);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().remove(&id);
    }
}

pub(crate) struct FakeGeocoder {
    result: Result<Vec<Address>, LocationError>,
}

impl FakeGeocoder {
    pub(crate) fn with(addresses: Vec<Address>) -> Self {
        Self {
            result: Ok(addresses),
        }
    }

    pub(crate) fn empty() -> Self {
        Self::with(Vec::new())
    }

    pub(crate) fn failing() -> Self {
        Self {
            result: Err(LocationError::Geocoding("service down".to_string())),
        }
    }
}

#[async_trait]
impl ReverseGeocoder for FakeGeocoder {
    async fn reverse(&self, _coord: &GeoCoordinate) -> Result<Vec<Address>, LocationError> {
        self.result.clone()
    }
}
