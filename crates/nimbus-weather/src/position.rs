//! Concrete position sources: configured coordinates and IP geolocation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nimbus_core::Config;
use parking_lot::{Mutex, RwLock};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::location::{PositionSource, SubscriptionId, UpdateRequest};
use crate::types::{GeoCoordinate, LocationError};

const REQUEST_TIMEOUT_SECS: u64 = 10;
const USER_AGENT: &str = concat!("Nimbus/", env!("CARGO_PKG_VERSION"));

/// A position that never changes, typically taken from configuration.
#[derive(Debug)]
pub struct FixedPositionSource {
    position: GeoCoordinate,
    next_id: AtomicU64,
}

impl FixedPositionSource {
    pub fn new(position: GeoCoordinate) -> Self {
        Self {
            position,
            next_id: AtomicU64::new(1),
        }
    }

    /// `None` unless both latitude and longitude are configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .location
            .fixed_position()
            .map(|(lat, lon)| Self::new(GeoCoordinate::new(lat, lon)))
    }
}

#[async_trait]
impl PositionSource for FixedPositionSource {
    async fn last_known(&self) -> Result<Option<GeoCoordinate>, LocationError> {
        Ok(Some(self.position.clone()))
    }

    fn subscribe(
        &self,
        _request: UpdateRequest,
        sink: mpsc::Sender<GeoCoordinate>,
    ) -> Result<SubscriptionId, LocationError> {
        // The position never moves, so one delivery is all there is
        let _ = sink.try_send(self.position.clone());
        Ok(SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed)))
    }

    fn unsubscribe(&self, _id: SubscriptionId) {}
}

#[derive(Debug, Deserialize)]
struct GeoIpResponse {
    latitude: Option<f64>,
    longitude: Option<f64>,
    city: Option<String>,
    #[serde(default)]
    error: bool,
    reason: Option<String>,
}

#[derive(Debug)]
struct GeoIpInner {
    client: Client,
    url: String,
    last_fix: RwLock<Option<GeoCoordinate>>,
}

impl GeoIpInner {
    async fn lookup(&self) -> Result<GeoCoordinate, LocationError> {
        let response = self.client.get(&self.url).send().await.map_err(|e| {
            tracing::debug!("IP geolocation request failed: {}", e);
            LocationError::ServiceUnavailable
        })?;

        if !response.status().is_success() {
            tracing::debug!("IP geolocation returned status {}", response.status());
            return Err(LocationError::ServiceUnavailable);
        }

        let body: GeoIpResponse = response.json().await.map_err(|e| {
            tracing::debug!("IP geolocation parse error: {}", e);
            LocationError::ServiceUnavailable
        })?;

        if body.error {
            tracing::warn!(
                "IP geolocation refused: {}",
                body.reason.as_deref().unwrap_or("no reason given")
            );
            return Err(LocationError::ServiceUnavailable);
        }

        let (Some(lat), Some(lon)) = (body.latitude, body.longitude) else {
            return Err(LocationError::NoFix);
        };

        let coord = GeoCoordinate {
            latitude: lat,
            longitude: lon,
            name: body.city.filter(|c| !c.is_empty()),
        };
        *self.last_fix.write() = Some(coord.clone());
        Ok(coord)
    }
}

/// Position from the public IP address. Coarse, but needs no hardware.
///
/// Each subscription runs its own polling task at the requested interval;
/// unsubscribing cancels that task.
#[derive(Debug, Clone)]
pub struct GeoIpPositionSource {
    inner: Arc<GeoIpInner>,
    polls: Arc<Mutex<HashMap<SubscriptionId, CancellationToken>>>,
    next_id: Arc<AtomicU64>,
}

impl GeoIpPositionSource {
    pub fn new(url: impl Into<String>) -> Result<Self, LocationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|_| LocationError::ServiceUnavailable)?;

        Ok(Self {
            inner: Arc::new(GeoIpInner {
                client,
                url: url.into(),
                last_fix: RwLock::new(None),
            }),
            polls: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, LocationError> {
        Self::new(config.location.geoip_url.clone())
    }

    /// Number of polling tasks currently registered.
    pub fn active_subscriptions(&self) -> usize {
        self.polls.lock().len()
    }
}

#[async_trait]
impl PositionSource for GeoIpPositionSource {
    async fn last_known(&self) -> Result<Option<GeoCoordinate>, LocationError> {
        Ok(self.inner.last_fix.read().clone())
    }

    fn subscribe(
        &self,
        request: UpdateRequest,
        sink: mpsc::Sender<GeoCoordinate>,
    ) -> Result<SubscriptionId, LocationError> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let inner = Arc::clone(&self.inner);
        // interval() rejects a zero period
        let period = request
            .interval
            .max(request.min_interval)
            .max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        match inner.lookup().await {
                            Ok(coord) => {
                                if sink.send(coord).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => tracing::warn!("IP geolocation failed: {}", e),
                        }
                    }
                }
            }
            tracing::debug!("IP geolocation poll {:?} stopped", id);
        });

        self.polls.lock().insert(id, token);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(token) = self.polls.lock().remove(&id) {
            token.cancel();
        }
    }
}
