//! Weather retrieval: cache lookup, remote call, parsing and fallback policy.
//!
//! Per request the order is always cache check, then network call, then cache
//! update. Connectivity failures are answered from the cache when any entry
//! exists for the key, however old. Server rejections and everything else are
//! surfaced unchanged.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};
use nimbus_core::Config;

use crate::cache::{city_key, coordinate_key, WeatherCache};
use crate::client::{Forecast, WeatherApi};
use crate::parse::parse_current;
use crate::types::{GeoCoordinate, WeatherError, WeatherSnapshot};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Entries younger than this satisfy one-shot fetches without a network call
    pub cache_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            cache_ttl: Duration::from_secs(config.weather.cache_ttl_secs),
        }
    }
}

/// What to look up.
#[derive(Debug, Clone, PartialEq)]
pub enum WeatherQuery {
    Coordinate(GeoCoordinate),
    City(String),
}

impl WeatherQuery {
    pub fn cache_key(&self) -> String {
        match self {
            Self::Coordinate(coord) => coordinate_key(coord),
            Self::City(name) => city_key(name),
        }
    }
}

impl std::fmt::Display for WeatherQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Coordinate(coord) => write!(f, "{}", coord),
            Self::City(name) => write!(f, "'{}'", name),
        }
    }
}

/// Position of a streaming retrieval.
enum StreamStep {
    Cached,
    Network,
    Done,
}

#[derive(Clone)]
pub struct WeatherRetrievalEngine {
    api: Arc<dyn WeatherApi>,
    cache: Arc<WeatherCache>,
}

impl std::fmt::Debug for WeatherRetrievalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherRetrievalEngine")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl WeatherRetrievalEngine {
    pub fn new(api: Arc<dyn WeatherApi>, settings: EngineSettings) -> Self {
        Self::with_cache(api, Arc::new(WeatherCache::new(settings.cache_ttl)))
    }

    pub fn with_cache(api: Arc<dyn WeatherApi>, cache: Arc<WeatherCache>) -> Self {
        Self { api, cache }
    }

    pub fn cache(&self) -> &WeatherCache {
        &self.cache
    }

    /// One-shot retrieval for a coordinate.
    pub async fn fetch_by_coordinate(
        &self,
        coord: &GeoCoordinate,
    ) -> Result<WeatherSnapshot, WeatherError> {
        self.fetch(&WeatherQuery::Coordinate(coord.clone())).await
    }

    /// One-shot retrieval for a city name.
    pub async fn fetch_by_city(&self, name: &str) -> Result<WeatherSnapshot, WeatherError> {
        self.fetch(&WeatherQuery::City(name.to_string())).await
    }

    /// One-shot retrieval. A fresh cache entry is returned without touching
    /// the network.
    pub async fn fetch(&self, query: &WeatherQuery) -> Result<WeatherSnapshot, WeatherError> {
        let key = query.cache_key();

        if let Some(entry) = self.cache.get_fresh(&key) {
            tracing::debug!("Cache hit for {}", key);
            return Ok(entry.snapshot.as_ref().clone());
        }

        self.refresh(query, &key).await
    }

    /// Streaming retrieval for a coordinate. See [`Self::stream`].
    pub fn stream_by_coordinate(
        &self,
        coord: GeoCoordinate,
    ) -> impl Stream<Item = Result<WeatherSnapshot, WeatherError>> + Send + 'static {
        self.stream(WeatherQuery::Coordinate(coord))
    }

    /// Streaming retrieval for a city name. See [`Self::stream`].
    pub fn stream_by_city(
        &self,
        name: impl Into<String>,
    ) -> impl Stream<Item = Result<WeatherSnapshot, WeatherError>> + Send + 'static {
        self.stream(WeatherQuery::City(name.into()))
    }

    /// Lazy stream of one or two results: the cached snapshot (fresh or
    /// stale) if one exists, then the outcome of a network refresh.
    ///
    /// Nothing happens until the stream is polled, and each call produces an
    /// independent stream.
    pub fn stream(
        &self,
        query: WeatherQuery,
    ) -> impl Stream<Item = Result<WeatherSnapshot, WeatherError>> + Send + 'static {
        let engine = self.clone();
        let key = query.cache_key();

        stream::unfold(StreamStep::Cached, move |step| {
            let engine = engine.clone();
            let query = query.clone();
            let key = key.clone();
            async move {
                match step {
                    StreamStep::Cached => match engine.cache.get(&key) {
                        Some(entry) => {
                            tracing::debug!("Emitting cached snapshot for {}", key);
                            Some((Ok(entry.snapshot.as_ref().clone()), StreamStep::Network))
                        }
                        None => Some((engine.refresh(&query, &key).await, StreamStep::Done)),
                    },
                    StreamStep::Network => {
                        Some((engine.refresh(&query, &key).await, StreamStep::Done))
                    }
                    StreamStep::Done => None,
                }
            }
        })
    }

    /// Forecast passthrough; forecasts are not cached.
    pub async fn forecast_by_coordinate(
        &self,
        coord: &GeoCoordinate,
    ) -> Result<Forecast, WeatherError> {
        self.api.forecast_by_coordinate(coord).await
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Network call plus the fallback policy.
    async fn refresh(
        &self,
        query: &WeatherQuery,
        key: &str,
    ) -> Result<WeatherSnapshot, WeatherError> {
        match self.request(query).await {
            Ok(snapshot) => {
                let stored = self.cache.put(key, snapshot);
                tracing::info!("Fetched weather for {}", query);
                Ok(stored.as_ref().clone())
            }
            Err(err) if err.allows_cache_fallback() => match self.cache.get(key) {
                Some(entry) => {
                    tracing::warn!("{}; serving cached weather for {}", err, query);
                    Ok(entry.snapshot.as_ref().clone())
                }
                None => {
                    tracing::error!("{} and no cached weather for {}", err, query);
                    Err(err)
                }
            },
            Err(err) => {
                tracing::error!("Weather request for {} failed: {}", query, err);
                Err(err)
            }
        }
    }

    async fn request(&self, query: &WeatherQuery) -> Result<WeatherSnapshot, WeatherError> {
        match query {
            WeatherQuery::Coordinate(coord) => {
                let body = self.api.current_by_coordinate(coord).await?;
                parse_current(&body, Some(coord)).map_err(WeatherError::unknown)
            }
            WeatherQuery::City(name) => {
                let body = self.api.current_by_city(name.trim()).await?;
                parse_current(&body, None).map_err(WeatherError::unknown)
            }
        }
    }
}
