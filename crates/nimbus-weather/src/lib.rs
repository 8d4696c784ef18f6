//! Weather retrieval for Nimbus
//!
//! Current conditions from OpenWeatherMap behind a stale-tolerant cache,
//! async location resolution with reverse geocoding, connectivity tracking
//! and a periodic refresh loop.

pub mod cache;
pub mod client;
pub mod engine;
pub mod geocode;
pub mod location;
pub mod network;
pub mod parse;
pub mod position;
pub mod refresh;
pub mod service;
pub mod state;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use cache::{CacheEntry, Clock, SystemClock, WeatherCache};
pub use client::{ClientSettings, Forecast, ForecastEntry, WeatherApi, WeatherClient};
pub use engine::{EngineSettings, WeatherQuery, WeatherRetrievalEngine};
pub use geocode::{Address, NominatimGeocoder, ReverseGeocoder};
pub use location::{LocationProvider, LocationSettings, LocationState, PositionSource};
pub use network::{ConnectivityProbe, NetworkEvent, NetworkMonitor, Transport};
pub use position::{FixedPositionSource, GeoIpPositionSource};
pub use refresh::{RefreshScheduler, RefreshSettings};
pub use service::WeatherService;
pub use state::UiState;
pub use types::*;
