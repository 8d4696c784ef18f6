//! OpenWeatherMap current-weather and forecast client.

use std::time::Duration;

use async_trait::async_trait;
use nimbus_core::{Config, ReqwestErrorExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;

use crate::types::{GeoCoordinate, WeatherError};

const DEFAULT_API_BASE: &str = "https://api.openweathermap.org/data/2.5";
const USER_AGENT: &str = concat!("Nimbus/", env!("CARGO_PKG_VERSION"));

/// Remote weather API surface used by the retrieval engine.
///
/// Current-weather calls return the raw JSON body; parsing into snapshots is
/// the engine's job so that parse failures are classified alongside transport
/// failures.
#[async_trait]
pub trait WeatherApi: Send + Sync {
    async fn current_by_coordinate(&self, coord: &GeoCoordinate) -> Result<Value, WeatherError>;

    async fn current_by_city(&self, city: &str) -> Result<Value, WeatherError>;

    async fn forecast_by_coordinate(&self, coord: &GeoCoordinate)
        -> Result<Forecast, WeatherError>;
}

/// Client connection settings
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub api_key: String,
    pub units: String,
    pub timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            api_key: String::new(),
            units: "metric".to_string(),
            timeout: Duration::from_secs(15),
        }
    }
}

impl From<&Config> for ClientSettings {
    fn from(config: &Config) -> Self {
        Self {
            base_url: config.weather.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.weather.effective_api_key(),
            units: config.weather.units.clone(),
            timeout: Duration::from_secs(config.weather.request_timeout_secs),
        }
    }
}

/// Five-day / three-hour forecast
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    pub city_name: String,
    pub country: String,
    pub entries: Vec<ForecastEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastEntry {
    /// Epoch seconds
    pub timestamp: i64,
    pub temperature: f64,
    pub temp_min: f64,
    pub temp_max: f64,
    pub description: String,
    pub icon: String,
    /// Probability of precipitation, 0.0..=1.0
    pub precipitation_chance: f64,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    #[serde(default)]
    list: Vec<ForecastItem>,
    city: Option<ForecastCity>,
}

#[derive(Debug, Deserialize)]
struct ForecastItem {
    dt: i64,
    main: ForecastMain,
    #[serde(default)]
    weather: Vec<ForecastCondition>,
    #[serde(default)]
    pop: f64,
}

#[derive(Debug, Deserialize)]
struct ForecastMain {
    temp: f64,
    temp_min: f64,
    temp_max: f64,
}

#[derive(Debug, Deserialize)]
struct ForecastCondition {
    #[serde(default)]
    description: String,
    #[serde(default)]
    icon: String,
}

#[derive(Debug, Default, Deserialize)]
struct ForecastCity {
    #[serde(default)]
    name: String,
    #[serde(default)]
    country: String,
}

impl From<ForecastResponse> for Forecast {
    fn from(resp: ForecastResponse) -> Self {
        let city = resp.city.unwrap_or_default();
        Self {
            city_name: city.name,
            country: city.country,
            entries: resp
                .list
                .into_iter()
                .map(|item| {
                    let condition = item.weather.into_iter().next();
                    ForecastEntry {
                        timestamp: item.dt,
                        temperature: item.main.temp,
                        temp_min: item.main.temp_min,
                        temp_max: item.main.temp_max,
                        description: condition
                            .as_ref()
                            .map(|c| c.description.clone())
                            .unwrap_or_default(),
                        icon: condition.map(|c| c.icon).unwrap_or_default(),
                        precipitation_chance: item.pop,
                    }
                })
                .collect(),
        }
    }
}

/// Which lookup produced a status, for the 404 message.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Lookup<'a> {
    Coordinate,
    City(&'a str),
}

/// Map a non-success status to a server error with a user-facing message.
pub(crate) fn classify_status(status: StatusCode, lookup: Lookup<'_>) -> WeatherError {
    let code = status.as_u16();
    let message = match code {
        401 => "API key is invalid or missing".to_string(),
        404 => match lookup {
            Lookup::City(name) => format!("City '{}' not found", name),
            Lookup::Coordinate => "Location not found".to_string(),
        },
        429 => "API limit reached".to_string(),
        500..=599 => format!("Server error (code: {})", code),
        _ => format!("Unexpected response (code: {})", code),
    };
    WeatherError::Server { code, message }
}

#[derive(Debug, Clone)]
pub struct WeatherClient {
    client: Client,
    settings: ClientSettings,
}

impl WeatherClient {
    pub fn new(settings: ClientSettings) -> Result<Self, WeatherError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(WeatherError::unknown)?;

        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    async fn get_json(
        &self,
        endpoint: &str,
        params: &[(&str, String)],
        lookup: Lookup<'_>,
    ) -> Result<Value, WeatherError> {
        let url = format!("{}/{}", self.settings.base_url, endpoint);

        let response = self
            .client
            .get(&url)
            .query(params)
            .query(&[
                ("appid", self.settings.api_key.as_str()),
                ("units", self.settings.units.as_str()),
            ])
            .send()
            .await
            .map_err(|e| WeatherError::Network(e.into_network_error()))?;

        let status = response.status();
        if !status.is_success() {
            let err = classify_status(status, lookup);
            tracing::warn!("Weather API returned {}: {}", status, err);
            return Err(err);
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| WeatherError::Network(e.into_network_error()))?;

        tracing::trace!("Weather API body: {}", String::from_utf8_lossy(&bytes));

        serde_json::from_slice(&bytes).map_err(WeatherError::unknown)
    }

    fn coordinate_params(coord: &GeoCoordinate) -> Vec<(&'static str, String)> {
        vec![
            ("lat", coord.latitude.to_string()),
            ("lon", coord.longitude.to_string()),
        ]
    }
}

#[async_trait]
impl WeatherApi for WeatherClient {
    #[instrument(skip(self), level = "info")]
    async fn current_by_coordinate(&self, coord: &GeoCoordinate) -> Result<Value, WeatherError> {
        self.get_json("weather", &Self::coordinate_params(coord), Lookup::Coordinate)
            .await
    }

    #[instrument(skip(self), level = "info")]
    async fn current_by_city(&self, city: &str) -> Result<Value, WeatherError> {
        self.get_json("weather", &[("q", city.to_string())], Lookup::City(city))
            .await
    }

    #[instrument(skip(self), level = "info")]
    async fn forecast_by_coordinate(
        &self,
        coord: &GeoCoordinate,
    ) -> Result<Forecast, WeatherError> {
        let body = self
            .get_json("forecast", &Self::coordinate_params(coord), Lookup::Coordinate)
            .await?;
        let resp: ForecastResponse = serde_json::from_value(body).map_err(WeatherError::unknown)?;
        Ok(resp.into())
    }
}
