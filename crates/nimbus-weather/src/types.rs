use std::hash::{Hash, Hasher};

use chrono::{DateTime, FixedOffset, Utc};
use nimbus_core::{AppError, NetworkError};
use serde::{Deserialize, Serialize};

/// Weather condition categories mapped from OpenWeatherMap icon codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WeatherCondition {
    #[default]
    Clear,
    PartlyCloudy,
    Cloudy,
    Overcast,
    Showers,
    Rain,
    Thunderstorm,
    Snow,
    Fog,
}

impl WeatherCondition {
    /// Convert an icon code ("01d", "10n", ...) to a WeatherCondition
    /// See: https://openweathermap.org/weather-conditions
    pub fn from_icon_code(code: &str) -> Self {
        match code.get(..2) {
            Some("01") => Self::Clear,
            Some("02") => Self::PartlyCloudy,
            Some("03") => Self::Cloudy,
            Some("04") => Self::Overcast,
            Some("09") => Self::Showers,
            Some("10") => Self::Rain,
            Some("11") => Self::Thunderstorm,
            Some("13") => Self::Snow,
            Some("50") => Self::Fog,
            _ => Self::Clear, // Unknown codes default to clear
        }
    }

    /// Get a human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            Self::Clear => "Clear",
            Self::PartlyCloudy => "Partly Cloudy",
            Self::Cloudy => "Cloudy",
            Self::Overcast => "Overcast",
            Self::Showers => "Showers",
            Self::Rain => "Rain",
            Self::Thunderstorm => "Thunderstorm",
            Self::Snow => "Snow",
            Self::Fog => "Fog",
        }
    }

    /// Icon name used by the presentation layer
    pub fn icon_name(&self) -> &'static str {
        match self {
            Self::Clear => "sun",
            Self::PartlyCloudy => "cloud_sun",
            Self::Cloudy | Self::Overcast => "cloud",
            Self::Showers | Self::Rain => "cloud_rain",
            Self::Thunderstorm => "cloud_lightning",
            Self::Snow => "cloud_snow",
            Self::Fog => "cloud_fog",
        }
    }
}

/// Whether an icon code refers to the daytime variant.
pub fn is_daytime_icon(code: &str) -> bool {
    !code.ends_with('n')
}

/// Render an epoch timestamp as local "HH:MM" for a location's UTC offset.
pub fn format_local_time(epoch_secs: i64, utc_offset_secs: i32) -> Option<String> {
    let offset = FixedOffset::east_opt(utc_offset_secs)?;
    let utc = DateTime::<Utc>::from_timestamp(epoch_secs, 0)?;
    Some(utc.with_timezone(&offset).format("%H:%M").to_string())
}

/// Geographic point.
///
/// Identity is the (latitude, longitude) pair; `name` is display metadata and
/// never takes part in equality, hashing or cache keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoCoordinate {
    pub latitude: f64,
    pub longitude: f64,
    pub name: Option<String>,
}

impl GeoCoordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            name: None,
        }
    }

    pub fn named(latitude: f64, longitude: f64, name: impl Into<String>) -> Self {
        Self {
            latitude,
            longitude,
            name: Some(name.into()),
        }
    }

    /// Both components finite and within WGS84 bounds.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// "lat, lon" text used when no place name is available.
    pub fn display_fallback(&self) -> String {
        format!("{:.4}, {:.4}", self.latitude, self.longitude)
    }
}

// -0.0 and 0.0 compare equal, so they must hash equal too.
fn coordinate_bits(value: f64) -> u64 {
    if value == 0.0 {
        0
    } else {
        value.to_bits()
    }
}

impl PartialEq for GeoCoordinate {
    fn eq(&self, other: &Self) -> bool {
        self.latitude == other.latitude && self.longitude == other.longitude
    }
}

impl Eq for GeoCoordinate {}

impl Hash for GeoCoordinate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        coordinate_bits(self.latitude).hash(state);
        coordinate_bits(self.longitude).hash(state);
    }
}

impl std::fmt::Display for GeoCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({:.4}, {:.4})", name, self.latitude, self.longitude),
            None => write!(f, "({:.4}, {:.4})", self.latitude, self.longitude),
        }
    }
}

/// Current weather at one place, as parsed from a single API response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub city_name: String,
    pub country: String,
    pub coordinate: Option<GeoCoordinate>,

    /// Temperatures in °C
    pub temperature: f64,
    pub feels_like: f64,
    pub temp_min: f64,
    pub temp_max: f64,

    /// Relative humidity in percent
    pub humidity: u8,
    /// Sea-level pressure in hPa
    pub pressure: u32,

    pub wind_speed: f64,
    pub wind_direction: u16,
    /// Cloud cover in percent
    pub cloudiness: u8,

    /// Precipitation over the last hour in mm, when reported
    pub rain_1h: Option<f64>,
    pub snow_1h: Option<f64>,

    pub description: String,
    pub icon: String,

    /// Epoch seconds
    pub sunrise: i64,
    pub sunset: i64,
    /// Seconds east of UTC
    pub utc_offset_secs: i32,
    /// Observation time, epoch seconds
    pub observed_at: i64,

    /// Original response body, for diagnostics only
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub raw_payload: String,
}

impl WeatherSnapshot {
    pub fn condition(&self) -> WeatherCondition {
        WeatherCondition::from_icon_code(&self.icon)
    }

    /// Short summary such as "Clear sky, 18°C".
    pub fn summary(&self) -> String {
        let mut chars = self.description.chars();
        let description = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
            None => self.condition().description().to_string(),
        };
        format!("{}, {}°C", description, self.temperature.round() as i64)
    }

    pub fn sunrise_local(&self) -> Option<String> {
        format_local_time(self.sunrise, self.utc_offset_secs)
    }

    pub fn sunset_local(&self) -> Option<String> {
        format_local_time(self.sunset, self.utc_offset_secs)
    }
}

/// Location service errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocationError {
    #[error("Location permission denied")]
    PermissionDenied,
    #[error("Location service unavailable")]
    ServiceUnavailable,
    #[error("Location request timed out")]
    Timeout,
    #[error("No position fix available")]
    NoFix,
    #[error("Reverse geocoding failed: {0}")]
    Geocoding(String),
}

/// Outcome classification for every weather and location operation.
#[derive(Debug, thiserror::Error)]
pub enum WeatherError {
    /// No connectivity, I/O failure or timeout.
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// The remote API rejected the request.
    #[error("Server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("Location error: {0}")]
    Location(#[from] LocationError),

    /// Anything unclassified, including malformed 200 responses.
    #[error("Unexpected error: {cause}")]
    Unknown {
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl WeatherError {
    pub fn unknown(cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Unknown {
            cause: cause.into(),
        }
    }

    /// HTTP status for server rejections.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Only connectivity failures may be masked by cached data; a server
    /// rejection or location failure is a real condition the user must see.
    pub fn allows_cache_fallback(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Message suitable for the presentation layer.
    pub fn user_message(&self) -> String {
        match self {
            Self::Network(e) => e.user_message().to_string(),
            Self::Server { message, .. } => message.clone(),
            Self::Location(e) => format!("Unable to get location: {}", e),
            Self::Unknown { .. } => "Unexpected error. Please try again.".to_string(),
        }
    }
}

impl From<WeatherError> for AppError {
    fn from(e: WeatherError) -> Self {
        match e {
            WeatherError::Network(n) => AppError::Network(n),
            WeatherError::Server { code, message } => AppError::WeatherService {
                status: code,
                message,
            },
            WeatherError::Location(l) => AppError::Location(l.to_string()),
            WeatherError::Unknown { cause } => AppError::Other(anyhow::Error::msg(cause.to_string())),
        }
    }
}
