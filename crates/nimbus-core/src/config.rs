use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::ConfigError;

type Result<T> = std::result::Result<T, ConfigError>;

/// Environment variable that overrides `weather.api_key`
pub const API_KEY_ENV: &str = "NIMBUS_API_KEY";

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add an error
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a user-friendly message summarizing all errors
    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Application configuration directory
    pub config_dir: PathBuf,

    /// Remote weather API and cache settings
    #[serde(default)]
    pub weather: WeatherConfig,

    /// Position resolution settings
    #[serde(default)]
    pub location: LocationConfig,

    /// Auto-refresh settings
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Connectivity probe settings
    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    /// Base URL of the OpenWeatherMap-compatible API
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// API key (`appid`); `NIMBUS_API_KEY` takes precedence when set
    #[serde(default)]
    pub api_key: String,

    /// Unit system requested from the API; snapshots assume `metric`
    #[serde(default = "default_units")]
    pub units: String,

    /// Age after which a cached snapshot is no longer fresh
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_base_url() -> String {
    "https://api.openweathermap.org/data/2.5".to_string()
}

fn default_units() -> String {
    "metric".to_string()
}

fn default_cache_ttl_secs() -> u64 {
    15 * 60
}

fn default_request_timeout_secs() -> u64 {
    15
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            api_key: String::new(),
            units: default_units(),
            cache_ttl_secs: default_cache_ttl_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl WeatherConfig {
    /// API key with the environment override applied.
    pub fn effective_api_key(&self) -> String {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| self.api_key.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    /// Upper bound on waiting for a live position fix
    #[serde(default = "default_fix_timeout_secs")]
    pub fix_timeout_secs: u64,

    /// Fastest rate at which live fixes are delivered
    #[serde(default = "default_min_update_interval_secs")]
    pub min_update_interval_secs: u64,

    /// Preferred rate of live fixes
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,

    /// Reverse geocoding endpoint (Nominatim-compatible)
    #[serde(default = "default_geocoder_url")]
    pub geocoder_url: String,

    /// IP geolocation endpoint
    #[serde(default = "default_geoip_url")]
    pub geoip_url: String,

    /// Fixed position; when both are set no lookup is performed
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

fn default_fix_timeout_secs() -> u64 {
    30
}

fn default_min_update_interval_secs() -> u64 {
    5
}

fn default_update_interval_secs() -> u64 {
    10
}

fn default_geocoder_url() -> String {
    "https://nominatim.openstreetmap.org/reverse".to_string()
}

fn default_geoip_url() -> String {
    "https://ipapi.co/json/".to_string()
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            fix_timeout_secs: default_fix_timeout_secs(),
            min_update_interval_secs: default_min_update_interval_secs(),
            update_interval_secs: default_update_interval_secs(),
            geocoder_url: default_geocoder_url(),
            geoip_url: default_geoip_url(),
            latitude: None,
            longitude: None,
        }
    }
}

impl LocationConfig {
    /// The configured fixed position, if both coordinates are present.
    pub fn fixed_position(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Seconds between automatic refreshes of the current location
    #[serde(default = "default_refresh_interval_secs")]
    pub interval_secs: u64,

    /// Start auto-refresh when the service starts
    #[serde(default = "default_refresh_enabled")]
    pub enabled: bool,
}

fn default_refresh_interval_secs() -> u64 {
    60
}

fn default_refresh_enabled() -> bool {
    true
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_refresh_interval_secs(),
            enabled: default_refresh_enabled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// URL probed to decide whether the internet is usable
    #[serde(default = "default_probe_url")]
    pub probe_url: String,

    /// Seconds between probes
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

fn default_probe_url() -> String {
    "https://api.openweathermap.org".to_string()
}

fn default_probe_interval_secs() -> u64 {
    30
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_url: default_probe_url(),
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nimbus");

        Self {
            config_dir,
            weather: WeatherConfig::default(),
            location: LocationConfig::default(),
            refresh: RefreshConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file, creating default if it doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from an explicit path, writing defaults if missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            let config = Self::default();
            config.save_to(config_path)?;
            tracing::info!("Wrote default configuration to {}", config_path.display());
            return Ok(config);
        }

        let contents = std::fs::read_to_string(config_path).map_err(|source| ConfigError::Io {
            path: config_path.to_path_buf(),
            source,
        })?;

        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: config_path.to_path_buf(),
            source,
        })
    }

    /// Load configuration and validate it
    ///
    /// Returns the config along with any validation warnings.
    /// Returns an error if validation fails with critical errors.
    pub fn load_validated() -> Result<(Self, ValidationResult)> {
        Self::load_validated_from(&Self::config_path()?)
    }

    pub fn load_validated_from(config_path: &Path) -> Result<(Self, ValidationResult)> {
        let config = Self::load_from(config_path)?;
        let validation = config.validate();

        if !validation.is_valid() {
            return Err(ConfigError::Invalid(validation.error_summary()));
        }

        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        Ok((config, validation))
    }

    /// Validate the configuration
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        self.validate_url(&self.weather.api_base_url, "weather.api_base_url", &mut result);
        self.validate_url(&self.location.geocoder_url, "location.geocoder_url", &mut result);
        self.validate_url(&self.location.geoip_url, "location.geoip_url", &mut result);
        self.validate_url(&self.network.probe_url, "network.probe_url", &mut result);

        if self.weather.units != "metric" {
            result.add_error(
                "weather.units",
                format!("Only \"metric\" is supported, got: {}", self.weather.units),
            );
        }

        if self.weather.effective_api_key().trim().is_empty() {
            result.add_warning(
                "weather.api_key",
                format!("No API key configured (set it here or via {})", API_KEY_ENV),
            );
        }

        let non_zero = [
            ("weather.cache_ttl_secs", self.weather.cache_ttl_secs),
            ("weather.request_timeout_secs", self.weather.request_timeout_secs),
            ("location.fix_timeout_secs", self.location.fix_timeout_secs),
            ("location.min_update_interval_secs", self.location.min_update_interval_secs),
            ("location.update_interval_secs", self.location.update_interval_secs),
            ("refresh.interval_secs", self.refresh.interval_secs),
            ("network.probe_interval_secs", self.network.probe_interval_secs),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                result.add_error(field, "Must be greater than 0");
            }
        }

        if self.location.min_update_interval_secs > self.location.update_interval_secs {
            result.add_warning(
                "location.min_update_interval_secs",
                "Minimum update interval is longer than the preferred interval",
            );
        }

        match (self.location.latitude, self.location.longitude) {
            (Some(lat), Some(lon)) => {
                if !(-90.0..=90.0).contains(&lat) {
                    result.add_error("location.latitude", "Latitude must be within -90..=90");
                }
                if !(-180.0..=180.0).contains(&lon) {
                    result.add_error("location.longitude", "Longitude must be within -180..=180");
                }
            }
            (None, None) => {}
            _ => result.add_error(
                "location",
                "Latitude and longitude must be set together",
            ),
        }

        result
    }

    /// Validate a URL field
    fn validate_url(&self, url_str: &str, field_name: &str, result: &mut ValidationResult) {
        match Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    result.add_error(
                        field_name,
                        format!("URL must use http or https scheme, got: {}", url.scheme()),
                    );
                }

                if url.host().is_none() {
                    result.add_error(field_name, "URL must have a host");
                }
            }
            Err(e) => {
                result.add_error(field_name, format!("Invalid URL: {}", e));
            }
        }
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let contents = toml::to_string_pretty(self)?;

        std::fs::write(config_path, contents).map_err(|source| ConfigError::Io {
            path: config_path.to_path_buf(),
            source,
        })
    }

    /// Get the path to the configuration file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("nimbus");

        Ok(config_dir.join("config.toml"))
    }
}
