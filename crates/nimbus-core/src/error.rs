//! Centralized error types for Nimbus.
//!
//! This module provides a typed error hierarchy that:
//! - Enables precise error handling throughout the codebase
//! - Provides user-friendly messages suitable for UI display
//! - Preserves full error context for debugging/logging

use std::path::PathBuf;

use thiserror::Error;

/// Top-level application error type.
///
/// Service crates convert their own errors into this type at the presentation
/// boundary. Use `user_message()` to get a UI-appropriate message.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The weather API rejected the request.
    #[error("Weather service error ({status}): {message}")]
    WeatherService { status: u16, message: String },

    #[error("Location error: {0}")]
    Location(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Returns a user-friendly message suitable for display in the UI.
    ///
    /// These messages are designed to be actionable and non-technical.
    pub fn user_message(&self) -> &'static str {
        match self {
            AppError::Network(e) => e.user_message(),
            AppError::Config(e) => e.user_message(),
            AppError::WeatherService { status: 401, .. } => {
                "Weather API key is invalid. Check settings."
            }
            AppError::WeatherService { status: 404, .. } => {
                "Location not found. Check and try again."
            }
            AppError::WeatherService { status: 429, .. } => {
                "Too many requests. Please wait and try again."
            }
            AppError::WeatherService { status, .. } if *status >= 500 => {
                "Weather service unavailable. Please try again later."
            }
            AppError::WeatherService { .. } => "Weather service error. Please try again.",
            AppError::Location(_) => "Unable to determine your location.",
            AppError::Other(_) => "An unexpected error occurred. Please try again.",
        }
    }
}

/// Transport failures before any HTTP response arrived.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out")]
    Timeout,
}

impl NetworkError {
    pub fn user_message(&self) -> &'static str {
        match self {
            NetworkError::ConnectionFailed(_) => {
                "Unable to connect. Check your internet connection."
            }
            NetworkError::Timeout => "The request timed out. Please try again.",
        }
    }
}

/// Failures loading, saving or validating the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No configuration directory available on this platform")]
    NoConfigDir,

    #[error("Failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Configuration validation failed: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> &'static str {
        match self {
            ConfigError::NoConfigDir => "No place to store settings was found.",
            ConfigError::Io { .. } => "The configuration file could not be read or written.",
            ConfigError::Parse { .. } => "Configuration file is malformed. Check your settings.",
            ConfigError::Serialize(_) => "Settings could not be saved.",
            ConfigError::Invalid(_) => "Invalid configuration. Check your settings.",
        }
    }
}

/// Extension trait for converting transport-level reqwest errors to our error types.
///
/// Only covers failures that happen before a response arrives; status codes are
/// classified by the caller.
pub trait ReqwestErrorExt {
    fn into_network_error(self) -> NetworkError;
}

impl ReqwestErrorExt for reqwest::Error {
    fn into_network_error(self) -> NetworkError {
        if self.is_timeout() {
            NetworkError::Timeout
        } else {
            NetworkError::ConnectionFailed(self.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_conversion() {
        let net_err = NetworkError::Timeout;
        let app_err: AppError = net_err.into();
        assert!(matches!(app_err, AppError::Network(NetworkError::Timeout)));
    }

    #[test]
    fn test_user_message_propagation() {
        let app_err = AppError::Network(NetworkError::Timeout);
        assert_eq!(
            app_err.user_message(),
            "The request timed out. Please try again."
        );
    }

    #[test]
    fn test_weather_service_messages_by_status() {
        let msg = |status| {
            AppError::WeatherService {
                status,
                message: String::new(),
            }
            .user_message()
        };
        assert!(msg(401).contains("API key"));
        assert!(msg(404).contains("not found"));
        assert!(msg(429).contains("Too many"));
        assert!(msg(503).contains("unavailable"));
        assert_eq!(msg(418), "Weather service error. Please try again.");
    }

    #[test]
    fn test_config_errors_reach_user_message() {
        let app_err = AppError::from(ConfigError::Invalid("refresh.interval_secs".into()));
        assert_eq!(
            app_err.user_message(),
            "Invalid configuration. Check your settings."
        );

        let io = ConfigError::Io {
            path: PathBuf::from("/etc/nimbus/config.toml"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(io.to_string().contains("/etc/nimbus/config.toml"));
    }
}
