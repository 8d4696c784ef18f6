//! Reverse geocoding: convert coordinates to human-readable place names.
//! The bundled implementation uses Nominatim (OpenStreetMap), which needs no API key.

use std::time::Duration;

use async_trait::async_trait;
use nimbus_core::Config;
use reqwest::Client;
use serde::Deserialize;

use crate::types::{GeoCoordinate, LocationError};

const REQUEST_TIMEOUT_SECS: u64 = 10;
const USER_AGENT: &str = concat!("Nimbus/", env!("CARGO_PKG_VERSION"));

/// Address components of one reverse-geocoding candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Address {
    /// City, town or village
    pub locality: Option<String>,
    /// County or district
    pub sub_admin_area: Option<String>,
    /// State or region
    pub admin_area: Option<String>,
    /// Suburb or neighbourhood
    pub sub_locality: Option<String>,
}

impl Address {
    /// First non-empty of locality, sub-admin area, admin area, sub-locality.
    pub fn place_name(&self) -> Option<&str> {
        [
            &self.locality,
            &self.sub_admin_area,
            &self.admin_area,
            &self.sub_locality,
        ]
        .into_iter()
        .filter_map(|part| part.as_deref())
        .map(str::trim)
        .find(|part| !part.is_empty())
    }
}

#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    /// Candidate addresses for a coordinate, best match first.
    async fn reverse(&self, coord: &GeoCoordinate) -> Result<Vec<Address>, LocationError>;
}

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    address: Option<NominatimAddress>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NominatimAddress {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    municipality: Option<String>,
    county: Option<String>,
    state: Option<String>,
    suburb: Option<String>,
    neighbourhood: Option<String>,
}

impl From<NominatimAddress> for Address {
    fn from(addr: NominatimAddress) -> Self {
        Self {
            // Prefer city > town > village > municipality
            locality: addr
                .city
                .or(addr.town)
                .or(addr.village)
                .or(addr.municipality),
            sub_admin_area: addr.county,
            admin_area: addr.state,
            sub_locality: addr.suburb.or(addr.neighbourhood),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    client: Client,
    url: String,
}

impl NominatimGeocoder {
    pub fn new(url: impl Into<String>) -> Result<Self, LocationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| LocationError::Geocoding(e.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, LocationError> {
        Self::new(config.location.geocoder_url.clone())
    }
}

#[async_trait]
impl ReverseGeocoder for NominatimGeocoder {
    async fn reverse(&self, coord: &GeoCoordinate) -> Result<Vec<Address>, LocationError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("lat", coord.latitude.to_string()),
                ("lon", coord.longitude.to_string()),
                ("format", "jsonv2".to_string()),
                ("addressdetails", "1".to_string()),
                ("zoom", "10".to_string()),
            ])
            .send()
            .await
            .map_err(|e| {
                tracing::debug!("Reverse geocode request failed: {}", e);
                LocationError::Geocoding(e.to_string())
            })?;

        if !response.status().is_success() {
            tracing::debug!("Reverse geocode returned status {}", response.status());
            return Err(LocationError::Geocoding(format!(
                "geocoder returned status {}",
                response.status()
            )));
        }

        let body: NominatimResponse = response.json().await.map_err(|e| {
            tracing::debug!("Reverse geocode parse error: {}", e);
            LocationError::Geocoding(e.to_string())
        })?;

        if let Some(error) = body.error {
            return Err(LocationError::Geocoding(error));
        }

        Ok(body.address.map(Address::from).into_iter().collect())
    }
}
