//! Conversion of raw current-weather responses into `WeatherSnapshot`s.
//!
//! `main` and a non-empty `weather` array are required; every other block is
//! optional and falls back to zero, an empty string, or `None` for rain/snow.

use serde::Deserialize;
use serde_json::Value;

use crate::types::{GeoCoordinate, WeatherSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("response is missing the `{0}` block")]
    MissingBlock(&'static str),
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct CurrentResponse {
    main: Option<MainBlock>,
    weather: Option<Vec<ConditionBlock>>,
    wind: Option<WindBlock>,
    clouds: Option<CloudsBlock>,
    sys: Option<SysBlock>,
    coord: Option<CoordBlock>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    timezone: i32,
    #[serde(default)]
    dt: i64,
    rain: Option<PrecipitationBlock>,
    snow: Option<PrecipitationBlock>,
}

#[derive(Debug, Deserialize)]
struct MainBlock {
    temp: f64,
    feels_like: f64,
    temp_min: f64,
    temp_max: f64,
    humidity: u8,
    pressure: u32,
}

#[derive(Debug, Deserialize)]
struct ConditionBlock {
    #[serde(default)]
    description: String,
    #[serde(default)]
    icon: String,
}

#[derive(Debug, Default, Deserialize)]
struct WindBlock {
    #[serde(default)]
    speed: f64,
    #[serde(default)]
    deg: u16,
}

#[derive(Debug, Default, Deserialize)]
struct CloudsBlock {
    #[serde(default)]
    all: u8,
}

#[derive(Debug, Default, Deserialize)]
struct SysBlock {
    #[serde(default)]
    country: String,
    #[serde(default)]
    sunrise: i64,
    #[serde(default)]
    sunset: i64,
}

#[derive(Debug, Deserialize)]
struct CoordBlock {
    lat: Option<f64>,
    lon: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PrecipitationBlock {
    #[serde(rename = "1h")]
    one_hour: Option<f64>,
}

/// Parse a current-weather response.
///
/// The coordinate echoed in the response wins over `hint`; the hint is only
/// used when the response carries no usable `coord` block.
pub fn parse_current(
    body: &Value,
    hint: Option<&GeoCoordinate>,
) -> Result<WeatherSnapshot, ParseError> {
    let response = CurrentResponse::deserialize(body)?;

    let main = response.main.ok_or(ParseError::MissingBlock("main"))?;
    let condition = response
        .weather
        .and_then(|list| list.into_iter().next())
        .ok_or(ParseError::MissingBlock("weather"))?;

    let wind = response.wind.unwrap_or_default();
    let clouds = response.clouds.unwrap_or_default();
    let sys = response.sys.unwrap_or_default();

    let display_name = (!response.name.is_empty())
        .then(|| response.name.clone())
        .or_else(|| hint.and_then(|h| h.name.clone()));

    let coordinate = match response.coord {
        Some(CoordBlock {
            lat: Some(lat),
            lon: Some(lon),
        }) => Some(GeoCoordinate {
            latitude: lat,
            longitude: lon,
            name: display_name,
        }),
        _ => hint.map(|h| GeoCoordinate {
            latitude: h.latitude,
            longitude: h.longitude,
            name: display_name,
        }),
    };

    Ok(WeatherSnapshot {
        city_name: response.name,
        country: sys.country,
        coordinate,
        temperature: main.temp,
        feels_like: main.feels_like,
        temp_min: main.temp_min,
        temp_max: main.temp_max,
        humidity: main.humidity,
        pressure: main.pressure,
        wind_speed: wind.speed,
        wind_direction: wind.deg,
        cloudiness: clouds.all,
        rain_1h: response.rain.and_then(|r| r.one_hour),
        snow_1h: response.snow.and_then(|s| s.one_hour),
        description: condition.description,
        icon: condition.icon,
        sunrise: sys.sunrise,
        sunset: sys.sunset,
        utc_offset_secs: response.timezone,
        observed_at: response.dt,
        raw_payload: body.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn berlin() -> Value {
        json!({
            "coord": {"lon": 13.41, "lat": 52.52},
            "weather": [{"id": 800, "main": "Clear", "description": "clear sky", "icon": "01d"}],
            "main": {
                "temp": 18.5, "feels_like": 17.9, "temp_min": 16.0, "temp_max": 20.1,
                "pressure": 1015, "humidity": 60
            },
            "wind": {"speed": 3.6, "deg": 250},
            "clouds": {"all": 0},
            "dt": 1717243200,
            "sys": {"country": "DE", "sunrise": 1717210000, "sunset": 1717270000},
            "timezone": 7200,
            "name": "Berlin"
        })
    }

    #[test]
    fn test_parse_full_response() {
        let snap = parse_current(&berlin(), None).unwrap();
        assert_eq!(snap.city_name, "Berlin");
        assert_eq!(snap.country, "DE");
        assert_eq!(snap.temperature, 18.5);
        assert_eq!(snap.humidity, 60);
        assert_eq!(snap.pressure, 1015);
        assert_eq!(snap.wind_direction, 250);
        assert_eq!(snap.description, "clear sky");
        assert_eq!(snap.icon, "01d");
        assert_eq!(snap.utc_offset_secs, 7200);
        assert_eq!(snap.rain_1h, None);
        assert!(snap.raw_payload.contains("Berlin"));
    }

    #[test]
    fn test_response_coordinate_wins_over_hint() {
        let hint = GeoCoordinate::named(0.0, 0.0, "Somewhere");
        let snap = parse_current(&berlin(), Some(&hint)).unwrap();
        let coord = snap.coordinate.unwrap();
        assert_eq!(coord, GeoCoordinate::new(52.52, 13.41));
        assert_eq!(coord.name.as_deref(), Some("Berlin"));
    }

    #[test]
    fn test_hint_used_without_coord_block() {
        let mut body = berlin();
        body.as_object_mut().unwrap().remove("coord");
        let hint = GeoCoordinate::new(52.5, 13.4);
        let snap = parse_current(&body, Some(&hint)).unwrap();
        assert_eq!(snap.coordinate, Some(hint));
    }

    #[test]
    fn test_optional_blocks_default() {
        let body = json!({
            "weather": [{"description": "light rain", "icon": "10n"}],
            "main": {
                "temp": 4.0, "feels_like": 1.0, "temp_min": 3.0, "temp_max": 5.0,
                "pressure": 1002, "humidity": 93
            },
            "rain": {"1h": 0.4}
        });
        let snap = parse_current(&body, None).unwrap();
        assert_eq!(snap.wind_speed, 0.0);
        assert_eq!(snap.wind_direction, 0);
        assert_eq!(snap.cloudiness, 0);
        assert_eq!(snap.country, "");
        assert_eq!(snap.rain_1h, Some(0.4));
        assert_eq!(snap.snow_1h, None);
        assert_eq!(snap.coordinate, None);
    }

    #[test]
    fn test_missing_main_is_hard_failure() {
        let mut body = berlin();
        body.as_object_mut().unwrap().remove("main");
        assert!(matches!(
            parse_current(&body, None),
            Err(ParseError::MissingBlock("main"))
        ));
    }

    #[test]
    fn test_empty_weather_array_is_hard_failure() {
        let mut body = berlin();
        body["weather"] = json!([]);
        assert!(matches!(
            parse_current(&body, None),
            Err(ParseError::MissingBlock("weather"))
        ));
    }

    #[test]
    fn test_wrong_types_are_malformed() {
        let mut body = berlin();
        body["main"]["temp"] = json!("warm");
        assert!(matches!(
            parse_current(&body, None),
            Err(ParseError::Malformed(_))
        ));
    }
}
