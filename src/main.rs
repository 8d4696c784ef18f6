//! Nimbus - current weather from the command line.

use anyhow::{bail, Result};
use clap::Parser;
use nimbus_core::{AppError, Config};
use nimbus_weather::{Forecast, GeoCoordinate, UiState, WeatherService, WeatherSnapshot};

#[derive(Parser)]
#[command(name = "nimbus")]
#[command(about = "Show current weather for a city, a coordinate or your location", long_about = None)]
struct Args {
    /// City to look up (defaults to the current location)
    city: Option<String>,

    /// Latitude in decimal degrees
    #[arg(long, requires = "lon", allow_hyphen_values = true, conflicts_with = "city")]
    lat: Option<f64>,

    /// Longitude in decimal degrees
    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    lon: Option<f64>,

    /// Also print the multi-day forecast
    #[arg(long)]
    forecast: bool,

    /// Keep refreshing until interrupted
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    nimbus_core::init()?;

    // Fails on validation errors; warnings are logged
    let (config, _warnings) = match Config::load_validated() {
        Ok(loaded) => loaded,
        Err(e) => {
            let err = AppError::from(e);
            tracing::error!("Failed to load configuration: {}", err);
            bail!(err.user_message());
        }
    };

    let service = match WeatherService::from_config(&config) {
        Ok(service) => service,
        Err(e) => {
            let err = AppError::from(e);
            tracing::error!("Failed to start weather service: {}", err);
            bail!(err.user_message());
        }
    };
    tracing::info!("Nimbus started");

    let state = match (args.city.as_deref(), args.lat, args.lon) {
        (Some(city), _, _) => service.fetch_by_city(city).await,
        (None, Some(lat), Some(lon)) => {
            let coord = GeoCoordinate::new(lat, lon);
            if !coord.is_valid() {
                bail!("Coordinates out of range: {}", coord);
            }
            service.fetch_by_coordinate(coord).await
        }
        _ => service.fetch_current_location().await,
    };
    print_state(&state);

    if args.forecast {
        match service.forecast().await {
            Some(Ok(forecast)) => print_forecast(&forecast),
            Some(Err(e)) => eprintln!("Forecast unavailable: {}", e.user_message()),
            None => eprintln!("Forecast unavailable: no location"),
        }
    }

    if args.watch && config.refresh.enabled {
        let mut updates = service.weather();
        updates.borrow_and_update();
        service.start_auto_refresh();
        println!(
            "Refreshing every {}s, press Ctrl-C to stop",
            config.refresh.interval_secs
        );

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = updates.borrow_and_update().clone();
                    print_state(&state);
                }
            }
        }
    } else if args.watch {
        eprintln!("Auto-refresh is disabled in the configuration");
    }

    // Graceful shutdown
    service.shutdown();

    if state.error().is_some() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_state(state: &UiState<WeatherSnapshot>) {
    match state {
        UiState::Loading => {}
        UiState::Success(snapshot) => print_snapshot(snapshot),
        UiState::Error(message) => eprintln!("Error: {}", message),
    }
}

fn print_snapshot(snapshot: &WeatherSnapshot) {
    let place = match (snapshot.city_name.as_str(), &snapshot.coordinate) {
        ("", Some(coord)) => coord
            .name
            .clone()
            .unwrap_or_else(|| coord.display_fallback()),
        ("", None) => "Unknown location".to_string(),
        (name, _) if snapshot.country.is_empty() => name.to_string(),
        (name, _) => format!("{}, {}", name, snapshot.country),
    };

    println!("{}", place);
    println!("  {}", snapshot.summary());
    println!(
        "  Feels like {:.0}°C, low {:.0}°C, high {:.0}°C",
        snapshot.feels_like, snapshot.temp_min, snapshot.temp_max
    );
    println!(
        "  Humidity {}%, pressure {} hPa, wind {:.1} m/s from {}°",
        snapshot.humidity, snapshot.pressure, snapshot.wind_speed, snapshot.wind_direction
    );
    if let Some(rain) = snapshot.rain_1h {
        println!("  Rain {:.1} mm in the last hour", rain);
    }
    if let Some(snow) = snapshot.snow_1h {
        println!("  Snow {:.1} mm in the last hour", snow);
    }
    if let (Some(sunrise), Some(sunset)) = (snapshot.sunrise_local(), snapshot.sunset_local()) {
        println!("  Sunrise {}, sunset {}", sunrise, sunset);
    }
}

fn print_forecast(forecast: &Forecast) {
    println!("Forecast for {}", forecast.city_name);
    for entry in &forecast.entries {
        let when = chrono::DateTime::from_timestamp(entry.timestamp, 0)
            .map(|t| t.format("%a %H:%M UTC").to_string())
            .unwrap_or_else(|| entry.timestamp.to_string());
        println!(
            "  {}  {:>5.1}°C  {:<20} {:>3.0}%",
            when,
            entry.temperature,
            entry.description,
            entry.precipitation_chance * 100.0
        );
    }
}
