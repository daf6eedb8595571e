//! Open-Meteo weather client

use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use std::time::Instant;
use tracing::{info, instrument, warn};

use super::{WeatherSource, build_url, fetch_json};
use crate::models::{ForecastSeries, WeatherSnapshot, valid_coordinates};
use crate::{Result, SkyglanceError};

/// Daily fields requested for a forecast
pub const DAILY_FIELDS: &[&str] = &[
    "temperature_2m_max",
    "temperature_2m_min",
    "weathercode",
    "relative_humidity_2m_max",
    "relative_humidity_2m_min",
    "precipitation_sum",
    "windspeed_10m_max",
    "winddirection_10m_dominant",
    "sunrise",
    "sunset",
    "uv_index_max",
];

#[derive(Debug, Deserialize)]
struct CurrentWeatherResponse {
    current_weather: Option<WeatherSnapshot>,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    daily: Option<ForecastSeries>,
}

/// Client for the public Open-Meteo forecast API
pub struct OpenMeteoClient {
    client: ClientWithMiddleware,
    base_url: String,
    forecast_days: u8,
}

impl OpenMeteoClient {
    #[must_use]
    pub fn new(client: ClientWithMiddleware, base_url: impl Into<String>, forecast_days: u8) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            forecast_days,
        }
    }

    fn coordinate_params(lat: f64, lon: f64) -> Result<Vec<(&'static str, String)>> {
        if !valid_coordinates(lat, lon) {
            return Err(SkyglanceError::input(format!("coordinates out of range: lat={lat}, lon={lon}")));
        }
        Ok(vec![("latitude", lat.to_string()), ("longitude", lon.to_string())])
    }
}

#[async_trait]
impl WeatherSource for OpenMeteoClient {
    #[instrument(skip(self))]
    async fn current_weather(&self, lat: f64, lon: f64) -> Result<WeatherSnapshot> {
        let start = Instant::now();
        let mut params = Self::coordinate_params(lat, lon)?;
        params.push(("current_weather", "true".to_string()));
        let url = build_url(&self.base_url, &params)?;

        let body = fetch_json(&self.client, url)
            .await?
            .ok_or_else(|| SkyglanceError::validation("empty current weather response"))?;
        let response: CurrentWeatherResponse = serde_json::from_value(body)?;
        let snapshot = response
            .current_weather
            .ok_or_else(|| SkyglanceError::validation("response has no current_weather block"))?;
        snapshot.validate()?;

        info!(elapsed_ms = start.elapsed().as_millis(), "fetched current weather");
        Ok(snapshot)
    }

    #[instrument(skip(self))]
    async fn forecast(&self, lat: f64, lon: f64) -> Result<ForecastSeries> {
        let start = Instant::now();
        let mut params = Self::coordinate_params(lat, lon)?;
        params.push(("daily", DAILY_FIELDS.join(",")));
        params.push(("forecast_days", self.forecast_days.to_string()));
        params.push(("timezone", "auto".to_string()));
        let url = build_url(&self.base_url, &params)?;

        let body = fetch_json(&self.client, url)
            .await?
            .ok_or_else(|| SkyglanceError::validation("empty forecast response"))?;
        let response: ForecastResponse = serde_json::from_value(body)?;
        let series = response
            .daily
            .ok_or_else(|| SkyglanceError::validation("response has no daily block"))?;
        series.validate()?;

        if series.is_empty() {
            warn!("forecast contains no days");
        }
        info!(
            days = series.days(),
            elapsed_ms = start.elapsed().as_millis(),
            "fetched forecast"
        );
        Ok(series)
    }
}
