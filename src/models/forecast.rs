//! Daily forecast series and the location forecast composite

use serde::{Deserialize, Serialize};

use super::{LocationResolution, ResolutionMethod};
use crate::{Result, SkyglanceError};

/// Daily forecast as parallel arrays; index `i` of every array describes day `i`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ForecastSeries {
    /// ISO8601 dates
    pub time: Vec<String>,
    /// Daily maximum temperature in Celsius
    pub temperature_2m_max: Vec<f64>,
    /// Daily minimum temperature in Celsius
    pub temperature_2m_min: Vec<f64>,
    /// WMO weather codes
    pub weathercode: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_humidity_2m_max: Option<Vec<Option<f64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_humidity_2m_min: Option<Vec<Option<f64>>>,
    /// Precipitation in millimeters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precipitation_sum: Option<Vec<Option<f64>>>,
    /// Maximum wind speed at 10 meters in km/h
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windspeed_10m_max: Option<Vec<Option<f64>>>,
    /// Dominant wind direction in degrees
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winddirection_10m_dominant: Option<Vec<Option<f64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sunrise: Option<Vec<Option<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sunset: Option<Vec<Option<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uv_index_max: Option<Vec<Option<f64>>>,
}

impl ForecastSeries {
    /// Number of forecast days
    #[must_use]
    pub fn days(&self) -> usize {
        self.time.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    /// Check that every present array has the same length as `time`
    pub fn validate(&self) -> Result<()> {
        let expected = self.time.len();
        let lengths = [
            ("temperature_2m_max", Some(self.temperature_2m_max.len())),
            ("temperature_2m_min", Some(self.temperature_2m_min.len())),
            ("weathercode", Some(self.weathercode.len())),
            ("relative_humidity_2m_max", self.relative_humidity_2m_max.as_ref().map(Vec::len)),
            ("relative_humidity_2m_min", self.relative_humidity_2m_min.as_ref().map(Vec::len)),
            ("precipitation_sum", self.precipitation_sum.as_ref().map(Vec::len)),
            ("windspeed_10m_max", self.windspeed_10m_max.as_ref().map(Vec::len)),
            ("winddirection_10m_dominant", self.winddirection_10m_dominant.as_ref().map(Vec::len)),
            ("sunrise", self.sunrise.as_ref().map(Vec::len)),
            ("sunset", self.sunset.as_ref().map(Vec::len)),
            ("uv_index_max", self.uv_index_max.as_ref().map(Vec::len)),
        ];

        for (field, len) in lengths {
            if let Some(len) = len.filter(|len| *len != expected) {
                return Err(SkyglanceError::validation(format!(
                    "forecast array {field} has {len} entries, expected {expected}"
                )));
            }
        }
        Ok(())
    }

    /// Summary of one day, if the index is in range
    #[must_use]
    pub fn day(&self, index: usize) -> Option<DailySummary> {
        Some(DailySummary {
            date: self.time.get(index)?.clone(),
            temperature_max: *self.temperature_2m_max.get(index)?,
            temperature_min: *self.temperature_2m_min.get(index)?,
            weathercode: *self.weathercode.get(index)?,
            precipitation_sum: self
                .precipitation_sum
                .as_ref()
                .and_then(|values| values.get(index).copied().flatten()),
        })
    }
}

/// One day pulled out of a [`ForecastSeries`]
#[derive(Debug, Clone, PartialEq)]
pub struct DailySummary {
    pub date: String,
    pub temperature_max: f64,
    pub temperature_min: f64,
    pub weathercode: i32,
    pub precipitation_sum: Option<f64>,
}

/// Forecast for the user's own location
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LocationForecast {
    pub location: LocationResolution,
    pub forecast: ForecastSeries,
}

impl LocationForecast {
    /// Which resolution method produced the location
    #[must_use]
    pub fn method(&self) -> ResolutionMethod {
        self.location.method
    }
}
