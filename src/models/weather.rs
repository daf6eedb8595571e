//! Current weather snapshot model

use serde::{Deserialize, Serialize};

use crate::{Result, SkyglanceError};

/// Current conditions as reported by Open-Meteo's `current_weather` block
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WeatherSnapshot {
    /// Temperature in Celsius
    pub temperature: f64,
    /// WMO weather interpretation code
    pub weathercode: i32,
    /// ISO8601 observation time (local to the location)
    pub time: String,
}

impl WeatherSnapshot {
    /// Reject snapshots that cannot be displayed
    pub fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() {
            return Err(SkyglanceError::validation(format!(
                "temperature is not a finite number: {}",
                self.temperature
            )));
        }
        if self.time.trim().is_empty() {
            return Err(SkyglanceError::validation("observation time is empty"));
        }
        Ok(())
    }

    /// Format temperature with unit
    #[must_use]
    pub fn format_temperature(&self) -> String {
        format!("{:.1}°C", self.temperature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_validation() {
        let snapshot = WeatherSnapshot {
            temperature: 0.0,
            weathercode: 3,
            time: "2025-01-01T12:00".to_string(),
        };
        assert!(snapshot.validate().is_ok());
        assert_eq!(snapshot.format_temperature(), "0.0°C");

        let no_time = WeatherSnapshot {
            time: " ".to_string(),
            ..snapshot.clone()
        };
        assert!(no_time.validate().is_err());

        let nan = WeatherSnapshot {
            temperature: f64::NAN,
            ..snapshot
        };
        assert!(nan.validate().is_err());
    }
}
