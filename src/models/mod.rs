//! Data models for the Skyglance data layer
//!
//! This module contains the core domain models organized by concern:
//! - Location: cities, countries and resolved user locations
//! - Weather: current conditions snapshot
//! - Forecast: daily forecast series and the location forecast composite

pub mod forecast;
pub mod location;
pub mod weather;

// Re-export all public types for convenient access
pub use forecast::{DailySummary, ForecastSeries, LocationForecast};
pub use location::{City, CityIdentity, Country, LocationResolution, ResolutionMethod, valid_coordinates};
pub use weather::WeatherSnapshot;
