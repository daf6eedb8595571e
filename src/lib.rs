//! Skyglance - weather lookup data layer
//!
//! Bounded time-expiring caches, deduplicating request coordination and
//! batched fetching from the weather, geocoding and location APIs.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod error;
pub mod logging;
pub mod models;
pub mod persistence;
pub mod upstream;
pub mod weather;

// Re-export core types for public API
pub use cache::TimestampedCache;
pub use config::SkyglanceConfig;
pub use coordinator::{CoordinatorStats, RequestCoordinator, request_key};
pub use directory::{CityDirectory, DirectorySettings};
pub use error::SkyglanceError;
pub use models::{City, Country, ForecastSeries, LocationForecast, LocationResolution, WeatherSnapshot};
pub use persistence::{FjallStorage, MemoryStorage, PersistenceBridge, StorageArea};
pub use upstream::{CityQuery, GeoDirectorySource, LocationSource, WeatherSource};
pub use weather::{WeatherService, WeatherSettings};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Core result type used throughout the library
pub type Result<T> = std::result::Result<T, SkyglanceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
