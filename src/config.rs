//! Configuration management for Skyglance
//!
//! Handles loading configuration from files, environment variables,
//! and provides validation for all configuration settings.

use crate::SkyglanceError;
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkyglanceConfig {
    /// Upstream API endpoints and HTTP behaviour
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Memoization cache lifetimes and bounds
    #[serde(default)]
    pub cache: CacheConfig,
    /// Concurrency ceilings, batching and throttling
    #[serde(default)]
    pub requests: RequestsConfig,
    /// Persisted cache mirror
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Device position used before falling back to IP lookup
    #[serde(default)]
    pub location: LocationConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Upstream API configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Open-Meteo forecast endpoint
    #[serde(default = "default_weather_base_url")]
    pub weather_base_url: String,
    /// Base URL of the geocoding proxy (`/countries`, `/cities`)
    #[serde(default = "default_geo_base_url")]
    pub geo_base_url: String,
    /// IP location endpoint
    #[serde(default = "default_location_url")]
    pub location_url: String,
    /// Nominatim reverse geocoding endpoint
    #[serde(default = "default_reverse_geocode_url")]
    pub reverse_geocode_url: String,
    /// Hard per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u32,
    /// Retries for transient failures (not applied to the location endpoint)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_forecast_days")]
    pub forecast_days: u8,
}

/// Cache configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_weather_ttl")]
    pub weather_ttl_seconds: u64,
    #[serde(default = "default_directory_ttl")]
    pub directory_ttl_seconds: u64,
    #[serde(default = "default_location_ttl")]
    pub location_ttl_seconds: u64,
    #[serde(default = "default_weather_max_entries")]
    pub weather_max_entries: usize,
    #[serde(default = "default_directory_max_entries")]
    pub directory_max_entries: usize,
}

/// Request scheduling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestsConfig {
    /// Concurrent foreground weather requests
    #[serde(default = "default_weather_concurrency")]
    pub weather_concurrency: usize,
    /// Concurrent geocoding requests
    #[serde(default = "default_geo_concurrency")]
    pub geo_concurrency: usize,
    /// Concurrent background prefetch requests; must stay below `weather_concurrency`
    #[serde(default = "default_prefetch_concurrency")]
    pub prefetch_concurrency: usize,
    /// Delay between weather chunks and between city batch dispatches
    #[serde(default = "default_request_delay")]
    pub request_delay_ms: u64,
    /// Delay after each prefetch chunk
    #[serde(default = "default_prefetch_delay")]
    pub prefetch_delay_ms: u64,
    #[serde(default = "default_weather_chunk_size")]
    pub weather_chunk_size: usize,
    #[serde(default = "default_city_batch_size")]
    pub city_batch_size: usize,
    #[serde(default = "default_max_city_batches")]
    pub max_city_batches: usize,
    /// `maxRows` for per-country listings and searches
    #[serde(default = "default_city_query_limit")]
    pub city_query_limit: usize,
}

/// Persisted cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Keep the weather mirror on disk; otherwise it lives only for the process
    #[serde(default = "default_persistence_enabled")]
    pub enabled: bool,
    /// Directory of the on-disk store
    #[serde(default = "default_persistence_location")]
    pub location: String,
    /// Persisted blobs older than this are discarded on load
    #[serde(default = "default_staleness_hours")]
    pub staleness_hours: u32,
}

/// Device position settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationConfig {
    pub device_latitude: Option<f64>,
    pub device_longitude: Option<f64>,
}

/// Logging configuration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (pretty or json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_weather_base_url() -> String {
    "https://api.open-meteo.com/v1/forecast".to_string()
}

fn default_geo_base_url() -> String {
    "http://localhost:5173/api".to_string()
}

fn default_location_url() -> String {
    "http://localhost:5173/api/location".to_string()
}

fn default_reverse_geocode_url() -> String {
    "https://nominatim.openstreetmap.org/reverse".to_string()
}

fn default_timeout() -> u32 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_forecast_days() -> u8 {
    16
}

fn default_weather_ttl() -> u64 {
    10 * 60
}

fn default_directory_ttl() -> u64 {
    30 * 60
}

fn default_location_ttl() -> u64 {
    5 * 60
}

fn default_weather_max_entries() -> usize {
    1000
}

fn default_directory_max_entries() -> usize {
    500
}

fn default_weather_concurrency() -> usize {
    6
}

fn default_geo_concurrency() -> usize {
    4
}

fn default_prefetch_concurrency() -> usize {
    3
}

fn default_request_delay() -> u64 {
    50
}

fn default_prefetch_delay() -> u64 {
    100
}

fn default_weather_chunk_size() -> usize {
    6
}

fn default_city_batch_size() -> usize {
    100
}

fn default_max_city_batches() -> usize {
    3
}

fn default_city_query_limit() -> usize {
    50
}

fn default_persistence_enabled() -> bool {
    true
}

fn default_persistence_location() -> String {
    dirs::cache_dir()
        .map(|dir| dir.join("skyglance"))
        .unwrap_or_else(|| PathBuf::from(".skyglance-cache"))
        .to_string_lossy()
        .into_owned()
}

fn default_staleness_hours() -> u32 {
    24
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            weather_base_url: default_weather_base_url(),
            geo_base_url: default_geo_base_url(),
            location_url: default_location_url(),
            reverse_geocode_url: default_reverse_geocode_url(),
            timeout_seconds: default_timeout(),
            max_retries: default_max_retries(),
            forecast_days: default_forecast_days(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            weather_ttl_seconds: default_weather_ttl(),
            directory_ttl_seconds: default_directory_ttl(),
            location_ttl_seconds: default_location_ttl(),
            weather_max_entries: default_weather_max_entries(),
            directory_max_entries: default_directory_max_entries(),
        }
    }
}

impl Default for RequestsConfig {
    fn default() -> Self {
        Self {
            weather_concurrency: default_weather_concurrency(),
            geo_concurrency: default_geo_concurrency(),
            prefetch_concurrency: default_prefetch_concurrency(),
            request_delay_ms: default_request_delay(),
            prefetch_delay_ms: default_prefetch_delay(),
            weather_chunk_size: default_weather_chunk_size(),
            city_batch_size: default_city_batch_size(),
            max_city_batches: default_max_city_batches(),
            city_query_limit: default_city_query_limit(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: default_persistence_enabled(),
            location: default_persistence_location(),
            staleness_hours: default_staleness_hours(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl SkyglanceConfig {
    /// Load configuration from file and environment variables
    pub fn load() -> Result<Self> {
        Self::load_from_path(None)
    }

    /// Load configuration from specified path
    pub fn load_from_path(config_path: Option<PathBuf>) -> Result<Self> {
        let mut builder = Config::builder();

        let config_file = config_path.unwrap_or_else(|| {
            Self::get_config_path().unwrap_or_else(|| PathBuf::from("config.toml"))
        });

        if config_file.exists() {
            builder = builder.add_source(
                File::from(config_file.clone())
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // e.g. SKYGLANCE_REQUESTS__WEATHER_CONCURRENCY=8
        builder = builder.add_source(
            Environment::with_prefix("SKYGLANCE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .with_context(|| "Failed to build configuration")?;

        let mut config: SkyglanceConfig = settings
            .try_deserialize()
            .with_context(|| format!("Failed to deserialize configuration from {}", config_file.display()))?;

        config.apply_defaults();
        config.validate()?;

        Ok(config)
    }

    /// Get the default configuration file path
    #[must_use]
    pub fn get_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("skyglance").join("config.toml"))
    }

    /// Replace zero or empty values with their defaults
    pub fn apply_defaults(&mut self) {
        if self.upstream.weather_base_url.is_empty() {
            self.upstream.weather_base_url = default_weather_base_url();
        }
        if self.upstream.geo_base_url.is_empty() {
            self.upstream.geo_base_url = default_geo_base_url();
        }
        if self.upstream.location_url.is_empty() {
            self.upstream.location_url = default_location_url();
        }
        if self.upstream.reverse_geocode_url.is_empty() {
            self.upstream.reverse_geocode_url = default_reverse_geocode_url();
        }
        if self.upstream.timeout_seconds == 0 {
            self.upstream.timeout_seconds = default_timeout();
        }
        if self.upstream.forecast_days == 0 {
            self.upstream.forecast_days = default_forecast_days();
        }
        if self.cache.weather_ttl_seconds == 0 {
            self.cache.weather_ttl_seconds = default_weather_ttl();
        }
        if self.cache.directory_ttl_seconds == 0 {
            self.cache.directory_ttl_seconds = default_directory_ttl();
        }
        if self.cache.location_ttl_seconds == 0 {
            self.cache.location_ttl_seconds = default_location_ttl();
        }
        if self.cache.weather_max_entries == 0 {
            self.cache.weather_max_entries = default_weather_max_entries();
        }
        if self.cache.directory_max_entries == 0 {
            self.cache.directory_max_entries = default_directory_max_entries();
        }
        if self.requests.weather_chunk_size == 0 {
            self.requests.weather_chunk_size = default_weather_chunk_size();
        }
        if self.requests.city_batch_size == 0 {
            self.requests.city_batch_size = default_city_batch_size();
        }
        if self.requests.city_query_limit == 0 {
            self.requests.city_query_limit = default_city_query_limit();
        }
        if self.persistence.location.is_empty() {
            self.persistence.location = default_persistence_location();
        }
        if self.persistence.staleness_hours == 0 {
            self.persistence.staleness_hours = default_staleness_hours();
        }
        if self.logging.level.is_empty() {
            self.logging.level = default_log_level();
        }
        if self.logging.format.is_empty() {
            self.logging.format = default_log_format();
        }
    }

    /// Validate all configuration settings
    pub fn validate(&self) -> Result<()> {
        self.validate_numeric_ranges()?;
        self.validate_concurrency()?;
        self.validate_string_values()?;
        self.validate_device_position()?;
        Ok(())
    }

    /// Validate numeric configuration ranges
    fn validate_numeric_ranges(&self) -> Result<()> {
        if self.upstream.timeout_seconds > 300 {
            return Err(SkyglanceError::config("Upstream timeout cannot exceed 300 seconds").into());
        }

        if self.upstream.max_retries > 10 {
            return Err(SkyglanceError::config("Upstream max retries cannot exceed 10").into());
        }

        if !(1..=16).contains(&self.upstream.forecast_days) {
            return Err(SkyglanceError::config("Forecast days must be between 1 and 16").into());
        }

        if self.requests.max_city_batches == 0 {
            return Err(SkyglanceError::config("At least one city batch must be fetched").into());
        }

        if self.persistence.staleness_hours > 168 {
            return Err(SkyglanceError::config("Staleness window cannot exceed 168 hours (1 week)").into());
        }

        Ok(())
    }

    /// Validate concurrency ceilings
    fn validate_concurrency(&self) -> Result<()> {
        let requests = &self.requests;
        if requests.weather_concurrency == 0 || requests.geo_concurrency == 0 || requests.prefetch_concurrency == 0 {
            return Err(SkyglanceError::config("Concurrency limits must be at least 1").into());
        }

        if requests.prefetch_concurrency >= requests.weather_concurrency {
            return Err(SkyglanceError::config(format!(
                "Prefetch concurrency ({}) must be lower than weather concurrency ({})",
                requests.prefetch_concurrency, requests.weather_concurrency
            ))
            .into());
        }

        Ok(())
    }

    /// Validate string configuration values
    fn validate_string_values(&self) -> Result<()> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            return Err(SkyglanceError::config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            ))
            .into());
        }

        let valid_log_formats = ["pretty", "json"];
        if !valid_log_formats.contains(&self.logging.format.as_str()) {
            return Err(SkyglanceError::config(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_log_formats.join(", ")
            ))
            .into());
        }

        let urls = [
            ("weather_base_url", &self.upstream.weather_base_url),
            ("geo_base_url", &self.upstream.geo_base_url),
            ("location_url", &self.upstream.location_url),
            ("reverse_geocode_url", &self.upstream.reverse_geocode_url),
        ];
        for (name, url) in urls {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(SkyglanceError::config(format!("{name} must be a valid HTTP or HTTPS URL")).into());
            }
        }

        Ok(())
    }

    fn validate_device_position(&self) -> Result<()> {
        match (self.location.device_latitude, self.location.device_longitude) {
            (None, None) => Ok(()),
            (Some(lat), Some(lon)) if crate::models::valid_coordinates(lat, lon) => Ok(()),
            (Some(_), Some(_)) => Err(SkyglanceError::config("Device position is out of range").into()),
            _ => Err(SkyglanceError::config("Device latitude and longitude must be set together").into()),
        }
    }

    /// Per-request upstream timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.upstream.timeout_seconds))
    }

    /// Configured device position, if both coordinates are present
    #[must_use]
    pub fn device_position(&self) -> Option<(f64, f64)> {
        self.location.device_latitude.zip(self.location.device_longitude)
    }

    /// Create configuration directory if it doesn't exist
    pub fn ensure_config_dir() -> Result<PathBuf> {
        if let Some(config_dir) = dirs::config_dir() {
            let skyglance_config_dir = config_dir.join("skyglance");
            std::fs::create_dir_all(&skyglance_config_dir).with_context(|| {
                format!("Failed to create config directory: {}", skyglance_config_dir.display())
            })?;
            Ok(skyglance_config_dir)
        } else {
            Err(SkyglanceError::config("Unable to determine config directory").into())
        }
    }
}
