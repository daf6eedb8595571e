//! Weather and forecast orchestration.
//!
//! Every lookup is cache-first: the in-memory memo cache, then the persisted
//! mirror, then the upstream through a [`RequestCoordinator`]. Successful
//! fetches are written through to both cache layers. Failures are logged and
//! surface as `None` or as omissions from a batch, never as errors.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::Result;
use crate::cache::TimestampedCache;
use crate::config::SkyglanceConfig;
use crate::coordinator::{CoordinatorStats, RequestCoordinator, request_key};
use crate::models::{City, ForecastSeries, LocationForecast, LocationResolution, WeatherSnapshot};
use crate::persistence::{PersistenceBridge, StorageArea};
use crate::upstream::{LocationSource, WeatherSource};

const LOCATION_KEY: &str = "ip_location";

/// Chunking, throttling and caching parameters for weather lookups
#[derive(Debug, Clone)]
pub struct WeatherSettings {
    /// Cities looked up in parallel per chunk
    pub chunk_size: usize,
    /// Pause between successive chunks
    pub chunk_delay: Duration,
    /// Pause after each background prefetch chunk
    pub prefetch_delay: Duration,
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    pub location_ttl: Duration,
    pub staleness: Duration,
}

impl Default for WeatherSettings {
    fn default() -> Self {
        Self {
            chunk_size: 6,
            chunk_delay: Duration::from_millis(50),
            prefetch_delay: Duration::from_millis(100),
            cache_ttl: Duration::from_secs(10 * 60),
            cache_max_entries: 1000,
            location_ttl: Duration::from_secs(5 * 60),
            staleness: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl From<&SkyglanceConfig> for WeatherSettings {
    fn from(config: &SkyglanceConfig) -> Self {
        Self {
            chunk_size: config.requests.weather_chunk_size,
            chunk_delay: Duration::from_millis(config.requests.request_delay_ms),
            prefetch_delay: Duration::from_millis(config.requests.prefetch_delay_ms),
            cache_ttl: Duration::from_secs(config.cache.weather_ttl_seconds),
            cache_max_entries: config.cache.weather_max_entries,
            location_ttl: Duration::from_secs(config.cache.location_ttl_seconds),
            staleness: Duration::from_secs(u64::from(config.persistence.staleness_hours) * 60 * 60),
        }
    }
}

/// Sizes of the weather caches and the load on both coordinators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeatherCacheStats {
    pub weather: usize,
    pub forecast: usize,
    pub location: usize,
    pub persisted_weather: usize,
    pub persisted_forecast: usize,
    pub prefetch_queued: usize,
    pub requests: CoordinatorStats,
    pub prefetch_requests: CoordinatorStats,
}

#[derive(Default)]
struct PrefetchState {
    running: bool,
    queue: VecDeque<City>,
}

pub struct WeatherService {
    weather: Arc<dyn WeatherSource>,
    location: Arc<dyn LocationSource>,
    coordinator: RequestCoordinator,
    prefetch_coordinator: RequestCoordinator,
    settings: WeatherSettings,
    weather_cache: TimestampedCache<String, WeatherSnapshot>,
    forecast_cache: TimestampedCache<String, ForecastSeries>,
    location_cache: TimestampedCache<String, LocationResolution>,
    persisted_weather: PersistenceBridge<WeatherSnapshot>,
    persisted_forecast: PersistenceBridge<ForecastSeries>,
    prefetch: Mutex<PrefetchState>,
}

impl WeatherService {
    /// Build the service, restoring persisted weather and forecasts that are
    /// still inside the staleness window.
    pub async fn new(
        weather: Arc<dyn WeatherSource>,
        location: Arc<dyn LocationSource>,
        coordinator: RequestCoordinator,
        prefetch_coordinator: RequestCoordinator,
        settings: WeatherSettings,
        storage: Arc<dyn StorageArea>,
    ) -> Self {
        if prefetch_coordinator.max_concurrency() >= coordinator.max_concurrency() {
            warn!(
                prefetch = prefetch_coordinator.max_concurrency(),
                foreground = coordinator.max_concurrency(),
                "prefetch concurrency should be below foreground concurrency"
            );
        }

        let ttl = settings.cache_ttl;
        let max = settings.cache_max_entries;
        Self {
            weather,
            location,
            coordinator,
            prefetch_coordinator,
            weather_cache: TimestampedCache::new("weather", max, ttl),
            forecast_cache: TimestampedCache::new("forecast", max, ttl),
            location_cache: TimestampedCache::new("location", 1, settings.location_ttl),
            persisted_weather: PersistenceBridge::load(storage.clone(), "weatherCache", ttl, settings.staleness).await,
            persisted_forecast: PersistenceBridge::load(storage, "forecastCache", ttl, settings.staleness).await,
            prefetch: Mutex::new(PrefetchState::default()),
            settings,
        }
    }

    /// Current conditions for `city`, or `None` if the city is invalid or
    /// the lookup fails.
    #[instrument(skip(self, city), fields(city = %city.name))]
    pub async fn get_current_weather(&self, city: &City) -> Option<WeatherSnapshot> {
        if let Err(e) = city.validate() {
            debug!(error = %e, "skipping weather lookup");
            return None;
        }

        match self.load_weather(city, &self.coordinator).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "failed to get current weather");
                None
            }
        }
    }

    async fn load_weather(&self, city: &City, coordinator: &RequestCoordinator) -> Result<WeatherSnapshot> {
        let key = city.cache_key();
        if let Some(snapshot) = self.weather_cache.get(&key) {
            debug!("weather memo cache hit");
            return Ok(snapshot);
        }
        if let Some(snapshot) = self.persisted_weather.get(&key) {
            debug!("weather persisted cache hit");
            self.weather_cache.set(key, snapshot.clone());
            return Ok(snapshot);
        }

        let (lat, lon) = (city.lat, city.lon);
        let source = Arc::clone(&self.weather);
        let snapshot = coordinator
            .add(
                coordinate_key("current_weather", lat, lon),
                move || async move { source.current_weather(lat, lon).await },
                None,
            )
            .await?;

        self.weather_cache.set(key.clone(), snapshot.clone());
        self.persisted_weather.set(key, snapshot.clone()).await;
        Ok(snapshot)
    }

    /// Daily forecast for `city`, or `None` if the city is invalid or the
    /// lookup fails.
    #[instrument(skip(self, city), fields(city = %city.name))]
    pub async fn get_forecast(&self, city: &City) -> Option<ForecastSeries> {
        if let Err(e) = city.validate() {
            debug!(error = %e, "skipping forecast lookup");
            return None;
        }

        let key = city.cache_key();
        if let Some(series) = self.forecast_cache.get(&key) {
            debug!("forecast memo cache hit");
            return Some(series);
        }
        if let Some(series) = self.persisted_forecast.get(&key) {
            debug!("forecast persisted cache hit");
            self.forecast_cache.set(key, series.clone());
            return Some(series);
        }

        match self.fetch_forecast(city.lat, city.lon).await {
            Ok(series) => {
                self.forecast_cache.set(key.clone(), series.clone());
                self.persisted_forecast.set(key, series.clone()).await;
                Some(series)
            }
            Err(e) => {
                warn!(error = %e, "failed to get forecast");
                None
            }
        }
    }

    async fn fetch_forecast(&self, lat: f64, lon: f64) -> Result<ForecastSeries> {
        let source = Arc::clone(&self.weather);
        self.coordinator
            .add(
                coordinate_key("forecast", lat, lon),
                move || async move { source.forecast(lat, lon).await },
                None,
            )
            .await
    }

    /// Current weather for many cities, keyed by city name.
    ///
    /// Cities are processed in chunks: every lookup in a chunk runs in
    /// parallel, the next chunk starts after the whole chunk has settled and
    /// a fixed delay has passed. Invalid or failing cities are omitted.
    #[instrument(skip(self, cities), fields(count = cities.len()))]
    pub async fn get_weather_for_cities(&self, cities: &[City]) -> HashMap<String, WeatherSnapshot> {
        let valid: Vec<&City> = cities.iter().filter(|city| city.has_valid_coordinates()).collect();
        if valid.len() < cities.len() {
            debug!(skipped = cities.len() - valid.len(), "skipping cities with invalid coordinates");
        }

        let mut results = HashMap::with_capacity(valid.len());
        for (index, chunk) in valid.chunks(self.settings.chunk_size.max(1)).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.settings.chunk_delay).await;
            }

            let lookups = chunk.iter().map(|city| async move {
                let snapshot = self.get_current_weather(city).await;
                (city.name.clone(), snapshot)
            });
            for (name, snapshot) in join_all(lookups).await {
                if let Some(snapshot) = snapshot {
                    results.insert(name, snapshot);
                }
            }
        }

        info!(requested = cities.len(), fetched = results.len(), "batch weather lookup finished");
        results
    }

    /// Warm the weather cache in the background.
    ///
    /// Returns the handle of the prefetch task it started, or `None` when a
    /// prefetch run is already active; in that case the cities are queued and
    /// picked up by the active run.
    pub fn prefetch_weather_for_cities(self: &Arc<Self>, cities: Vec<City>) -> Option<JoinHandle<()>> {
        {
            let mut state = self.prefetch.lock();
            state
                .queue
                .extend(cities.into_iter().filter(City::has_valid_coordinates));
            if state.running || state.queue.is_empty() {
                return None;
            }
            state.running = true;
        }

        let service = Arc::clone(self);
        Some(tokio::spawn(async move { service.run_prefetch().await }))
    }

    async fn run_prefetch(&self) {
        loop {
            let batch: Vec<City> = {
                let mut state = self.prefetch.lock();
                if state.queue.is_empty() {
                    state.running = false;
                    return;
                }
                state.queue.drain(..).collect()
            };
            debug!(cities = batch.len(), "prefetching weather");

            for chunk in batch.chunks(self.prefetch_coordinator.max_concurrency()) {
                let lookups = chunk
                    .iter()
                    .filter(|city| !self.weather_cache.contains_key(&city.cache_key()))
                    .map(|city| self.load_weather(city, &self.prefetch_coordinator));
                for result in join_all(lookups).await {
                    if let Err(e) = result {
                        debug!(error = %e, "prefetch lookup failed");
                    }
                }
                tokio::time::sleep(self.settings.prefetch_delay).await;
            }
        }
    }

    /// Forecast for the user's own location, tagged with how the location
    /// was resolved. `None` if either step fails.
    #[instrument(skip(self))]
    pub async fn get_location_forecast(&self) -> Option<LocationForecast> {
        let location = match self.location_cache.get(LOCATION_KEY) {
            Some(location) => location,
            None => {
                let source = Arc::clone(&self.location);
                let resolved = self
                    .coordinator
                    .add(LOCATION_KEY, move || async move { source.resolve_location().await }, None)
                    .await;
                match resolved {
                    Ok(location) => {
                        self.location_cache.set(LOCATION_KEY.to_string(), location.clone());
                        location
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to resolve location");
                        return None;
                    }
                }
            }
        };

        match self.fetch_forecast(location.latitude, location.longitude).await {
            Ok(forecast) => {
                info!(method = ?location.method, place = %location.display_name(), "location forecast ready");
                Some(LocationForecast { location, forecast })
            }
            Err(e) => {
                warn!(error = %e, "failed to get location forecast");
                None
            }
        }
    }

    /// Empty every memo cache and the persisted mirrors.
    pub async fn clear_caches(&self) {
        self.weather_cache.clear();
        self.forecast_cache.clear();
        self.location_cache.clear();
        self.persisted_weather.clear().await;
        self.persisted_forecast.clear().await;
        info!("weather caches cleared");
    }

    #[must_use]
    pub fn cache_stats(&self) -> WeatherCacheStats {
        WeatherCacheStats {
            weather: self.weather_cache.len(),
            forecast: self.forecast_cache.len(),
            location: self.location_cache.len(),
            persisted_weather: self.persisted_weather.len(),
            persisted_forecast: self.persisted_forecast.len(),
            prefetch_queued: self.prefetch.lock().queue.len(),
            requests: self.coordinator.stats(),
            prefetch_requests: self.prefetch_coordinator.stats(),
        }
    }
}

fn coordinate_key(endpoint: &str, lat: f64, lon: f64) -> String {
    request_key(endpoint, &[("latitude", lat.to_string()), ("longitude", lon.to_string())])
}
