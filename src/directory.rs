//! City and country directory.
//!
//! The full city list is fetched as `max_batches` pages issued concurrently
//! through the geocoding coordinator, with a short delay between issuing
//! successive pages. A failing page contributes nothing; the rest are merged
//! and deduplicated by city identity.

use futures::future::join_all;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::cache::TimestampedCache;
use crate::config::SkyglanceConfig;
use crate::coordinator::{CoordinatorStats, RequestCoordinator, request_key};
use crate::models::{City, Country};
use crate::persistence::{PersistenceBridge, StorageArea};
use crate::upstream::{CityQuery, GeoDirectorySource};

const ALL_CITIES_KEY: &str = "all_cities";
const ALL_COUNTRIES_KEY: &str = "all_countries";

/// Paging, throttling and caching parameters for the directory
#[derive(Debug, Clone)]
pub struct DirectorySettings {
    pub batch_size: usize,
    pub max_batches: usize,
    /// Delay between issuing successive batch requests
    pub request_delay: Duration,
    /// `maxRows` for per-country listings and searches
    pub query_limit: usize,
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
    pub staleness: Duration,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_batches: 3,
            request_delay: Duration::from_millis(50),
            query_limit: 50,
            cache_ttl: Duration::from_secs(30 * 60),
            cache_max_entries: 500,
            staleness: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl From<&SkyglanceConfig> for DirectorySettings {
    fn from(config: &SkyglanceConfig) -> Self {
        Self {
            batch_size: config.requests.city_batch_size,
            max_batches: config.requests.max_city_batches,
            request_delay: Duration::from_millis(config.requests.request_delay_ms),
            query_limit: config.requests.city_query_limit,
            cache_ttl: Duration::from_secs(config.cache.directory_ttl_seconds),
            cache_max_entries: config.cache.directory_max_entries,
            staleness: Duration::from_secs(u64::from(config.persistence.staleness_hours) * 60 * 60),
        }
    }
}

/// Sizes of the directory caches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryCacheStats {
    pub countries: usize,
    pub cities: usize,
    pub searches: usize,
    pub requests: CoordinatorStats,
}

/// Merge city lists, keeping one city per identity.
///
/// A later duplicate replaces the earlier record but keeps its position.
#[must_use]
pub fn dedup_cities(cities: impl IntoIterator<Item = City>) -> Vec<City> {
    let mut positions = HashMap::new();
    let mut unique: Vec<City> = Vec::new();
    for city in cities {
        match positions.entry(city.identity()) {
            Entry::Occupied(slot) => unique[*slot.get()] = city,
            Entry::Vacant(slot) => {
                slot.insert(unique.len());
                unique.push(city);
            }
        }
    }
    unique
}

pub struct CityDirectory {
    source: Arc<dyn GeoDirectorySource>,
    coordinator: RequestCoordinator,
    settings: DirectorySettings,
    countries: TimestampedCache<String, Vec<Country>>,
    cities: TimestampedCache<String, Vec<City>>,
    searches: TimestampedCache<String, Vec<City>>,
    session_countries: PersistenceBridge<Vec<Country>>,
    session_cities: PersistenceBridge<Vec<City>>,
}

impl CityDirectory {
    /// Build the directory, restoring any session copies of the lists.
    pub async fn new(
        source: Arc<dyn GeoDirectorySource>,
        coordinator: RequestCoordinator,
        settings: DirectorySettings,
        session: Arc<dyn StorageArea>,
    ) -> Self {
        let ttl = settings.cache_ttl;
        let max = settings.cache_max_entries;
        Self {
            source,
            coordinator,
            countries: TimestampedCache::new("countries", max, ttl),
            cities: TimestampedCache::new("cities", max, ttl),
            searches: TimestampedCache::new("city_search", max, ttl),
            session_countries: PersistenceBridge::load(session.clone(), "countries", ttl, settings.staleness).await,
            session_cities: PersistenceBridge::load(session, "cities", ttl, settings.staleness).await,
            settings,
        }
    }

    /// Load countries and the full city list concurrently.
    pub async fn initialize(&self) -> (Vec<Country>, Vec<City>) {
        let (countries, cities) = tokio::join!(self.fetch_countries(), self.fetch_all_cities());
        info!(countries = countries.len(), cities = cities.len(), "directory initialized");
        (countries, cities)
    }

    /// All countries; empty if the upstream fails and nothing is cached.
    #[instrument(skip(self))]
    pub async fn fetch_countries(&self) -> Vec<Country> {
        if let Some(countries) = self.countries.get(ALL_COUNTRIES_KEY) {
            debug!("countries served from memo cache");
            return countries;
        }
        if let Some(countries) = self.session_countries.get(ALL_COUNTRIES_KEY).filter(|c| !c.is_empty()) {
            debug!("countries restored from session storage");
            self.countries.set(ALL_COUNTRIES_KEY.to_string(), countries.clone());
            return countries;
        }

        let source = Arc::clone(&self.source);
        let result = self
            .coordinator
            .add("countries", move || async move { source.countries().await }, None)
            .await;

        match result {
            Ok(countries) if !countries.is_empty() => {
                self.countries.set(ALL_COUNTRIES_KEY.to_string(), countries.clone());
                self.session_countries.set(ALL_COUNTRIES_KEY, countries.clone()).await;
                countries
            }
            Ok(_) => {
                warn!("no valid countries in response");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch countries");
                Vec::new()
            }
        }
    }

    /// The complete city directory from all pages that could be fetched.
    #[instrument(skip(self))]
    pub async fn fetch_all_cities(&self) -> Vec<City> {
        if let Some(cities) = self.cities.get(ALL_CITIES_KEY).filter(|c| !c.is_empty()) {
            debug!("cities served from memo cache");
            return cities;
        }
        if let Some(cities) = self.session_cities.get(ALL_CITIES_KEY).filter(|c| !c.is_empty()) {
            debug!("cities restored from session storage");
            self.cities.set(ALL_CITIES_KEY.to_string(), cities.clone());
            return cities;
        }

        let cities = self.fetch_city_batches().await;
        if cities.is_empty() {
            warn!("no city batch returned any data");
        } else {
            self.cities.set(ALL_CITIES_KEY.to_string(), cities.clone());
            self.session_cities.set(ALL_CITIES_KEY, cities.clone()).await;
        }
        cities
    }

    async fn fetch_city_batches(&self) -> Vec<City> {
        let batch_count = self.settings.max_batches;
        let mut pending = Vec::with_capacity(batch_count);

        for batch in 0..batch_count {
            let query = CityQuery::page(batch * self.settings.batch_size, self.settings.batch_size);
            let source = Arc::clone(&self.source);
            pending.push(self.coordinator.submit(
                format!("cities_batch_{}", batch + 1),
                move || async move { source.cities_page(&query).await },
                None,
            ));

            if batch + 1 < batch_count {
                tokio::time::sleep(self.settings.request_delay).await;
            }
        }

        let pages = join_all(pending).await;
        let mut failed = 0;
        let merged = pages.into_iter().enumerate().flat_map(|(index, page)| match page {
            Ok(cities) => cities,
            Err(e) => {
                warn!(batch = index + 1, error = %e, "city batch failed, skipping");
                failed += 1;
                Vec::new()
            }
        });
        let cities = dedup_cities(merged);

        info!(cities = cities.len(), failed_batches = failed, "fetched city batches");
        cities
    }

    /// Cities of one country, up to the configured query limit.
    #[instrument(skip(self))]
    pub async fn fetch_cities_for_country(&self, country_code: &str) -> Vec<City> {
        let country_code = country_code.trim();
        if country_code.is_empty() {
            return Vec::new();
        }

        let cache_key = format!("country_{country_code}");
        if let Some(cities) = self.cities.get(&cache_key) {
            return cities;
        }

        let query = CityQuery::page(0, self.settings.query_limit).with_country(country_code);
        match self.query_cities(query).await {
            Some(cities) => {
                self.cities.set(cache_key, cities.clone());
                cities
            }
            None => Vec::new(),
        }
    }

    /// Cities whose name matches `query`, optionally within one country.
    #[instrument(skip(self))]
    pub async fn search_cities(&self, query: &str, country_code: Option<&str>) -> Vec<City> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }
        let country_code = country_code.map(str::trim).filter(|c| !c.is_empty());

        let cache_key = format!("search_{query}_{}", country_code.unwrap_or("all"));
        if let Some(cities) = self.searches.get(&cache_key) {
            return cities;
        }

        let mut city_query = CityQuery::page(0, self.settings.query_limit).with_prefix(query);
        if let Some(code) = country_code {
            city_query = city_query.with_country(code);
        }
        match self.query_cities(city_query).await {
            Some(cities) => {
                self.searches.set(cache_key, cities.clone());
                cities
            }
            None => Vec::new(),
        }
    }

    async fn query_cities(&self, query: CityQuery) -> Option<Vec<City>> {
        let mut params = vec![
            ("maxRows", query.limit.to_string()),
            ("startRow", query.offset.to_string()),
        ];
        if let Some(country) = &query.country {
            params.push(("country", country.clone()));
        }
        if let Some(prefix) = &query.prefix {
            params.push(("q", prefix.clone()));
        }
        let key = request_key("cities", &params);

        let source = Arc::clone(&self.source);
        let result = self
            .coordinator
            .add(key, move || async move { source.cities_page(&query).await }, None)
            .await;

        match result {
            Ok(cities) => Some(dedup_cities(cities)),
            Err(e) => {
                warn!(error = %e, "city query failed");
                None
            }
        }
    }

    /// Drop every memoized list and the session copies.
    pub async fn clear_caches(&self) {
        self.countries.clear();
        self.cities.clear();
        self.searches.clear();
        self.session_countries.clear().await;
        self.session_cities.clear().await;
    }

    #[must_use]
    pub fn cache_stats(&self) -> DirectoryCacheStats {
        DirectoryCacheStats {
            countries: self.countries.len(),
            cities: self.cities.len(),
            searches: self.searches.len(),
            requests: self.coordinator.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStorage;
    use crate::{Result, SkyglanceError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves three pages; page offsets listed in `failing` return an error.
    #[derive(Default)]
    struct PagedSource {
        pages: HashMap<usize, Vec<City>>,
        failing: Vec<usize>,
        page_calls: AtomicUsize,
        country_calls: AtomicUsize,
        queries: Mutex<Vec<CityQuery>>,
    }

    #[async_trait]
    impl GeoDirectorySource for PagedSource {
        async fn cities_page(&self, query: &CityQuery) -> Result<Vec<City>> {
            self.page_calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().push(query.clone());
            if self.failing.contains(&query.offset) {
                return Err(SkyglanceError::http(502, "Bad Gateway"));
            }
            Ok(self.pages.get(&query.offset).cloned().unwrap_or_default())
        }

        async fn countries(&self) -> Result<Vec<Country>> {
            self.country_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Country {
                country_code: "DE".to_string(),
                country_name: "Germany".to_string(),
                population: None,
            }])
        }
    }

    fn city(name: &str, id: u64) -> City {
        City::new(name, 50.0, 8.0, "DE").with_geoname_id(id)
    }

    fn settings() -> DirectorySettings {
        DirectorySettings {
            batch_size: 10,
            ..DirectorySettings::default()
        }
    }

    async fn directory(source: Arc<PagedSource>, session: Arc<MemoryStorage>) -> CityDirectory {
        let coordinator = RequestCoordinator::new("geo", 4, Duration::from_secs(30));
        CityDirectory::new(source, coordinator, settings(), session).await
    }

    #[test]
    fn test_dedup_last_write_wins_in_first_position() {
        let mut newer = city("Frankfurt", 42);
        newer.population = Some(760_000);
        let cities = dedup_cities(vec![city("Frankfurt", 42), city("Mainz", 7), newer]);

        assert_eq!(cities.len(), 2);
        assert_eq!(cities[0].geoname_id, Some(42));
        assert_eq!(cities[0].population, Some(760_000));
        assert_eq!(cities[1].name, "Mainz");
    }

    #[test]
    fn test_dedup_without_ids_uses_name_and_position() {
        let cities = dedup_cities(vec![
            City::new("Springfield", 39.8, -89.6, "US"),
            City::new("Springfield", 39.8, -89.6, "US"),
            City::new("Springfield", 37.2, -93.3, "US"),
        ]);
        assert_eq!(cities.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_failure_keeps_other_pages() {
        let mut first = city("Berlin", 1);
        first.population = Some(1);
        let mut duplicate = city("Berlin", 1);
        duplicate.population = Some(2);

        let source = Arc::new(PagedSource {
            pages: HashMap::from([
                (0, vec![first, city("Hamburg", 2)]),
                (10, vec![city("Munich", 3)]),
                (20, vec![duplicate, city("Cologne", 4)]),
            ]),
            failing: vec![10],
            ..PagedSource::default()
        });
        let dir = directory(source.clone(), Arc::new(MemoryStorage::new())).await;

        let cities = dir.fetch_all_cities().await;
        let names: Vec<_> = cities.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Berlin", "Hamburg", "Cologne"]);
        assert_eq!(cities[0].population, Some(2));
        assert_eq!(source.page_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_issued_with_delay_between_dispatches() {
        let source = Arc::new(PagedSource::default());
        let dir = directory(source.clone(), Arc::new(MemoryStorage::new())).await;

        let start = tokio::time::Instant::now();
        dir.fetch_all_cities().await;
        assert_eq!(start.elapsed(), Duration::from_millis(100));

        let offsets: Vec<_> = source.queries.lock().iter().map(|q| q.offset).collect();
        assert_eq!(offsets, vec![0, 10, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_city_list_cached_and_mirrored_to_session() {
        let source = Arc::new(PagedSource {
            pages: HashMap::from([(0, vec![city("Berlin", 1)])]),
            ..PagedSource::default()
        });
        let session = Arc::new(MemoryStorage::new());
        let dir = directory(source.clone(), session.clone()).await;

        assert_eq!(dir.fetch_all_cities().await.len(), 1);
        assert_eq!(dir.fetch_all_cities().await.len(), 1);
        assert_eq!(source.page_calls.load(Ordering::SeqCst), 3);

        let restored = directory(source.clone(), session).await;
        assert_eq!(restored.fetch_all_cities().await[0].name, "Berlin");
        assert_eq!(source.page_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_batches_failing_is_not_cached() {
        let source = Arc::new(PagedSource {
            failing: vec![0, 10, 20],
            ..PagedSource::default()
        });
        let dir = directory(source.clone(), Arc::new(MemoryStorage::new())).await;

        assert!(dir.fetch_all_cities().await.is_empty());
        assert!(dir.fetch_all_cities().await.is_empty());
        assert_eq!(source.page_calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_country_listing_and_search_use_own_namespaces() {
        let source = Arc::new(PagedSource {
            pages: HashMap::from([(0, vec![city("Berlin", 1)])]),
            ..PagedSource::default()
        });
        let dir = directory(source.clone(), Arc::new(MemoryStorage::new())).await;

        assert_eq!(dir.fetch_cities_for_country("DE").await.len(), 1);
        assert_eq!(dir.fetch_cities_for_country("DE").await.len(), 1);
        assert_eq!(dir.search_cities("Ber", Some("DE")).await.len(), 1);
        assert_eq!(dir.search_cities("Ber", None).await.len(), 1);
        assert!(dir.search_cities("   ", None).await.is_empty());
        assert!(dir.fetch_cities_for_country("").await.is_empty());

        assert_eq!(source.page_calls.load(Ordering::SeqCst), 3);
        let queries = source.queries.lock();
        assert_eq!(queries[0].country.as_deref(), Some("DE"));
        assert_eq!(queries[0].limit, 50);
        assert_eq!(queries[1].prefix.as_deref(), Some("Ber"));
        assert!(queries[2].country.is_none());

        let stats = dir.cache_stats();
        assert_eq!(stats.cities, 1);
        assert_eq!(stats.searches, 2);
    }

    #[tokio::test]
    async fn test_countries_cached_and_cleared() {
        let source = Arc::new(PagedSource::default());
        let session = Arc::new(MemoryStorage::new());
        let dir = directory(source.clone(), session.clone()).await;

        assert_eq!(dir.fetch_countries().await.len(), 1);
        assert_eq!(dir.fetch_countries().await.len(), 1);
        assert_eq!(source.country_calls.load(Ordering::SeqCst), 1);
        assert!(session.get("countries").await.unwrap().is_some());

        dir.clear_caches().await;
        assert_eq!(dir.cache_stats().countries, 0);
        assert!(session.get("countries").await.unwrap().is_none());

        dir.fetch_countries().await;
        assert_eq!(source.country_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_loads_both_lists() {
        let source = Arc::new(PagedSource {
            pages: HashMap::from([(0, vec![city("Berlin", 1)])]),
            ..PagedSource::default()
        });
        let dir = directory(source, Arc::new(MemoryStorage::new())).await;

        let (countries, cities) = dir.initialize().await;
        assert_eq!(countries.len(), 1);
        assert_eq!(cities.len(), 1);
    }
}
