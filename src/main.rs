use anyhow::{Context, Result};
use skyglance::config::SkyglanceConfig;
use skyglance::upstream::{
    FixedPosition, GeoProxyClient, IpLocationClient, LocationResolver, NominatimGeocoder, OpenMeteoClient,
    build_http_client,
};
use skyglance::{
    CityDirectory, DirectorySettings, FjallStorage, MemoryStorage, RequestCoordinator, StorageArea, WeatherService,
    WeatherSettings,
};
use std::sync::Arc;

const SAMPLE_CITIES: usize = 5;

#[tokio::main]
async fn main() -> Result<()> {
    let config = SkyglanceConfig::load()?;
    skyglance::logging::init(&config.logging)?;

    let timeout = config.timeout();
    let client = build_http_client(timeout, config.upstream.max_retries)?;
    // 429 from the location endpoint must reach the fallback path unretried
    let location_client = build_http_client(timeout, 0)?;

    let weather_source = Arc::new(OpenMeteoClient::new(
        client.clone(),
        &config.upstream.weather_base_url,
        config.upstream.forecast_days,
    ));
    let geo_source = Arc::new(GeoProxyClient::new(client.clone(), &config.upstream.geo_base_url));
    let location_source = Arc::new(LocationResolver::new(
        Arc::new(FixedPosition(config.device_position())),
        Arc::new(NominatimGeocoder::new(client, &config.upstream.reverse_geocode_url)),
        IpLocationClient::new(location_client, &config.upstream.location_url),
    ));

    let requests = &config.requests;
    let weather_coordinator = RequestCoordinator::new("weather", requests.weather_concurrency, timeout);
    let geo_coordinator = RequestCoordinator::new("geo", requests.geo_concurrency, timeout);
    let prefetch_coordinator = RequestCoordinator::new("prefetch", requests.prefetch_concurrency, timeout);

    let storage: Arc<dyn StorageArea> = if config.persistence.enabled {
        Arc::new(
            FjallStorage::open(&config.persistence.location)
                .with_context(|| format!("Failed to open cache at {}", config.persistence.location))?,
        )
    } else {
        Arc::new(MemoryStorage::new())
    };
    let session: Arc<dyn StorageArea> = Arc::new(MemoryStorage::new());

    let directory = CityDirectory::new(
        geo_source,
        geo_coordinator,
        DirectorySettings::from(&config),
        session,
    )
    .await;
    let weather = Arc::new(
        WeatherService::new(
            weather_source,
            location_source,
            weather_coordinator,
            prefetch_coordinator,
            WeatherSettings::from(&config),
            storage,
        )
        .await,
    );

    match weather.get_location_forecast().await {
        Some(local) => {
            println!("Forecast for {} ({:?})", local.location.display_name(), local.method());
            for day in (0..local.forecast.days()).filter_map(|i| local.forecast.day(i)) {
                println!(
                    "  {}  {:>5.1} / {:>5.1}  (code {})",
                    day.date, day.temperature_max, day.temperature_min, day.weathercode
                );
            }
        }
        None => println!("Could not resolve a local forecast"),
    }

    let (countries, cities) = directory.initialize().await;
    println!("Loaded {} countries and {} cities", countries.len(), cities.len());

    let sample: Vec<_> = cities.iter().take(SAMPLE_CITIES).cloned().collect();
    let snapshots = weather.get_weather_for_cities(&sample).await;
    for city in &sample {
        if let Some(snapshot) = snapshots.get(&city.name) {
            println!("  {:<24} {} (code {})", city.name, snapshot.format_temperature(), snapshot.weathercode);
        }
    }

    if let Some(prefetch) = weather.prefetch_weather_for_cities(cities.into_iter().skip(SAMPLE_CITIES).take(20).collect()) {
        prefetch.await.context("prefetch task panicked")?;
    }

    tracing::info!(stats = ?weather.cache_stats(), "done");
    Ok(())
}
