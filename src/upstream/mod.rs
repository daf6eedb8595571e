//! Upstream fetch adapters for the weather, geocoding and location APIs.
//!
//! Each adapter sits behind a trait so the orchestration layer can be driven
//! by mock sources in tests.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::RetryTransientMiddleware;
use reqwest_retry::policies::ExponentialBackoff;
use serde_json::Value;
use std::time::Duration;

use crate::models::{City, Country, ForecastSeries, LocationResolution, WeatherSnapshot};
use crate::{Result, SkyglanceError};

pub mod geo_proxy;
pub mod location;
pub mod open_meteo;

pub use geo_proxy::GeoProxyClient;
pub use location::{
    FixedPosition, IpLocationClient, LocationResolver, NominatimGeocoder, PlaceName, PositionProvider, ReverseGeocoder,
};
pub use open_meteo::OpenMeteoClient;

const USER_AGENT: &str = concat!("Skyglance/", env!("CARGO_PKG_VERSION"));

/// Current conditions and daily forecasts by coordinates
#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn current_weather(&self, lat: f64, lon: f64) -> Result<WeatherSnapshot>;
    async fn forecast(&self, lat: f64, lon: f64) -> Result<ForecastSeries>;
}

/// Paginated city listing and the country list
#[async_trait]
pub trait GeoDirectorySource: Send + Sync {
    /// One page of cities; records that fail normalization are dropped.
    async fn cities_page(&self, query: &CityQuery) -> Result<Vec<City>>;
    async fn countries(&self) -> Result<Vec<Country>>;
}

/// Where the user is
#[async_trait]
pub trait LocationSource: Send + Sync {
    async fn resolve_location(&self) -> Result<LocationResolution>;
}

/// Filter and page for a city listing request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CityQuery {
    pub offset: usize,
    pub limit: usize,
    /// ISO country code
    pub country: Option<String>,
    /// Name prefix
    pub prefix: Option<String>,
}

impl CityQuery {
    #[must_use]
    pub fn page(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

/// HTTP client with a hard per-request timeout and transient-failure retries
pub fn build_http_client(timeout: Duration, max_retries: u32) -> Result<ClientWithMiddleware> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| SkyglanceError::config(format!("failed to create HTTP client: {e}")))?;

    let builder = ClientBuilder::new(client);
    let builder = if max_retries > 0 {
        let policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        builder.with(RetryTransientMiddleware::new_with_policy(policy))
    } else {
        builder
    };
    Ok(builder.build())
}

pub(crate) fn build_url(base: &str, params: &[(&str, String)]) -> Result<Url> {
    Url::parse_with_params(base, params)
        .map_err(|e| SkyglanceError::config(format!("invalid upstream URL {base}: {e}")))
}

/// GET `url` and parse the body as JSON.
///
/// 429 maps to `RateLimited`, any other non-2xx status to `Http`, and an
/// unparseable body to `Validation`. An empty body yields `None`.
pub(crate) async fn fetch_json(client: &ClientWithMiddleware, url: Url) -> Result<Option<Value>> {
    tracing::debug!(%url, "upstream request");
    let response = client.get(url.clone()).send().await?;
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(SkyglanceError::rate_limited(format!("{} returned 429", url.path())));
    }
    if !status.is_success() {
        let reason = status.canonical_reason().unwrap_or("Unknown status");
        return Err(SkyglanceError::http(
            status.as_u16(),
            format!("{} responded with {reason}", url.path()),
        ));
    }

    let body = response.bytes().await?;
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> ClientWithMiddleware {
        build_http_client(Duration::from_secs(5), 0).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_json_classifies_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/garbage"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(200).set_body_string("  "))
            .mount(&server)
            .await;

        let url = |p: &str| build_url(&format!("{}{p}", server.uri()), &[]).unwrap();

        let limited = fetch_json(&client(), url("/limited")).await;
        assert!(matches!(limited, Err(SkyglanceError::RateLimited { .. })));

        let broken = fetch_json(&client(), url("/broken")).await;
        assert!(matches!(broken, Err(SkyglanceError::Http { status: 503, .. })));

        let garbage = fetch_json(&client(), url("/garbage")).await;
        assert!(matches!(garbage, Err(SkyglanceError::Validation { .. })));

        assert_eq!(fetch_json(&client(), url("/empty")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let client = build_http_client(Duration::from_millis(200), 0).unwrap();
        let url = build_url(&server.uri(), &[]).unwrap();
        let result = fetch_json(&client, url).await;
        assert!(matches!(result, Err(SkyglanceError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_connection_failure_is_network_error() {
        let client = client();
        let url = build_url("http://127.0.0.1:9/unreachable", &[]).unwrap();
        let result = fetch_json(&client, url).await;
        assert!(matches!(result, Err(SkyglanceError::Network { .. })));
    }

    #[test]
    fn test_build_url_encodes_params() {
        let url = build_url("https://example.com/api/cities", &[("q", "São Paulo".to_string())]).unwrap();
        assert_eq!(url.as_str(), "https://example.com/api/cities?q=S%C3%A3o+Paulo");
        assert!(build_url("not a url", &[]).is_err());
    }
}
