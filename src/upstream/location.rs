//! Location resolution: device position with reverse geocoding, then IP
//! lookup, then a fixed fallback when the IP service rate limits us.

use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::{LocationSource, build_url, fetch_json};
use crate::models::{LocationResolution, ResolutionMethod, valid_coordinates};
use crate::{Result, SkyglanceError};

/// Source of the device's own position (the browser geolocation stand-in)
#[async_trait]
pub trait PositionProvider: Send + Sync {
    /// `None` when no position is available or permission was denied.
    async fn current_position(&self) -> Result<Option<(f64, f64)>>;
}

/// A position fixed at construction, typically from configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedPosition(pub Option<(f64, f64)>);

#[async_trait]
impl PositionProvider for FixedPosition {
    async fn current_position(&self) -> Result<Option<(f64, f64)>> {
        Ok(self.0)
    }
}

/// Place attached to a position by reverse geocoding
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlaceName {
    pub city: Option<String>,
    pub country_name: Option<String>,
    pub country_code: Option<String>,
}

#[async_trait]
pub trait ReverseGeocoder: Send + Sync {
    async fn reverse_geocode(&self, lat: f64, lon: f64) -> Result<PlaceName>;
}

#[derive(Debug, Deserialize)]
struct NominatimResponse {
    address: Option<NominatimAddress>,
}

#[derive(Debug, Deserialize)]
struct NominatimAddress {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    municipality: Option<String>,
    country: Option<String>,
    country_code: Option<String>,
}

/// Reverse geocoding through Nominatim (OpenStreetMap)
pub struct NominatimGeocoder {
    client: ClientWithMiddleware,
    base_url: String,
}

impl NominatimGeocoder {
    #[must_use]
    pub fn new(client: ClientWithMiddleware, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ReverseGeocoder for NominatimGeocoder {
    #[instrument(skip(self))]
    async fn reverse_geocode(&self, lat: f64, lon: f64) -> Result<PlaceName> {
        let url = build_url(
            &self.base_url,
            &[
                ("lat", lat.to_string()),
                ("lon", lon.to_string()),
                ("format", "json".to_string()),
                ("addressdetails", "1".to_string()),
                ("zoom", "10".to_string()),
            ],
        )?;
        let body = fetch_json(&self.client, url)
            .await?
            .ok_or_else(|| SkyglanceError::validation("empty reverse geocoding response"))?;
        let response: NominatimResponse = serde_json::from_value(body)?;

        let Some(address) = response.address else {
            return Ok(PlaceName::default());
        };

        // city > town > village > municipality
        let city = address
            .city
            .or(address.town)
            .or(address.village)
            .or(address.municipality)
            .filter(|name| !name.is_empty());

        Ok(PlaceName {
            city,
            country_name: address.country.filter(|name| !name.is_empty()),
            country_code: address
                .country_code
                .filter(|code| !code.is_empty())
                .map(|code| code.to_uppercase()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct IpLocationResponse {
    latitude: f64,
    longitude: f64,
    city: Option<String>,
    country_name: Option<String>,
    country_code: Option<String>,
}

/// Client for the IP-based location endpoint
pub struct IpLocationClient {
    client: ClientWithMiddleware,
    url: String,
}

impl IpLocationClient {
    #[must_use]
    pub fn new(client: ClientWithMiddleware, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    /// Approximate location of this host. A 429 surfaces as `RateLimited`.
    #[instrument(skip(self))]
    pub async fn lookup(&self) -> Result<LocationResolution> {
        let url = build_url(&self.url, &[])?;
        let body = fetch_json(&self.client, url)
            .await?
            .ok_or_else(|| SkyglanceError::validation("empty location response"))?;
        let response: IpLocationResponse = serde_json::from_value(body)?;

        if !valid_coordinates(response.latitude, response.longitude) {
            return Err(SkyglanceError::validation(format!(
                "location service returned out-of-range coordinates: {}, {}",
                response.latitude, response.longitude
            )));
        }

        let non_empty = |value: Option<String>| value.filter(|v| !v.is_empty());
        Ok(LocationResolution {
            latitude: response.latitude,
            longitude: response.longitude,
            city: non_empty(response.city),
            country_name: non_empty(response.country_name),
            country_code: non_empty(response.country_code),
            method: ResolutionMethod::Ip,
        })
    }
}

/// Resolves the user's location in priority order: device, IP, fallback.
pub struct LocationResolver {
    position: Arc<dyn PositionProvider>,
    geocoder: Arc<dyn ReverseGeocoder>,
    ip: IpLocationClient,
}

impl LocationResolver {
    #[must_use]
    pub fn new(position: Arc<dyn PositionProvider>, geocoder: Arc<dyn ReverseGeocoder>, ip: IpLocationClient) -> Self {
        Self { position, geocoder, ip }
    }

    async fn from_device(&self) -> Option<LocationResolution> {
        let (latitude, longitude) = match self.position.current_position().await {
            Ok(Some(position)) if valid_coordinates(position.0, position.1) => position,
            Ok(Some(position)) => {
                warn!(?position, "ignoring out-of-range device position");
                return None;
            }
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "device position unavailable");
                return None;
            }
        };

        let place = self
            .geocoder
            .reverse_geocode(latitude, longitude)
            .await
            .unwrap_or_else(|e| {
                debug!(error = %e, "reverse geocoding failed, keeping bare coordinates");
                PlaceName::default()
            });

        Some(LocationResolution {
            latitude,
            longitude,
            city: place.city,
            country_name: place.country_name,
            country_code: place.country_code,
            method: ResolutionMethod::Browser,
        })
    }
}

#[async_trait]
impl LocationSource for LocationResolver {
    #[instrument(skip(self))]
    async fn resolve_location(&self) -> Result<LocationResolution> {
        if let Some(location) = self.from_device().await {
            info!(city = ?location.city, "resolved location from device position");
            return Ok(location);
        }

        match self.ip.lookup().await {
            Ok(location) => {
                info!(city = ?location.city, "resolved location from IP");
                Ok(location)
            }
            Err(SkyglanceError::RateLimited { .. }) => {
                warn!("location service rate limited, using fallback location");
                Ok(LocationResolution::fallback())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::build_http_client;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http() -> ClientWithMiddleware {
        build_http_client(Duration::from_secs(5), 0).unwrap()
    }

    struct CountingGeocoder {
        calls: AtomicUsize,
        result: Result<PlaceName>,
    }

    #[async_trait]
    impl ReverseGeocoder for CountingGeocoder {
        async fn reverse_geocode(&self, _lat: f64, _lon: f64) -> Result<PlaceName> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn geocoder(result: Result<PlaceName>) -> Arc<CountingGeocoder> {
        Arc::new(CountingGeocoder {
            calls: AtomicUsize::new(0),
            result,
        })
    }

    async fn ip_server(template: ResponseTemplate) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/location"))
            .respond_with(template)
            .mount(&server)
            .await;
        server
    }

    fn resolver(server: &MockServer, position: Option<(f64, f64)>, geocoder: Arc<CountingGeocoder>) -> LocationResolver {
        LocationResolver::new(
            Arc::new(FixedPosition(position)),
            geocoder,
            IpLocationClient::new(http(), format!("{}/api/location", server.uri())),
        )
    }

    #[tokio::test]
    async fn test_device_position_preferred() {
        let server = ip_server(ResponseTemplate::new(500)).await;
        let place = PlaceName {
            city: Some("Zurich".to_string()),
            country_name: Some("Switzerland".to_string()),
            country_code: Some("CH".to_string()),
        };
        let geocoder = geocoder(Ok(place));

        let location = resolver(&server, Some((47.37, 8.54)), geocoder.clone())
            .resolve_location()
            .await
            .unwrap();

        assert_eq!(location.method, ResolutionMethod::Browser);
        assert_eq!(location.city.as_deref(), Some("Zurich"));
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reverse_geocode_failure_keeps_device_position() {
        let server = ip_server(ResponseTemplate::new(500)).await;
        let geocoder = geocoder(Err(SkyglanceError::network("offline")));

        let location = resolver(&server, Some((47.37, 8.54)), geocoder)
            .resolve_location()
            .await
            .unwrap();

        assert_eq!(location.method, ResolutionMethod::Browser);
        assert!(location.city.is_none());
        assert_eq!(location.latitude, 47.37);
    }

    #[tokio::test]
    async fn test_ip_lookup_without_device_position() {
        let server = ip_server(ResponseTemplate::new(200).set_body_json(json!({
            "latitude": 48.8566,
            "longitude": 2.3522,
            "city": "Paris",
            "country_name": "France",
            "country_code": ""
        })))
        .await;
        let geocoder = geocoder(Ok(PlaceName::default()));

        let location = resolver(&server, None, geocoder.clone()).resolve_location().await.unwrap();

        assert_eq!(location.method, ResolutionMethod::Ip);
        assert_eq!(location.city.as_deref(), Some("Paris"));
        assert!(location.country_code.is_none());
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_resolves_to_fallback() {
        let server = ip_server(ResponseTemplate::new(429).set_body_json(json!({
            "error": "Rate limit exceeded. Please try again later.",
            "code": "RATE_LIMIT"
        })))
        .await;

        let location = resolver(&server, None, geocoder(Ok(PlaceName::default())))
            .resolve_location()
            .await
            .unwrap();

        assert_eq!(location.method, ResolutionMethod::Fallback);
        assert!(valid_coordinates(location.latitude, location.longitude));
    }

    #[tokio::test]
    async fn test_other_ip_errors_propagate() {
        let server = ip_server(ResponseTemplate::new(503)).await;
        let result = resolver(&server, None, geocoder(Ok(PlaceName::default())))
            .resolve_location()
            .await;
        assert!(matches!(result, Err(SkyglanceError::Http { status: 503, .. })));

        let server = ip_server(ResponseTemplate::new(200).set_body_json(json!({ "latitude": "n/a" }))).await;
        let result = resolver(&server, None, geocoder(Ok(PlaceName::default())))
            .resolve_location()
            .await;
        assert!(matches!(result, Err(SkyglanceError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_out_of_range_device_position_falls_through_to_ip() {
        let server = ip_server(ResponseTemplate::new(200).set_body_json(json!({
            "latitude": 40.4168,
            "longitude": -3.7038
        })))
        .await;

        let location = resolver(&server, Some((123.0, 8.0)), geocoder(Ok(PlaceName::default())))
            .resolve_location()
            .await
            .unwrap();
        assert_eq!(location.method, ResolutionMethod::Ip);
    }

    #[tokio::test]
    async fn test_nominatim_prefers_city_then_town() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reverse"))
            .and(query_param("format", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "display_name": "Grindelwald, Switzerland",
                "address": {
                    "town": "Grindelwald",
                    "village": "Grund",
                    "country": "Switzerland",
                    "country_code": "ch"
                }
            })))
            .mount(&server)
            .await;

        let geocoder = NominatimGeocoder::new(http(), format!("{}/reverse", server.uri()));
        let place = geocoder.reverse_geocode(46.62, 8.04).await.unwrap();
        assert_eq!(place.city.as_deref(), Some("Grindelwald"));
        assert_eq!(place.country_code.as_deref(), Some("CH"));
    }
}
