//! Client for the geocoding proxy (`/countries`, `/cities`)

use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{CityQuery, GeoDirectorySource, build_url, fetch_json};
use crate::models::{City, Country};
use crate::{Result, SkyglanceError};

pub struct GeoProxyClient {
    client: ClientWithMiddleware,
    base_url: String,
}

impl GeoProxyClient {
    #[must_use]
    pub fn new(client: ClientWithMiddleware, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{name}", self.base_url)
    }
}

fn into_records(body: Option<Value>, what: &str) -> Result<Vec<Value>> {
    match body {
        None => Ok(Vec::new()),
        Some(Value::Array(records)) => Ok(records),
        Some(_) => Err(SkyglanceError::validation(format!("{what} response is not an array"))),
    }
}

#[async_trait]
impl GeoDirectorySource for GeoProxyClient {
    #[instrument(skip(self))]
    async fn cities_page(&self, query: &CityQuery) -> Result<Vec<City>> {
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
        let url = build_url(&self.endpoint("cities"), &params)?;

        let records = into_records(fetch_json(&self.client, url).await?, "cities")?;
        let total = records.len();
        let cities: Vec<City> = records
            .iter()
            .filter_map(|raw| match City::from_json(raw) {
                Ok(city) => Some(city),
                Err(e) => {
                    debug!(error = %e, "dropping city record");
                    None
                }
            })
            .collect();

        debug!(received = total, kept = cities.len(), "normalized city page");
        Ok(cities)
    }

    #[instrument(skip(self))]
    async fn countries(&self) -> Result<Vec<Country>> {
        let url = build_url(&self.endpoint("countries"), &[])?;
        let records = into_records(fetch_json(&self.client, url).await?, "countries")?;
        let countries: Vec<Country> = records
            .iter()
            .filter_map(|raw| Country::from_json(raw).ok())
            .collect();

        debug!(received = records.len(), kept = countries.len(), "validated countries");
        Ok(countries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::build_http_client;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> GeoProxyClient {
        let http = build_http_client(Duration::from_secs(5), 0).unwrap();
        GeoProxyClient::new(http, format!("{}/api/", server.uri()))
    }

    #[tokio::test]
    async fn test_cities_page_params_and_normalization() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/cities"))
            .and(query_param("maxRows", "100"))
            .and(query_param("startRow", "200"))
            .and(query_param("country", "DE"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "name": "Berlin", "lat": "52.52", "lng": "13.40", "countryCode": "DE", "geonameId": 2950159 },
                { "name": "Hamburg", "lat": 53.55, "lon": 10.0, "countryCode": "DE" },
                { "name": "Broken", "lat": 123.0, "lng": 10.0 },
                { "lat": 1.0, "lng": 2.0 }
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let query = CityQuery::page(200, 100).with_country("DE");
        let cities = client.cities_page(&query).await.unwrap();

        assert_eq!(cities.len(), 2);
        assert_eq!(cities[0].lon, 13.40);
        assert_eq!(cities[0].geoname_id, Some(2950159));
        assert_eq!(cities[1].name, "Hamburg");
    }

    #[tokio::test]
    async fn test_cities_page_with_prefix_and_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/cities"))
            .and(query_param("q", "Ber"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let cities = client
            .cities_page(&CityQuery::page(0, 50).with_prefix("Ber"))
            .await
            .unwrap();
        assert!(cities.is_empty());
    }

    #[tokio::test]
    async fn test_non_array_body_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "error": "no username" })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(matches!(
            client.cities_page(&CityQuery::page(0, 10)).await,
            Err(SkyglanceError::Validation { .. })
        ));
        assert!(matches!(client.countries().await, Err(SkyglanceError::Validation { .. })));
    }

    #[tokio::test]
    async fn test_countries_filtered() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/countries"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "countryCode": "FR", "countryName": "France", "population": "66987244" },
                { "countryCode": "", "countryName": "Nowhere" },
                { "countryCode": "DE", "countryName": "Germany", "population": 83000000 }
            ])))
            .mount(&server)
            .await;

        let countries = client_for(&server).countries().await.unwrap();
        assert_eq!(countries.len(), 2);
        assert_eq!(countries[1].population.as_deref(), Some("83000000"));
    }

    #[tokio::test]
    async fn test_server_error_propagates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let result = client_for(&server).countries().await;
        assert!(matches!(result, Err(SkyglanceError::Http { status: 500, .. })));
    }
}
