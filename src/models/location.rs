//! City, country and resolved-location models

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, SkyglanceError};

/// Returns true when both coordinates are finite and inside the WGS84 ranges.
#[must_use]
pub fn valid_coordinates(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

/// A city from the geocoding directory
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct City {
    /// City name
    pub name: String,
    /// Latitude in decimal degrees
    pub lat: f64,
    /// Longitude in decimal degrees
    pub lon: f64,
    /// Country code when known, otherwise the country name
    pub country: String,
    /// Country code (ISO 3166-1 alpha-2)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
    /// Stable GeoNames identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geoname_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub population: Option<u64>,
}

/// Deduplication identity of a city
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CityIdentity {
    GeonameId(u64),
    /// Name plus the bit patterns of latitude and longitude
    Position(String, u64, u64),
}

impl City {
    /// Create a new city without directory metadata
    #[must_use]
    pub fn new(name: impl Into<String>, lat: f64, lon: f64, country: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lat,
            lon,
            country: country.into(),
            country_code: None,
            geoname_id: None,
            population: None,
        }
    }

    /// Attach a GeoNames identifier
    #[must_use]
    pub fn with_geoname_id(mut self, geoname_id: u64) -> Self {
        self.geoname_id = Some(geoname_id);
        self
    }

    #[must_use]
    pub fn has_valid_coordinates(&self) -> bool {
        valid_coordinates(self.lat, self.lon)
    }

    /// Reject cities whose coordinates are NaN or out of range
    pub fn validate(&self) -> Result<()> {
        if self.has_valid_coordinates() {
            Ok(())
        } else {
            Err(SkyglanceError::input(format!(
                "coordinates out of range for {}: lat={}, lon={}",
                self.name, self.lat, self.lon
            )))
        }
    }

    /// Memoization key, `name|lat|lon`
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("{}|{}|{}", self.name, self.lat, self.lon)
    }

    /// Identity used to deduplicate directory listings
    #[must_use]
    pub fn identity(&self) -> CityIdentity {
        match self.geoname_id {
            Some(id) => CityIdentity::GeonameId(id),
            None => CityIdentity::Position(self.name.clone(), self.lat.to_bits(), self.lon.to_bits()),
        }
    }

    /// Normalize one raw city record from the geocoding proxy.
    ///
    /// Accepts `lon` or `lng`, numbers or numeric strings for coordinates and
    /// identifiers, and reconciles `country`/`countryCode`. Records without a
    /// name or with out-of-range coordinates are rejected.
    pub fn from_json(raw: &Value) -> Result<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| SkyglanceError::validation("city record is not an object"))?;

        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| SkyglanceError::validation("city record has no name"))?;

        let lat = obj
            .get("lat")
            .and_then(number_field)
            .ok_or_else(|| SkyglanceError::validation(format!("city {name} has no latitude")))?;
        let lon = obj
            .get("lon")
            .and_then(number_field)
            .or_else(|| obj.get("lng").and_then(number_field))
            .ok_or_else(|| SkyglanceError::validation(format!("city {name} has no longitude")))?;

        if !valid_coordinates(lat, lon) {
            return Err(SkyglanceError::validation(format!(
                "city {name} has out-of-range coordinates: lat={lat}, lon={lon}"
            )));
        }

        let country_code = non_empty_str(obj.get("countryCode"));
        let country = country_code
            .clone()
            .or_else(|| non_empty_str(obj.get("country")))
            .or_else(|| non_empty_str(obj.get("countryName")))
            .unwrap_or_else(|| "Unknown".to_string());

        Ok(Self {
            name: name.to_string(),
            lat,
            lon,
            country,
            country_code,
            geoname_id: obj.get("geonameId").and_then(integer_field),
            population: obj.get("population").and_then(integer_field),
        })
    }
}

/// A country from the geocoding directory
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Country {
    pub country_code: String,
    pub country_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub population: Option<String>,
}

impl Country {
    /// Validate one raw country record; code and name must be non-empty strings
    pub fn from_json(raw: &Value) -> Result<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| SkyglanceError::validation("country record is not an object"))?;

        let country_code = non_empty_str(obj.get("countryCode"))
            .ok_or_else(|| SkyglanceError::validation("country record has no countryCode"))?;
        let country_name = non_empty_str(obj.get("countryName"))
            .ok_or_else(|| SkyglanceError::validation("country record has no countryName"))?;
        let population = obj.get("population").and_then(|p| match p {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

        Ok(Self {
            country_code,
            country_name,
            population,
        })
    }
}

/// How a location was resolved
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionMethod {
    /// Position supplied by the device/browser geolocation source
    Browser,
    /// Approximate position from the IP location service
    Ip,
    /// Static coordinates used when the IP service rate limits us
    Fallback,
}

/// The user's resolved location
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LocationResolution {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub country_name: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    pub method: ResolutionMethod,
}

impl LocationResolution {
    /// Location used when the IP service refuses to answer
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            latitude: 51.5074,
            longitude: -0.1278,
            city: Some("London".to_string()),
            country_name: Some("United Kingdom".to_string()),
            country_code: Some("GB".to_string()),
            method: ResolutionMethod::Fallback,
        }
    }

    /// Display name, approximate when the city is unknown
    #[must_use]
    pub fn display_name(&self) -> String {
        self.city
            .clone()
            .unwrap_or_else(|| "Your Location (Approximate)".to_string())
    }
}

fn number_field(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn integer_field(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
