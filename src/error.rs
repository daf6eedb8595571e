//! Error types and handling for the Skyglance data layer

use thiserror::Error;

/// Main error type for the Skyglance data layer.
///
/// The type is `Clone` so that one in-flight request result can be handed to
/// every caller that joined it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SkyglanceError {
    /// Configuration-related errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Connect or transport failure before a response arrived
    #[error("Network error: {message}")]
    Network { message: String },

    /// The request exceeded its deadline
    #[error("Request timed out: {message}")]
    Timeout { message: String },

    /// Upstream answered with a non-2xx status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Upstream answered with HTTP 429
    #[error("Rate limited: {message}")]
    RateLimited { message: String },

    /// Response body did not have the expected shape
    #[error("Invalid response: {message}")]
    Validation { message: String },

    /// Caller passed invalid coordinates or city data
    #[error("Invalid input: {message}")]
    Input { message: String },

    /// Request was cancelled before it settled
    #[error("Request cancelled: {message}")]
    Cancelled { message: String },

    /// Persisted storage failures
    #[error("Storage error: {message}")]
    Storage { message: String },
}

impl SkyglanceError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a new HTTP status error
    pub fn http<S: Into<String>>(status: u16, message: S) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Create a new rate limit error
    pub fn rate_limited<S: Into<String>>(message: S) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    /// Create a new response validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a new input error
    pub fn input<S: Into<String>>(message: S) -> Self {
        Self::Input {
            message: message.into(),
        }
    }

    /// Create a new cancellation error
    pub fn cancelled<S: Into<String>>(message: S) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Whether retrying the same request later could succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } | Self::Timeout { .. } | Self::RateLimited { .. } => true,
            Self::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Get a user-friendly error message
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Config { .. } => {
                "Configuration error. Please check your config file.".to_string()
            }
            Self::Network { .. } => {
                "Network error - please check your connection".to_string()
            }
            Self::Timeout { .. } => "Request timeout - please try again".to_string(),
            Self::Http { status, .. } if *status >= 500 => {
                "The weather service is having trouble. Please try again later.".to_string()
            }
            Self::Http { .. } => "The request failed. Please try again.".to_string(),
            Self::RateLimited { .. } => {
                "Service temporarily unavailable due to high traffic. Please try again later."
                    .to_string()
            }
            Self::Validation { .. } => "Invalid data received from the weather service.".to_string(),
            Self::Input { message } => format!("Invalid input: {message}"),
            Self::Cancelled { .. } => "Request cancelled".to_string(),
            Self::Storage { .. } => {
                "Local cache error. You may need to clear your cache.".to_string()
            }
        }
    }
}

impl From<reqwest::Error> for SkyglanceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if let Some(status) = err.status() {
            if status.as_u16() == 429 {
                Self::rate_limited(err.to_string())
            } else {
                Self::http(status.as_u16(), err.to_string())
            }
        } else if err.is_decode() {
            Self::validation(err.to_string())
        } else {
            Self::network(err.to_string())
        }
    }
}

impl From<reqwest_middleware::Error> for SkyglanceError {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(err) => err.into(),
            reqwest_middleware::Error::Middleware(err) => Self::network(format!("{err:#}")),
        }
    }
}

impl From<serde_json::Error> for SkyglanceError {
    fn from(err: serde_json::Error) -> Self {
        Self::validation(err.to_string())
    }
}

impl From<fjall::Error> for SkyglanceError {
    fn from(err: fjall::Error) -> Self {
        Self::storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let config_err = SkyglanceError::config("missing base url");
        assert!(matches!(config_err, SkyglanceError::Config { .. }));

        let http_err = SkyglanceError::http(503, "Service Unavailable");
        assert!(matches!(http_err, SkyglanceError::Http { status: 503, .. }));

        let input_err = SkyglanceError::input("latitude out of range");
        assert!(matches!(input_err, SkyglanceError::Input { .. }));
    }

    #[test]
    fn test_user_messages() {
        let network_err = SkyglanceError::network("connection refused");
        assert!(network_err.user_message().contains("check your connection"));

        let rate_err = SkyglanceError::rate_limited("429");
        assert!(rate_err.user_message().contains("high traffic"));

        let input_err = SkyglanceError::input("lat=91");
        assert!(input_err.user_message().contains("lat=91"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SkyglanceError::timeout("30s").is_retryable());
        assert!(SkyglanceError::http(502, "Bad Gateway").is_retryable());
        assert!(!SkyglanceError::http(404, "Not Found").is_retryable());
        assert!(!SkyglanceError::validation("missing daily").is_retryable());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: SkyglanceError = json_err.into();
        assert!(matches!(err, SkyglanceError::Validation { .. }));
    }
}
