use std::time::Duration;

use thiserror::Error;

use crate::airports::AirportError;
use crate::cache::CacheError;
use crate::quota::Exhausted;
use crate::upstream::UpstreamError;

// Every failure a caller of this crate can observe
#[derive(Error, Debug)]
pub enum LayoverError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Rate limit exceeded on {bucket}, retry after {}ms", retry_after.as_millis())]
    RateLimited {
        bucket: String,
        retry_after: Duration,
    },

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Airport data unavailable: {0}")]
    Airports(#[from] AirportError),
}

impl LayoverError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        LayoverError::InvalidInput(msg.into())
    }

    // HTTP-like status a caller-facing surface should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            LayoverError::InvalidInput(_) => 400,
            LayoverError::NotFound(_) => 404,
            LayoverError::Conflict(_) => 409,
            LayoverError::RateLimited { .. } => 429,
            LayoverError::Upstream(_) => 502,
            LayoverError::Cache(_) | LayoverError::Airports(_) => 500,
        }
    }

    // Whole seconds to put in a `Retry-After` hint, rounded up.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            LayoverError::RateLimited { retry_after, .. } => {
                let millis = retry_after.as_millis() as u64;
                Some(millis.div_ceil(1000).max(1))
            }
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, LayoverError::RateLimited { .. })
    }
}

impl From<Exhausted> for LayoverError {
    fn from(e: Exhausted) -> Self {
        LayoverError::RateLimited {
            bucket: e.bucket,
            retry_after: e.retry_after,
        }
    }
}
