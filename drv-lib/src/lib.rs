mod chunk;
mod chunk_mgr;
mod endpoint;
mod transport;

#[cfg(test)]
mod chunk_mgr_tests;

pub use chunk::*;
pub use chunk_mgr::*;
pub use endpoint::*;
pub use transport::*;

use reqwest::StatusCode;
use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum DrvError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("permanent storage error: {0}")]
    Permanent(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid param: {0}")]
    Invalid(String),
    #[error("db error: {0}")]
    DbError(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl DrvError {
    pub fn from_http_status(code: StatusCode, info: String) -> Self {
        match code {
            StatusCode::NOT_FOUND => DrvError::NotFound(info),
            StatusCode::TOO_MANY_REQUESTS => DrvError::RateLimited(info),
            StatusCode::PAYLOAD_TOO_LARGE => {
                DrvError::Invalid(format!("payload too large: {}", info))
            }
            code if code.is_server_error() => {
                DrvError::Transient(format!("HTTP error: {} for {}", code, info))
            }
            _ => DrvError::Permanent(format!("HTTP error: {} for {}", code, info)),
        }
    }

    /// Retryable errors may succeed on another attempt or another endpoint.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DrvError::Transient(_) | DrvError::RateLimited(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, DrvError::RateLimited(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DrvError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DrvError::Conflict(_))
    }
}

pub type DrvResult<T> = std::result::Result<T, DrvError>;

impl From<std::io::Error> for DrvError {
    fn from(err: std::io::Error) -> Self {
        DrvError::IoError(err.to_string())
    }
}
