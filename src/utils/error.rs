//! The `error` module defines the crate-wide error type.
//!
//! Construction-time failures (configuration, opening the persistence engine,
//! building request URLs) surface through [`Error`]. Failures on a live
//! connection never do; they are classified as [`crate::sse::SseError`] and
//! routed through the retry policy instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("persistence error: {0}")]
    Persistence(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("no tokio runtime available: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),
}

pub type Result<T> = std::result::Result<T, Error>;
