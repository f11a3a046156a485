//! Custom error types for zenfeed

use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate fingerprint: {0:#018x}")]
    Duplicate(u64),

    #[error("Block is sealed")]
    Sealed,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Storage corruption: {0}")]
    Corruption(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Key-value store error: {0}")]
    Kv(#[from] rocksdb::Error),
}

impl Error {
    /// Stable kind name, used for log fields and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::NotFound(_) => "not_found",
            Error::Duplicate(_) => "duplicate",
            Error::Sealed => "sealed",
            Error::Cancelled => "cancelled",
            Error::Timeout(_) => "timeout",
            Error::Upstream(_) => "upstream",
            Error::Corruption(_) => "corruption",
            Error::Internal(_) => "internal",
            Error::Io(_) => "io",
            Error::Http(_) => "http",
            Error::UrlParse(_) => "url",
            Error::Json(_) => "json",
            Error::TomlParse(_) => "toml",
            Error::Kv(_) => "kv",
        }
    }

    /// True for errors the ingestion pipeline retries on a later tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Upstream(_) | Error::Timeout(_) | Error::Http(_) | Error::Io(_)
        )
    }
}

/// Result type alias for zenfeed
pub type Result<T> = std::result::Result<T, Error>;
