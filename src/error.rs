//! Error handling for the checkout monitor

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Stream acquisition error (connect/read failures, treated as transient)
    #[error("Stream error: {0}")]
    Stream(String),

    /// Classifier returned no usable result for a frame
    #[error("Classifier error: {0}")]
    Classifier(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote API returned a non-success status
    #[error("API error: {0}")]
    Api(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
