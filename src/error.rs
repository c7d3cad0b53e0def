//! Error types for the tiered cache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tiered cache
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A layer refused or failed a write. Never fatal to a lookup.
    #[error("Cache layer {layer} failed: {reason}")]
    Layer { layer: String, reason: String },

    /// Stored value could not be decoded into an entry
    #[error("Failed to decode cache entry: {0}")]
    Codec(String),

    // =========================================================================
    // Origin Errors
    // =========================================================================
    /// Origin could not be reached
    #[error("Origin request failed: {0}")]
    OriginRequest(#[source] reqwest::Error),

    /// Origin answered with a non-success status
    #[error("Origin returned {status} for {url}")]
    OriginStatus { status: u16, url: String },

    /// Any other origin failure (custom fetchers)
    #[error("Origin fetch failed: {0}")]
    Origin(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Construct a soft layer failure
    pub fn layer(layer: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Layer {
            layer: layer.into(),
            reason: reason.to_string(),
        }
    }

    /// True for failures that originate from the origin fetch
    pub fn is_origin(&self) -> bool {
        matches!(
            self,
            Error::OriginRequest(_) | Error::OriginStatus { .. } | Error::Origin(_)
        )
    }
}
