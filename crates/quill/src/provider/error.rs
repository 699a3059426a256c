//! Completion service errors.

use thiserror::Error;

/// Errors from the remote completion service.
///
/// Never retried here; retry policy is the caller's concern.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transport-level failure reaching the provider.
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider returned a non-success status.
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Response carried no usable text content.
    #[error("provider response contained no text content")]
    MissingText,

    /// Event-stream failure mid-response.
    #[error("provider stream error: {0}")]
    Stream(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;
