//! Minimal generative-AI clients.
//!
//! This crate provides focused, stateless wrappers around the HTTP APIs the
//! story engine talks to:
//! - [`OpenRouter`] chat completions (DeepSeek by default)
//! - [`Gemini`] `generateContent`
//! - [`HuggingFace`] text-to-image inference
//!
//! Every client returns the raw provider text; cleanup and fallback content
//! belong to the caller.

mod gemini;
mod huggingface;
mod openrouter;

pub use gemini::Gemini;
pub use huggingface::{GeneratedImage, HuggingFace};
pub use openrouter::OpenRouter;

use std::time::Duration;
use thiserror::Error;

/// Default per-request timeout shared by the text clients.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur when calling a provider.
#[derive(Debug, Error)]
pub enum Error {
    #[error("API key not configured")]
    NoApiKey,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Map a transport error, keeping timeouts distinguishable.
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Error::Timeout(timeout)
        } else {
            Error::Network(err.to_string())
        }
    }
}

/// Turn a non-success HTTP response into [`Error::Api`].
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, Error> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    Err(Error::Api { status, message })
}
