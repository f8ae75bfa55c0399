//! Errors raised talking to the control plane.

use thiserror::Error;

/// All the errors this crate can report.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A request to `url` failed at the transport or HTTP-status layer.
    #[error("request to {url} failed: {source}")]
    Http {
        /// The URL that was requested.
        url: String,
        /// The underlying transport/HTTP error.
        #[source]
        source: reqwest::Error,
    },
    /// The control plane rejected the authentication attempt.
    #[error("authentication rejected: {message}")]
    AuthRejected {
        /// Message reported by the control plane.
        message: String,
    },
    /// A response body could not be decoded into the expected shape.
    #[error("malformed response from {url}: {reason}")]
    MalformedResponse {
        /// The URL that produced the response.
        url: String,
        /// Human-readable description of what was wrong with it.
        reason: String,
    },
}
