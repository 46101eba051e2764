//! Error types for the certificate authority client.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while talking to the certificate authority.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CaError {
    /// Raised when the signer address cannot be used as a base URL.
    #[error("invalid certificate authority address {addr}: {message}")]
    Address {
        /// Configured address.
        addr: String,
        /// Human-readable reason.
        message: String,
    },
    /// Raised when a credential or key file cannot be read.
    #[error("failed to read {path}: {message}")]
    Read {
        /// File that could not be read.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the HTTP client cannot be configured.
    #[error("failed to configure TLS: {0}")]
    Tls(String),
    /// Raised when a request never produced a response.
    #[error("request to {url} failed: {message}")]
    Transport {
        /// Request URL.
        url: String,
        /// Human-readable reason.
        message: String,
    },
    /// Raised when the approle login is refused.
    #[error("approle login failed with status {status}: {body}")]
    Login {
        /// Upstream HTTP status.
        status: u16,
        /// Upstream response body.
        body: String,
    },
    /// Raised when the signing request is refused.
    #[error("could not issue certificate, signing failed with status {status}: {body}")]
    Signing {
        /// Upstream HTTP status.
        status: u16,
        /// Upstream response body.
        body: String,
    },
    /// Raised when a successful response does not have the expected shape.
    #[error("unexpected response from {url}: {message}")]
    Response {
        /// Request URL.
        url: String,
        /// Human-readable reason.
        message: String,
    },
    /// Raised when the issued certificate cannot be written or copied.
    #[error("failed to store certificate: {0}")]
    Store(String),
}
