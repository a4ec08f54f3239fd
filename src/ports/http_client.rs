use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when the connection to the upstream fails or breaks
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The TCP/TLS connection was not established in time
    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for calling upstream instances.
///
/// The response future resolves once response headers arrive; the response
/// timeout is applied by the caller around it. Dropping the future aborts
/// the call.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send `req` to the absolute URI it carries, giving up on the
    /// connection attempt after `connect_timeout`.
    async fn send_request(
        &self,
        req: Request<AxumBody>,
        connect_timeout: Duration,
    ) -> HttpClientResult<Response<AxumBody>>;
}
