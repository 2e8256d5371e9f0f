use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for upstream HTTP operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when the upstream cannot be reached or the exchange fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when the request cannot be pointed at the upstream
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for relaying requests upstream
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Forward an inbound request to the upstream and return its response
    ///
    /// # Arguments
    /// * `req` - The inbound request; its path and query are kept
    ///
    /// # Returns
    /// A future that resolves to the upstream's response or an error
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;
}
