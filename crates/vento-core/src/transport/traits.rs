//! Transport traits for the vendor firmware endpoint.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Abstract vendor endpoint access.
///
/// This trait enables:
/// - Production implementation using reqwest
/// - Mock implementation for unit testing (with body-read counting)
pub trait VendorTransport: Send + Sync {
    type Response: CheckResponse;

    /// Issue a streaming GET and return as soon as response headers are
    /// available. No body bytes are consumed.
    fn begin_check(
        &self,
        url: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Self::Response, TransportError>> + Send;
}

/// An in-flight check response. Headers are available immediately; the
/// body is consumed at most once. Dropping the value aborts the transfer.
pub trait CheckResponse: Send {
    fn status(&self) -> u16;

    fn content_disposition(&self) -> Option<&str>;

    /// Read the full body. The timeout covers the whole transfer and must
    /// be sized for multi-megabyte payloads.
    fn read_body(
        self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;
}
