//! reqwest-based vendor transport implementation.

use std::time::Duration;

use reqwest::header::CONTENT_DISPOSITION;
use tracing::debug;

use super::traits::{CheckResponse, TransportError, VendorTransport};

/// Production transport over plain HTTP.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl VendorTransport for HttpTransport {
    type Response = HttpResponse;

    async fn begin_check(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Self::Response, TransportError> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    TransportError::Timeout { timeout_ms: timeout.as_millis() as u64 }
                } else {
                    TransportError::Unreachable(err.to_string())
                }
            })?;

        debug!(url = %url, status = response.status().as_u16(), "Vendor endpoint responded");

        let content_disposition = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(HttpResponse { inner: response, content_disposition })
    }
}

/// Headers-available response; the body stays on the wire until read.
pub struct HttpResponse {
    inner: reqwest::Response,
    content_disposition: Option<String>,
}

impl CheckResponse for HttpResponse {
    fn status(&self) -> u16 {
        self.inner.status().as_u16()
    }

    fn content_disposition(&self) -> Option<&str> {
        self.content_disposition.as_deref()
    }

    async fn read_body(self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let bytes = tokio::time::timeout(timeout, self.inner.bytes())
            .await
            .map_err(|_| TransportError::Timeout { timeout_ms: timeout.as_millis() as u64 })?
            .map_err(|err| TransportError::ReadFailed(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}
