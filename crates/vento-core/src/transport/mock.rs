//! Mock vendor transport for testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{CheckResponse, TransportError, VendorTransport};

/// Scripted transport for unit testing checker logic.
///
/// Counts header fetches and body reads so tests can assert that an
/// up-to-date check aborts before touching the body.
#[derive(Clone, Default)]
pub struct MockVendorTransport {
    script: Arc<Mutex<VecDeque<Result<ScriptedResponse, TransportError>>>>,
    begin_count: Arc<AtomicUsize>,
    body_reads: Arc<AtomicUsize>,
    begin_delay: Arc<Mutex<Duration>>,
}

#[derive(Clone)]
struct ScriptedResponse {
    status: u16,
    content_disposition: Option<String>,
    body: Vec<u8>,
}

impl MockVendorTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response to be returned on the next check.
    pub fn queue_response(&self, status: u16, disposition: Option<&str>, body: Vec<u8>) {
        self.script.lock().unwrap().push_back(Ok(ScriptedResponse {
            status,
            content_disposition: disposition.map(str::to_string),
            body,
        }));
    }

    /// Shorthand for a 200 attachment response.
    pub fn queue_firmware(&self, filename: &str, body: Vec<u8>) {
        self.queue_response(
            200,
            Some(&format!("attachment; filename=\"{filename}\"")),
            body,
        );
    }

    /// Queue a transport failure.
    pub fn queue_error(&self, err: TransportError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    /// Number of header fetches issued so far.
    pub fn begin_count(&self) -> usize {
        self.begin_count.load(Ordering::SeqCst)
    }

    /// Number of responses whose body was actually read.
    pub fn body_reads(&self) -> usize {
        self.body_reads.load(Ordering::SeqCst)
    }

    /// Delay header fetches, to make in-flight overlap observable in tests.
    pub fn set_begin_delay(&self, delay: Duration) {
        *self.begin_delay.lock().unwrap() = delay;
    }
}

impl VendorTransport for MockVendorTransport {
    type Response = MockResponse;

    async fn begin_check(
        &self,
        _url: &str,
        _timeout: Duration,
    ) -> Result<Self::Response, TransportError> {
        self.begin_count.fetch_add(1, Ordering::SeqCst);
        let delay = *self.begin_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(TransportError::Unreachable("no scripted response".into())))?;
        Ok(MockResponse { scripted, body_reads: self.body_reads.clone() })
    }
}

pub struct MockResponse {
    scripted: ScriptedResponse,
    body_reads: Arc<AtomicUsize>,
}

impl CheckResponse for MockResponse {
    fn status(&self) -> u16 {
        self.scripted.status
    }

    fn content_disposition(&self) -> Option<&str> {
        self.scripted.content_disposition.as_deref()
    }

    async fn read_body(self, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        self.body_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.scripted.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_responses_come_back_in_order() {
        let mock = MockVendorTransport::new();
        mock.queue_firmware("C6_1_5_46_72_P1_1_1_5_48.mbin", vec![0u8; 16]);
        mock.queue_error(TransportError::Unreachable("down".into()));

        let first = mock.begin_check("http://x", Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.status(), 200);
        assert!(first.content_disposition().unwrap().contains("filename="));
        assert_eq!(mock.body_reads(), 0);
        assert_eq!(first.read_body(Duration::from_secs(1)).await.unwrap().len(), 16);
        assert_eq!(mock.body_reads(), 1);

        assert!(mock.begin_check("http://x", Duration::from_secs(1)).await.is_err());
        assert_eq!(mock.begin_count(), 2);
    }

    #[tokio::test]
    async fn dropping_a_response_reads_no_body() {
        let mock = MockVendorTransport::new();
        mock.queue_firmware("C6_1_5_46_72_P1_1_1_5_48.mbin", vec![0u8; 16]);

        let response = mock.begin_check("http://x", Duration::from_secs(1)).await.unwrap();
        drop(response);
        assert_eq!(mock.body_reads(), 0);
    }
}
