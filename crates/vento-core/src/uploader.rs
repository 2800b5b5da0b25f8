//! Firmware upload client for the device's embedded web server.
//!
//! The device is a constrained embedded HTTP server with several
//! non-negotiable quirks:
//!
//! - Sessions are bound to the client address. Credentials travel as two
//!   extra form fields inside the upload request itself; `login` is only a
//!   credential probe.
//! - The receive window is tiny; effective throughput is on the order of
//!   tens of kilobytes per second, so timeouts must scale with payload size.
//! - After the last byte the device flashes for several seconds before
//!   answering. That silence is not a stall.
//! - The 200 response is followed by an abrupt, non-graceful connection
//!   close. That close is normal completion, not a transport fault.
//!
//! Because of the last two points the request is framed by hand over a
//! plain [`TcpStream`] instead of going through an HTTP client that would
//! classify the teardown as an error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

use crate::store::{MAX_BINARY_SIZE, MIN_BINARY_SIZE};
use crate::version::FIRMWARE_EXTENSION;

pub const UPLOAD_ENDPOINT: &str = "/g1.html";

// Form field names are mandated by the device firmware.
pub const FORM_FIELD_USERNAME: &str = "1";
pub const FORM_FIELD_PASSWORD: &str = "2";
pub const FORM_FIELD_FIRMWARE: &str = "11111";

pub const DEFAULT_USERNAME: &str = "user";
pub const DEFAULT_PASSWORD: &str = "user";

/// Phrase the device embeds in its HTML status cell on success.
pub const SUCCESS_PHRASE: &str = "Firmware uploaded successfully";

/// The login form has a password input; the upload and status pages don't.
/// Its presence in a 200 response means the credentials were rejected.
const LOGIN_FORM_MARKER: &str = "name=\"2\"";
/// The upload form's file input, present only when authenticated.
const UPLOAD_FORM_MARKER: &str = "name=\"11111\"";

const MULTIPART_BOUNDARY: &str = "----vento7f3a9c1e";
const CHUNK_SIZE: usize = 4096;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for the post-upload response, covering the flashing delay.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);
pub const RESTART_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_RESTART_TIMEOUT: Duration = Duration::from_secs(300);
/// The device keeps serving for a moment after confirming the upload and
/// only then drops off the network to flash and reboot, for around two
/// minutes. A probe fired before the drop would read the old server as a
/// completed restart.
pub const DEVICE_RESTART_DELAY: Duration = Duration::from_secs(120);

const MAX_RESPONSE_BYTES: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("device rejected credentials")]
    Rejected,

    #[error("device unreachable: {0}")]
    Unreachable(String),
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("unsupported firmware extension: {0:?}")]
    Extension(String),

    #[error("firmware size {0} bytes outside {MIN_BINARY_SIZE}..={MAX_BINARY_SIZE}")]
    Size(u64),

    #[error("payload failed signature check: {0}")]
    Signature(String),
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A genuine failure mid-transfer, distinct from the expected abrupt
    /// close after the device has responded.
    #[error("transport failure during upload: {0}")]
    Transport(String),

    #[error("device rejected upload (HTTP {status})")]
    DeviceRejected { status: u16 },

    #[error("upload cancelled")]
    Cancelled,
}

/// Cooperative cancellation flag, checked between upload chunks.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Proof of a successful credential probe against one device.
///
/// The device keys its session on the client address, so the credentials
/// are re-sent inside the upload request rather than a token.
#[derive(Debug, Clone)]
pub struct Session {
    username: String,
    password: String,
}

/// Stateless upload client for one device address.
#[derive(Debug, Clone)]
pub struct FirmwareUploader {
    host: String,
}

impl FirmwareUploader {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    fn addr(&self) -> String {
        if self.host.contains(':') {
            self.host.clone()
        } else {
            format!("{}:80", self.host)
        }
    }

    /// Probe the credentials with a urlencoded login POST.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, AuthError> {
        let body = format!("{FORM_FIELD_USERNAME}={username}&{FORM_FIELD_PASSWORD}={password}");
        let reply = self
            .post(
                "application/x-www-form-urlencoded",
                body.as_bytes(),
                LOGIN_TIMEOUT,
            )
            .await
            .map_err(|err| match err {
                UploadError::Transport(msg) => AuthError::Unreachable(msg),
                _ => AuthError::Unreachable(err.to_string()),
            })?;

        if reply.status != 200 || !reply.body.contains(UPLOAD_FORM_MARKER) {
            warn!(host = %self.host, status = reply.status, "Login rejected");
            return Err(AuthError::Rejected);
        }

        debug!(host = %self.host, "Login accepted");
        Ok(Session { username: username.to_string(), password: password.to_string() })
    }

    /// Upload a firmware binary.
    ///
    /// `on_progress` receives monotonically increasing `(sent, total)` byte
    /// counts. Cancellation is checked between chunks; cancelling drops the
    /// connection deterministically.
    pub async fn upload_firmware(
        &self,
        session: &Session,
        binary: &[u8],
        filename: &str,
        mut on_progress: impl FnMut(u64, u64) + Send,
        cancel: &CancelHandle,
    ) -> Result<(), UploadError> {
        validate_payload(filename, binary)?;

        let body =
            build_multipart(&session.username, &session.password, filename, binary);
        let budget = upload_timeout(body.len());
        info!(
            host = %self.host,
            bytes = binary.len(),
            budget_secs = budget.as_secs(),
            "Starting firmware upload"
        );

        let mut stream = connect(&self.addr(), CONNECT_TIMEOUT)
            .await
            .map_err(UploadError::Transport)?;

        let head = format!(
            "POST {UPLOAD_ENDPOINT} HTTP/1.1\r\n\
             Host: {}\r\n\
             Content-Type: multipart/form-data; boundary={MULTIPART_BOUNDARY}\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n",
            self.host,
            body.len()
        );

        let deadline = Instant::now() + budget;
        write_all_deadline(&mut stream, head.as_bytes(), deadline).await?;

        let total = body.len() as u64;
        let mut sent = 0u64;
        on_progress(0, total);
        for chunk in body.chunks(CHUNK_SIZE) {
            if cancel.is_cancelled() {
                info!(host = %self.host, sent = sent, "Upload cancelled, dropping connection");
                return Err(UploadError::Cancelled);
            }
            write_all_deadline(&mut stream, chunk, deadline).await?;
            sent += chunk.len() as u64;
            on_progress(sent, total);
        }
        stream
            .flush()
            .await
            .map_err(|err| UploadError::Transport(err.to_string()))?;

        debug!(host = %self.host, "Upload body sent, waiting for device to process");

        // Silence here is the device flashing, not a stall.
        let reply = read_reply(&mut stream, RESPONSE_TIMEOUT).await?;

        if reply.status != 200 {
            return Err(UploadError::DeviceRejected { status: reply.status });
        }
        if reply.body.contains(SUCCESS_PHRASE) {
            info!(host = %self.host, "Device confirmed firmware upload");
            return Ok(());
        }
        if reply.body.contains(LOGIN_FORM_MARKER) {
            return Err(UploadError::Auth(AuthError::Rejected));
        }
        Err(UploadError::DeviceRejected { status: reply.status })
    }

    /// Best-effort logout. The device is usually already restarting, so
    /// every failure is ignored.
    pub async fn logout(&self) {
        let body = format!("{FORM_FIELD_USERNAME}=&{FORM_FIELD_PASSWORD}=");
        if self
            .post("application/x-www-form-urlencoded", body.as_bytes(), CONNECT_TIMEOUT)
            .await
            .is_err()
        {
            debug!(host = %self.host, "Logout failed (device may be restarting)");
        }
    }

    /// Wait out the flash window, then poll basic reachability until the
    /// device accepts connections again.
    ///
    /// Returns `true` once a TCP connect succeeds. Success is necessary but
    /// not sufficient for install success; verification follows separately.
    pub async fn wait_for_restart(&self, timeout_budget: Duration) -> bool {
        self.wait_for_restart_with(DEVICE_RESTART_DELAY, timeout_budget, RESTART_POLL_INTERVAL)
            .await
    }

    /// As [`wait_for_restart`](Self::wait_for_restart) with explicit grace
    /// and poll knobs. Pass a zero `grace` to probe immediately, for a
    /// device that is not known to be mid-flash.
    pub async fn wait_for_restart_with(
        &self,
        grace: Duration,
        timeout_budget: Duration,
        poll_interval: Duration,
    ) -> bool {
        if !grace.is_zero() {
            debug!(host = %self.host, secs = grace.as_secs(), "Waiting out the flash window");
            tokio::time::sleep(grace).await;
        }
        let addr = self.addr();
        let deadline = Instant::now() + timeout_budget;
        loop {
            match timeout(poll_interval.max(Duration::from_millis(10)), TcpStream::connect(&addr)).await {
                Ok(Ok(_)) => {
                    info!(host = %self.host, "Device is reachable again");
                    return true;
                }
                _ => {
                    if Instant::now() + poll_interval >= deadline {
                        warn!(host = %self.host, "Device did not come back within budget");
                        return false;
                    }
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    async fn post(
        &self,
        content_type: &str,
        body: &[u8],
        budget: Duration,
    ) -> Result<HttpReply, UploadError> {
        let mut stream = connect(&self.addr(), CONNECT_TIMEOUT)
            .await
            .map_err(UploadError::Transport)?;
        let head = format!(
            "POST {UPLOAD_ENDPOINT} HTTP/1.1\r\n\
             Host: {}\r\n\
             Content-Type: {content_type}\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n",
            self.host,
            body.len()
        );
        let deadline = Instant::now() + budget;
        write_all_deadline(&mut stream, head.as_bytes(), deadline).await?;
        write_all_deadline(&mut stream, body, deadline).await?;
        stream
            .flush()
            .await
            .map_err(|err| UploadError::Transport(err.to_string()))?;
        read_reply(&mut stream, budget).await
    }
}

/// The upload budget scales with payload size: the device trickles data in
/// at roughly 20 KB/s, so a flat timeout would kill every large transfer.
fn upload_timeout(body_len: usize) -> Duration {
    Duration::from_secs(30 + body_len as u64 / 20_000)
}

fn validate_payload(filename: &str, binary: &[u8]) -> Result<(), ValidationError> {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if extension != FIRMWARE_EXTENSION {
        return Err(ValidationError::Extension(extension));
    }

    let len = binary.len() as u64;
    if !(MIN_BINARY_SIZE..=MAX_BINARY_SIZE).contains(&len) {
        return Err(ValidationError::Size(len));
    }

    // A vendor error page saved as firmware must never reach the device.
    let prefix = &binary[..binary.len().min(256)];
    let looks_like_markup = prefix.starts_with(b"<")
        || prefix.windows(5).any(|w| w.eq_ignore_ascii_case(b"<html"));
    if looks_like_markup {
        return Err(ValidationError::Signature("payload looks like an HTML page".into()));
    }

    Ok(())
}

fn build_multipart(username: &str, password: &str, filename: &str, binary: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(binary.len() + 512);
    for (name, value) in [(FORM_FIELD_USERNAME, username), (FORM_FIELD_PASSWORD, password)] {
        body.extend_from_slice(
            format!(
                "--{MULTIPART_BOUNDARY}\r\n\
                 Content-Disposition: form-data; name=\"{name}\"\r\n\r\n\
                 {value}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(
        format!(
            "--{MULTIPART_BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"{FORM_FIELD_FIRMWARE}\"; filename=\"{filename}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(binary);
    body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    body
}

async fn connect(addr: &str, budget: Duration) -> Result<TcpStream, String> {
    match timeout(budget, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(format!("connect to {addr} failed: {err}")),
        Err(_) => Err(format!("connect to {addr} timed out")),
    }
}

async fn write_all_deadline(
    stream: &mut TcpStream,
    data: &[u8],
    deadline: Instant,
) -> Result<(), UploadError> {
    match timeout_at(deadline, stream.write_all(data)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(UploadError::Transport(err.to_string())),
        Err(_) => Err(UploadError::Transport("upload timed out mid-transfer".into())),
    }
}

struct HttpReply {
    status: u16,
    body: String,
}

/// Read whatever the device sends until EOF, an error, or the budget runs
/// out. An IO error after bytes have already arrived is the device's usual
/// abrupt close and is treated as end-of-response.
async fn read_reply(stream: &mut TcpStream, budget: Duration) -> Result<HttpReply, UploadError> {
    let deadline = Instant::now() + budget;
    let mut raw: Vec<u8> = Vec::new();
    let mut buf = [0u8; 2048];

    loop {
        match timeout_at(deadline, stream.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                raw.extend_from_slice(&buf[..n]);
                if raw.len() >= MAX_RESPONSE_BYTES {
                    break;
                }
            }
            Ok(Err(err)) => {
                if raw.is_empty() {
                    return Err(UploadError::Transport(format!("read failed: {err}")));
                }
                debug!(error = %err, "Connection dropped after response (expected)");
                break;
            }
            Err(_) => {
                if raw.is_empty() {
                    return Err(UploadError::Transport(
                        "no response from device within budget".into(),
                    ));
                }
                break;
            }
        }
    }

    parse_reply(&raw)
}

fn parse_reply(raw: &[u8]) -> Result<HttpReply, UploadError> {
    let text = String::from_utf8_lossy(raw);
    let status_line = text
        .lines()
        .next()
        .ok_or_else(|| UploadError::Transport("empty response".into()))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| UploadError::Transport(format!("malformed status line: {status_line}")))?;

    let body = match text.find("\r\n\r\n") {
        Some(idx) => text[idx + 4..].to_string(),
        None => String::new(),
    };
    Ok(HttpReply { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    const FILENAME: &str = "C6_1_5_46_72_P1_1_1_5_48.mbin";

    fn firmware_bytes() -> Vec<u8> {
        vec![0xA5u8; 200_000]
    }

    fn success_page() -> String {
        format!("<html><body><td id=\"st\">Status: {SUCCESS_PHRASE}, device is restarting.</td></body></html>")
    }

    fn login_page() -> String {
        "<html><form><input name=\"1\"><input name=\"2\" type=\"password\"></form></html>".to_string()
    }

    fn upload_form_page() -> String {
        "<html><form><input type=\"file\" name=\"11111\"></form></html>".to_string()
    }

    /// Accept one connection, read the full request, send `response`
    /// verbatim, then drop the socket. Returns the captured request.
    fn serve_once(response: String) -> (SocketAddr, JoinHandle<Vec<u8>>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let listener = TcpListener::from_std(listener).unwrap();
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_http_request(&mut stream).await;
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.flush().await.unwrap();
            request
        });
        (addr, handle)
    }

    async fn read_http_request(stream: &mut TcpStream) -> Vec<u8> {
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        let mut body_expected: Option<usize> = None;
        let mut header_len = 0usize;
        loop {
            if let Some(expected) = body_expected
                && raw.len() >= header_len + expected
            {
                break;
            }
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            raw.extend_from_slice(&buf[..n]);
            if body_expected.is_none()
                && let Some(idx) = raw.windows(4).position(|w| w == b"\r\n\r\n")
            {
                header_len = idx + 4;
                let headers = String::from_utf8_lossy(&raw[..idx]).to_ascii_lowercase();
                let expected = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                body_expected = Some(expected);
            }
        }
        raw
    }

    fn session() -> Session {
        Session { username: DEFAULT_USERNAME.into(), password: DEFAULT_PASSWORD.into() }
    }

    #[tokio::test]
    async fn success_phrase_then_abrupt_close_is_success() {
        // Content-Length larger than the actual body: the device goes away
        // before delivering everything it promised.
        let body = success_page();
        let response = format!(
            "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
            body.len() + 4096
        );
        let (addr, server) = serve_once(response);
        let uploader = FirmwareUploader::new(addr.to_string());

        let result = uploader
            .upload_firmware(&session(), &firmware_bytes(), FILENAME, |_, _| {}, &CancelHandle::new())
            .await;

        assert!(result.is_ok(), "abrupt close after success must not be a transport fault: {result:?}");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn response_without_phrase_is_device_rejected() {
        let body = upload_form_page();
        let response = format!(
            "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let (addr, _server) = serve_once(response);
        let uploader = FirmwareUploader::new(addr.to_string());

        let result = uploader
            .upload_firmware(&session(), &firmware_bytes(), FILENAME, |_, _| {}, &CancelHandle::new())
            .await;

        assert!(matches!(result, Err(UploadError::DeviceRejected { status: 200 })));
    }

    #[tokio::test]
    async fn login_form_in_upload_response_is_auth_rejection() {
        let body = login_page();
        let response = format!(
            "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let (addr, _server) = serve_once(response);
        let uploader = FirmwareUploader::new(addr.to_string());

        let result = uploader
            .upload_firmware(&session(), &firmware_bytes(), FILENAME, |_, _| {}, &CancelHandle::new())
            .await;

        assert!(matches!(result, Err(UploadError::Auth(AuthError::Rejected))));
    }

    #[tokio::test]
    async fn multipart_body_carries_device_field_names() {
        let body = success_page();
        let response = format!(
            "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let (addr, server) = serve_once(response);
        let uploader = FirmwareUploader::new(addr.to_string());

        uploader
            .upload_firmware(&session(), &firmware_bytes(), FILENAME, |_, _| {}, &CancelHandle::new())
            .await
            .unwrap();

        let request = String::from_utf8_lossy(&server.await.unwrap()).to_string();
        assert!(request.starts_with("POST /g1.html HTTP/1.1\r\n"));
        assert!(request.contains("name=\"1\""));
        assert!(request.contains("name=\"2\""));
        assert!(request.contains(&format!("name=\"11111\"; filename=\"{FILENAME}\"")));
    }

    #[tokio::test]
    async fn progress_is_monotone_and_reaches_total() {
        let body = success_page();
        let response = format!(
            "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let (addr, _server) = serve_once(response);
        let uploader = FirmwareUploader::new(addr.to_string());

        let mut seen: Vec<u64> = Vec::new();
        let mut total_seen = 0u64;
        uploader
            .upload_firmware(
                &session(),
                &firmware_bytes(),
                FILENAME,
                |sent, total| {
                    seen.push(sent);
                    total_seen = total;
                },
                &CancelHandle::new(),
            )
            .await
            .unwrap();

        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress must be monotone");
        assert_eq!(*seen.last().unwrap(), total_seen);
        assert!(total_seen > firmware_bytes().len() as u64, "total covers the multipart framing");
    }

    #[tokio::test]
    async fn cancellation_aborts_between_chunks() {
        let (addr, _server) = serve_once("HTTP/1.1 200 OK\r\n\r\n".to_string());
        let uploader = FirmwareUploader::new(addr.to_string());
        let cancel = CancelHandle::new();
        cancel.cancel();

        let result = uploader
            .upload_firmware(&session(), &firmware_bytes(), FILENAME, |_, _| {}, &cancel)
            .await;

        assert!(matches!(result, Err(UploadError::Cancelled)));
    }

    #[tokio::test]
    async fn validation_rejects_bad_payloads_before_any_io() {
        let uploader = FirmwareUploader::new("240.0.0.1:9"); // never reached
        let cancel = CancelHandle::new();

        let result = uploader
            .upload_firmware(&session(), &firmware_bytes(), "firmware.bin", |_, _| {}, &cancel)
            .await;
        assert!(matches!(result, Err(UploadError::Validation(ValidationError::Extension(_)))));

        let result = uploader
            .upload_firmware(&session(), &vec![0u8; 50 * 1024], FILENAME, |_, _| {}, &cancel)
            .await;
        assert!(matches!(result, Err(UploadError::Validation(ValidationError::Size(_)))));

        let mut page = b"<html>error page</html>".to_vec();
        page.resize(200_000, b' ');
        let result = uploader
            .upload_firmware(&session(), &page, FILENAME, |_, _| {}, &cancel)
            .await;
        assert!(matches!(result, Err(UploadError::Validation(ValidationError::Signature(_)))));
    }

    #[tokio::test]
    async fn login_accepts_upload_form_and_rejects_login_form() {
        let body = upload_form_page();
        let response = format!(
            "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let (addr, _server) = serve_once(response);
        let uploader = FirmwareUploader::new(addr.to_string());
        assert!(uploader.login(DEFAULT_USERNAME, DEFAULT_PASSWORD).await.is_ok());

        let body = login_page();
        let response = format!(
            "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let (addr, _server) = serve_once(response);
        let uploader = FirmwareUploader::new(addr.to_string());
        assert!(matches!(
            uploader.login(DEFAULT_USERNAME, "wrong").await,
            Err(AuthError::Rejected)
        ));
    }

    #[tokio::test]
    async fn wait_for_restart_reports_reachability() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let uploader = FirmwareUploader::new(addr.to_string());
        assert!(
            uploader
                .wait_for_restart_with(
                    Duration::ZERO,
                    Duration::from_millis(500),
                    Duration::from_millis(20)
                )
                .await
        );

        // A port nothing listens on never comes back
        let uploader = FirmwareUploader::new("127.0.0.1:1");
        assert!(
            !uploader
                .wait_for_restart_with(
                    Duration::ZERO,
                    Duration::from_millis(200),
                    Duration::from_millis(20)
                )
                .await
        );
    }

    #[tokio::test]
    async fn restart_wait_defers_the_first_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        // The pre-flash web server is still up; a probe fired immediately
        // would see it and call the restart done.
        let uploader = FirmwareUploader::new(addr.to_string());
        let started = Instant::now();
        assert!(
            uploader
                .wait_for_restart_with(
                    Duration::from_millis(150),
                    Duration::from_millis(500),
                    Duration::from_millis(20)
                )
                .await
        );
        assert!(
            started.elapsed() >= Duration::from_millis(150),
            "probe must wait out the flash window first"
        );
    }

    #[test]
    fn upload_timeout_scales_with_size() {
        assert_eq!(upload_timeout(0), Duration::from_secs(30));
        assert_eq!(upload_timeout(1_000_000), Duration::from_secs(80));
        assert!(upload_timeout(10_000_000) >= Duration::from_secs(530));
    }
}
