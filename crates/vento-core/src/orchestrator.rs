//! Per-device update orchestrator.
//!
//! Composes the family-scoped checker cache, the externally supplied
//! installed-version reading, and the uploader into one install lifecycle.
//! All visible state transitions happen here; the uploader carries no retry
//! policy of its own and retries are an explicit caller decision via a new
//! `install` call after `reset`.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::checker::FirmwareChecker;
use crate::events::{TracingObserver, UpdateEvent, UpdateObserver};
use crate::store::CachedFirmware;
use crate::transport::VendorTransport;
use crate::uploader::{CancelHandle, FirmwareUploader, UploadError};
use crate::version::{ControllerFamily, FirmwareVersion};

/// Install lifecycle state, one per managed device.
///
/// Transitions are owned solely by the orchestrator. The only regressions
/// are `Failed -> Idle` and `Succeeded -> Idle` via an explicit [`UpdateOrchestrator::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Checking,
    Downloading,
    Validating,
    Uploading,
    WaitingRestart,
    Verifying,
    Succeeded,
    Failed,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateState::Idle => write!(f, "Idle"),
            UpdateState::Checking => write!(f, "Checking"),
            UpdateState::Downloading => write!(f, "Downloading"),
            UpdateState::Validating => write!(f, "Validating"),
            UpdateState::Uploading => write!(f, "Uploading"),
            UpdateState::WaitingRestart => write!(f, "Waiting for Restart"),
            UpdateState::Verifying => write!(f, "Verifying"),
            UpdateState::Succeeded => write!(f, "Succeeded"),
            UpdateState::Failed => write!(f, "Failed"),
        }
    }
}

/// Why an accepted install attempt ended in `Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    #[error("firmware check failed: {0}")]
    Check(String),

    #[error("firmware validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("upload cancelled")]
    Cancelled,

    #[error("device did not come back within the restart budget")]
    RestartTimeout,

    #[error("installed version never matched the uploaded firmware")]
    VerificationMismatch,
}

/// Rejection of an `install` or `reset` request. No state was changed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallError {
    #[error("update already in progress (state {0})")]
    NotIdle(UpdateState),

    #[error("target version does not match the cached latest firmware")]
    TargetMismatch,

    #[error("no firmware cached for family {0}")]
    NoFirmware(ControllerFamily),

    #[error("installed firmware {0} is too old for automatic update")]
    UnsupportedDevice(FirmwareVersion),

    #[error("cannot reset while an update is active (state {0})")]
    Active(UpdateState),
}

/// External collaborator that reads the device's installed firmware
/// version, typically the host's telemetry polling loop. Returns `None`
/// while the device is unreachable.
pub trait InstalledVersionSource: Send + Sync {
    fn installed_version(&self) -> impl Future<Output = Option<FirmwareVersion>> + Send;
}

/// Timing and credential knobs for one device.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub username: String,
    pub password: String,
    pub verify_attempts: u32,
    pub verify_interval: Duration,
    /// How long the device keeps its old web server up before dropping off
    /// the network to flash. Probing earlier mistakes the old server for a
    /// completed restart.
    pub restart_grace: Duration,
    pub restart_timeout: Duration,
    pub restart_poll_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            username: crate::uploader::DEFAULT_USERNAME.to_string(),
            password: crate::uploader::DEFAULT_PASSWORD.to_string(),
            verify_attempts: 8,
            verify_interval: Duration::from_secs(15),
            restart_grace: crate::uploader::DEVICE_RESTART_DELAY,
            restart_timeout: crate::uploader::DEFAULT_RESTART_TIMEOUT,
            restart_poll_interval: Duration::from_secs(5),
        }
    }
}

/// One instance per managed device.
pub struct UpdateOrchestrator<T, S, O = TracingObserver>
where
    T: VendorTransport + 'static,
    S: InstalledVersionSource,
    O: UpdateObserver,
{
    checker: Arc<FirmwareChecker<T>>,
    uploader: FirmwareUploader,
    source: S,
    observer: Arc<O>,
    family: ControllerFamily,
    settings: OrchestratorSettings,
    state_tx: watch::Sender<UpdateState>,
    progress_tx: watch::Sender<Option<u8>>,
    last_failure: Mutex<Option<FailReason>>,
    claim: Mutex<()>,
    cancel: CancelHandle,
}

impl<T, S> UpdateOrchestrator<T, S, TracingObserver>
where
    T: VendorTransport + 'static,
    S: InstalledVersionSource,
{
    /// Create an orchestrator with the default tracing observer. Must be
    /// called within a tokio runtime (it joins the family's check job).
    pub fn new(
        checker: Arc<FirmwareChecker<T>>,
        host: &str,
        family: ControllerFamily,
        source: S,
        settings: OrchestratorSettings,
    ) -> Self {
        Self::with_observer(checker, host, family, source, settings, Arc::new(TracingObserver))
    }
}

impl<T, S, O> UpdateOrchestrator<T, S, O>
where
    T: VendorTransport + 'static,
    S: InstalledVersionSource,
    O: UpdateObserver,
{
    /// Create an orchestrator with a custom observer.
    pub fn with_observer(
        checker: Arc<FirmwareChecker<T>>,
        host: &str,
        family: ControllerFamily,
        source: S,
        settings: OrchestratorSettings,
        observer: Arc<O>,
    ) -> Self {
        checker.register(family);
        let (state_tx, _) = watch::channel(UpdateState::Idle);
        let (progress_tx, _) = watch::channel(None);
        Self {
            checker,
            uploader: FirmwareUploader::new(host),
            source,
            observer,
            family,
            settings,
            state_tx,
            progress_tx,
            last_failure: Mutex::new(None),
            claim: Mutex::new(()),
            cancel: CancelHandle::new(),
        }
    }

    pub fn family(&self) -> ControllerFamily {
        self.family
    }

    /// Current lifecycle state.
    pub fn status(&self) -> UpdateState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<UpdateState> {
        self.state_tx.subscribe()
    }

    /// Upload progress, 0..=100 while uploading, `None` when indeterminate.
    pub fn progress(&self) -> Option<u8> {
        *self.progress_tx.borrow()
    }

    /// Latest cached firmware for this device's family, if any.
    pub fn latest(&self) -> Option<CachedFirmware> {
        self.checker.store().load(self.family)
    }

    /// Why the last attempt failed, if it did.
    pub fn last_failure(&self) -> Option<FailReason> {
        self.last_failure.lock().unwrap().clone()
    }

    /// While the device is flashing or restarting, host-side reachability
    /// probes are expected to fail and must not raise an offline alarm.
    pub fn updating(&self) -> bool {
        matches!(self.status(), UpdateState::Uploading | UpdateState::WaitingRestart)
    }

    /// Request cancellation of an in-flight upload.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Return to `Idle` after a finished attempt.
    pub fn reset(&self) -> Result<(), InstallError> {
        let _claim = self.claim.lock().unwrap();
        match self.status() {
            UpdateState::Failed | UpdateState::Succeeded => {
                *self.last_failure.lock().unwrap() = None;
                self.progress_tx.send_replace(None);
                self.transition(UpdateState::Idle);
                Ok(())
            }
            UpdateState::Idle => Ok(()),
            other => Err(InstallError::Active(other)),
        }
    }

    /// Run an install attempt to completion.
    ///
    /// Rejected without any state change unless the state is `Idle` and
    /// `target` equals the currently cached latest version; the latter
    /// closes the race between a user-initiated install and a concurrent
    /// checker refresh. An accepted attempt always returns `Ok(())`; its
    /// outcome lands in [`status`](Self::status) and
    /// [`last_failure`](Self::last_failure).
    pub async fn install(&self, target: &FirmwareVersion) -> Result<(), InstallError> {
        let cached = self
            .checker
            .store()
            .load(self.family)
            .ok_or(InstallError::NoFirmware(self.family))?;

        if let Some(installed) = self.source.installed_version().await
            && !installed.supports_upload()
        {
            return Err(InstallError::UnsupportedDevice(installed));
        }

        {
            let _claim = self.claim.lock().unwrap();
            let state = self.status();
            if state != UpdateState::Idle {
                return Err(InstallError::NotIdle(state));
            }
            if !cached.controller_version.same_numbers(target) {
                return Err(InstallError::TargetMismatch);
            }
            self.cancel.clear();
            *self.last_failure.lock().unwrap() = None;
            self.transition(UpdateState::Checking);
        }

        match self.run_install(cached).await {
            Ok(version) => {
                self.transition(UpdateState::Succeeded);
                self.observer.on_event(&UpdateEvent::Succeeded { version });
                Ok(())
            }
            Err(reason) => {
                warn!(family = %self.family, reason = %reason, "Install attempt failed");
                *self.last_failure.lock().unwrap() = Some(reason.clone());
                self.transition(UpdateState::Failed);
                self.observer.on_event(&UpdateEvent::Failed { reason });
                Ok(())
            }
        }
    }

    async fn run_install(&self, cached: CachedFirmware) -> Result<FirmwareVersion, FailReason> {
        let store = self.checker.store();

        let record = if store.binary_exists(&cached) {
            // Common path: a validated binary is already on disk, so
            // Downloading and Validating are skipped entirely.
            cached
        } else {
            self.transition(UpdateState::Downloading);
            let record = self
                .checker
                .check_now(self.family)
                .await
                .map_err(|err| FailReason::Check(err.to_string()))?;
            self.transition(UpdateState::Validating);
            if !store.binary_exists(&record) {
                return Err(FailReason::Validation("downloaded binary failed validation".into()));
            }
            self.observer.on_event(&UpdateEvent::CheckCompleted {
                family: self.family,
                version: record.controller_version,
            });
            record
        };

        let binary = tokio::fs::read(&record.binary_path)
            .await
            .map_err(|err| FailReason::Validation(format!("read firmware binary: {err}")))?;

        self.transition(UpdateState::Uploading);
        self.progress_tx.send_replace(Some(0));

        let session = self
            .uploader
            .login(&self.settings.username, &self.settings.password)
            .await
            .map_err(|err| FailReason::Auth(err.to_string()))?;

        let observer = Arc::clone(&self.observer);
        let progress_tx = self.progress_tx.clone();
        let upload = self
            .uploader
            .upload_firmware(
                &session,
                &binary,
                &record.filename,
                move |sent, total| {
                    let percent = if total > 0 { (sent * 100 / total) as u8 } else { 0 };
                    progress_tx.send_replace(Some(percent));
                    observer.on_event(&UpdateEvent::Progress { sent, total, percent });
                },
                &self.cancel,
            )
            .await;

        if let Err(err) = upload {
            return Err(match err {
                UploadError::Auth(err) => FailReason::Auth(err.to_string()),
                UploadError::Validation(err) => FailReason::Validation(err.to_string()),
                UploadError::Cancelled => FailReason::Cancelled,
                other => FailReason::Upload(other.to_string()),
            });
        }

        self.uploader.logout().await;

        self.transition(UpdateState::WaitingRestart);
        self.progress_tx.send_replace(None);
        let restarted = self
            .uploader
            .wait_for_restart_with(
                self.settings.restart_grace,
                self.settings.restart_timeout,
                self.settings.restart_poll_interval,
            )
            .await;
        if !restarted {
            // Device state is unknown here, not assumed bricked
            return Err(FailReason::RestartTimeout);
        }

        self.transition(UpdateState::Verifying);
        for attempt in 1..=self.settings.verify_attempts {
            if let Some(installed) = self.source.installed_version().await
                && installed.same_numbers(&record.controller_version)
            {
                info!(family = %self.family, version = %installed, "Installed version verified");
                return Ok(installed);
            }
            debug!(attempt, "Installed version does not match yet");
            if attempt < self.settings.verify_attempts {
                tokio::time::sleep(self.settings.verify_interval).await;
            }
        }
        // A slow-to-report device may already run the new firmware; a
        // manual re-check beats an automatic re-upload here.
        Err(FailReason::VerificationMismatch)
    }

    fn transition(&self, to: UpdateState) {
        let from = self.status();
        if from == to {
            return;
        }
        info!(device = %self.family, from = %from, to = %to, "State transition");
        self.state_tx.send_replace(to);
        self.observer.on_event(&UpdateEvent::StateChanged { from, to });
    }

    #[cfg(test)]
    fn force_state(&self, state: UpdateState) {
        self.state_tx.send_replace(state);
    }
}

impl<T, S, O> Drop for UpdateOrchestrator<T, S, O>
where
    T: VendorTransport + 'static,
    S: InstalledVersionSource,
    O: UpdateObserver,
{
    fn drop(&mut self) {
        self.checker.unregister(self.family);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::CheckerConfig;
    use crate::store::FirmwareStore;
    use crate::transport::MockVendorTransport;
    use crate::uploader::SUCCESS_PHRASE;
    use chrono::Utc;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const FILENAME: &str = "C6_1_5_46_72_P1_1_1_5_48.mbin";

    fn target_version() -> FirmwareVersion {
        FirmwareVersion::new(ControllerFamily::C6, 1, 5, 46, 72)
    }

    /// Installed-version source that always reads the same value.
    struct FixedSource(Option<FirmwareVersion>);

    impl InstalledVersionSource for FixedSource {
        async fn installed_version(&self) -> Option<FirmwareVersion> {
            self.0
        }
    }

    fn test_settings() -> OrchestratorSettings {
        OrchestratorSettings {
            verify_attempts: 3,
            verify_interval: Duration::from_millis(10),
            restart_grace: Duration::from_millis(30),
            restart_timeout: Duration::from_millis(300),
            restart_poll_interval: Duration::from_millis(20),
            ..OrchestratorSettings::default()
        }
    }

    fn make_checker(dir: &std::path::Path) -> Arc<FirmwareChecker<MockVendorTransport>> {
        FirmwareChecker::new(
            MockVendorTransport::new(),
            FirmwareStore::new(dir),
            CheckerConfig { check_interval: Duration::from_secs(3600), ..CheckerConfig::default() },
        )
    }

    fn seed_store(store: &FirmwareStore, with_binary: bool) -> CachedFirmware {
        let binary_path = if with_binary {
            store.write_binary(FILENAME, &vec![0xA5u8; 200_000]).unwrap()
        } else {
            store.dir().join(FILENAME)
        };
        let record = CachedFirmware {
            checked_at: Utc::now(),
            filename: FILENAME.to_string(),
            controller_version: target_version(),
            panel_version: None,
            binary_path,
        };
        store.save(ControllerFamily::C6, &record).unwrap();
        record
    }

    /// Minimal scripted device: serves the upload form on urlencoded
    /// POSTs (login), the success page on multipart POSTs, and drops bare
    /// connects (restart probes). Stops accepting after `accept_limit`.
    fn spawn_device(accept_limit: Option<usize>) -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let listener = TcpListener::from_std(listener).unwrap();
            let mut served = 0usize;
            loop {
                if accept_limit.is_some_and(|limit| served >= limit) {
                    break;
                }
                let Ok((mut stream, _)) = listener.accept().await else { break };
                served += 1;
                tokio::spawn(async move {
                    let request = read_request(&mut stream).await;
                    if request.is_empty() {
                        return; // restart probe
                    }
                    let text = String::from_utf8_lossy(&request).to_string();
                    let body = if text.contains("multipart/form-data") {
                        format!("<html><td id=\"st\">Status: {SUCCESS_PHRASE}.</td></html>")
                    } else {
                        "<html><input type=\"file\" name=\"11111\"></html>".to_string()
                    };
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        addr
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) -> Vec<u8> {
        let mut raw = Vec::new();
        let mut buf = [0u8; 4096];
        let mut expected: Option<usize> = None;
        let mut header_len = 0usize;
        loop {
            if let Some(expected) = expected
                && raw.len() >= header_len + expected
            {
                break;
            }
            let n = match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            raw.extend_from_slice(&buf[..n]);
            if expected.is_none()
                && let Some(idx) = raw.windows(4).position(|w| w == b"\r\n\r\n")
            {
                header_len = idx + 4;
                let headers = String::from_utf8_lossy(&raw[..idx]).to_ascii_lowercase();
                expected = Some(
                    headers
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse().ok())
                        .unwrap_or(0),
                );
            }
        }
        raw
    }

    #[tokio::test]
    async fn install_rejected_when_not_idle() {
        let dir = tempfile::tempdir().unwrap();
        let checker = make_checker(dir.path());
        seed_store(checker.store(), true);
        let orch = UpdateOrchestrator::new(
            checker,
            "127.0.0.1:1",
            ControllerFamily::C6,
            FixedSource(Some(target_version())),
            test_settings(),
        );

        orch.force_state(UpdateState::Uploading);
        let result = orch.install(&target_version()).await;

        assert_eq!(result, Err(InstallError::NotIdle(UpdateState::Uploading)));
        assert_eq!(orch.status(), UpdateState::Uploading, "rejection must not change state");
    }

    #[tokio::test]
    async fn install_rejected_on_target_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let checker = make_checker(dir.path());
        seed_store(checker.store(), true);
        let orch = UpdateOrchestrator::new(
            checker,
            "127.0.0.1:1",
            ControllerFamily::C6,
            FixedSource(Some(target_version())),
            test_settings(),
        );

        let stale = FirmwareVersion::new(ControllerFamily::C6, 1, 5, 40, 60);
        let result = orch.install(&stale).await;

        assert_eq!(result, Err(InstallError::TargetMismatch));
        assert_eq!(orch.status(), UpdateState::Idle);
    }

    #[tokio::test]
    async fn install_rejected_without_cached_firmware() {
        let dir = tempfile::tempdir().unwrap();
        let checker = make_checker(dir.path());
        let orch = UpdateOrchestrator::new(
            checker,
            "127.0.0.1:1",
            ControllerFamily::C6,
            FixedSource(Some(target_version())),
            test_settings(),
        );

        let result = orch.install(&target_version()).await;
        assert_eq!(result, Err(InstallError::NoFirmware(ControllerFamily::C6)));
    }

    #[tokio::test]
    async fn install_rejected_for_too_old_installed_firmware() {
        let dir = tempfile::tempdir().unwrap();
        let checker = make_checker(dir.path());
        seed_store(checker.store(), true);
        let ancient = FirmwareVersion::new(ControllerFamily::C6, 1, 3, 10, 5);
        let orch = UpdateOrchestrator::new(
            checker,
            "127.0.0.1:1",
            ControllerFamily::C6,
            FixedSource(Some(ancient)),
            test_settings(),
        );

        let result = orch.install(&target_version()).await;
        assert_eq!(result, Err(InstallError::UnsupportedDevice(ancient)));
    }

    #[tokio::test]
    async fn full_install_succeeds_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let checker = make_checker(dir.path());
        seed_store(checker.store(), true);
        let device = spawn_device(None);
        let orch = UpdateOrchestrator::new(
            checker,
            &device.to_string(),
            ControllerFamily::C6,
            FixedSource(Some(target_version())),
            test_settings(),
        );

        orch.install(&target_version()).await.unwrap();

        assert_eq!(orch.status(), UpdateState::Succeeded);
        assert_eq!(orch.last_failure(), None);

        orch.reset().unwrap();
        assert_eq!(orch.status(), UpdateState::Idle);
    }

    #[tokio::test]
    async fn verification_exhaustion_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let checker = make_checker(dir.path());
        seed_store(checker.store(), true);
        let device = spawn_device(None);
        // Device keeps reporting the pre-update version
        let old = FirmwareVersion::new(ControllerFamily::C6, 1, 5, 40, 60);
        let orch = UpdateOrchestrator::new(
            checker,
            &device.to_string(),
            ControllerFamily::C6,
            FixedSource(Some(old)),
            test_settings(),
        );

        orch.install(&target_version()).await.unwrap();

        assert_eq!(orch.status(), UpdateState::Failed);
        assert_eq!(orch.last_failure(), Some(FailReason::VerificationMismatch));
    }

    #[tokio::test]
    async fn restart_timeout_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let checker = make_checker(dir.path());
        seed_store(checker.store(), true);
        // Device serves login + upload, then never accepts again
        let device = spawn_device(Some(2));
        let orch = UpdateOrchestrator::new(
            checker,
            &device.to_string(),
            ControllerFamily::C6,
            FixedSource(Some(target_version())),
            test_settings(),
        );

        orch.install(&target_version()).await.unwrap();

        assert_eq!(orch.status(), UpdateState::Failed);
        assert_eq!(orch.last_failure(), Some(FailReason::RestartTimeout));
    }

    #[tokio::test]
    async fn missing_binary_triggers_on_demand_check() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MockVendorTransport::new();
        let checker = FirmwareChecker::new(
            transport.clone(),
            FirmwareStore::new(dir.path()),
            CheckerConfig { check_interval: Duration::from_secs(3600), ..CheckerConfig::default() },
        );
        seed_store(checker.store(), false);
        let device = spawn_device(None);
        let orch = UpdateOrchestrator::new(
            checker,
            &device.to_string(),
            ControllerFamily::C6,
            FixedSource(Some(target_version())),
            test_settings(),
        );

        // Let the registration-triggered check fail on the empty script
        // first; the next scheduled one is an hour away.
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.queue_firmware(FILENAME, vec![0xA5u8; 200_000]);

        orch.install(&target_version()).await.unwrap();

        assert_eq!(orch.status(), UpdateState::Succeeded);
        assert_eq!(transport.body_reads(), 1, "orchestrator must trigger the download");
    }
}
