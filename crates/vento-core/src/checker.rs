//! Periodic firmware checker, one logical job per controller family.
//!
//! The vendor endpoint has no metadata API: the advertised version only
//! exists in the content-disposition header of the download itself. A check
//! therefore fetches headers first, decides from the filename whether the
//! payload is functionally newer than the cache, and only then consumes the
//! body. Up-to-date checks never read a single body byte.
//!
//! Families are reference-counted: two devices of the same family share one
//! job, and the first device leaving must not disable checks for the second.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{CachedFirmware, FirmwareStore, MAX_BINARY_SIZE, MIN_BINARY_SIZE};
use crate::transport::{CheckResponse, VendorTransport};
use crate::version::{self, ControllerFamily};

#[derive(Error, Debug, Clone)]
pub enum CheckError {
    #[error("vendor endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("advertised firmware version not parsable: {0}")]
    UnparsableVersion(String),

    #[error("advertised firmware file not supported: {0}")]
    UnsupportedFile(String),

    #[error("downloaded firmware payload invalid: {0}")]
    InvalidPayload(String),

    #[error("firmware store error: {0}")]
    Store(String),
}

/// Timing knobs; production defaults match the vendor's rate limiting.
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Interval between scheduled checks per family.
    pub check_interval: Duration,
    /// Budget for the headers-only phase.
    pub header_timeout: Duration,
    /// Budget for the full body download.
    pub download_timeout: Duration,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(7 * 24 * 3600),
            header_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(300),
        }
    }
}

struct FamilyEntry {
    refs: usize,
    job: JoinHandle<()>,
}

type CheckOutcome = Result<CachedFirmware, CheckError>;
type InflightMap = HashMap<ControllerFamily, watch::Receiver<Option<CheckOutcome>>>;

/// Removes its in-flight entry on drop, so an aborted check task cannot
/// leave a dead entry behind that later callers attach to forever.
struct InflightGuard<'a> {
    inflight: &'a Mutex<InflightMap>,
    family: ControllerFamily,
    rx: watch::Receiver<Option<CheckOutcome>>,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock().unwrap();
        if inflight.get(&self.family).is_some_and(|cur| cur.same_channel(&self.rx)) {
            inflight.remove(&self.family);
        }
    }
}

/// Family-scoped firmware checker shared by all devices of one family.
pub struct FirmwareChecker<T: VendorTransport + 'static> {
    transport: T,
    store: FirmwareStore,
    config: CheckerConfig,
    families: Mutex<HashMap<ControllerFamily, FamilyEntry>>,
    inflight: Mutex<InflightMap>,
}

impl<T: VendorTransport + 'static> FirmwareChecker<T> {
    pub fn new(transport: T, store: FirmwareStore, config: CheckerConfig) -> Arc<Self> {
        Arc::new(Self {
            transport,
            store,
            config,
            families: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &FirmwareStore {
        &self.store
    }

    /// Register a device of the given family. The periodic job starts on
    /// the first registration and runs immediately.
    pub fn register(self: &Arc<Self>, family: ControllerFamily) {
        let mut families = self.families.lock().unwrap();
        if let Some(entry) = families.get_mut(&family) {
            entry.refs += 1;
            debug!(family = %family, refs = entry.refs, "Joined existing check job");
            return;
        }

        let weak = Arc::downgrade(self);
        let interval = self.config.check_interval;
        let job = tokio::spawn(async move {
            loop {
                let Some(checker) = weak.upgrade() else { break };
                if let Err(err) = checker.check_now(family).await {
                    warn!(family = %family, error = %err, "Scheduled firmware check failed");
                }
                drop(checker);
                tokio::time::sleep(interval).await;
            }
        });

        families.insert(family, FamilyEntry { refs: 1, job });
        info!(family = %family, "Started periodic firmware check job");
    }

    /// Unregister one device. The job stops only when the last device of
    /// the family leaves; extra unregisters are a no-op.
    pub fn unregister(&self, family: ControllerFamily) {
        let mut families = self.families.lock().unwrap();
        let Some(entry) = families.get_mut(&family) else {
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            let entry = families.remove(&family).expect("entry present");
            entry.job.abort();
            info!(family = %family, "Stopped periodic firmware check job");
        } else {
            debug!(family = %family, refs = entry.refs, "Device left, check job stays active");
        }
    }

    /// Whether the periodic job for a family is currently active.
    pub fn job_active(&self, family: ControllerFamily) -> bool {
        self.families.lock().unwrap().contains_key(&family)
    }

    /// Run a check for one family, now.
    ///
    /// Reentrancy-guarded: a caller arriving while a check for the same
    /// family is in flight attaches to that check's result instead of
    /// issuing a second request against a rate-limited server. If the
    /// owning task is aborted mid-check, one waiter takes over.
    pub async fn check_now(&self, family: ControllerFamily) -> CheckOutcome {
        loop {
            // Scoped so the std MutexGuard is dropped before any await,
            // keeping this future Send.
            let claimed = {
                let mut inflight = self.inflight.lock().unwrap();
                if let Some(rx) = inflight.get(&family) {
                    Err(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(family, rx.clone());
                    Ok((tx, rx))
                }
            };

            let (tx, rx) = match claimed {
                Err(mut rx) => {
                    debug!(family = %family, "Attaching to in-flight firmware check");
                    loop {
                        if let Some(outcome) = rx.borrow_and_update().clone() {
                            return outcome;
                        }
                        if rx.changed().await.is_err() {
                            // Owning check aborted before publishing. Evict its
                            // dead entry, unless a newer check already replaced
                            // it, and go around for another attempt.
                            let mut inflight = self.inflight.lock().unwrap();
                            if inflight.get(&family).is_some_and(|cur| cur.same_channel(&rx)) {
                                inflight.remove(&family);
                            }
                            break;
                        }
                    }
                    continue;
                }
                Ok(pair) => pair,
            };

            // The guard ties the entry to this task: an abort at any await
            // point removes it instead of wedging later callers.
            let guard = InflightGuard { inflight: &self.inflight, family, rx };
            let outcome = self.run_check(family).await;
            drop(guard);
            let _ = tx.send(Some(outcome.clone()));
            return outcome;
        }
    }

    async fn run_check(&self, family: ControllerFamily) -> CheckOutcome {
        let cached = self.store.load(family);

        let response = self
            .transport
            .begin_check(family.vendor_url(), self.config.header_timeout)
            .await
            .map_err(|err| CheckError::Unreachable(err.to_string()))?;

        if response.status() != 200 {
            return Err(CheckError::Unreachable(format!("HTTP {}", response.status())));
        }

        let filename = response
            .content_disposition()
            .and_then(extract_filename)
            .map(str::to_string);
        let Some(filename) = filename else {
            self.touch_checked_at(family, cached.as_ref());
            return Err(CheckError::UnparsableVersion(
                "no filename in content-disposition".into(),
            ));
        };

        let parsed = match version::parse_filename(&filename) {
            Ok(parsed) => parsed,
            Err(err) => {
                // Prior cache stays untouched apart from the timestamp
                self.touch_checked_at(family, cached.as_ref());
                return Err(CheckError::UnparsableVersion(err.to_string()));
            }
        };

        if parsed.controller.family != family {
            self.touch_checked_at(family, cached.as_ref());
            return Err(CheckError::UnparsableVersion(format!(
                "family mismatch: expected {family}, got {}",
                parsed.controller.family
            )));
        }

        if !parsed.extension_supported() {
            self.touch_checked_at(family, cached.as_ref());
            return Err(CheckError::UnsupportedFile(parsed.extension));
        }

        if let Some(existing) = &cached
            && !version::is_newer(&existing.controller_version, &parsed.controller)
            && self.store.binary_exists(existing)
        {
            // Up to date with a valid binary on disk: abort the transfer
            // before any body bytes and refresh the timestamp only.
            drop(response);
            debug!(family = %family, version = %existing.controller_version, "Firmware is up to date");
            let refreshed = CachedFirmware { checked_at: Utc::now(), ..existing.clone() };
            self.store
                .save(family, &refreshed)
                .map_err(|err| CheckError::Store(err.to_string()))?;
            return Ok(refreshed);
        }

        info!(family = %family, version = %parsed.controller, "Downloading firmware");
        let body = response
            .read_body(self.config.download_timeout)
            .await
            .map_err(|err| CheckError::Unreachable(err.to_string()))?;

        let len = body.len() as u64;
        if !(MIN_BINARY_SIZE..=MAX_BINARY_SIZE).contains(&len) {
            self.touch_checked_at(family, cached.as_ref());
            return Err(CheckError::InvalidPayload(format!("{len} bytes")));
        }

        let binary_path = self
            .store
            .write_binary(&parsed.filename, &body)
            .map_err(|err| CheckError::Store(err.to_string()))?;

        let record = CachedFirmware {
            checked_at: Utc::now(),
            filename: parsed.filename.clone(),
            controller_version: parsed.controller,
            panel_version: parsed.panel,
            binary_path,
        };
        self.store
            .save(family, &record)
            .map_err(|err| CheckError::Store(err.to_string()))?;

        self.evict_superseded();

        info!(family = %family, version = %record.controller_version, "New firmware cached");
        Ok(record)
    }

    /// Refresh `checked_at` so a non-transport failure is not retried
    /// before the next scheduled tick. Version and binary fields keep
    /// their previous values.
    fn touch_checked_at(&self, family: ControllerFamily, cached: Option<&CachedFirmware>) {
        if let Some(existing) = cached {
            let refreshed = CachedFirmware { checked_at: Utc::now(), ..existing.clone() };
            if let Err(err) = self.store.save(family, &refreshed) {
                warn!(family = %family, error = %err, "Failed to refresh check timestamp");
            }
        }
    }

    fn evict_superseded(&self) {
        let families: Vec<ControllerFamily> =
            self.families.lock().unwrap().keys().copied().collect();
        let keep: Vec<CachedFirmware> =
            families.iter().filter_map(|f| self.store.load(*f)).collect();
        if !keep.is_empty() {
            self.store.evict_stale(&keep);
        }
    }
}

/// Extract the filename from a content-disposition value.
///
/// Handles both quoted and unquoted forms:
/// - `attachment; filename="C6_1_5_46_72_P1_1_1_5_48.mbin"`
/// - `attachment; filename=C6_1_5_46_72_P1_1_1_5_48.mbin`
fn extract_filename(content_disposition: &str) -> Option<&str> {
    for segment in content_disposition.split(';') {
        let stripped = segment.trim();
        // get() rather than a byte slice: header values are untrusted and
        // may put a multi-byte character across the cut
        let starts_filename = stripped
            .get(..8)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("filename"));
        if starts_filename {
            let (_, value) = stripped.split_once('=')?;
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            if value.is_empty() {
                return None;
            }
            return Some(value);
        }
    }
    None
}
