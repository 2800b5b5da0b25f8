//! Durable cache of the last-known latest firmware per controller family.
//!
//! One JSON record per family plus the downloaded binary alongside it.
//! Records are replaced wholesale on each successful check and written
//! atomically (temp file then rename) so a crash mid-write cannot leave a
//! half-written record that parses as valid.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::version::{ControllerFamily, FirmwareVersion, PanelVersion};

/// Binaries outside this window are treated as corrupt or truncated.
pub const MIN_BINARY_SIZE: u64 = 100_000;
pub const MAX_BINARY_SIZE: u64 = 10_000_000;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("atomic rename failed: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Latest-known firmware metadata for one controller family.
///
/// Owned exclusively by the store; the checker is the single writer,
/// orchestrators read snapshots via [`FirmwareStore::load`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFirmware {
    pub checked_at: DateTime<Utc>,
    pub filename: String,
    pub controller_version: FirmwareVersion,
    pub panel_version: Option<PanelVersion>,
    pub binary_path: PathBuf,
}

/// Filesystem-backed firmware cache rooted at one directory.
#[derive(Debug, Clone)]
pub struct FirmwareStore {
    dir: PathBuf,
}

impl FirmwareStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, family: ControllerFamily) -> PathBuf {
        self.dir.join(format!("{family}.json"))
    }

    /// Load the cached record for a family. Missing or corrupt persisted
    /// data yields `None`; the next check will simply re-download.
    pub fn load(&self, family: ControllerFamily) -> Option<CachedFirmware> {
        let path = self.record_path(family);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(family = %family, path = %path.display(), error = %err, "Discarding corrupt firmware record");
                None
            }
        }
    }

    /// Atomically replace the record for a family.
    pub fn save(&self, family: ControllerFamily, record: &CachedFirmware) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.flush()?;
        tmp.persist(self.record_path(family))?;
        info!(family = %family, version = %record.controller_version, "Stored firmware record");
        Ok(())
    }

    /// Write a downloaded binary next to the records, atomically.
    pub fn write_binary(&self, filename: &str, data: &[u8]) -> Result<PathBuf, StoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(filename);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(data)?;
        tmp.flush()?;
        tmp.persist(&path)?;
        debug!(path = %path.display(), bytes = data.len(), "Wrote firmware binary");
        Ok(path)
    }

    /// Whether the record's binary is present on disk with a plausible size.
    ///
    /// A failed check invalidates only the binary reference, not the record:
    /// the metadata stays so the next check knows what it last saw.
    pub fn binary_exists(&self, record: &CachedFirmware) -> bool {
        match fs::metadata(&record.binary_path) {
            Ok(meta) => {
                meta.is_file() && (MIN_BINARY_SIZE..=MAX_BINARY_SIZE).contains(&meta.len())
            }
            Err(_) => false,
        }
    }

    /// Remove firmware binaries no longer referenced by any kept record.
    pub fn evict_stale(&self, keep: &[CachedFirmware]) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let is_binary = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("mbin"));
            if !is_binary {
                continue;
            }
            let needed = keep.iter().any(|r| r.binary_path == path);
            if !needed {
                match fs::remove_file(&path) {
                    Ok(()) => info!(path = %path.display(), "Removed superseded firmware binary"),
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "Failed to remove firmware binary");
                    }
                }
            }
        }
    }
}
