//! Vento-Core: firmware update engine for Komfovent ventilation controllers.
//!
//! Keeps a fleet of C6/C8 air handling units on current firmware: polls the
//! vendor download feed, caches validated binaries on disk, and drives the
//! upload-flash-restart-verify cycle against each device's embedded web
//! server.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Version**: Firmware filename parsing and the update-eligibility order
//! - **Store**: Durable per-family cache of records and binaries
//! - **Transport**: Vendor HTTP abstraction (reqwest, mock)
//! - **Checker**: Periodic per-family checks against the vendor feed
//! - **Uploader**: Hand-framed HTTP upload to the device web server
//! - **Orchestrator**: Per-device install state machine
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use vento_core::checker::{CheckerConfig, FirmwareChecker};
//! use vento_core::orchestrator::{OrchestratorSettings, UpdateOrchestrator};
//! use vento_core::store::FirmwareStore;
//! use vento_core::transport::HttpTransport;
//! use vento_core::version::{ControllerFamily, FirmwareVersion};
//!
//! # async fn demo(source: impl vento_core::orchestrator::InstalledVersionSource) {
//! let checker = FirmwareChecker::new(
//!     HttpTransport::new(),
//!     FirmwareStore::new("/var/lib/vento"),
//!     CheckerConfig::default(),
//! );
//!
//! let orchestrator = UpdateOrchestrator::new(
//!     Arc::clone(&checker),
//!     "192.168.1.40",
//!     ControllerFamily::C6,
//!     source,
//!     OrchestratorSettings::default(),
//! );
//!
//! if let Some(latest) = orchestrator.latest() {
//!     orchestrator.install(&latest.controller_version).await.unwrap();
//! }
//! # }
//! ```

pub mod checker;
pub mod config;
pub mod events;
pub mod orchestrator;
pub mod store;
pub mod transport;
pub mod uploader;
pub mod version;

// Re-exports for convenience
pub use checker::{CheckError, CheckerConfig, FirmwareChecker};
pub use config::{DeviceConfig, UpdaterConfig};
pub use events::{NullObserver, TracingObserver, UpdateEvent, UpdateObserver};
pub use orchestrator::{
    FailReason, InstallError, InstalledVersionSource, OrchestratorSettings, UpdateOrchestrator,
    UpdateState,
};
pub use store::{CachedFirmware, FirmwareStore, StoreError};
pub use transport::{HttpTransport, MockVendorTransport, TransportError, VendorTransport};
pub use uploader::{AuthError, CancelHandle, FirmwareUploader, Session, UploadError};
pub use version::{ControllerFamily, FirmwareVersion, PanelVersion, parse_filename};
