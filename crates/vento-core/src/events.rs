//! Event system for UI decoupling.
//!
//! Allows CLI/service/UI layers to subscribe to update-lifecycle events
//! without tight coupling to the core logic.

use crate::orchestrator::{FailReason, UpdateState};
use crate::version::{ControllerFamily, FirmwareVersion};

/// Events emitted by the update orchestrator.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// Orchestrator state transition.
    StateChanged { from: UpdateState, to: UpdateState },
    /// Upload progress for the current install.
    Progress { sent: u64, total: u64, percent: u8 },
    /// A firmware check finished with a usable result.
    CheckCompleted {
        family: ControllerFamily,
        version: FirmwareVersion,
    },
    /// The install attempt failed.
    Failed { reason: FailReason },
    /// The install attempt succeeded and was verified.
    Succeeded { version: FirmwareVersion },
}

/// Observer trait for receiving update events.
///
/// Implement this trait in your host layer to receive updates.
pub trait UpdateObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &UpdateEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl UpdateObserver for NullObserver {
    fn on_event(&self, _event: &UpdateEvent) {
        // Do nothing
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl UpdateObserver for TracingObserver {
    fn on_event(&self, event: &UpdateEvent) {
        match event {
            UpdateEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Update state changed");
            }
            UpdateEvent::Progress { sent, total, percent } => {
                tracing::debug!(sent = sent, total = total, progress = %format!("{percent}%"), "Upload progress");
            }
            UpdateEvent::CheckCompleted { family, version } => {
                tracing::info!(family = %family, version = %version, "Firmware check completed");
            }
            UpdateEvent::Failed { reason } => {
                tracing::error!(reason = %reason, "Firmware install failed");
            }
            UpdateEvent::Succeeded { version } => {
                tracing::info!(version = %version, "Firmware install verified");
            }
        }
    }
}
