//! Device access permission
//!
//! The broker decides, or asks someone to decide, whether a device may be
//! opened. Outcomes never come back as return values: they are posted as
//! `SessionEvent::PermissionResult` into the session queue, so they are handled
//! in order with every other event, whichever thread produced them.

use async_channel::{Sender, TrySendError};
use common::{DeviceDescriptor, SessionEvent, UiEvent, notify_ui};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Source of access decisions
pub trait PermissionBroker: Send {
    /// Whether access is already granted without asking
    fn has_permission(&self, device: &DeviceDescriptor) -> bool;

    /// Start an access request; the outcome arrives later as an event
    fn request_access(&mut self, device: &DeviceDescriptor);
}

/// How the configured broker answers requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// Ask the user through the UI
    #[default]
    Prompt,
    /// Every matching device is pre-approved
    Grant,
    /// Every request is declined
    Deny,
}

impl std::str::FromStr for PermissionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "prompt" => Ok(PermissionMode::Prompt),
            "grant" => Ok(PermissionMode::Grant),
            "deny" => Ok(PermissionMode::Deny),
            other => Err(format!(
                "Invalid permission mode '{}', must be one of: prompt, grant, deny",
                other
            )),
        }
    }
}

/// Broker driven by the configured `PermissionMode`
///
/// In prompt mode the question goes to the UI as `PermissionRequested`; the UI
/// answers by posting `PermissionResult` on the session bridge.
pub struct PolicyBroker {
    mode: PermissionMode,
    event_tx: Sender<SessionEvent>,
    ui_tx: Sender<UiEvent>,
}

impl PolicyBroker {
    pub fn new(mode: PermissionMode, event_tx: Sender<SessionEvent>, ui_tx: Sender<UiEvent>) -> Self {
        Self {
            mode,
            event_tx,
            ui_tx,
        }
    }

    pub fn mode(&self) -> PermissionMode {
        self.mode
    }

    fn post_outcome(&self, device: &DeviceDescriptor, granted: bool) {
        let event = SessionEvent::PermissionResult {
            device: device.clone(),
            granted,
        };
        // The session thread is the caller, so it must not block on its own queue.
        // A full queue hands the outcome to a helper thread that waits for room.
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!("Session queue full, deferring permission outcome for {}", device);
                let event_tx = self.event_tx.clone();
                let spawned = std::thread::Builder::new()
                    .name("permission-outcome".to_string())
                    .spawn(move || {
                        if let Err(e) = event_tx.send_blocking(event) {
                            warn!("Failed to post permission outcome: {}", e);
                        }
                    });
                if let Err(e) = spawned {
                    warn!("Failed to post permission outcome for {}: {}", device, e);
                }
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Session queue closed, dropping permission outcome for {}", device);
            }
        }
    }
}

impl PermissionBroker for PolicyBroker {
    fn has_permission(&self, _device: &DeviceDescriptor) -> bool {
        self.mode == PermissionMode::Grant
    }

    fn request_access(&mut self, device: &DeviceDescriptor) {
        match self.mode {
            PermissionMode::Prompt => {
                info!("Asking for permission to open {}", device);
                if let Err(e) = notify_ui(
                    &self.ui_tx,
                    UiEvent::PermissionRequested {
                        device: device.clone(),
                    },
                ) {
                    warn!("Failed to ask for permission: {}", e);
                }
            }
            PermissionMode::Grant => {
                debug!("Auto-granting access to {}", device);
                self.post_outcome(device, true);
            }
            PermissionMode::Deny => {
                debug!("Auto-denying access to {}", device);
                self.post_outcome(device, false);
            }
        }
    }
}
