//! Async channel bridge between the UI/platform side and the session thread
//!
//! Two queues cross the boundary:
//! - `SessionEvent`s flow into the session manager, which processes them one at a
//!   time in arrival order. Hotplug callbacks, permission brokers, user commands and
//!   the polling reader all post here.
//! - `UiEvent`s flow out to the UI collaborator. Nothing on the session or reader
//!   threads ever calls into UI code directly.

use crate::usb_types::{DeviceDescriptor, DeviceLocation, SessionId};
use async_channel::{Receiver, Sender, TrySendError, bounded};

/// Capacity of both queues
const CHANNEL_CAPACITY: usize = 256;

/// Events consumed by the session manager
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A device was plugged in
    Attached {
        /// Descriptor snapshot taken on arrival
        device: DeviceDescriptor,
    },

    /// A device was unplugged
    Detached {
        /// Where the device used to be
        location: DeviceLocation,
    },

    /// Outcome of a permission request
    PermissionResult {
        /// Device the request was issued for
        device: DeviceDescriptor,
        /// Whether the user granted access
        granted: bool,
    },

    /// Tear down the current session (user command)
    Reset,

    /// Enumerate attached devices and connect if the target is present
    Rescan,

    /// The polling reader stopped on its own (device gone)
    ReaderLost {
        /// Session the reader belonged to
        session: SessionId,
    },

    /// Tear down and stop processing events
    Shutdown,
}

/// Notifications for the UI collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// A session was opened and the reader is running
    Connected { device: DeviceDescriptor },

    /// No session is open anymore (or an open attempt failed)
    Disconnected,

    /// The user declined access to the device
    PermissionDenied { device: DeviceDescriptor },

    /// The user has to decide whether the device may be opened
    PermissionRequested { device: DeviceDescriptor },

    /// A decoded packet to append to the display
    DataAppended { text: String },
}

impl UiEvent {
    /// Route the event to the matching handler callback
    pub fn dispatch<H: UiHandler + ?Sized>(self, handler: &mut H) {
        match self {
            UiEvent::Connected { device } => handler.on_connected(&device),
            UiEvent::Disconnected => handler.on_disconnected(),
            UiEvent::PermissionDenied { device } => handler.on_permission_denied(&device),
            UiEvent::PermissionRequested { device } => handler.on_permission_requested(&device),
            UiEvent::DataAppended { text } => handler.on_data_appended(&text),
        }
    }
}

/// Callbacks implemented by the UI collaborator
///
/// Always invoked on the UI side, after the event has crossed the channel.
pub trait UiHandler {
    fn on_connected(&mut self, device: &DeviceDescriptor);
    fn on_disconnected(&mut self);
    fn on_permission_denied(&mut self, device: &DeviceDescriptor);
    fn on_data_appended(&mut self, text: &str);

    /// Only used by brokers that ask the user; ignored by default
    fn on_permission_requested(&mut self, _device: &DeviceDescriptor) {}
}

/// Handle for the UI/platform side (async)
#[derive(Clone)]
pub struct SessionBridge {
    event_tx: Sender<SessionEvent>,
    ui_rx: Receiver<UiEvent>,
}

impl SessionBridge {
    /// Send an event to the session thread
    pub async fn send_event(&self, event: SessionEvent) -> crate::Result<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next UI notification
    pub async fn recv_ui_event(&self) -> crate::Result<UiEvent> {
        self.ui_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive a UI notification without waiting
    pub fn try_recv_ui_event(&self) -> Option<UiEvent> {
        self.ui_rx.try_recv().ok()
    }

    /// Sender for producers living on plain threads (hotplug callbacks)
    pub fn event_sender(&self) -> Sender<SessionEvent> {
        self.event_tx.clone()
    }
}

/// Handle for the session thread (blocking)
pub struct SessionWorker {
    pub(crate) event_rx: Receiver<SessionEvent>,
    /// Event sender, handed to readers and brokers that post back into the queue
    pub event_tx: Sender<SessionEvent>,
    /// UI notification sender
    pub ui_tx: Sender<UiEvent>,
}

impl SessionWorker {
    /// Receive the next event (blocking)
    pub fn recv_event(&self) -> crate::Result<SessionEvent> {
        self.event_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive an event without blocking
    pub fn try_recv_event(&self) -> Option<SessionEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Queue a UI notification
    pub fn notify(&self, event: UiEvent) -> crate::Result<()> {
        notify_ui(&self.ui_tx, event)
    }
}

/// Queue a UI notification without blocking the caller
///
/// A full queue drops the notification instead of stalling the session thread.
/// Card data does not go through here: the reader blocks until the UI has room.
pub fn notify_ui(ui_tx: &Sender<UiEvent>, event: UiEvent) -> crate::Result<()> {
    match ui_tx.try_send(event) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(event)) => Err(crate::Error::Channel(format!(
            "UI queue full, dropped {:?}",
            event
        ))),
        Err(TrySendError::Closed(_)) => Err(crate::Error::Channel("UI queue closed".into())),
    }
}

/// Create the channel bridge between the UI side and the session thread
///
/// Returns (SessionBridge for the UI/platform, SessionWorker for the session thread)
pub fn create_session_bridge() -> (SessionBridge, SessionWorker) {
    let (event_tx, event_rx) = bounded(CHANNEL_CAPACITY);
    let (ui_tx, ui_rx) = bounded(CHANNEL_CAPACITY);

    (
        SessionBridge {
            event_tx: event_tx.clone(),
            ui_rx,
        },
        SessionWorker {
            event_rx,
            event_tx,
            ui_tx,
        },
    )
}
