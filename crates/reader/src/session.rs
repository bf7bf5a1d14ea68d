//! Session state machine
//!
//! The session manager owns the only `ConnectionState` and is the only code that
//! changes it. It runs on its own thread and consumes `SessionEvent`s one at a
//! time, so a detach racing a permission grant is simply two events in a row.
//!
//! ```text
//!                 attach (needs permission)
//!  Disconnected ─────────────────────────────► AwaitingPermission
//!       ▲  │                                       │   │
//!       │  │ attach/rescan (known granted)  denied │   │ granted
//!       │  ▼                                       ▼   ▼
//!       │ open ◄──────────────────────────────── Disconnected / open
//!       │  │ ok
//!       │  ▼
//!       └─ Connected ── detach / reset / reader lost / shutdown
//! ```

use crate::error::SessionError;
use crate::permission::PermissionBroker;
use crate::usb::host::{DeviceLink, UsbHost};
use crate::usb::matcher::{self, DeviceTarget};
use crate::usb::poller::{PollSettings, PollingReader, spawn_reader};
use async_channel::Sender;
use common::{
    DeviceDescriptor, DeviceLocation, EndpointHandle, SessionEvent, SessionId, SessionWorker,
    UiEvent, notify_ui,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Default time to wait for a reader to exit after teardown
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Session manager settings
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub target: DeviceTarget,
    pub poll: PollSettings,
    pub shutdown_grace: Duration,
}

impl SessionSettings {
    pub fn new(target: DeviceTarget) -> Self {
        Self {
            target,
            poll: PollSettings::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// An open session: claimed link plus its running reader
pub struct Session {
    id: SessionId,
    device: DeviceDescriptor,
    endpoint: EndpointHandle,
    link: Arc<dyn DeviceLink>,
    running: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn endpoint(&self) -> EndpointHandle {
        self.endpoint
    }
}

/// Connection state, owned by the session manager
pub enum ConnectionState {
    Disconnected,
    AwaitingPermission {
        device: DeviceDescriptor,
        endpoint: EndpointHandle,
    },
    Connected(Session),
}

/// Read-only view of `ConnectionState`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    AwaitingPermission,
    Connected,
}

/// Owns the connection state machine
pub struct SessionManager<H: UsbHost, B: PermissionBroker> {
    host: H,
    broker: B,
    settings: SessionSettings,
    state: ConnectionState,
    /// Devices the user granted access to, until they detach
    granted: HashSet<DeviceLocation>,
    next_session: u64,
    /// Reader that outlived its grace period; must exit before the next spawn
    lingering: Option<(SessionId, JoinHandle<()>)>,
    ui_tx: Sender<UiEvent>,
    event_tx: Sender<SessionEvent>,
}

impl<H: UsbHost, B: PermissionBroker> SessionManager<H, B> {
    pub fn new(
        host: H,
        broker: B,
        settings: SessionSettings,
        ui_tx: Sender<UiEvent>,
        event_tx: Sender<SessionEvent>,
    ) -> Self {
        Self {
            host,
            broker,
            settings,
            state: ConnectionState::Disconnected,
            granted: HashSet::new(),
            next_session: 1,
            lingering: None,
            ui_tx,
            event_tx,
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self.state {
            ConnectionState::Disconnected => SessionStatus::Disconnected,
            ConnectionState::AwaitingPermission { .. } => SessionStatus::AwaitingPermission,
            ConnectionState::Connected(_) => SessionStatus::Connected,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Device of the pending request or open session
    pub fn current_device(&self) -> Option<&DeviceDescriptor> {
        match &self.state {
            ConnectionState::Disconnected => None,
            ConnectionState::AwaitingPermission { device, .. } => Some(device),
            ConnectionState::Connected(session) => Some(&session.device),
        }
    }

    /// Running flag of the open session's reader
    pub fn running_flag(&self) -> Option<Arc<AtomicBool>> {
        match &self.state {
            ConnectionState::Connected(session) => Some(session.running.clone()),
            _ => None,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Process one event; returns false once the manager has shut down
    pub fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Attached { device } => self.device_attached(device),
            SessionEvent::Detached { location } => self.device_detached(location),
            SessionEvent::PermissionResult { device, granted } => {
                self.permission_result(device, granted)
            }
            SessionEvent::Reset => self.reset(),
            SessionEvent::Rescan => self.rescan(),
            SessionEvent::ReaderLost { session } => self.reader_lost(session),
            SessionEvent::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    /// A device was plugged in
    pub fn device_attached(&mut self, device: DeviceDescriptor) {
        if !self.settings.target.matches(&device) {
            debug!("Ignoring attached device {}", device);
            return;
        }

        match &self.state {
            ConnectionState::Connected(session) => {
                debug!(
                    "Already connected to {}, ignoring {}",
                    session.device, device
                );
                return;
            }
            ConnectionState::AwaitingPermission { device: pending, .. }
                if pending.location == device.location =>
            {
                debug!("Permission already requested for {}", device);
                return;
            }
            _ => {}
        }

        match matcher::validate_topology(&device) {
            Ok(endpoint) => self.begin_open(device, endpoint),
            Err(e) => warn!("Not opening {}: {}", device, SessionError::from(e)),
        }
    }

    /// A device was unplugged
    pub fn device_detached(&mut self, location: DeviceLocation) {
        self.granted.remove(&location);

        let affected = self
            .current_device()
            .is_some_and(|device| device.location == location);
        if affected {
            info!("Device at {} detached", location);
            self.teardown();
        } else {
            debug!("Ignoring detach at {}", location);
        }
    }

    /// Outcome of a permission request
    pub fn permission_result(&mut self, device: DeviceDescriptor, granted: bool) {
        let pending = match &self.state {
            ConnectionState::AwaitingPermission {
                device: pending, ..
            } => pending.location == device.location,
            _ => false,
        };
        if !pending {
            debug!(
                "Ignoring stale permission result for {} (granted={})",
                device, granted
            );
            return;
        }

        let ConnectionState::AwaitingPermission { device, endpoint } =
            std::mem::replace(&mut self.state, ConnectionState::Disconnected)
        else {
            return;
        };

        if granted {
            info!("Permission granted for {}", device);
            self.granted.insert(device.location);
            self.open(device, endpoint);
        } else {
            warn!("{}", SessionError::PermissionDenied(device.location));
            self.notify(UiEvent::PermissionDenied { device });
        }
    }

    /// Tear down the current session or pending request
    pub fn reset(&mut self) {
        if !self.teardown() {
            debug!("Reset while disconnected, nothing to do");
        }
    }

    /// Look for the target among attached devices and connect to it
    pub fn rescan(&mut self) {
        if let ConnectionState::Connected(session) = &self.state {
            debug!("Rescan ignored, session {} is open", session.id);
            return;
        }

        let devices = match self.host.enumerate() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Failed to enumerate devices: {}", e);
                return;
            }
        };

        match matcher::select(&devices, self.settings.target) {
            Ok(Some((device, endpoint))) => {
                if let ConnectionState::AwaitingPermission { device: pending, .. } = &self.state
                    && pending.location == device.location
                {
                    debug!("Permission already requested for {}", device);
                    return;
                }
                info!("Found {}", device);
                self.begin_open(device, endpoint);
            }
            Ok(None) => info!("No {} device attached", self.settings.target),
            Err(e) => warn!(
                "Found {} but not opening it: {}",
                self.settings.target,
                SessionError::from(e)
            ),
        }
    }

    /// The reader stopped on its own
    pub fn reader_lost(&mut self, session: SessionId) {
        match &self.state {
            ConnectionState::Connected(current) if current.id == session => {
                warn!("Reader for session {} lost its device", session);
                self.teardown();
            }
            _ => debug!("Ignoring reader loss for old session {}", session),
        }
    }

    /// Tear down and wait for any leftover reader
    pub fn shutdown(&mut self) {
        self.teardown();
        if let Some((id, handle)) = self.lingering.take()
            && wait_for_stop(handle, self.settings.shutdown_grace).is_err()
        {
            warn!("Reader for session {} still running at shutdown", id);
        }
        info!("Session manager shut down");
    }

    /// Open directly when access is known, otherwise ask for it
    fn begin_open(&mut self, device: DeviceDescriptor, endpoint: EndpointHandle) {
        if self.granted.contains(&device.location) || self.broker.has_permission(&device) {
            self.state = ConnectionState::Disconnected;
            self.open(device, endpoint);
            return;
        }

        info!("Awaiting permission for {}", device);
        self.broker.request_access(&device);
        self.state = ConnectionState::AwaitingPermission { device, endpoint };
    }

    /// Open the device, claim the interface and start the reader
    fn open(&mut self, device: DeviceDescriptor, endpoint: EndpointHandle) {
        debug_assert!(matches!(self.state, ConnectionState::Disconnected));

        match self.try_open(&device, endpoint) {
            Ok(session) => {
                info!(
                    "Session {} connected to {} (endpoint {:#04x}, {} byte packets)",
                    session.id, device, endpoint.address, endpoint.max_packet_size
                );
                self.state = ConnectionState::Connected(session);
                self.notify(UiEvent::Connected { device });
            }
            Err(e) => {
                warn!("Could not open {}: {}", device, e);
                self.state = ConnectionState::Disconnected;
                self.notify(UiEvent::Disconnected);
            }
        }
    }

    fn try_open(
        &mut self,
        device: &DeviceDescriptor,
        endpoint: EndpointHandle,
    ) -> Result<Session, SessionError> {
        if let Some((id, handle)) = self.lingering.take()
            && let Err(handle) = wait_for_stop(handle, self.settings.shutdown_grace)
        {
            self.lingering = Some((id, handle));
            return Err(SessionError::ReaderStillRunning(id));
        }

        let link = self
            .host
            .open(device, &endpoint)
            .map_err(SessionError::OpenFailure)?;

        let id = SessionId(self.next_session);
        self.next_session += 1;

        let running = Arc::new(AtomicBool::new(true));
        let reader = PollingReader::new(
            id,
            link.clone(),
            endpoint,
            running.clone(),
            self.settings.poll,
            self.ui_tx.clone(),
            self.event_tx.clone(),
        );

        let reader = match spawn_reader(reader) {
            Ok(handle) => handle,
            Err(e) => {
                running.store(false, Ordering::Release);
                link.release();
                return Err(SessionError::ReaderSpawn(e));
            }
        };

        Ok(Session {
            id,
            device: device.clone(),
            endpoint,
            link,
            running,
            reader,
        })
    }

    /// Move to Disconnected, releasing whatever the current state holds
    ///
    /// Returns false when already disconnected (no notification is sent).
    fn teardown(&mut self) -> bool {
        match std::mem::replace(&mut self.state, ConnectionState::Disconnected) {
            ConnectionState::Disconnected => false,
            ConnectionState::AwaitingPermission { device, .. } => {
                info!("Dropped pending permission request for {}", device);
                self.notify(UiEvent::Disconnected);
                true
            }
            ConnectionState::Connected(session) => {
                let Session {
                    id,
                    device,
                    link,
                    running,
                    reader,
                    ..
                } = session;

                running.store(false, Ordering::Release);
                link.release();

                match wait_for_stop(reader, self.settings.shutdown_grace) {
                    Ok(()) => debug!("Reader for session {} joined", id),
                    Err(handle) => {
                        warn!(
                            "Reader for session {} did not stop within {:?}",
                            id, self.settings.shutdown_grace
                        );
                        self.lingering = Some((id, handle));
                    }
                }

                info!("Session {} on {}: {}", id, device, SessionError::SessionTornDown);
                self.notify(UiEvent::Disconnected);
                true
            }
        }
    }

    fn notify(&self, event: UiEvent) {
        if let Err(e) = notify_ui(&self.ui_tx, event) {
            warn!("Failed to notify UI: {}", e);
        }
    }
}

/// Wait for a reader thread to exit, at most `grace`
///
/// Hands the handle back if the thread is still running.
fn wait_for_stop(handle: JoinHandle<()>, grace: Duration) -> Result<(), JoinHandle<()>> {
    let deadline = Instant::now() + grace;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(handle);
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    if handle.join().is_err() {
        error!("Reader thread panicked");
    }
    Ok(())
}

/// Session manager thread
///
/// Drains the session queue until a Shutdown event arrives or every sender is gone.
pub struct SessionManagerThread<H: UsbHost, B: PermissionBroker> {
    manager: SessionManager<H, B>,
    worker: SessionWorker,
}

impl<H: UsbHost, B: PermissionBroker> SessionManagerThread<H, B> {
    pub fn new(manager: SessionManager<H, B>, worker: SessionWorker) -> Self {
        Self { manager, worker }
    }

    pub fn run(mut self) {
        info!("Session manager started");

        loop {
            let event = match self.worker.recv_event() {
                Ok(event) => event,
                Err(e) => {
                    debug!("Session queue closed: {}", e);
                    self.manager.shutdown();
                    break;
                }
            };

            debug!("Session event: {:?}", event);

            // A panic in one transition must not take the event loop down with it
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.manager.handle_event(event)
            }));

            match result {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => error!("Panic in session event handler: {:?}", e),
            }
        }

        info!("Session manager stopped");
    }
}

/// Spawn the session manager on its own thread
pub fn spawn_session_manager<H, B>(
    manager: SessionManager<H, B>,
    worker: SessionWorker,
) -> std::io::Result<JoinHandle<()>>
where
    H: UsbHost + 'static,
    B: PermissionBroker + 'static,
{
    std::thread::Builder::new()
        .name("session-manager".to_string())
        .spawn(move || SessionManagerThread::new(manager, worker).run())
}
