//! In-memory USB host and permission broker for session tests

#![allow(dead_code)]

use async_channel::{Receiver, unbounded};
use common::test_utils::wait_until;
use common::{DeviceDescriptor, DeviceLocation, EndpointHandle, SessionEvent, UiEvent};
use reader::permission::PermissionBroker;
use reader::session::{SessionManager, SessionSettings};
use reader::usb::matcher::DeviceTarget;
use reader::usb::poller::PollSettings;
use reader::usb::{DeviceLink, UsbHost};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use common::test_utils::{CARD_READER_PID, CARD_READER_VID};

/// How long tests wait for something to happen on another thread
pub const WAIT: Duration = Duration::from_secs(2);

/// Settings with short timings so tests stay quick
pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        target: DeviceTarget::new(CARD_READER_VID, CARD_READER_PID),
        poll: PollSettings {
            interval: Duration::from_millis(1),
            read_timeout: Duration::from_millis(5),
        },
        shutdown_grace: Duration::from_millis(500),
    }
}

/// Device link fed by the test
#[derive(Default)]
pub struct MockLink {
    packets: Mutex<VecDeque<Vec<u8>>>,
    released: AtomicBool,
    vanished: AtomicBool,
    reads: AtomicUsize,
    /// Every read blocks this long first, ignoring release
    stall: Option<Duration>,
}

impl MockLink {
    /// Queue one packet for the reader
    pub fn push_packet(&self, packet: &[u8]) {
        self.packets.lock().unwrap().push_back(packet.to_vec());
    }

    /// Make every further read fail as if the device was unplugged
    pub fn vanish(&self) {
        self.vanished.store(true, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn pending_packets(&self) -> usize {
        self.packets.lock().unwrap().len()
    }
}

impl DeviceLink for MockLink {
    fn read_interrupt(
        &self,
        _endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        self.reads.fetch_add(1, Ordering::SeqCst);

        if let Some(stall) = self.stall {
            std::thread::sleep(stall);
        }

        if self.released.load(Ordering::SeqCst) || self.vanished.load(Ordering::SeqCst) {
            return Err(rusb::Error::NoDevice);
        }

        let packet = self.packets.lock().unwrap().pop_front();
        match packet {
            Some(packet) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            None => {
                std::thread::sleep(timeout.min(Duration::from_millis(2)));
                Err(rusb::Error::Timeout)
            }
        }
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct HostState {
    devices: Vec<DeviceDescriptor>,
    open_error: Option<rusb::Error>,
    opens: Vec<(DeviceLocation, EndpointHandle)>,
    links: Vec<Arc<MockLink>>,
    read_stall: Option<Duration>,
}

/// USB host whose bus content is set by the test
///
/// Clones share state, so the test keeps one while the manager owns another.
#[derive(Clone, Default)]
pub struct MockHost {
    state: Arc<Mutex<HostState>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_devices(&self, devices: Vec<DeviceDescriptor>) {
        self.state.lock().unwrap().devices = devices;
    }

    /// Make the next opens fail with `error`
    pub fn fail_open(&self, error: rusb::Error) {
        self.state.lock().unwrap().open_error = Some(error);
    }

    /// Links opened from now on block every read for `stall`
    pub fn set_read_stall(&self, stall: Option<Duration>) {
        self.state.lock().unwrap().read_stall = stall;
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opens.len()
    }

    pub fn opened(&self) -> Vec<(DeviceLocation, EndpointHandle)> {
        self.state.lock().unwrap().opens.clone()
    }

    /// Every link handed out so far, oldest first
    pub fn links(&self) -> Vec<Arc<MockLink>> {
        self.state.lock().unwrap().links.clone()
    }

    /// Link handed out by the most recent successful open
    pub fn last_link(&self) -> Arc<MockLink> {
        self.state
            .lock()
            .unwrap()
            .links
            .last()
            .cloned()
            .expect("no device was opened")
    }
}

impl UsbHost for MockHost {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, rusb::Error> {
        Ok(self.state.lock().unwrap().devices.clone())
    }

    fn open(
        &self,
        device: &DeviceDescriptor,
        endpoint: &EndpointHandle,
    ) -> Result<Arc<dyn DeviceLink>, rusb::Error> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.open_error {
            return Err(error);
        }

        state.opens.push((device.location, *endpoint));
        let link = Arc::new(MockLink {
            stall: state.read_stall,
            ..MockLink::default()
        });
        state.links.push(link.clone());
        Ok(link)
    }
}

/// Broker that records requests and leaves the answer to the test
#[derive(Clone, Default)]
pub struct ScriptedBroker {
    pre_granted: bool,
    requests: Arc<Mutex<Vec<DeviceDescriptor>>>,
}

impl ScriptedBroker {
    pub fn new(pre_granted: bool) -> Self {
        Self {
            pre_granted,
            requests: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<DeviceDescriptor> {
        self.requests.lock().unwrap().clone()
    }
}

impl PermissionBroker for ScriptedBroker {
    fn has_permission(&self, _device: &DeviceDescriptor) -> bool {
        self.pre_granted
    }

    fn request_access(&mut self, device: &DeviceDescriptor) {
        self.requests.lock().unwrap().push(device.clone());
    }
}

/// A session manager wired to mocks, plus the ends of its queues
pub struct Harness {
    pub manager: SessionManager<MockHost, ScriptedBroker>,
    pub host: MockHost,
    pub broker: ScriptedBroker,
    pub ui_rx: Receiver<UiEvent>,
    pub event_rx: Receiver<SessionEvent>,
}

impl Harness {
    pub fn new(pre_granted: bool) -> Self {
        Self::with_settings(pre_granted, fast_settings())
    }

    pub fn with_settings(pre_granted: bool, settings: SessionSettings) -> Self {
        let host = MockHost::new();
        let broker = ScriptedBroker::new(pre_granted);
        let (ui_tx, ui_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();

        let manager = SessionManager::new(
            host.clone(),
            broker.clone(),
            settings,
            ui_tx,
            event_tx,
        );

        Self {
            manager,
            host,
            broker,
            ui_rx,
            event_rx,
        }
    }

    /// Every UI event queued so far
    pub fn drain_ui(&self) -> Vec<UiEvent> {
        std::iter::from_fn(|| self.ui_rx.try_recv().ok()).collect()
    }

    /// Wait for the next UI event
    pub fn next_ui(&self) -> Option<UiEvent> {
        let mut event = None;
        wait_until(WAIT, || {
            event = self.ui_rx.try_recv().ok();
            event.is_some()
        });
        event
    }

    /// Wait for the next event the manager's helpers posted back into the queue
    pub fn next_event(&self) -> Option<SessionEvent> {
        let mut event = None;
        wait_until(WAIT, || {
            event = self.event_rx.try_recv().ok();
            event.is_some()
        });
        event
    }
}
