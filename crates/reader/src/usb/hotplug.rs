//! Hot-plug detection
//!
//! A dedicated thread owns the libusb hot-plug registration and drives
//! `handle_events`, turning arrivals and departures into session events.

use crate::usb::device::{location_of, snapshot_device};
use async_channel::Sender;
use common::SessionEvent;
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long one `handle_events` call may block before the stop flag is checked
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Hot-plug callback handler
///
/// Converts libusb notifications into session events.
struct HotplugCallback {
    event_tx: Sender<SessionEvent>,
}

impl HotplugCallback {
    fn post(&self, event: SessionEvent) {
        if let Err(e) = self.event_tx.send_blocking(event) {
            error!("Failed to post hot-plug event: {}", e);
        }
    }
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );

        match snapshot_device(&device) {
            Ok(device) => self.post(SessionEvent::Attached { device }),
            Err(e) => warn!(
                "Could not read descriptors of arrived device at {}: {}",
                location_of(&device),
                e
            ),
        }
    }

    fn device_left(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );

        self.post(SessionEvent::Detached {
            location: location_of(&device),
        });
    }
}

/// Running hot-plug thread
pub struct HotplugWatcher {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl HotplugWatcher {
    /// Start watching, or `None` when libusb has no hot-plug support here
    pub fn spawn(
        context: Context,
        event_tx: Sender<SessionEvent>,
    ) -> std::io::Result<Option<Self>> {
        if !rusb::has_hotplug() {
            warn!("Hot-plug not supported on this platform, use rescan to connect");
            return Ok(None);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let handle = std::thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || run(context, event_tx, thread_stop))?;

        Ok(Some(Self { stop, handle }))
    }

    /// Stop the thread and wait for it
    pub fn stop(self) {
        self.stop.store(true, Ordering::Release);
        if self.handle.join().is_err() {
            error!("Hot-plug thread panicked");
        }
    }
}

fn run(context: Context, event_tx: Sender<SessionEvent>, stop: Arc<AtomicBool>) {
    let callback: Box<dyn Hotplug<Context>> = Box::new(HotplugCallback { event_tx });

    // We enumerate through rescan; only changes are interesting here
    let _registration = match HotplugBuilder::new()
        .enumerate(false)
        .register(&context, callback)
    {
        Ok(registration) => registration,
        Err(e) => {
            error!("Failed to register hot-plug callback: {}", e);
            return;
        }
    };

    info!("Hot-plug thread started");

    while !stop.load(Ordering::Acquire) {
        match context.handle_events(Some(EVENT_TIMEOUT)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                // Transient; back off instead of spinning
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_TIMEOUT);
            }
        }
    }

    info!("Hot-plug thread stopped");
}
