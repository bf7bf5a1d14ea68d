//! USB subsystem
//!
//! Device discovery, topology checks, the libusb host backend, hot-plug
//! detection and the interrupt polling reader.
//!
//! Blocking USB work never runs on the UI task: the reader polls on its own
//! thread and hot-plug events are pumped by a dedicated `usb-events` thread.

pub mod device;
pub mod host;
pub mod hotplug;
pub mod matcher;
pub mod poller;

pub use device::RusbHost;
pub use host::{DeviceLink, UsbHost};
pub use hotplug::HotplugWatcher;
pub use matcher::DeviceTarget;
pub use poller::{PollSettings, PollingReader, decode_packet};
