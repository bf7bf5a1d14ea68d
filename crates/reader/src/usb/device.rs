//! libusb-backed host access
//!
//! Wraps rusb: descriptor snapshots for enumeration and hotplug, and an opened
//! device with its single interface claimed for the polling reader.

use crate::usb::host::{DeviceLink, UsbHost};
use common::usb_types::{map_direction, map_transfer_kind};
use common::{
    DeviceDescriptor, DeviceLocation, EndpointDescriptor, EndpointHandle, InterfaceDescriptor,
};
use rusb::{ConfigDescriptor, Context, Device, DeviceHandle, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Take a descriptor snapshot of a rusb device
///
/// Reads the device descriptor and the active configuration (falling back to the
/// first configuration for unconfigured devices). Only the first alternate
/// setting of each interface is recorded.
pub fn snapshot_device<T: UsbContext>(device: &Device<T>) -> Result<DeviceDescriptor, rusb::Error> {
    let descriptor = device.device_descriptor()?;
    let config = device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))?;

    Ok(DeviceDescriptor {
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        location: location_of(device),
        interfaces: snapshot_interfaces(&config),
    })
}

/// Bus location of a rusb device
pub fn location_of<T: UsbContext>(device: &Device<T>) -> DeviceLocation {
    DeviceLocation::new(device.bus_number(), device.address())
}

fn snapshot_interfaces(config: &ConfigDescriptor) -> Vec<InterfaceDescriptor> {
    config
        .interfaces()
        .map(|interface| {
            let endpoints = interface
                .descriptors()
                .next()
                .map(|alt| {
                    alt.endpoint_descriptors()
                        .map(|ep| EndpointDescriptor {
                            address: ep.address(),
                            direction: map_direction(ep.direction()),
                            transfer_kind: map_transfer_kind(ep.transfer_type()),
                            max_packet_size: ep.max_packet_size(),
                        })
                        .collect()
                })
                .unwrap_or_default();

            InterfaceDescriptor {
                number: interface.number(),
                endpoints,
            }
        })
        .collect()
}

/// USB host backed by a libusb context
pub struct RusbHost {
    context: Context,
}

impl RusbHost {
    /// Create a new libusb context
    pub fn new() -> Result<Self, rusb::Error> {
        Ok(Self {
            context: Context::new()?,
        })
    }

    /// Get USB context
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Find the live rusb device behind a snapshot
    fn find_device(&self, wanted: &DeviceDescriptor) -> Result<Device<Context>, rusb::Error> {
        for device in self.context.devices()?.iter() {
            if location_of(&device) != wanted.location {
                continue;
            }
            // Addresses get reused after unplug; make sure it is still the same product
            let descriptor = device.device_descriptor()?;
            if descriptor.vendor_id() == wanted.vendor_id
                && descriptor.product_id() == wanted.product_id
            {
                return Ok(device);
            }
        }
        Err(rusb::Error::NoDevice)
    }
}

impl UsbHost for RusbHost {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, rusb::Error> {
        let devices = self.context.devices()?;
        let mut snapshots = Vec::with_capacity(devices.len());

        for device in devices.iter() {
            match snapshot_device(&device) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(
                    "Failed to read descriptors during enumeration: bus={}, addr={}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }

        debug!("Enumerated {} devices", snapshots.len());
        Ok(snapshots)
    }

    fn open(
        &self,
        device: &DeviceDescriptor,
        endpoint: &EndpointHandle,
    ) -> Result<Arc<dyn DeviceLink>, rusb::Error> {
        let usb_device = self.find_device(device)?;
        let link = RusbLink::open(&usb_device, endpoint.interface)?;
        Ok(Arc::new(link))
    }
}

/// An opened device with one claimed interface
pub struct RusbLink {
    handle: DeviceHandle<Context>,
    interface: u8,
    /// Whether we took the interface away from a kernel driver
    kernel_detached: bool,
    released: AtomicBool,
}

impl RusbLink {
    /// Open the device and claim `interface`
    ///
    /// Detaches an active kernel driver first so the claim cannot be refused
    /// by it; the driver is reattached on release.
    pub fn open(device: &Device<Context>, interface: u8) -> Result<Self, rusb::Error> {
        let handle = device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            e
        })?;

        let location = location_of(device);
        debug!("Opened device at {}", location);

        let kernel_detached = match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on {}",
                    interface, location
                );
                match handle.detach_kernel_driver(interface) {
                    Ok(()) => true,
                    Err(e) => {
                        // The claim below will most likely fail and report it
                        warn!(
                            "Failed to detach kernel driver from interface {}: {}",
                            interface, e
                        );
                        false
                    }
                }
            }
            Ok(false) => {
                debug!("No kernel driver active on interface {}", interface);
                false
            }
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
                false
            }
        };

        if let Err(e) = handle.claim_interface(interface) {
            warn!("Failed to claim interface {}: {}", interface, e);
            if kernel_detached {
                let _ = handle.attach_kernel_driver(interface);
            }
            return Err(e);
        }

        debug!("Claimed interface {} on {}", interface, location);

        Ok(Self {
            handle,
            interface,
            kernel_detached,
            released: AtomicBool::new(false),
        })
    }
}

impl DeviceLink for RusbLink {
    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, rusb::Error> {
        if self.released.load(Ordering::Acquire) {
            return Err(rusb::Error::NoDevice);
        }
        self.handle.read_interrupt(endpoint, buf, timeout)
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.handle.release_interface(self.interface) {
            warn!("Failed to release interface {}: {}", self.interface, e);
        }

        if self.kernel_detached {
            match self.handle.attach_kernel_driver(self.interface) {
                Ok(()) => debug!("Reattached kernel driver to interface {}", self.interface),
                Err(e) => debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    self.interface, e
                ),
            }
        }

        debug!("Released interface {}", self.interface);
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for RusbLink {
    fn drop(&mut self) {
        self.release();
    }
}
