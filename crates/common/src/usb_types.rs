//! USB type abstractions shared by the reader and its tests
//!
//! Descriptors here are immutable snapshots taken at enumeration time. They carry
//! just enough of the USB descriptor tree to match a device by VID/PID and check
//! its interface/endpoint topology.

use std::fmt;

/// Physical location of a device on the host (bus number, device address)
///
/// Used as the device identity: two descriptors with the same location refer to
/// the same attachment of the same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceLocation {
    pub bus: u8,
    pub address: u8,
}

impl DeviceLocation {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for DeviceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus {:03} device {:03}", self.bus, self.address)
    }
}

/// Endpoint data direction, from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointDirection {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Endpoint transfer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Snapshot of a single endpoint descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Endpoint address including the direction bit (e.g. 0x81)
    pub address: u8,
    pub direction: EndpointDirection,
    pub transfer_kind: TransferKind,
    pub max_packet_size: u16,
}

/// Snapshot of an interface (first alternate setting) and its endpoints
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Immutable snapshot of an attached device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    pub location: DeviceLocation,
    /// Interfaces of the active configuration
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl DeviceDescriptor {
    /// Number of interfaces in the active configuration
    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    /// `vvvv:pppp` identifier, as printed by lsusb
    pub fn id_string(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id_string(), self.location)
    }
}

/// The validated interrupt-IN endpoint a session reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointHandle {
    /// Interface that has to be claimed to use the endpoint
    pub interface: u8,
    /// Endpoint address (direction bit set)
    pub address: u8,
    pub max_packet_size: u16,
}

/// Identifier of one Connected session, unique per session manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Map a rusb endpoint direction to ours
pub fn map_direction(direction: rusb::Direction) -> EndpointDirection {
    match direction {
        rusb::Direction::In => EndpointDirection::In,
        rusb::Direction::Out => EndpointDirection::Out,
    }
}

/// Map a rusb transfer type to ours
pub fn map_transfer_kind(kind: rusb::TransferType) -> TransferKind {
    match kind {
        rusb::TransferType::Control => TransferKind::Control,
        rusb::TransferType::Isochronous => TransferKind::Isochronous,
        rusb::TransferType::Bulk => TransferKind::Bulk,
        rusb::TransferType::Interrupt => TransferKind::Interrupt,
    }
}
