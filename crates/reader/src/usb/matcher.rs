//! Device matching and topology validation
//!
//! Pure functions over descriptor snapshots: no I/O, no side effects.

use crate::error::TopologyMismatch;
use common::{DeviceDescriptor, EndpointDirection, EndpointHandle, TransferKind};

/// The (VID, PID) pair the reader looks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTarget {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceTarget {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
        }
    }

    /// Whether the descriptor carries exactly this VID/PID
    pub fn matches(&self, device: &DeviceDescriptor) -> bool {
        device.vendor_id == self.vendor_id && device.product_id == self.product_id
    }
}

impl std::fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor_id, self.product_id)
    }
}

/// First device in enumeration order with the target VID/PID
pub fn find_match<'a>(
    devices: &'a [DeviceDescriptor],
    target: DeviceTarget,
) -> Option<&'a DeviceDescriptor> {
    devices.iter().find(|device| target.matches(device))
}

/// Check the device exposes exactly one interface with exactly one interrupt IN endpoint
pub fn validate_topology(device: &DeviceDescriptor) -> Result<EndpointHandle, TopologyMismatch> {
    let [interface] = device.interfaces.as_slice() else {
        return Err(TopologyMismatch::InterfaceCount(device.interface_count()));
    };

    let [endpoint] = interface.endpoints.as_slice() else {
        return Err(TopologyMismatch::EndpointCount {
            interface: interface.number,
            count: interface.endpoints.len(),
        });
    };

    if endpoint.transfer_kind != TransferKind::Interrupt {
        return Err(TopologyMismatch::NotInterrupt {
            address: endpoint.address,
            kind: endpoint.transfer_kind,
        });
    }

    if endpoint.direction != EndpointDirection::In {
        return Err(TopologyMismatch::NotIn {
            address: endpoint.address,
            direction: endpoint.direction,
        });
    }

    Ok(EndpointHandle {
        interface: interface.number,
        address: endpoint.address,
        max_packet_size: endpoint.max_packet_size,
    })
}

/// Match then validate
///
/// `Ok(None)` when no device carries the target IDs, `Err` when the first
/// matching device has the wrong shape.
pub fn select(
    devices: &[DeviceDescriptor],
    target: DeviceTarget,
) -> Result<Option<(DeviceDescriptor, EndpointHandle)>, TopologyMismatch> {
    match find_match(devices, target) {
        Some(device) => {
            let endpoint = validate_topology(device)?;
            Ok(Some((device.clone(), endpoint)))
        }
        None => Ok(None),
    }
}
