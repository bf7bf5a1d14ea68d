//! Session error types
//!
//! Open-negotiation errors end the current attempt and show up as a state change.
//! Polling errors are absorbed by the reader; only `SessionTornDown` stops it.

use common::{DeviceLocation, EndpointDirection, TransferKind};
use thiserror::Error;

/// Why a device's interface/endpoint layout was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyMismatch {
    #[error("expected exactly one interface, found {0}")]
    InterfaceCount(usize),

    #[error("expected exactly one endpoint on interface {interface}, found {count}")]
    EndpointCount { interface: u8, count: usize },

    #[error("endpoint {address:#04x} is {kind:?}, expected Interrupt")]
    NotInterrupt { address: u8, kind: TransferKind },

    #[error("endpoint {address:#04x} is {direction:?}, expected In")]
    NotIn {
        address: u8,
        direction: EndpointDirection,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Device present but shaped differently than expected; no retry
    #[error("device topology mismatch: {0}")]
    TopologyMismatch(#[from] TopologyMismatch),

    /// User declined access; retry only via rescan
    #[error("permission denied for device at {0}")]
    PermissionDenied(DeviceLocation),

    /// Handle or interface claim could not be obtained
    #[error("failed to open device: {0}")]
    OpenFailure(#[source] rusb::Error),

    /// The reader thread could not be started
    #[error("failed to spawn reader thread: {0}")]
    ReaderSpawn(#[source] std::io::Error),

    /// A previous reader did not stop within the grace period
    #[error("previous reader for session {0} is still running")]
    ReaderStillRunning(common::SessionId),

    /// A single poll iteration failed; the loop keeps going
    #[error("transient read error: {0}")]
    TransientRead(#[source] rusb::Error),

    /// The device or link went away; the reader stops
    #[error("session torn down")]
    SessionTornDown,
}

impl SessionError {
    /// Whether the polling loop has to stop on this error
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionError::SessionTornDown)
    }
}

/// Classify a read error from the endpoint
///
/// Device removal ends the session; everything else (stalls, overflows, I/O
/// glitches) is expected now and then and only costs one iteration.
pub fn classify_read_error(err: rusb::Error) -> SessionError {
    match err {
        rusb::Error::NoDevice | rusb::Error::NotFound => SessionError::SessionTornDown,
        other => SessionError::TransientRead(other),
    }
}
