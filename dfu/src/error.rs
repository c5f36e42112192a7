use thiserror::Error;

use crate::state::{DfuState, DfuStatusCode};
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum DfuError {
    #[error("Malformed descriptor: {0}")]
    MalformedDescriptor(String),
    #[error("Invalid DfuSe memory layout: {0:?}")]
    InvalidMemoryLayout(String),
    #[error("Transfer error: {0}")]
    Transfer(TransportError),
    #[error("Short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: usize, actual: usize },
    #[error("DFU status error: {status} (state {state})")]
    DeviceError {
        status: DfuStatusCode,
        state: DfuState,
    },
    #[error("Address {address:#010x} is outside of the memory map")]
    AddressOutOfRange { address: u32 },
    #[error("Segment at {address:#010x} is not erasable")]
    SegmentNotErasable { address: u32 },
    #[error("Device disconnected")]
    DeviceLost,
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
    #[error("Invalid interface")]
    InvalidInterface,
    #[error("Not connected")]
    NotConnected,
    #[error("Timeout")]
    Timeout,
    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),
}

impl DfuError {
    /// Errors raised by the device or the control pipe in the middle of an
    /// operation. These leave the device in an unknown state and are
    /// followed by an abort-to-idle attempt.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            DfuError::Transfer(_)
                | DfuError::ShortTransfer { .. }
                | DfuError::DeviceError { .. }
                | DfuError::Timeout
        )
    }
}

impl From<TransportError> for DfuError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Disconnected => DfuError::DeviceLost,
            err => DfuError::Transfer(err),
        }
    }
}

pub(crate) fn malformed(msg: impl Into<String>) -> DfuError {
    DfuError::MalformedDescriptor(msg.into())
}
