//! Transport seam between the protocol engine and a USB stack.
//!
//! The engine never talks to a USB library directly. Everything it needs
//! from the bus goes through [Transport]: configuration and interface
//! selection, control transfers, bus reset and disconnect detection.
//! [NusbTransport](crate::NusbTransport) implements it on top of `nusb`.

use std::time::Duration;

use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

/// Setup stage of a control transfer, minus direction and `wLength`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    /// Class request addressed to an interface, as used by every DFU request.
    pub fn class_interface(request: u8, value: u16, interface: u8) -> Self {
        ControlSetup {
            request_type: RequestType::Class,
            recipient: Recipient::Interface,
            request,
            value,
            index: interface as u16,
        }
    }

    /// Standard request addressed to the device (`GET_DESCRIPTOR` & co).
    pub fn standard_device(request: u8, value: u16, index: u16) -> Self {
        ControlSetup {
            request_type: RequestType::Standard,
            recipient: Recipient::Device,
            request,
            value,
            index,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("device disconnected")]
    Disconnected,
    #[error("request stalled")]
    Stall,
    #[error("timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// Blocking USB transport used by a [DfuSession](crate::DfuSession).
///
/// Calls are issued one at a time; implementations do not need to be
/// re-entrant.
pub trait Transport {
    fn select_configuration(
        &mut self,
        configuration: u8,
    ) -> Result<(), TransportError>;

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    fn select_alternate(
        &mut self,
        interface: u8,
        alternate: u8,
    ) -> Result<(), TransportError>;

    /// Device-to-host control transfer of at most `length` bytes.
    fn control_in(
        &mut self,
        setup: ControlSetup,
        length: u16,
    ) -> Result<Vec<u8>, TransportError>;

    /// Host-to-device control transfer. Returns the number of bytes written.
    fn control_out(
        &mut self,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<usize, TransportError>;

    /// Issue a USB bus reset.
    fn reset(&mut self) -> Result<(), TransportError>;

    /// Release the device.
    fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Block until the device drops off the bus, or fail with
    /// [TransportError::Timeout].
    fn wait_disconnected(
        &mut self,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// Wait between two status polls.
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn select_configuration(
        &mut self,
        configuration: u8,
    ) -> Result<(), TransportError> {
        (**self).select_configuration(configuration)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        (**self).claim_interface(interface)
    }

    fn select_alternate(
        &mut self,
        interface: u8,
        alternate: u8,
    ) -> Result<(), TransportError> {
        (**self).select_alternate(interface, alternate)
    }

    fn control_in(
        &mut self,
        setup: ControlSetup,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        (**self).control_in(setup, length)
    }

    fn control_out(
        &mut self,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        (**self).control_out(setup, data)
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        (**self).reset()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }

    fn wait_disconnected(
        &mut self,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        (**self).wait_disconnected(timeout)
    }

    fn sleep(&mut self, duration: Duration) {
        (**self).sleep(duration)
    }
}
