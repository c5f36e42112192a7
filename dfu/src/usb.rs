use std::time::{Duration, Instant};

use log::{debug, info};
use nusb::{
    self, MaybeFuture,
    transfer::{self, ControlIn, ControlOut, ControlType, TransferError},
};

use crate::DEFAULT_TIMEOUT;
use crate::descriptor::{DFU_CLASS, DFU_SUBCLASS};
use crate::error::DfuError;
use crate::transport::{
    ControlSetup, Recipient, RequestType, Transport, TransportError,
};

const DISCONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// [Transport] over a device opened with [`nusb`].
pub struct NusbTransport {
    info: nusb::DeviceInfo,
    device: nusb::Device,
    interface: Option<nusb::Interface>,
    timeout: Duration,
}

impl NusbTransport {
    pub fn open(info: nusb::DeviceInfo) -> Result<Self, DfuError> {
        let device = info.open().wait()?;
        Ok(NusbTransport {
            info,
            device,
            interface: None,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Timeout of each control transfer.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn device_info(&self) -> &nusb::DeviceInfo {
        &self.info
    }

    fn is_present(&self) -> Result<bool, TransportError> {
        let id = self.info.id();
        Ok(nusb::list_devices()
            .wait()
            .map_err(usb_error)?
            .any(|dev| dev.id() == id))
    }
}

fn control_type(request_type: RequestType) -> ControlType {
    match request_type {
        RequestType::Standard => ControlType::Standard,
        RequestType::Class => ControlType::Class,
        RequestType::Vendor => ControlType::Vendor,
    }
}

fn recipient(recipient: Recipient) -> transfer::Recipient {
    match recipient {
        Recipient::Device => transfer::Recipient::Device,
        Recipient::Interface => transfer::Recipient::Interface,
        Recipient::Endpoint => transfer::Recipient::Endpoint,
        Recipient::Other => transfer::Recipient::Other,
    }
}

fn usb_error(err: nusb::Error) -> TransportError {
    TransportError::Other(err.to_string())
}

impl From<TransferError> for TransportError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Stall => TransportError::Stall,
            TransferError::Disconnected => TransportError::Disconnected,
            TransferError::Cancelled => TransportError::Timeout,
            err => TransportError::Other(err.to_string()),
        }
    }
}

impl Transport for NusbTransport {
    fn select_configuration(
        &mut self,
        configuration: u8,
    ) -> Result<(), TransportError> {
        let active = self
            .device
            .active_configuration()
            .ok()
            .map(|config| config.configuration_value());
        if active == Some(configuration) {
            return Ok(());
        }
        debug!("selecting configuration {configuration}");
        self.device
            .set_configuration(configuration)
            .wait()
            .map_err(usb_error)
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        if self
            .interface
            .as_ref()
            .is_some_and(|intf| intf.interface_number() == interface)
        {
            return Ok(());
        }
        let claimed = self
            .device
            .claim_interface(interface)
            .wait()
            .map_err(usb_error)?;
        self.interface = Some(claimed);
        Ok(())
    }

    fn select_alternate(
        &mut self,
        interface: u8,
        alternate: u8,
    ) -> Result<(), TransportError> {
        self.claim_interface(interface)?;
        match &self.interface {
            Some(intf) => {
                intf.set_alt_setting(alternate).wait().map_err(usb_error)
            }
            None => Err(TransportError::Other("interface not claimed".into())),
        }
    }

    fn control_in(
        &mut self,
        setup: ControlSetup,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        let data = ControlIn {
            control_type: control_type(setup.request_type),
            recipient: recipient(setup.recipient),
            request: setup.request,
            value: setup.value,
            index: setup.index,
            length,
        };
        let result = match (&self.interface, setup.recipient) {
            (Some(intf), Recipient::Interface) => {
                intf.control_in(data, self.timeout).wait()
            }
            _ => self.device.control_in(data, self.timeout).wait(),
        };
        Ok(result?)
    }

    fn control_out(
        &mut self,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        let control = ControlOut {
            control_type: control_type(setup.request_type),
            recipient: recipient(setup.recipient),
            request: setup.request,
            value: setup.value,
            index: setup.index,
            data,
        };
        match (&self.interface, setup.recipient) {
            (Some(intf), Recipient::Interface) => {
                intf.control_out(control, self.timeout).wait()?
            }
            _ => self.device.control_out(control, self.timeout).wait()?,
        }
        Ok(data.len())
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.interface = None;
        self.device.reset().wait().map_err(usb_error)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.interface = None;
        Ok(())
    }

    fn wait_disconnected(
        &mut self,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if !self.is_present()? {
                self.interface = None;
                return Ok(());
            }
            std::thread::sleep(DISCONNECT_POLL_INTERVAL);
        }
        Err(TransportError::Timeout)
    }
}

fn is_dfu_device(dev: &nusb::DeviceInfo) -> bool {
    dev.interfaces()
        .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
}

/// Attached devices exposing a DFU interface, optionally filtered by vendor
/// and product id.
pub fn find_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<Vec<nusb::DeviceInfo>, DfuError> {
    let devices: Vec<nusb::DeviceInfo> = nusb::list_devices()
        .wait()?
        .filter(|dev| {
            vid.is_none_or(|id| dev.vendor_id() == id)
                && pid.is_none_or(|id| dev.product_id() == id)
        })
        .filter(is_dfu_device)
        .collect();
    info!("found {} DFU devices", devices.len());
    Ok(devices)
}
