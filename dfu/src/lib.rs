//! USB Device Firmware Upgrade (DFU) protocol engine
//!
//! Implements the host side of the DFU 1.1 protocol with the STM32
//! extensions (aka "DfuSe"): descriptor parsing, capability negotiation,
//! the DFU state machine and the read / erase / write transfer algorithms.
//! USB access goes through the [Transport] trait; [NusbTransport] implements
//! it on top of [`nusb`].
//!
//! Useful references:
//! - DFU: [USB Device Firmware Upgrade Specification, Revision 1.1](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//! - DfuSe: [STMicroelectronics AN3156](https://www.st.com/resource/en/application_note/an3156-usb-dfu-protocol-used-in-the-stm32-bootloader-stmicroelectronics.pdf)
//!
//! # Example
//!
//! The following example reads the first kilobyte of every DFU device:
//! ```no_run
//! use dfu_engine::{
//!     DfuSession, NusbTransport, SessionOptions, find_dfu_devices,
//! };
//!
//! # fn main() -> Result<(), dfu_engine::DfuError> {
//! for info in find_dfu_devices(None, None)? {
//!     let transport = NusbTransport::open(info)?;
//!     let mut session =
//!         DfuSession::new(transport, SessionOptions::default());
//!     session.init()?;
//!     session.connect(0)?;
//!     let data = session.read(Some(1024)).run(|_| {})?;
//!     println!("read {} bytes", data.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`nusb`]: https://docs.rs/nusb

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000u64);
pub(crate) const DEFAULT_TRANSFER_SIZE: u16 = 1024 * 2;

mod connection;
pub mod descriptor;
mod error;
mod interface;
pub mod memory;
mod process;
mod properties;
mod session;
mod state;
mod transfer;
mod transport;
mod usb;

#[cfg(test)]
mod testing;

use std::time::Duration;

// Re-exports
pub use connection::DfuConnection;
pub use descriptor::{DFU_VERSION_NUMBER, DFUSE_VERSION_NUMBER};
pub use error::DfuError;
pub use interface::{
    InterfaceSetting, find_dfu_interfaces, fix_interface_names,
    read_configuration_descriptor, read_device_descriptor, read_languages,
    read_string_descriptor,
};
pub use memory::{MemoryMap, MemorySegment, Sector, parse_memory_descriptor};
pub use process::{
    ReadEvent, ReadProcess, SessionEvent, WriteEvent, WriteProcess,
};
pub use properties::Properties;
pub use session::{DfuSession, DfuType, SessionOptions};
pub use state::{
    DfuRequest, DfuState, DfuStatus, DfuStatusCode, DfuseCommand,
};
pub use transport::{
    ControlSetup, Recipient, RequestType, Transport, TransportError,
};
pub use usb::{NusbTransport, find_dfu_devices};
