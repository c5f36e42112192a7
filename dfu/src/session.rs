use std::time::Duration;

use log::{debug, info, warn};

use crate::connection::DfuConnection;
use crate::descriptor::DFU_PROTOCOL_DFU_MODE;
use crate::error::DfuError;
use crate::interface::{
    InterfaceSetting, find_dfu_interfaces, fix_interface_names,
    read_configuration_descriptor,
};
use crate::memory::{MemoryMap, MemorySegment};
use crate::process::{
    ReadEvent, ReadProcess, SessionEvent, TransferOptions, WriteEvent,
    WriteProcess,
};
use crate::properties::Properties;
use crate::state::{DfuState, DfuStatus};
use crate::transfer;
use crate::transport::Transport;

#[derive(Clone, Copy, Debug, Default)]
pub struct SessionOptions {
    /// Select the first configuration and read interface names again when
    /// the device did not report them during discovery.
    pub force_interfaces_name: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuType {
    Dfu,
    /// STMicroelectronics extension, DFU 1.1a
    Dfuse,
}

type Listener = Box<dyn FnMut(SessionEvent<'_>)>;

/// State shared by the operations of one connection.
struct Target<'a> {
    memory: Option<&'a MemoryMap>,
    start_address: Option<u32>,
    dfu_type: DfuType,
}

impl Target<'_> {
    fn dfuse_memory(&self) -> Result<Option<&MemoryMap>, DfuError> {
        match (self.dfu_type, self.memory) {
            (DfuType::Dfu, _) => Ok(None),
            (DfuType::Dfuse, Some(map)) => Ok(Some(map)),
            (DfuType::Dfuse, None) => Err(DfuError::UnsupportedOperation(
                "DfuSe transfer without memory map",
            )),
        }
    }
}

/// A DFU capable device and its active alternate setting.
///
/// ```no_run
/// use dfu_engine::{DfuSession, NusbTransport, SessionOptions, WriteEvent};
///
/// # fn main() -> Result<(), dfu_engine::DfuError> {
/// let device = dfu_engine::find_dfu_devices(Some(0x0483), Some(0xdf11))?
///     .into_iter()
///     .next()
///     .expect("no device");
/// let transport = NusbTransport::open(device)?;
/// let mut session = DfuSession::new(transport, SessionOptions::default());
/// session.init()?;
/// session.connect(0)?;
/// session.set_dfuse_start_address(Some(0x0800_0000));
/// session.write(&[0u8; 1024]).run(|event| {
///     if let WriteEvent::WriteProcess { bytes_sent, expected_size } = event {
///         println!("{bytes_sent}/{expected_size}");
///     }
/// })?;
/// # Ok(())
/// # }
/// ```
pub struct DfuSession<T: Transport> {
    transport: T,
    options: SessionOptions,
    interfaces: Vec<InterfaceSetting>,
    current: Option<InterfaceSetting>,
    properties: Option<Properties>,
    memory: Option<MemoryMap>,
    connected: bool,
    dfuse_start_address: Option<u32>,
    listener: Option<Listener>,
}

impl<T: Transport> DfuSession<T> {
    pub fn new(transport: T, options: SessionOptions) -> Self {
        DfuSession {
            transport,
            options,
            interfaces: Vec::new(),
            current: None,
            properties: None,
            memory: None,
            connected: false,
            dfuse_start_address: None,
            listener: None,
        }
    }

    /// Receive [SessionEvent]s.
    pub fn on_event(
        &mut self,
        listener: impl FnMut(SessionEvent<'_>) + 'static,
    ) {
        self.listener = Some(Box::new(listener));
    }

    fn emit(&mut self, event: SessionEvent<'_>) {
        if let Some(listener) = self.listener.as_mut() {
            listener(event);
        }
    }

    /// Discover the DFU alternate settings of the device.
    pub fn init(&mut self) -> Result<(), DfuError> {
        let mut interfaces = find_dfu_interfaces(&mut self.transport)?;
        if self.options.force_interfaces_name {
            fix_interface_names(&mut self.transport, &mut interfaces)?;
        }
        debug!("{} DFU interfaces", interfaces.len());
        self.interfaces = interfaces;
        self.emit(SessionEvent::Init);
        Ok(())
    }

    pub fn interfaces(&self) -> &[InterfaceSetting] {
        &self.interfaces
    }

    /// Activate the alternate setting at `index` of [Self::interfaces].
    pub fn connect(&mut self, index: usize) -> Result<(), DfuError> {
        let setting = self
            .interfaces
            .get(index)
            .cloned()
            .ok_or(DfuError::InvalidInterface)?;

        let config = match read_configuration_descriptor(
            &mut self.transport,
            setting.configuration_index(),
        ) {
            Ok(config) => config,
            Err(err) => {
                self.connected = false;
                self.emit(SessionEvent::Disconnect(Some(&err)));
                return Err(err);
            }
        };
        let properties = Properties::from_configuration(
            &config,
            setting.interface(),
            setting.alternate(),
        );
        debug!("{properties:?}");

        self.memory = setting.memory().cloned();
        self.properties = Some(properties);
        self.current = Some(setting);
        if let Err(err) = self.open() {
            self.connected = false;
            if matches!(err, DfuError::DeviceLost) {
                self.emit(SessionEvent::Disconnect(Some(&err)));
            }
            return Err(err);
        }
        self.connected = true;
        if let Some(current) = &self.current {
            info!(
                "connected to interface {} alt {} ({})",
                current.interface(),
                current.alternate(),
                current.name().unwrap_or("unnamed")
            );
        }
        self.emit(SessionEvent::Connect);
        Ok(())
    }

    fn open(&mut self) -> Result<(), DfuError> {
        let current = self.current.as_ref().ok_or(DfuError::NotConnected)?;
        self.transport.select_configuration(current.configuration())?;
        self.transport.claim_interface(current.interface())?;
        self.transport
            .select_alternate(current.interface(), current.alternate())?;
        Ok(())
    }

    /// Release the device.
    pub fn close(&mut self) -> Result<(), DfuError> {
        let result = self.transport.close();
        self.connected = false;
        self.emit(SessionEvent::Disconnect(None));
        Ok(result?)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Active alternate setting.
    pub fn current_interface(&self) -> Option<&InterfaceSetting> {
        self.current.as_ref()
    }

    /// Properties of the active alternate setting.
    pub fn properties(&self) -> Option<Properties> {
        self.properties
    }

    pub fn dfu_type(&self) -> DfuType {
        let dfuse_version =
            self.properties.is_some_and(|p| p.is_dfuse_version());
        let dfu_mode = self
            .current
            .as_ref()
            .is_some_and(|c| c.protocol() == DFU_PROTOCOL_DFU_MODE);
        if dfuse_version && dfu_mode {
            DfuType::Dfuse
        } else {
            DfuType::Dfu
        }
    }

    pub fn memory_map(&self) -> Option<&MemoryMap> {
        self.memory.as_ref()
    }

    pub fn dfuse_segment(&self, addr: u32) -> Option<&MemorySegment> {
        self.memory.as_ref()?.segment(addr)
    }

    pub fn dfuse_first_writable_segment(&self) -> Option<&MemorySegment> {
        self.memory.as_ref()?.first_writable_segment()
    }

    pub fn dfuse_max_read_size(&self, addr: u32) -> u32 {
        self.memory
            .as_ref()
            .map_or(0, |map| map.max_read_size(addr))
    }

    pub fn dfuse_start_address(&self) -> Option<u32> {
        self.dfuse_start_address
    }

    /// Address used by DfuSe reads and writes. `None` picks the first
    /// writable segment.
    pub fn set_dfuse_start_address(&mut self, addr: Option<u32>) {
        self.dfuse_start_address = addr;
    }

    /// Prepare an upload of at most `max_size` bytes. `None` reads until
    /// the device sends a short block, or to the end of the segment on
    /// DfuSe devices.
    pub fn read(&mut self, max_size: Option<usize>) -> ReadProcess<'_, T> {
        ReadProcess::new(self, max_size)
    }

    /// Prepare a download of `data`.
    pub fn write<'d>(&mut self, data: &'d [u8]) -> WriteProcess<'_, 'd, T> {
        WriteProcess::new(self, data)
    }

    pub(crate) fn run_read(
        &mut self,
        max_size: Option<usize>,
        options: TransferOptions,
        on_event: &mut dyn FnMut(ReadEvent<'_>),
    ) -> Result<Vec<u8>, DfuError> {
        let properties =
            self.require(|p| p.can_upload, "device cannot upload")?;
        let transfer_size =
            options.transfer_size.unwrap_or(properties.transfer_size);
        self.run(|conn, target| {
            let memory = target.dfuse_memory()?;
            conn.ensure_idle()?;
            match memory {
                Some(map) => transfer::do_dfuse_read(
                    conn,
                    map,
                    target.start_address,
                    transfer_size,
                    max_size,
                    on_event,
                ),
                None => transfer::do_read(
                    conn,
                    transfer_size,
                    0,
                    max_size,
                    on_event,
                ),
            }
        })
    }

    pub(crate) fn run_write(
        &mut self,
        data: &[u8],
        options: TransferOptions,
        on_event: &mut dyn FnMut(WriteEvent<'_>),
    ) -> Result<(), DfuError> {
        let properties =
            self.require(|p| p.can_download, "device cannot download")?;
        let transfer_size =
            options.transfer_size.unwrap_or(properties.transfer_size);
        let tolerant = options
            .manifestation_tolerant
            .unwrap_or(properties.manifestation_tolerant);
        let outcome = self.run(|conn, target| {
            let memory = target.dfuse_memory()?;
            conn.ensure_idle()?;
            match memory {
                Some(map) => transfer::do_dfuse_write(
                    conn,
                    map,
                    target.start_address,
                    transfer_size,
                    data,
                    on_event,
                ),
                None => transfer::do_write(
                    conn,
                    transfer_size,
                    tolerant,
                    data,
                    on_event,
                ),
            }
        })?;
        if let Some(st) = outcome.status {
            debug!("final status {} ({})", st.status, st.state);
        }
        if outcome.device_reset {
            self.connected = false;
            self.emit(SessionEvent::Disconnect(None));
        }
        Ok(())
    }

    /// Erase the DfuSe sectors covering `length` bytes at `start`.
    pub fn erase(
        &mut self,
        start: u32,
        length: usize,
        mut on_event: impl FnMut(WriteEvent<'_>),
    ) -> Result<(), DfuError> {
        self.require(|p| p.can_download, "device cannot download")?;
        self.run(|conn, target| {
            let map = target.dfuse_memory()?.ok_or(
                DfuError::UnsupportedOperation("erase needs a DfuSe device"),
            )?;
            conn.ensure_idle()?;
            transfer::erase(conn, map, start, length, &mut on_event)
        })
    }

    /// Ask a runtime interface to switch to DFU mode.
    pub fn detach(&mut self) -> Result<(), DfuError> {
        let will_detach = self.properties.is_some_and(|p| p.will_detach);
        self.run(|conn, _| conn.detach().map(|_| ()))?;
        if !will_detach {
            debug!("device expects a bus reset to complete detach");
        }
        Ok(())
    }

    pub fn abort(&mut self) -> Result<(), DfuError> {
        self.run(|conn, _| conn.abort())
    }

    pub fn abort_to_idle(&mut self) -> Result<(), DfuError> {
        self.run(|conn, _| conn.abort_to_idle())
    }

    pub fn get_status(&mut self) -> Result<DfuStatus, DfuError> {
        self.run(|conn, _| conn.get_status())
    }

    pub fn get_state(&mut self) -> Result<DfuState, DfuError> {
        self.run(|conn, _| conn.get_state())
    }

    pub fn clear_status(&mut self) -> Result<(), DfuError> {
        self.run(|conn, _| conn.clear_status())
    }

    pub fn is_error(&mut self) -> Result<bool, DfuError> {
        self.run(|conn, _| conn.is_error())
    }

    /// DfuSe opcodes supported by the device.
    pub fn dfuse_commands(&mut self) -> Result<Vec<u8>, DfuError> {
        if self.dfu_type() != DfuType::Dfuse {
            return Err(DfuError::UnsupportedOperation("not a DfuSe device"));
        }
        self.run(|conn, _| conn.dfuse_get_commands())
    }

    /// Wait for the device to leave the bus, e.g. after a detach.
    pub fn wait_disconnected(
        &mut self,
        timeout: Duration,
    ) -> Result<(), DfuError> {
        self.transport.wait_disconnected(timeout)?;
        self.connected = false;
        self.emit(SessionEvent::Disconnect(None));
        Ok(())
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn require(
        &self,
        capability: impl Fn(&Properties) -> bool,
        what: &'static str,
    ) -> Result<Properties, DfuError> {
        let properties = match self.properties {
            Some(properties) if self.connected => properties,
            _ => return Err(DfuError::NotConnected),
        };
        if !capability(&properties) {
            return Err(DfuError::UnsupportedOperation(what));
        }
        Ok(properties)
    }

    /// Run `op` on the active interface. Protocol errors are followed by a
    /// best effort abort to idle, a lost device marks the session
    /// disconnected.
    fn run<R>(
        &mut self,
        op: impl FnOnce(
            &mut DfuConnection<'_, T>,
            &Target<'_>,
        ) -> Result<R, DfuError>,
    ) -> Result<R, DfuError> {
        let dfu_type = self.dfu_type();
        let interface = match &self.current {
            Some(current) if self.connected => current.interface(),
            _ => return Err(DfuError::NotConnected),
        };
        let target = Target {
            memory: self.memory.as_ref(),
            start_address: self.dfuse_start_address,
            dfu_type,
        };

        let mut conn = DfuConnection::new(&mut self.transport, interface);
        let result = op(&mut conn, &target);
        if let Err(err) = &result {
            if err.is_protocol_error() {
                debug!("{err}, aborting to idle");
                if let Err(abort_err) = conn.abort_to_idle() {
                    warn!("abort to idle failed: {abort_err}");
                }
            }
        }
        drop(conn);

        if let Err(err @ DfuError::DeviceLost) = &result {
            warn!("device lost");
            self.connected = false;
            self.emit(SessionEvent::Disconnect(Some(err)));
        }
        result
    }
}
