use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::error::DfuError;
use crate::state::{
    DFU_STATUS_LEN, DfuRequest, DfuState, DfuStatus, DfuseCommand,
};
use crate::transport::{ControlSetup, Transport, TransportError};

const DFU_STATE_LEN: u16 = 1;

/// `wValue` of `DFU_DETACH`, in milliseconds.
const DETACH_TIMEOUT_MS: u16 = 1000;

/// Longest time a status poll loop may wait for the device.
pub(crate) const POLL_DEADLINE: Duration = Duration::from_secs(10);

/// DFU requests addressed to one interface of a device.
///
/// A connection borrows the session's transport for the duration of one
/// operation and remembers the last status the device reported.
pub struct DfuConnection<'t, T: Transport> {
    transport: &'t mut T,
    interface: u8,
    last_status: Option<DfuStatus>,
}

impl<'t, T: Transport> DfuConnection<'t, T> {
    pub(crate) fn new(transport: &'t mut T, interface: u8) -> Self {
        DfuConnection {
            transport,
            interface,
            last_status: None,
        }
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    /// Status returned by the most recent `DFU_GETSTATUS`.
    pub fn last_status(&self) -> Option<DfuStatus> {
        self.last_status
    }

    pub(crate) fn transport(&mut self) -> &mut T {
        &mut *self.transport
    }

    pub fn detach(&mut self) -> Result<usize, DfuError> {
        self.request_out(DfuRequest::Detach, DETACH_TIMEOUT_MS, &[])
    }

    pub fn get_status(&mut self) -> Result<DfuStatus, DfuError> {
        let data = self.request_in(DfuRequest::GetStatus, 0, DFU_STATUS_LEN)?;
        let st = DfuStatus::from_raw(&data)?;
        self.last_status = Some(st);
        Ok(st)
    }

    pub fn get_state(&mut self) -> Result<DfuState, DfuError> {
        let data = self.request_in(DfuRequest::GetState, 0, DFU_STATE_LEN)?;
        match data.first() {
            Some(state) => Ok(DfuState::from(*state)),
            None => Err(DfuError::ShortTransfer {
                expected: DFU_STATE_LEN as usize,
                actual: 0,
            }),
        }
    }

    pub fn clear_status(&mut self) -> Result<(), DfuError> {
        self.request_out(DfuRequest::ClearStatus, 0, &[]).map(|_| ())
    }

    pub fn abort(&mut self) -> Result<(), DfuError> {
        self.request_out(DfuRequest::Abort, 0, &[]).map(|_| ())
    }

    pub fn is_error(&mut self) -> Result<bool, DfuError> {
        Ok(self.get_status()?.state == DfuState::DfuError)
    }

    /// `DFU_DNLOAD` of one block. Returns the number of bytes sent.
    pub fn download(
        &mut self,
        block_nr: u16,
        data: &[u8],
    ) -> Result<usize, DfuError> {
        self.request_out(DfuRequest::Download, block_nr, data)
    }

    /// `DFU_UPLOAD` of one block of at most `length` bytes.
    pub fn upload(
        &mut self,
        block_nr: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        self.request_in(DfuRequest::Upload, block_nr, length)
    }

    /// Poll `DFU_GETSTATUS` until `pred` accepts the device state, waiting
    /// `bwPollTimeout` between two polls. A device in `dfuERROR` or reporting
    /// an error status ends the loop with [DfuError::DeviceError].
    pub fn poll_until(
        &mut self,
        pred: impl Fn(DfuState) -> bool,
    ) -> Result<DfuStatus, DfuError> {
        let start = Instant::now();
        let mut waited = Duration::ZERO;
        let mut st = self.get_status()?;
        while !pred(st.state) && st.state != DfuState::DfuError {
            let delay = Duration::from_millis(st.poll_timeout as u64);
            waited += delay;
            if waited.max(start.elapsed()) >= POLL_DEADLINE {
                return Err(DfuError::Timeout);
            }
            self.transport.sleep(delay);
            st = self.get_status()?;
        }
        st.ret(st)
    }

    pub fn poll_until_idle(
        &mut self,
        idle_state: DfuState,
    ) -> Result<DfuStatus, DfuError> {
        self.poll_until(|state| state == idle_state)
    }

    /// Bring the device back to `dfuIDLE` from any state.
    ///
    /// `DFU_ABORT` is sent exactly once. Devices in `dfuERROR` stall it and
    /// need `DFU_CLRSTATUS` instead.
    pub fn abort_to_idle(&mut self) -> Result<(), DfuError> {
        match self.abort() {
            Ok(()) => {}
            Err(DfuError::Transfer(TransportError::Stall)) => {
                debug!("abort stalled, device is probably in dfuERROR");
            }
            Err(err) => return Err(err),
        }
        let st = self.get_status()?;
        if !st.is_ok() {
            self.clear_status()?;
        }
        self.poll_until_idle(DfuState::DfuIdle).map(|_| ())
    }

    /// Make sure a new operation starts from `dfuIDLE`.
    pub fn ensure_idle(&mut self) -> Result<(), DfuError> {
        let state = self.get_state()?;
        if state != DfuState::DfuIdle {
            debug!("device in {state}, aborting to idle");
            self.abort_to_idle()?;
        }
        Ok(())
    }

    pub fn dfuse_set_address(&mut self, addr: u32) -> Result<(), DfuError> {
        self.dfuse_command(DfuseCommand::SetAddress, addr)
    }

    pub fn dfuse_erase_sector(&mut self, addr: u32) -> Result<(), DfuError> {
        self.dfuse_command(DfuseCommand::EraseSector, addr)
    }

    /// Send a DfuSe command and wait for the device to execute it.
    pub fn dfuse_command(
        &mut self,
        command: DfuseCommand,
        addr: u32,
    ) -> Result<(), DfuError> {
        debug!("DfuSe command {command:?} {addr:#010x}");
        let payload = command.payload(addr);
        self.download(0, &payload)?;
        match self.poll_until(|state| state != DfuState::DownloadBusy) {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(
                    "DfuSe command {command:?} at {addr:#010x} failed: {err}"
                );
                Err(err)
            }
        }
    }

    /// Opcodes supported by a DfuSe device (`UPLOAD` of block 0). The first
    /// byte is `GET_COMMANDS` itself.
    pub fn dfuse_get_commands(&mut self) -> Result<Vec<u8>, DfuError> {
        self.ensure_idle()?;
        let commands = self.upload(0, crate::DEFAULT_TRANSFER_SIZE)?;
        self.abort_to_idle()?;
        Ok(commands)
    }

    fn request_out(
        &mut self,
        req: DfuRequest,
        value: u16,
        data: &[u8],
    ) -> Result<usize, DfuError> {
        let setup =
            ControlSetup::class_interface(req.code(), value, self.interface);
        let written = self.transport.control_out(setup, data)?;
        if written < data.len() {
            return Err(DfuError::ShortTransfer {
                expected: data.len(),
                actual: written,
            });
        }
        Ok(written)
    }

    fn request_in(
        &mut self,
        req: DfuRequest,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        let setup =
            ControlSetup::class_interface(req.code(), value, self.interface);
        let data = self.transport.control_in(setup, length)?;
        let exact = matches!(req, DfuRequest::GetStatus | DfuRequest::GetState);
        if exact && data.len() < length as usize {
            return Err(DfuError::ShortTransfer {
                expected: length as usize,
                actual: data.len(),
            });
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::state::DfuStatusCode;
    use crate::testing::MockDevice;

    #[test]
    fn test_poll_until_idle_waits_poll_timeout() {
        let mut dev = MockDevice::dfu();
        dev.set_state(DfuState::DownloadBusy);
        dev.script_busy(3, 50, DfuState::DfuIdle);

        let mut conn = DfuConnection::new(&mut dev, 0);
        let st = conn.poll_until_idle(DfuState::DfuIdle).unwrap();
        assert_eq!(st.state, DfuState::DfuIdle);
        drop(conn);

        assert_eq!(dev.count(DfuRequest::GetStatus), 4);
        let slept: Duration = dev.sleeps().iter().sum();
        assert!(slept >= Duration::from_millis(100));
        assert!(dev.sleeps().iter().all(|d| *d == Duration::from_millis(50)));
    }

    #[test]
    fn test_poll_until_reports_device_error() {
        let mut dev = MockDevice::dfu();
        dev.set_error(DfuStatusCode::ErrVerify);

        let mut conn = DfuConnection::new(&mut dev, 0);
        let err = conn.poll_until_idle(DfuState::DfuIdle).unwrap_err();
        assert!(matches!(
            err,
            DfuError::DeviceError {
                status: DfuStatusCode::ErrVerify,
                state: DfuState::DfuError
            }
        ));
        assert_eq!(dev.count(DfuRequest::GetStatus), 1);
        assert!(dev.sleeps().is_empty());
    }

    #[test]
    fn test_poll_until_times_out() {
        let mut dev = MockDevice::dfu();
        dev.set_state(DfuState::DownloadBusy);
        dev.script_busy(u32::MAX, 1000, DfuState::DfuIdle);

        let mut conn = DfuConnection::new(&mut dev, 0);
        assert!(matches!(
            conn.poll_until_idle(DfuState::DfuIdle),
            Err(DfuError::Timeout)
        ));
    }

    #[test]
    fn test_abort_to_idle_clears_error() {
        let mut dev = MockDevice::dfu();
        dev.set_error(DfuStatusCode::ErrWrite);

        let mut conn = DfuConnection::new(&mut dev, 0);
        conn.abort_to_idle().unwrap();
        assert_eq!(conn.get_state().unwrap(), DfuState::DfuIdle);
        drop(conn);

        assert_eq!(dev.count(DfuRequest::Abort), 1);
        assert_eq!(dev.count(DfuRequest::ClearStatus), 1);
    }

    #[test]
    fn test_ensure_idle_only_aborts_when_needed() {
        let mut dev = MockDevice::dfu();
        DfuConnection::new(&mut dev, 0).ensure_idle().unwrap();
        assert_eq!(dev.count(DfuRequest::Abort), 0);

        dev.set_state(DfuState::UploadIdle);
        DfuConnection::new(&mut dev, 0).ensure_idle().unwrap();
        assert_eq!(dev.count(DfuRequest::Abort), 1);
        assert_eq!(dev.state(), DfuState::DfuIdle);
    }

    #[test]
    fn test_short_status_is_rejected() {
        let mut dev = MockDevice::dfu();
        dev.truncate_status(4);
        let mut conn = DfuConnection::new(&mut dev, 0);
        assert!(matches!(
            conn.get_status(),
            Err(DfuError::ShortTransfer {
                expected: 6,
                actual: 4
            })
        ));
    }

    #[test]
    fn test_dfuse_commands() {
        let mut dev = MockDevice::dfuse("@Flash/0x08000000/04*016Kg");
        let mut conn = DfuConnection::new(&mut dev, 0);
        conn.dfuse_set_address(0x0800_4000).unwrap();
        conn.dfuse_erase_sector(0x0800_4000).unwrap();
        assert_eq!(
            conn.dfuse_get_commands().unwrap(),
            vec![0x00, 0x21, 0x41]
        );
        drop(conn);
        assert_eq!(dev.address_pointer(), 0x0800_4000);
        assert_eq!(dev.erased(), &[0x0800_4000]);
    }
}
