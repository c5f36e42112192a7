use std::fmt;

use crate::error::DfuError;

/// DFU class requests (`bRequest`), DFU 1.1 table 3.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuRequest {
    Detach = 0,
    Download = 1,
    Upload = 2,
    GetStatus = 3,
    ClearStatus = 4,
    GetState = 5,
    Abort = 6,
}

impl DfuRequest {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// DfuSe commands, sent as the payload of a `DFU_DNLOAD` with block 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuseCommand {
    GetCommands = 0x00,
    SetAddress = 0x21,
    EraseSector = 0x41,
}

impl DfuseCommand {
    pub fn opcode(self) -> u8 {
        self as u8
    }

    pub(crate) fn payload(self, addr: u32) -> [u8; 5] {
        let [a0, a1, a2, a3] = addr.to_le_bytes();
        [self.opcode(), a0, a1, a2, a3]
    }
}

/// Device state as reported by `DFU_GETSTATE` / `DFU_GETSTATUS`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DownloadSync,
    DownloadBusy,
    DownloadIdle,
    ManifestSync,
    Manifest,
    ManifestWaitReset,
    UploadIdle,
    DfuError,
    Other(u8),
}

impl From<u8> for DfuState {
    fn from(code: u8) -> Self {
        match code {
            0 => DfuState::AppIdle,
            1 => DfuState::AppDetach,
            2 => DfuState::DfuIdle,
            3 => DfuState::DownloadSync,
            4 => DfuState::DownloadBusy,
            5 => DfuState::DownloadIdle,
            6 => DfuState::ManifestSync,
            7 => DfuState::Manifest,
            8 => DfuState::ManifestWaitReset,
            9 => DfuState::UploadIdle,
            10 => DfuState::DfuError,
            other => DfuState::Other(other),
        }
    }
}

impl From<DfuState> for u8 {
    fn from(state: DfuState) -> Self {
        match state {
            DfuState::AppIdle => 0,
            DfuState::AppDetach => 1,
            DfuState::DfuIdle => 2,
            DfuState::DownloadSync => 3,
            DfuState::DownloadBusy => 4,
            DfuState::DownloadIdle => 5,
            DfuState::ManifestSync => 6,
            DfuState::Manifest => 7,
            DfuState::ManifestWaitReset => 8,
            DfuState::UploadIdle => 9,
            DfuState::DfuError => 10,
            DfuState::Other(code) => code,
        }
    }
}

impl fmt::Display for DfuState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DfuState::AppIdle => write!(f, "appIDLE"),
            DfuState::AppDetach => write!(f, "appDETACH"),
            DfuState::DfuIdle => write!(f, "dfuIDLE"),
            DfuState::DownloadSync => write!(f, "dfuDNLOAD-SYNC"),
            DfuState::DownloadBusy => write!(f, "dfuDNBUSY"),
            DfuState::DownloadIdle => write!(f, "dfuDNLOAD-IDLE"),
            DfuState::ManifestSync => write!(f, "dfuMANIFEST-SYNC"),
            DfuState::Manifest => write!(f, "dfuMANIFEST"),
            DfuState::ManifestWaitReset => write!(f, "dfuMANIFEST-WAIT-RESET"),
            DfuState::UploadIdle => write!(f, "dfuUPLOAD-IDLE"),
            DfuState::DfuError => write!(f, "dfuERROR"),
            DfuState::Other(code) => write!(f, "unknown state {code}"),
        }
    }
}

/// `bStatus` field of a `DFU_GETSTATUS` response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuStatusCode {
    Ok,
    ErrTarget,
    ErrFile,
    ErrWrite,
    ErrErase,
    ErrCheckErased,
    ErrProg,
    ErrVerify,
    ErrAddress,
    ErrNotDone,
    ErrFirmware,
    ErrVendor,
    ErrUsbReset,
    ErrPowerOnReset,
    ErrUnknown,
    ErrStalledPacket,
    Other(u8),
}

impl From<u8> for DfuStatusCode {
    fn from(code: u8) -> Self {
        match code {
            0x00 => DfuStatusCode::Ok,
            0x01 => DfuStatusCode::ErrTarget,
            0x02 => DfuStatusCode::ErrFile,
            0x03 => DfuStatusCode::ErrWrite,
            0x04 => DfuStatusCode::ErrErase,
            0x05 => DfuStatusCode::ErrCheckErased,
            0x06 => DfuStatusCode::ErrProg,
            0x07 => DfuStatusCode::ErrVerify,
            0x08 => DfuStatusCode::ErrAddress,
            0x09 => DfuStatusCode::ErrNotDone,
            0x0a => DfuStatusCode::ErrFirmware,
            0x0b => DfuStatusCode::ErrVendor,
            0x0c => DfuStatusCode::ErrUsbReset,
            0x0d => DfuStatusCode::ErrPowerOnReset,
            0x0e => DfuStatusCode::ErrUnknown,
            0x0f => DfuStatusCode::ErrStalledPacket,
            other => DfuStatusCode::Other(other),
        }
    }
}

impl From<DfuStatusCode> for u8 {
    fn from(status: DfuStatusCode) -> Self {
        match status {
            DfuStatusCode::Ok => 0x00,
            DfuStatusCode::ErrTarget => 0x01,
            DfuStatusCode::ErrFile => 0x02,
            DfuStatusCode::ErrWrite => 0x03,
            DfuStatusCode::ErrErase => 0x04,
            DfuStatusCode::ErrCheckErased => 0x05,
            DfuStatusCode::ErrProg => 0x06,
            DfuStatusCode::ErrVerify => 0x07,
            DfuStatusCode::ErrAddress => 0x08,
            DfuStatusCode::ErrNotDone => 0x09,
            DfuStatusCode::ErrFirmware => 0x0a,
            DfuStatusCode::ErrVendor => 0x0b,
            DfuStatusCode::ErrUsbReset => 0x0c,
            DfuStatusCode::ErrPowerOnReset => 0x0d,
            DfuStatusCode::ErrUnknown => 0x0e,
            DfuStatusCode::ErrStalledPacket => 0x0f,
            DfuStatusCode::Other(code) => code,
        }
    }
}

impl fmt::Display for DfuStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code: u8 = (*self).into();
        match self {
            DfuStatusCode::Ok => write!(f, "OK"),
            DfuStatusCode::ErrTarget => write!(f, "errTARGET"),
            DfuStatusCode::ErrFile => write!(f, "errFILE"),
            DfuStatusCode::ErrWrite => write!(f, "errWRITE"),
            DfuStatusCode::ErrErase => write!(f, "errERASE"),
            DfuStatusCode::ErrCheckErased => write!(f, "errCHECK_ERASED"),
            DfuStatusCode::ErrProg => write!(f, "errPROG"),
            DfuStatusCode::ErrVerify => write!(f, "errVERIFY"),
            DfuStatusCode::ErrAddress => write!(f, "errADDRESS"),
            DfuStatusCode::ErrNotDone => write!(f, "errNOTDONE"),
            DfuStatusCode::ErrFirmware => write!(f, "errFIRMWARE"),
            DfuStatusCode::ErrVendor => write!(f, "errVENDOR"),
            DfuStatusCode::ErrUsbReset => write!(f, "errUSBR"),
            DfuStatusCode::ErrPowerOnReset => write!(f, "errPOR"),
            DfuStatusCode::ErrUnknown => write!(f, "errUNKNOWN"),
            DfuStatusCode::ErrStalledPacket => write!(f, "errSTALLEDPKT"),
            DfuStatusCode::Other(_) => write!(f, "status {code:#04x}"),
        }
    }
}

pub(crate) const DFU_STATUS_LEN: u16 = 6;

/// Response to `DFU_GETSTATUS`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DfuStatus {
    pub status: DfuStatusCode,
    /// Milliseconds the host must wait before the next `DFU_GETSTATUS`.
    pub poll_timeout: u32,
    pub state: DfuState,
    pub string_index: u8,
}

impl DfuStatus {
    pub(crate) fn from_raw(data: &[u8]) -> Result<Self, DfuError> {
        if data.len() < DFU_STATUS_LEN as usize {
            return Err(DfuError::ShortTransfer {
                expected: DFU_STATUS_LEN as usize,
                actual: data.len(),
            });
        }
        Ok(DfuStatus {
            status: data[0].into(),
            poll_timeout: u32::from_le_bytes([data[1], data[2], data[3], 0]),
            state: data[4].into(),
            string_index: data[5],
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == DfuStatusCode::Ok && self.state != DfuState::DfuError
    }

    pub fn ok(&self) -> Result<(), DfuError> {
        self.ret(())
    }

    pub fn ret<T>(&self, t: T) -> Result<T, DfuError> {
        if self.is_ok() {
            Ok(t)
        } else {
            Err(DfuError::from(self))
        }
    }
}

impl From<&DfuStatus> for DfuError {
    fn from(st: &DfuStatus) -> Self {
        DfuError::DeviceError {
            status: st.status,
            state: st.state,
        }
    }
}
