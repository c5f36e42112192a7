//! Simulated DFU / DfuSe device for unit tests.

use std::time::Duration;

use crate::descriptor::{DT_CONFIGURATION, DT_DEVICE, DT_STRING};
use crate::memory::{MemoryMap, parse_memory_descriptor};
use crate::state::{DfuRequest, DfuState, DfuStatusCode};
use crate::transport::{
    ControlSetup, RequestType, Transport, TransportError,
};

const GET_DESCRIPTOR: u8 = 0x06;
const BUSY_POLL_MS: u32 = 5;

struct BusyScript {
    remaining: u32,
    poll_timeout: u32,
    then: DfuState,
}

struct Flash {
    map: MemoryMap,
    base: u32,
    data: Vec<u8>,
}

impl Flash {
    fn offset(&self, addr: u32) -> Option<usize> {
        self.map.segment(addr)?;
        Some((addr - self.base) as usize)
    }
}

pub(crate) struct MockDevice {
    state: DfuState,
    status: DfuStatusCode,
    transfer_size: u16,
    manifestation_tolerant: bool,
    can_upload: bool,
    names: Vec<String>,
    flash: Option<Flash>,
    image: Vec<u8>,
    address_pointer: u32,
    busy: Option<BusyScript>,
    pending_error: Option<DfuStatusCode>,
    fail_block: Option<(u16, DfuStatusCode)>,
    disconnect_block: Option<u16>,
    disconnected: bool,
    status_len: usize,
    requests: Vec<u8>,
    downloads: Vec<(u16, usize)>,
    sleeps: Vec<Duration>,
    erased: Vec<u32>,
    resets: u32,
    alt_setting: Option<(u8, u8)>,
    configuration: Option<u8>,
    strings_locked: bool,
    raw_strings: Vec<(u8, Vec<u8>)>,
    detach_value: Option<u16>,
}

impl MockDevice {
    fn new(
        names: Vec<String>,
        flash: Option<Flash>,
        transfer_size: u16,
    ) -> Self {
        MockDevice {
            state: DfuState::DfuIdle,
            status: DfuStatusCode::Ok,
            transfer_size,
            manifestation_tolerant: true,
            can_upload: true,
            names,
            flash,
            image: Vec::new(),
            address_pointer: 0,
            busy: None,
            pending_error: None,
            fail_block: None,
            disconnect_block: None,
            disconnected: false,
            status_len: 6,
            requests: Vec::new(),
            downloads: Vec::new(),
            sleeps: Vec::new(),
            erased: Vec::new(),
            resets: 0,
            alt_setting: None,
            configuration: None,
            strings_locked: false,
            raw_strings: Vec::new(),
            detach_value: None,
        }
    }

    /// Plain DFU 1.1 device with a 64 byte transfer size.
    pub(crate) fn dfu() -> Self {
        MockDevice::new(vec!["DFU firmware".into()], None, 64)
    }

    /// DfuSe device whose first alternate setting exposes `layout`. Flash
    /// starts out programmed with zeroes, so writes only succeed after an
    /// erase.
    pub(crate) fn dfuse(layout: &str) -> Self {
        let map = parse_memory_descriptor(layout).unwrap();
        let base = map.segments.first().start_addr();
        let size = map.segments.last().end_addr() - base;
        let flash = Flash {
            map,
            base,
            data: vec![0; size as usize],
        };
        MockDevice::new(vec![layout.into()], Some(flash), 1024)
    }

    pub(crate) fn with_alternate(mut self, name: &str) -> Self {
        self.names.push(name.into());
        self
    }

    pub(crate) fn manifestation_tolerant(mut self, tolerant: bool) -> Self {
        self.manifestation_tolerant = tolerant;
        self
    }

    pub(crate) fn upload_capable(mut self, can_upload: bool) -> Self {
        self.can_upload = can_upload;
        self
    }

    /// Report `status` after the `DFU_DNLOAD` of `block`.
    pub(crate) fn fail_download_at(
        mut self,
        block: u16,
        status: DfuStatusCode,
    ) -> Self {
        self.fail_block = Some((block, status));
        self
    }

    /// Stall interface string requests until a configuration is selected.
    pub(crate) fn strings_need_configuration(mut self) -> Self {
        self.strings_locked = true;
        self
    }

    /// Answer requests for string `index` with `data` as is.
    pub(crate) fn with_raw_string(mut self, index: u8, data: &[u8]) -> Self {
        self.raw_strings.push((index, data.to_vec()));
        self
    }

    /// Drop off the bus when `block` is downloaded.
    pub(crate) fn disconnect_at_download(mut self, block: u16) -> Self {
        self.disconnect_block = Some(block);
        self
    }

    pub(crate) fn state(&self) -> DfuState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: DfuState) {
        self.state = state;
    }

    pub(crate) fn set_error(&mut self, status: DfuStatusCode) {
        self.state = DfuState::DfuError;
        self.status = status;
    }

    /// Answer the next `count` status requests with `dfuDNBUSY` and
    /// `poll_timeout`, then switch to `then`.
    pub(crate) fn script_busy(
        &mut self,
        count: u32,
        poll_timeout: u32,
        then: DfuState,
    ) {
        self.busy = Some(BusyScript {
            remaining: count,
            poll_timeout,
            then,
        });
    }

    pub(crate) fn truncate_status(&mut self, len: usize) {
        self.status_len = len;
    }

    pub(crate) fn count(&self, req: DfuRequest) -> usize {
        self.requests.iter().filter(|r| **r == req.code()).count()
    }

    pub(crate) fn requests(&self) -> &[u8] {
        &self.requests
    }

    pub(crate) fn downloads(&self) -> &[(u16, usize)] {
        &self.downloads
    }

    pub(crate) fn sleeps(&self) -> &[Duration] {
        &self.sleeps
    }

    pub(crate) fn address_pointer(&self) -> u32 {
        self.address_pointer
    }

    pub(crate) fn erased(&self) -> &[u32] {
        &self.erased
    }

    pub(crate) fn image(&self) -> &[u8] {
        &self.image
    }

    pub(crate) fn resets(&self) -> u32 {
        self.resets
    }

    pub(crate) fn configuration(&self) -> Option<u8> {
        self.configuration
    }

    /// `wValue` of the last `DFU_DETACH`.
    pub(crate) fn detach_value(&self) -> Option<u16> {
        self.detach_value
    }

    pub(crate) fn alt_setting(&self) -> Option<(u8, u8)> {
        self.alt_setting
    }

    pub(crate) fn flash(&self, addr: u32, len: usize) -> &[u8] {
        let flash = self.flash.as_ref().unwrap();
        let offset = (addr - flash.base) as usize;
        &flash.data[offset..offset + len]
    }

    fn device_descriptor(&self) -> Vec<u8> {
        vec![
            0x12, DT_DEVICE, 0x00, 0x02, 0x00, 0x00, 0x00, 0x40, 0x83, 0x04,
            0x11, 0xDF, 0x00, 0x22, 0x00, 0x00, 0x00, 0x01,
        ]
    }

    fn configuration_descriptor(&self) -> Vec<u8> {
        let mut data = vec![DT_CONFIGURATION; 9];
        data[0] = 0x09;
        data[4] = 0x01;
        data[5] = 0x01;
        data[6] = 0x00;
        data[7] = 0x80;
        data[8] = 0x32;
        for (alt, _) in self.names.iter().enumerate() {
            data.extend_from_slice(&[
                0x09,
                0x04,
                0x00,
                alt as u8,
                0x00,
                0xFE,
                0x01,
                0x02,
                alt as u8 + 1,
            ]);
        }
        let mut attributes = 0b0001;
        if self.can_upload {
            attributes |= 0b0010;
        }
        if self.manifestation_tolerant {
            attributes |= 0b0100;
        }
        let version: u16 = if self.flash.is_some() { 0x011A } else { 0x0110 };
        let [ts0, ts1] = self.transfer_size.to_le_bytes();
        let [v0, v1] = version.to_le_bytes();
        data.extend_from_slice(&[
            0x09, 0x21, attributes, 0xFF, 0x00, ts0, ts1, v0, v1,
        ]);
        let total = data.len() as u16;
        data[2..4].copy_from_slice(&total.to_le_bytes());
        data
    }

    fn string_descriptor(&self, index: u8) -> Option<Vec<u8>> {
        if index == 0 {
            return Some(vec![0x04, DT_STRING, 0x09, 0x04]);
        }
        let raw = self.raw_strings.iter().find(|(i, _)| *i == index);
        if let Some((_, data)) = raw {
            return Some(data.clone());
        }
        if self.strings_locked && self.configuration.is_none() {
            return None;
        }
        let name = self.names.get(index as usize - 1)?;
        let mut data = vec![0, DT_STRING];
        for unit in name.encode_utf16() {
            data.extend_from_slice(&unit.to_le_bytes());
        }
        data[0] = data.len() as u8;
        Some(data)
    }

    fn status_response(&mut self) -> Vec<u8> {
        let mut poll_timeout = 0;
        if let Some(busy) = self.busy.as_mut() {
            if busy.remaining > 0 {
                busy.remaining -= 1;
                poll_timeout = busy.poll_timeout;
                self.state = DfuState::DownloadBusy;
            } else {
                self.state = busy.then;
                self.busy = None;
            }
        } else {
            match self.state {
                DfuState::DownloadSync => {
                    if let Some(err) = self.pending_error.take() {
                        self.state = DfuState::DfuError;
                        self.status = err;
                    } else {
                        self.state = DfuState::DownloadBusy;
                        poll_timeout = BUSY_POLL_MS;
                    }
                }
                DfuState::DownloadBusy => self.state = DfuState::DownloadIdle,
                DfuState::ManifestSync => {
                    self.state = DfuState::Manifest;
                    poll_timeout = BUSY_POLL_MS;
                }
                DfuState::Manifest => self.state = DfuState::DfuIdle,
                _ => {}
            }
        }

        let reported = self.state;
        if reported == DfuState::Manifest {
            if self.flash.is_some() {
                // DfuSe leave: the bootloader restarts right away
                self.state = DfuState::DfuIdle;
            } else if !self.manifestation_tolerant {
                self.state = DfuState::ManifestWaitReset;
            }
        }
        let [p0, p1, p2, _] = poll_timeout.to_le_bytes();
        let mut data = vec![self.status.into(), p0, p1, p2, reported.into(), 0];
        data.truncate(self.status_len);
        data
    }

    fn stall(&mut self) -> TransportError {
        self.state = DfuState::DfuError;
        self.status = DfuStatusCode::ErrStalledPacket;
        TransportError::Stall
    }

    fn dnload(
        &mut self,
        block: u16,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        if !matches!(self.state, DfuState::DfuIdle | DfuState::DownloadIdle) {
            return Err(self.stall());
        }
        if self.disconnect_block == Some(block) {
            self.disconnected = true;
            return Err(TransportError::Disconnected);
        }
        self.downloads.push((block, data.len()));
        if data.is_empty() {
            self.state = DfuState::ManifestSync;
            return Ok(0);
        }

        if let Some(flash) = self.flash.as_mut() {
            if block == 0 {
                let addr = match data {
                    [_, a0, a1, a2, a3] => {
                        u32::from_le_bytes([*a0, *a1, *a2, *a3])
                    }
                    _ => return Err(self.stall()),
                };
                match data[0] {
                    0x21 => self.address_pointer = addr,
                    0x41 => {
                        let Some(segment) = flash.map.segment(addr) else {
                            self.pending_error =
                                Some(DfuStatusCode::ErrTarget);
                            self.state = DfuState::DownloadSync;
                            return Ok(data.len());
                        };
                        let start = segment.start_addr();
                        let size = segment.sector_size() as usize;
                        let offset = (start - flash.base) as usize;
                        flash.data[offset..offset + size].fill(0xFF);
                        self.erased.push(addr);
                    }
                    _ => return Err(self.stall()),
                }
            } else if block >= 2 {
                let addr = self.address_pointer
                    + (block as u32 - 2) * self.transfer_size as u32;
                for (i, byte) in data.iter().enumerate() {
                    match flash.offset(addr + i as u32) {
                        Some(offset) if flash.data[offset] == 0xFF => {
                            flash.data[offset] = *byte
                        }
                        Some(_) => {
                            self.pending_error =
                                Some(DfuStatusCode::ErrCheckErased);
                            break;
                        }
                        None => {
                            self.pending_error =
                                Some(DfuStatusCode::ErrAddress);
                            break;
                        }
                    }
                }
            } else {
                return Err(self.stall());
            }
        } else {
            if block == 0 {
                self.image.clear();
            }
            self.image.extend_from_slice(data);
        }

        if let Some((fail, status)) = self.fail_block {
            if fail == block {
                self.pending_error = Some(status);
            }
        }
        self.state = DfuState::DownloadSync;
        Ok(data.len())
    }

    fn upload(
        &mut self,
        block: u16,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        if !matches!(self.state, DfuState::DfuIdle | DfuState::UploadIdle) {
            return Err(self.stall());
        }
        let length = length as usize;
        if let Some(flash) = self.flash.as_ref() {
            let data = match block {
                0 => vec![0x00, 0x21, 0x41],
                1 => return Err(self.stall()),
                _ => {
                    let addr = self.address_pointer
                        + (block as u32 - 2) * self.transfer_size as u32;
                    let Some(offset) = flash.offset(addr) else {
                        return Err(self.stall());
                    };
                    let end = (offset + length).min(flash.data.len());
                    flash.data[offset..end].to_vec()
                }
            };
            self.state = DfuState::UploadIdle;
            Ok(data)
        } else {
            let offset = (block as usize * self.transfer_size as usize)
                .min(self.image.len());
            let end = (offset + length).min(self.image.len());
            let data = self.image[offset..end].to_vec();
            self.state = if data.len() < length {
                DfuState::DfuIdle
            } else {
                DfuState::UploadIdle
            };
            Ok(data)
        }
    }

    fn check_connected(&self) -> Result<(), TransportError> {
        if self.disconnected {
            Err(TransportError::Disconnected)
        } else {
            Ok(())
        }
    }
}

impl Transport for MockDevice {
    fn select_configuration(
        &mut self,
        configuration: u8,
    ) -> Result<(), TransportError> {
        self.check_connected()?;
        self.configuration = Some(configuration);
        Ok(())
    }

    fn claim_interface(
        &mut self,
        _interface: u8,
    ) -> Result<(), TransportError> {
        self.check_connected()
    }

    fn select_alternate(
        &mut self,
        interface: u8,
        alternate: u8,
    ) -> Result<(), TransportError> {
        self.check_connected()?;
        self.alt_setting = Some((interface, alternate));
        Ok(())
    }

    fn control_in(
        &mut self,
        setup: ControlSetup,
        length: u16,
    ) -> Result<Vec<u8>, TransportError> {
        self.check_connected()?;
        let mut data = if setup.request_type == RequestType::Standard {
            if setup.request != GET_DESCRIPTOR {
                return Err(TransportError::Stall);
            }
            let [index, kind] = setup.value.to_le_bytes();
            match kind {
                DT_DEVICE => self.device_descriptor(),
                DT_CONFIGURATION if index == 0 => {
                    self.configuration_descriptor()
                }
                DT_STRING => self
                    .string_descriptor(index)
                    .ok_or(TransportError::Stall)?,
                _ => return Err(TransportError::Stall),
            }
        } else {
            self.requests.push(setup.request);
            let request = setup.request;
            if request == DfuRequest::GetStatus.code() {
                self.status_response()
            } else if request == DfuRequest::GetState.code() {
                vec![self.state.into()]
            } else if request == DfuRequest::Upload.code() {
                self.upload(setup.value, length)?
            } else {
                return Err(self.stall());
            }
        };
        data.truncate(length as usize);
        Ok(data)
    }

    fn control_out(
        &mut self,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<usize, TransportError> {
        self.check_connected()?;
        self.requests.push(setup.request);
        match setup.request {
            r if r == DfuRequest::Download.code() => {
                self.dnload(setup.value, data)
            }
            r if r == DfuRequest::Abort.code() => {
                if self.state == DfuState::DfuError {
                    return Err(TransportError::Stall);
                }
                self.state = DfuState::DfuIdle;
                Ok(0)
            }
            r if r == DfuRequest::ClearStatus.code() => {
                if self.state == DfuState::DfuError {
                    self.state = DfuState::DfuIdle;
                    self.status = DfuStatusCode::Ok;
                }
                Ok(0)
            }
            r if r == DfuRequest::Detach.code() => {
                self.detach_value = Some(setup.value);
                self.state = DfuState::AppDetach;
                Ok(0)
            }
            _ => Err(self.stall()),
        }
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        self.resets += 1;
        self.state = DfuState::DfuIdle;
        self.status = DfuStatusCode::Ok;
        Ok(())
    }

    fn wait_disconnected(
        &mut self,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        if self.state == DfuState::ManifestWaitReset {
            // the device resets itself and comes back in DFU mode
            self.state = DfuState::DfuIdle;
            Ok(())
        } else {
            Err(TransportError::Timeout)
        }
    }

    fn sleep(&mut self, duration: Duration) {
        self.sleeps.push(duration);
    }
}
