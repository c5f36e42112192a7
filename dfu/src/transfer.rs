use log::{debug, info, warn};

use crate::connection::DfuConnection;
use crate::error::DfuError;
use crate::memory::MemoryMap;
use crate::process::{ReadEvent, WriteEvent};
use crate::state::{DfuState, DfuStatus};
use crate::transport::Transport;

/// First `wBlockNum` carrying data in DfuSe transfers. Blocks 0 and 1 are
/// reserved for commands.
pub(crate) const DFUSE_FIRST_BLOCK: u16 = 2;

#[derive(Debug)]
pub(crate) struct WriteOutcome {
    pub(crate) status: Option<DfuStatus>,
    /// The device reset (or was reset) during manifestation.
    pub(crate) device_reset: bool,
}

/// Upload blocks starting at `first_block` until a short block or until
/// `max_size` bytes were received.
pub(crate) fn do_read<T: Transport>(
    conn: &mut DfuConnection<'_, T>,
    transfer_size: u16,
    first_block: u16,
    max_size: Option<usize>,
    on_event: &mut dyn FnMut(ReadEvent<'_>),
) -> Result<Vec<u8>, DfuError> {
    let mut data = Vec::with_capacity(max_size.unwrap_or(0));
    let mut block = first_block;
    let mut reached_max = true;

    on_event(ReadEvent::Process {
        done: 0,
        total: max_size,
    });
    loop {
        let length = match max_size {
            Some(max) => (max - data.len()).min(transfer_size as usize) as u16,
            None => transfer_size,
        };
        if length == 0 {
            break;
        }
        let chunk = conn.upload(block, length)?;
        data.extend_from_slice(&chunk);
        on_event(ReadEvent::Process {
            done: data.len(),
            total: max_size,
        });
        if chunk.len() < length as usize {
            reached_max = false;
            break;
        }
        block = block.wrapping_add(1);
    }

    if reached_max {
        // device is still in dfuUPLOAD-IDLE
        conn.abort_to_idle()?;
    }
    debug!("received {} bytes", data.len());
    Ok(data)
}

/// Start address of a DfuSe transfer: the configured one, otherwise the
/// first writable segment.
pub(crate) fn dfuse_start_address(
    map: &MemoryMap,
    configured: Option<u32>,
) -> u32 {
    if let Some(addr) = configured {
        return addr;
    }
    let segment = map
        .first_writable_segment()
        .unwrap_or_else(|| map.segments.first());
    let addr = segment.start_addr();
    warn!("no start address set, using {addr:#010x}");
    addr
}

pub(crate) fn do_dfuse_read<T: Transport>(
    conn: &mut DfuConnection<'_, T>,
    map: &MemoryMap,
    start_address: Option<u32>,
    transfer_size: u16,
    max_size: Option<usize>,
    on_event: &mut dyn FnMut(ReadEvent<'_>),
) -> Result<Vec<u8>, DfuError> {
    let start = dfuse_start_address(map, start_address);
    if map.segment(start).is_none() {
        warn!("start address {start:#010x} is outside of the memory map");
    }
    let limit = map.max_read_size(start) as usize;
    if limit == 0 {
        return Err(DfuError::AddressOutOfRange { address: start });
    }
    let size = match max_size {
        Some(size) if size > limit => {
            warn!(
                "read size {size} exceeds the segment at {start:#010x}, \
                 reading {limit} bytes"
            );
            limit
        }
        Some(size) => size,
        None => limit,
    };

    conn.dfuse_set_address(start)?;
    conn.abort_to_idle()?;
    do_read(conn, transfer_size, DFUSE_FIRST_BLOCK, Some(size), on_event)
}

pub(crate) fn do_write<T: Transport>(
    conn: &mut DfuConnection<'_, T>,
    transfer_size: u16,
    manifestation_tolerant: bool,
    data: &[u8],
    on_event: &mut dyn FnMut(WriteEvent<'_>),
) -> Result<WriteOutcome, DfuError> {
    let expected_size = data.len();
    let mut bytes_sent = 0;
    let mut block: u16 = 0;

    on_event(WriteEvent::WriteStart);
    for chunk in data.chunks(transfer_size as usize) {
        bytes_sent += conn.download(block, chunk)?;
        conn.poll_until_idle(DfuState::DownloadIdle)?;
        block = block.wrapping_add(1);
        on_event(WriteEvent::WriteProcess {
            bytes_sent,
            expected_size,
        });
    }

    debug!("sent {bytes_sent} bytes, starting manifestation");
    conn.download(block, &[])?;

    let mut device_reset = false;
    if manifestation_tolerant {
        match conn.poll_until(|state| {
            state == DfuState::DfuIdle || state == DfuState::ManifestWaitReset
        }) {
            Ok(st) if st.state == DfuState::ManifestWaitReset => {
                debug!("device waits for reset");
                if let Err(err) = conn.transport().reset() {
                    debug!("reset failed: {err}");
                }
                device_reset = true;
            }
            Ok(_) => {}
            Err(DfuError::DeviceLost) => {
                warn!(
                    "device disconnected during manifestation, \
                     assuming it reset"
                );
                device_reset = true;
            }
            Err(err) => return Err(err),
        }
    } else {
        // a non tolerant device may drop off the bus before answering
        if let Err(err) = conn.get_status() {
            debug!("status after manifestation failed: {err}");
        }
        if conn
            .transport()
            .wait_disconnected(crate::DEFAULT_TIMEOUT)
            .is_err()
        {
            info!("device did not reset itself, issuing a bus reset");
            if let Err(err) = conn.transport().reset() {
                debug!("reset failed: {err}");
            }
        }
        device_reset = true;
    }

    let status = conn.last_status();
    if let Some(st) = status {
        on_event(WriteEvent::Verify(st));
    }
    on_event(WriteEvent::WriteEnd { bytes_sent });
    Ok(WriteOutcome {
        status,
        device_reset,
    })
}

/// Erase every sector touched by `length` bytes at `start`.
pub(crate) fn erase<T: Transport>(
    conn: &mut DfuConnection<'_, T>,
    map: &MemoryMap,
    start: u32,
    length: usize,
    on_event: &mut dyn FnMut(WriteEvent<'_>),
) -> Result<(), DfuError> {
    let length = u32::try_from(length)
        .map_err(|_| DfuError::AddressOutOfRange { address: start })?;
    let sectors = map.erase_plan(start, length)?;
    let expected_size = sectors.iter().map(|s| s.size as usize).sum();
    let mut bytes_sent = 0;

    on_event(WriteEvent::EraseStart);
    for sector in &sectors {
        debug!("erasing sector at {:#010x}", sector.address);
        conn.dfuse_erase_sector(sector.address)?;
        bytes_sent += sector.size as usize;
        on_event(WriteEvent::EraseProcess {
            bytes_sent,
            expected_size,
        });
    }
    on_event(WriteEvent::EraseEnd);
    Ok(())
}

pub(crate) fn do_dfuse_write<T: Transport>(
    conn: &mut DfuConnection<'_, T>,
    map: &MemoryMap,
    start_address: Option<u32>,
    transfer_size: u16,
    data: &[u8],
    on_event: &mut dyn FnMut(WriteEvent<'_>),
) -> Result<WriteOutcome, DfuError> {
    let start = dfuse_start_address(map, start_address);
    erase(conn, map, start, data.len(), on_event)?;

    let expected_size = data.len();
    let mut bytes_sent = 0;
    let mut block = DFUSE_FIRST_BLOCK;
    let mut addr = start;

    on_event(WriteEvent::WriteStart);
    for (i, chunk) in data.chunks(transfer_size as usize).enumerate() {
        if i == 0 || map.sector_start(addr).is_ok_and(|s| s == addr) {
            conn.dfuse_set_address(addr)?;
            block = DFUSE_FIRST_BLOCK;
        }
        let written = conn.download(block, chunk)?;
        conn.poll_until_idle(DfuState::DownloadIdle)?;
        bytes_sent += written;
        addr = addr.wrapping_add(written as u32);
        block = block.wrapping_add(1);
        on_event(WriteEvent::WriteProcess {
            bytes_sent,
            expected_size,
        });
    }

    debug!("leaving DFU mode through {start:#010x}");
    conn.dfuse_set_address(start)?;
    conn.download(0, &[])?;
    let mut device_reset = false;
    match conn.poll_until_idle(DfuState::Manifest) {
        Ok(_) => {}
        Err(DfuError::DeviceLost) => {
            warn!("device disconnected while leaving DFU mode");
            device_reset = true;
        }
        Err(err) => warn!("device did not enter manifestation: {err}"),
    }

    let status = conn.last_status();
    if let Some(st) = status {
        on_event(WriteEvent::Verify(st));
    }
    on_event(WriteEvent::WriteEnd { bytes_sent });
    Ok(WriteOutcome {
        status,
        device_reset,
    })
}
