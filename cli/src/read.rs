use dfu_engine::{DfuError, DfuSession, DfuType, NusbTransport, ReadEvent};

use crate::{CliError, print_progress};

pub(crate) fn upload(
    session: &mut DfuSession<NusbTransport>,
    start_address: Option<u32>,
    length: Option<usize>,
    transfer_size: Option<u16>,
) -> Result<Vec<u8>, CliError> {
    if session.dfu_type() == DfuType::Dfu {
        return read_blocks(session, length, transfer_size);
    }

    let start = match start_address.or(session.dfuse_start_address()) {
        Some(addr) => addr,
        None => session
            .dfuse_first_writable_segment()
            .map(|s| s.start_addr())
            .ok_or(DfuError::UnsupportedOperation("empty memory map"))?,
    };
    let total = length.unwrap_or(session.dfuse_max_read_size(start) as usize);

    // reads stop at segment boundaries
    let mut data = Vec::with_capacity(total);
    while data.len() < total {
        let addr = start + data.len() as u32;
        let available = session.dfuse_max_read_size(addr) as usize;
        if available == 0 {
            return Err(DfuError::AddressOutOfRange { address: addr }.into());
        }
        session.set_dfuse_start_address(Some(addr));
        let done = data.len();
        let size = (total - done).min(available);
        let mut process = session.read(Some(size));
        if let Some(transfer_size) = transfer_size {
            process = process.transfer_size(transfer_size);
        }
        let chunk = process.run(|event| match event {
            ReadEvent::Process { done: n, .. } => {
                print_progress("Reading", done + n, total)
            }
            ReadEvent::Error(_) => println!(" ❌"),
            ReadEvent::End(_) => {}
        })?;
        data.extend(chunk);
    }
    println!();
    Ok(data)
}

fn read_blocks(
    session: &mut DfuSession<NusbTransport>,
    length: Option<usize>,
    transfer_size: Option<u16>,
) -> Result<Vec<u8>, CliError> {
    let mut process = session.read(length);
    if let Some(transfer_size) = transfer_size {
        process = process.transfer_size(transfer_size);
    }
    let data = process.run(|event| match event {
        ReadEvent::Process {
            done,
            total: Some(total),
        } => print_progress("Reading", done, total),
        ReadEvent::Process { done, total: None } => {
            print!("\r  Reading {done} bytes");
            let _ = std::io::Write::flush(&mut std::io::stdout());
        }
        ReadEvent::Error(_) => println!(" ❌"),
        ReadEvent::End(_) => {}
    })?;
    println!();
    Ok(data)
}
