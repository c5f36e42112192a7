use dfu_engine::{DfuSession, NusbTransport, WriteEvent};

use crate::{CliError, print_progress};

pub(crate) fn download(
    session: &mut DfuSession<NusbTransport>,
    data: &[u8],
    transfer_size: Option<u16>,
) -> Result<(), CliError> {
    let mut process = session.write(data);
    if let Some(transfer_size) = transfer_size {
        process = process.transfer_size(transfer_size);
    }
    process.run(|event| match event {
        WriteEvent::EraseStart => println!("Erasing..."),
        WriteEvent::EraseProcess {
            bytes_sent,
            expected_size,
        } => print_progress("Erasing", bytes_sent, expected_size),
        WriteEvent::EraseEnd | WriteEvent::WriteEnd { .. } => println!(),
        WriteEvent::WriteStart => println!("Flashing..."),
        WriteEvent::WriteProcess {
            bytes_sent,
            expected_size,
        } => print_progress("Flashing", bytes_sent, expected_size),
        WriteEvent::Verify(status) => {
            println!("Device status: {} ({})", status.status, status.state)
        }
        WriteEvent::Error(_) => println!(" ❌"),
        WriteEvent::End => println!("Done"),
    })?;

    if !session.is_connected() {
        println!("Device was reset");
    }
    Ok(())
}
