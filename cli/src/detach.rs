use std::time::{Duration, Instant};

use dfu_engine::{DfuSession, NusbTransport, Transport, find_dfu_devices};
use log::debug;

use crate::CliError;

pub(crate) fn detach(
    session: &mut DfuSession<NusbTransport>,
) -> Result<(), CliError> {
    let Some(properties) = session.properties() else {
        return Err(CliError::NoDFUDevice);
    };
    let info = session.transport().device_info().clone();

    println!("Detaching...");
    session.detach()?;
    let timeout = Duration::from_millis(properties.detach_timeout.into());
    if properties.will_detach {
        let timeout = timeout.max(Duration::from_secs(1));
        if let Err(err) = session.wait_disconnected(timeout) {
            debug!("device still attached: {err}");
        }
    } else {
        println!("Resetting...");
        if let Err(err) = session.transport_mut().reset() {
            debug!("reset failed: {err}");
        }
    }

    println!("Waiting for device to reconnect...");
    let start = Instant::now();
    loop {
        let devices =
            find_dfu_devices(Some(info.vendor_id()), Some(info.product_id()))?;
        if !devices.is_empty() {
            println!("Reconnected in {:?}", start.elapsed());
            return Ok(());
        }
        if start.elapsed() >= Duration::from_secs(30) {
            return Err(CliError::NoDFUDevice);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
