use dfu_engine::{
    DfuSession, InterfaceSetting, MemorySegment, NusbTransport,
    SessionOptions, find_dfu_devices,
};

use crate::{CliError, DeviceArgs};

pub(crate) fn list_dfu_devices(args: &DeviceArgs) -> Result<(), CliError> {
    let devices = find_dfu_devices(args.vendor, args.product)?;
    if devices.is_empty() {
        println!("No DFU device found");
        return Ok(());
    }
    let options = SessionOptions {
        force_interfaces_name: args.force_names,
    };
    for info in devices {
        println!(
            "Bus {} Device {:03}: ID {:04x}:{:04x}",
            info.bus_id(),
            info.device_address(),
            info.vendor_id(),
            info.product_id(),
        );
        let mut session = DfuSession::new(NusbTransport::open(info)?, options);
        session.init()?;
        for (index, interface) in session.interfaces().iter().enumerate() {
            print_interface(index, interface);
        }
    }
    Ok(())
}

fn print_interface(index: usize, interface: &InterfaceSetting) {
    println!(
        "  [{index}] {} (cfg={}, intf={}, alt={}, {})",
        interface.name().unwrap_or("<unnamed>"),
        interface.configuration(),
        interface.interface(),
        interface.alternate(),
        if interface.protocol() == 1 { "runtime" } else { "dfu" },
    );
    let Some(map) = interface.memory() else {
        return;
    };

    // consecutive sectors with the same geometry are printed once
    let mut segments = map.segments.iter().peekable();
    while let Some(first) = segments.next() {
        let mut count = 1;
        while segments.next_if(|s| same_kind(first, s)).is_some() {
            count += 1;
        }
        print_segment("    ", first, count);
    }
}

fn same_kind(a: &MemorySegment, b: &MemorySegment) -> bool {
    a.sector_size() == b.sector_size()
        && a.readable() == b.readable()
        && a.erasable() == b.erasable()
        && a.writable() == b.writable()
}

fn print_segment(prefix: &str, segment: &MemorySegment, count: usize) {
    let mut sector_size = segment.sector_size();
    let size_char = if sector_size >= 1024 {
        sector_size /= 1024;
        "K"
    } else {
        " "
    };
    println!(
        "{}0x{:08X} {:3} sectors of {:4}{} bytes ({}{}{})",
        prefix,
        segment.start_addr(),
        count,
        sector_size,
        size_char,
        if segment.readable() { "r" } else { "" },
        if segment.writable() { "w" } else { "" },
        if segment.erasable() { "e" } else { "" },
    );
}
