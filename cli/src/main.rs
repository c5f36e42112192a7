use std::{
    fs,
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use parse_size::parse_size;

use dfu_engine::{
    DfuSession, DfuType, NusbTransport, SessionOptions, find_dfu_devices,
};
use detach::*;
use error::CliError;
use list::*;
use read::*;
use write::*;

mod detach;
mod error;
mod list;
mod read;
mod write;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(clap::Args, Clone, Copy)]
struct DeviceArgs {
    /// vendor ID (ex: "0483")
    #[clap(short, long, value_parser=hex_u16)]
    vendor: Option<u16>,
    /// product ID (ex: "df11")
    #[clap(short, long, value_parser=hex_u16)]
    product: Option<u16>,
    /// index of the DFU interface / alternate setting (see "list")
    #[clap(short, long)]
    alt: Option<usize>,
    /// read missing interface names from the first configuration
    #[clap(long)]
    force_names: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// list DFU devices
    List {
        #[command(flatten)]
        device: DeviceArgs,
    },
    /// read from device
    Read {
        /// file to write
        file: PathBuf,
        #[command(flatten)]
        device: DeviceArgs,
        /// start address (ex: 0x0800000)
        #[clap(short, long, value_parser=maybe_hex::<u32>)]
        start_address: Option<u32>,
        /// length (ex: 64K, 2MB)
        #[clap(short, long, value_parser=parse_length)]
        length: Option<usize>,
        /// override the transfer size of the device
        #[clap(short, long)]
        transfer_size: Option<u16>,
    },
    /// write to device
    Write {
        /// raw binary file to write
        file: PathBuf,
        #[command(flatten)]
        device: DeviceArgs,
        /// start address (ex: 0x0800000)
        #[clap(short, long, value_parser=maybe_hex::<u32>)]
        start_address: Option<u32>,
        /// override the transfer size of the device
        #[clap(short, long)]
        transfer_size: Option<u16>,
    },
    /// switch a runtime interface to DFU mode
    Detach {
        #[command(flatten)]
        device: DeviceArgs,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::List {
            device: DeviceArgs {
                vendor: None,
                product: None,
                alt: None,
                force_names: false,
            },
        }
    }
}

fn hex_u16(s: &str) -> Result<u16, String> {
    <u16>::from_str_radix(s, 16).map_err(|e| format!("{e}"))
}

fn parse_length(s: &str) -> Result<usize, String> {
    let len = parse_size(s).map_err(|e| format!("{e}"))?;
    len.try_into().map_err(|e| format!("{e}"))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::init();

    if let Err(err) = match &cli.command.unwrap_or_default() {
        Commands::List { device } => list_dfu_devices(device),
        Commands::Read {
            file,
            device,
            start_address,
            length,
            transfer_size,
        } => read_file(file, device, *start_address, *length, *transfer_size),
        Commands::Write {
            file,
            device,
            start_address,
            transfer_size,
        } => write_file(file, device, *start_address, *transfer_size),
        Commands::Detach { device } => detach_device(device),
    } {
        eprintln!("Error: {err}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn open_session(
    args: &DeviceArgs,
) -> Result<DfuSession<NusbTransport>, CliError> {
    let devices = find_dfu_devices(args.vendor, args.product)?;
    if devices.len() > 1 {
        return Err(CliError::ManyDFUDevices);
    }
    let Some(info) = devices.into_iter().next() else {
        return Err(CliError::NoDFUDevice);
    };

    let options = SessionOptions {
        force_interfaces_name: args.force_names,
    };
    let mut session = DfuSession::new(NusbTransport::open(info)?, options);
    session.init()?;
    Ok(session)
}

/// Connect to the interface given on the command line, or to the first one
/// mapping `start_address`.
fn connect(
    args: &DeviceArgs,
    start_address: Option<u32>,
) -> Result<DfuSession<NusbTransport>, CliError> {
    let mut session = open_session(args)?;
    let index = match (args.alt, start_address) {
        (Some(alt), _) => alt,
        (None, Some(addr)) => session
            .interfaces()
            .iter()
            .position(|intf| {
                intf.memory().is_some_and(|map| map.segment(addr).is_some())
            })
            .ok_or(CliError::NoInterface(addr))?,
        (None, None) => 0,
    };
    session.connect(index)?;
    if session.dfu_type() == DfuType::Dfuse {
        session.set_dfuse_start_address(start_address);
    }
    Ok(session)
}

pub(crate) fn print_progress(label: &str, done: usize, total: usize) {
    let total = total.max(1);
    let percentage = (100 * done) / total;
    let filled = ((60 * done) / total).min(60);
    print!(
        "\r  {label} {:3}% [{}]",
        percentage,
        "#".repeat(filled) + &" ".repeat(60 - filled)
    );
    let _ = io::stdout().flush();
}

fn read_file(
    file: &PathBuf,
    args: &DeviceArgs,
    start_address: Option<u32>,
    length: Option<usize>,
    transfer_size: Option<u16>,
) -> Result<(), CliError> {
    let mut session = connect(args, start_address)?;
    let data = upload(&mut session, start_address, length, transfer_size)?;
    fs::write(file, &data)?;
    println!("{} bytes written to {}", data.len(), file.display());
    Ok(())
}

fn write_file(
    file: &PathBuf,
    args: &DeviceArgs,
    start_address: Option<u32>,
    transfer_size: Option<u16>,
) -> Result<(), CliError> {
    let data = fs::read(file)?;
    let mut session = connect(args, start_address)?;
    download(&mut session, &data, transfer_size)?;
    Ok(())
}

fn detach_device(args: &DeviceArgs) -> Result<(), CliError> {
    let mut session = connect(args, None)?;
    detach(&mut session)
}
