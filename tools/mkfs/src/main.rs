//! `mkfs <device> <nsectors>` — write a blank filesystem.

use std::process::ExitCode;

use block_device::FileBlockDevice;
use clap::Parser;

/// Write a blank VSTa-style filesystem onto `device`.
#[derive(Parser)]
#[command(name = "mkfs", about = "Write a blank VSTa-style filesystem onto a device")]
struct Args {
    /// Path to the device or image file to create/overwrite.
    device: String,

    /// Total number of 512-byte sectors the volume should hold.
    nsectors: u32,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let device = match FileBlockDevice::create(&args.device, args.nsectors) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("mkfs: cannot create {}: {e}", args.device);
            return ExitCode::FAILURE;
        }
    };

    match vfs::mkfs::format_device(&device, args.nsectors) {
        Ok(()) => {
            println!("mkfs: wrote {} sectors to {}", args.nsectors, args.device);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("mkfs: {e}");
            ExitCode::FAILURE
        }
    }
}
