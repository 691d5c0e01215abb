//! `fsck [--yes] <device>` — interactive consistency check and repair.

use std::io::{self, Write};
use std::process::ExitCode;

use block_device::{BlockDevice, FileBlockDevice};
use clap::Parser;
use vfs::fsck::{check, AlwaysYes, Prompter};

/// Check (and, with consent, repair) a VSTa-style filesystem image.
#[derive(Parser)]
#[command(name = "fsck", about = "Check and repair a VSTa-style filesystem")]
struct Args {
    /// Path to the device or image file to check.
    device: String,

    /// Accept every proposed repair without prompting.
    #[arg(long)]
    yes: bool,
}

/// Prompts on stdin/stdout for each proposed repair.
struct Interactive;

impl Prompter for Interactive {
    fn confirm(&mut self, description: &str) -> bool {
        print!("fsck: {description} [y/N] ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        if io::stdin().read_line(&mut line).is_err() {
            return false;
        }
        matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let device = match FileBlockDevice::open(&args.device) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("fsck: cannot open {}: {e}", args.device);
            return ExitCode::FAILURE;
        }
    };
    let nsectors = device.total_sectors();

    let report = if args.yes {
        check(&device, nsectors, &mut AlwaysYes)
    } else {
        check(&device, nsectors, &mut Interactive)
    };

    match report {
        Ok(report) => {
            println!(
                "fsck: {} error(s) found, {} fixed, {} sector(s) reclaimed",
                report.errors_found, report.errors_fixed, report.lost_sectors_reclaimed
            );
            if report.errors_found == report.errors_fixed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("fsck: {e}");
            ExitCode::FAILURE
        }
    }
}
