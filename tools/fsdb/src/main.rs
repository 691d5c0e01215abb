//! `fsdb [-p] <device>` — interactive inspection shell over a raw
//! filesystem image. Read-only: no command in this shell ever writes a
//! sector.

use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use block_device::{BlockDevice, FileBlockDevice, SECTOR_SIZE};
use clap::Parser;
use vfs::format::{DirEntry, FileHeader, FreeNode, Superblock, DIRENT_SIZE, HEADER_SIZE};

/// Interactive inspection shell for a VSTa-style filesystem image.
#[derive(Parser)]
#[command(name = "fsdb", about = "Interactively inspect a VSTa-style filesystem image")]
struct Args {
    /// Open the device read-only even if the underlying file permits writes.
    #[arg(short = 'p', long)]
    physical: bool,

    /// Path to the device or image file to inspect.
    device: String,
}

fn read_sector(device: &dyn BlockDevice, sector: u32) -> Option<[u8; SECTOR_SIZE]> {
    let mut buf = [0u8; SECTOR_SIZE];
    match device.read_sectors(sector, 1, &mut buf) {
        Ok(()) => Some(buf),
        Err(e) => {
            println!("sector {sector}: {e}");
            None
        }
    }
}

fn cmd_fs(device: &dyn BlockDevice) {
    let Some(raw) = read_sector(device, vfs::format::SUPER_SEC) else { return };
    let sb = Superblock::decode(&raw);
    println!("magic:              {:#010x}", sb.magic);
    println!("total_sectors:      {}", sb.total_sectors);
    println!("extent_growth_quantum: {}", sb.extent_growth_quantum);
    println!("free_list_head:     {}", sb.free_list_head);
    println!("reclaim entries:    {}", sb.reclaim.len());
    for e in &sb.reclaim {
        println!("  {} + {}", e.start, e.length);
    }
}

fn cmd_free(device: &dyn BlockDevice, sector: u32) {
    let Some(raw) = read_sector(device, sector) else { return };
    let node = FreeNode::decode(&raw);
    println!("next: {}", node.next);
    for e in &node.entries {
        println!("  {} + {}", e.start, e.length);
    }
}

fn cmd_file(device: &dyn BlockDevice, sector: u32) {
    let Some(raw) = read_sector(device, sector) else { return };
    let hdr = FileHeader::decode(&raw[..HEADER_SIZE]);
    println!("kind:         {}", hdr.kind);
    println!("nlink:        {}", hdr.nlink);
    println!("owner:        {}", hdr.owner);
    println!("byte_length:  {}", hdr.byte_length);
    println!("revision:     {}", hdr.revision);
    println!("prev_version: {}", hdr.prev_version);
    println!("ctime:        {}", hdr.ctime);
    println!("mtime:        {}", hdr.mtime);
    println!("extents:");
    for e in &hdr.blks {
        println!("  {} + {}", e.start, e.length);
    }
}

fn dir_entry_at(device: &dyn BlockDevice, hdr: &FileHeader, idx: u32) -> Option<DirEntry> {
    let pos = HEADER_SIZE as u64 + idx as u64 * DIRENT_SIZE as u64;
    let mut sector_of_pos = (pos / SECTOR_SIZE as u64) as u32;
    let byte_off = (pos % SECTOR_SIZE as u64) as usize;
    for e in &hdr.blks {
        if sector_of_pos < e.length {
            let raw = read_sector(device, e.start + sector_of_pos)?;
            return Some(DirEntry::decode(&raw[byte_off..byte_off + DIRENT_SIZE]));
        }
        sector_of_pos -= e.length;
    }
    None
}

fn cmd_dir(device: &dyn BlockDevice, sector: u32, only_idx: Option<u32>) {
    let Some(raw) = read_sector(device, sector) else { return };
    let hdr = FileHeader::decode(&raw[..HEADER_SIZE]);
    if hdr.byte_length < HEADER_SIZE as u32 {
        println!("sector {sector}: byte_length smaller than the header");
        return;
    }
    let count = (hdr.byte_length - HEADER_SIZE as u32) / DIRENT_SIZE as u32;
    for idx in only_idx.map(|i| i..i + 1).unwrap_or(0..count) {
        match dir_entry_at(device, &hdr, idx) {
            Some(e) if e.is_end() => println!("[{idx}] (end)"),
            Some(e) if e.is_tomb() => println!("[{idx}] (tomb) -> {}", e.start),
            Some(e) => println!("[{idx}] {:?} -> {}", e.name_str(), e.start),
            None => println!("[{idx}] <out of range>"),
        }
    }
}

fn cmd_sec(device: &dyn BlockDevice, sector: u32) {
    let Some(raw) = read_sector(device, sector) else { return };
    for (row, chunk) in raw.chunks(16).enumerate() {
        print!("{:08x}  ", row * 16);
        for b in chunk {
            print!("{b:02x} ");
        }
        println!();
    }
}

fn run(device: &dyn BlockDevice) {
    let stdin = io::stdin();
    loop {
        print!("fsdb> ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            [] => continue,
            ["quit"] | ["q"] => break,
            ["fs"] => cmd_fs(device),
            ["free", sec] => match sec.parse() {
                Ok(s) => cmd_free(device, s),
                Err(_) => println!("bad sector number {sec:?}"),
            },
            ["dir", sec] => match sec.parse() {
                Ok(s) => cmd_dir(device, s, None),
                Err(_) => println!("bad sector number {sec:?}"),
            },
            ["dir", sec, idx] => match (sec.parse(), idx.parse()) {
                (Ok(s), Ok(i)) => cmd_dir(device, s, Some(i)),
                _ => println!("bad sector/index"),
            },
            ["file", sec] => match sec.parse() {
                Ok(s) => cmd_file(device, s),
                Err(_) => println!("bad sector number {sec:?}"),
            },
            ["sec", sec] => match sec.parse() {
                Ok(s) => cmd_sec(device, s),
                Err(_) => println!("bad sector number {sec:?}"),
            },
            _ => println!("commands: fs, free <sec>, dir <sec> [idx], file <sec>, sec <sec>, quit"),
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    let _ = args.physical; // read-only regardless; kept for CLI parity with the original tool.

    let device = match FileBlockDevice::open(&args.device) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("fsdb: cannot open {}: {e}", args.device);
            return ExitCode::FAILURE;
        }
    };
    run(&device);
    ExitCode::SUCCESS
}
