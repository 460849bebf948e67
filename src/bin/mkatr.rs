//! Image-creation tool: builds a fresh ATR container from a density
//! preset or explicit geometry.

use clap::Parser;
use sio2em::atr::{infer_geometry, write_header, HEADER_LEN};
use std::io::{Seek, SeekFrom, Write};

#[derive(Debug, Parser)]
#[command(name = "mkatr", about = "Create an ATR disk image")]
struct Cli {
    /// Density preset: 90k, 130k, 180k, 360k, 720k, 1440k, 16m, 32m,
    /// or ss/sd, ss/ed, ss/dd, ds/dd, ds/qd, ds/hd.
    #[arg(short = 'd')]
    density: Option<String>,

    #[arg(short = 't')]
    tracks: Option<u8>,
    #[arg(short = 's')]
    spt: Option<u16>,
    #[arg(short = 'h')]
    heads: Option<u8>,
    #[arg(short = 'b')]
    bps: Option<u16>,

    /// Store boot sectors 1-3 as full 256-byte slots instead of compact
    /// 128-byte slots (256-bps images only).
    #[arg(short = 'f')]
    full13_force: bool,

    file: String,
}

fn density_sectors_bps(density: &str) -> Option<(u32, u16)> {
    Some(match density.to_ascii_lowercase().as_str() {
        "90k" | "ss/sd" => (720, 128),
        "130k" | "ss/ed" => (1040, 128),
        "180k" | "ss/dd" => (720, 256),
        "360k" | "ds/dd" => (1440, 256),
        "720k" | "ds/qd" => (2880, 256),
        "1440k" | "ds/hd" => (5760, 256),
        "16m" => (720 * 16, 256),
        "32m" => (720 * 32, 256),
        _ => return None,
    })
}

fn main() {
    let cli = Cli::parse();

    let (sectors, bps) = if let Some(density) = &cli.density {
        match density_sectors_bps(density) {
            Some(v) => v,
            None => {
                eprintln!("unknown density {density}");
                std::process::exit(1);
            }
        }
    } else {
        let tracks = cli.tracks.unwrap_or(40) as u32;
        let spt = cli.spt.unwrap_or(18) as u32;
        let heads = cli.heads.unwrap_or(0).max(1) as u32;
        let bps = cli.bps.unwrap_or(128);
        (tracks * spt * heads, bps)
    };

    let row = infer_geometry(sectors, bps);
    let full13 = cli.full13_force && bps == 256;
    let payload_size: u64 = if bps == 256 {
        if full13 {
            sectors as u64 * 256
        } else {
            3 * 128 + (sectors.saturating_sub(3)) as u64 * 256
        }
    } else {
        sectors as u64 * bps as u64
    };

    let mut file = match std::fs::OpenOptions::new().create(true).write(true).truncate(true).open(&cli.file) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("failed to create {}: {e}", cli.file);
            std::process::exit(1);
        }
    };

    if let Err(e) = write_header(&mut file, payload_size, bps) {
        eprintln!("failed to write header: {e}");
        std::process::exit(1);
    }
    let zeros = vec![0u8; payload_size as usize];
    if let Err(e) = file.write_all(&zeros) {
        eprintln!("failed to write payload: {e}");
        std::process::exit(1);
    }
    let _ = file.seek(SeekFrom::Start(HEADER_LEN));

    println!(
        "{}: {} sectors, {} bytes/sector, {} tracks, {} heads",
        cli.file, sectors, bps, row.tracks, row.heads
    );
}
