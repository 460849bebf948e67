//! CLI configuration, lockfile acquisition, and signal-driven shutdown —
//! the ambient process shell around the protocol core.

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("another instance is already running (lockfile held)")]
    AlreadyRunning,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

#[derive(Debug, Clone)]
pub enum DriveSlot {
    Disk { path: String, full13_force: bool },
    Pcl { path: String },
    Empty,
}

/// Parsed, validated CLI arguments. Built once at startup and handed by
/// reference to the dispatcher; never mutated by the protocol core.
#[derive(Debug, Parser)]
#[command(name = "sio2em", about = "Serial bus peripheral emulator")]
pub struct Cli {
    /// Use the command-asserted modem-control line to gate command reads.
    #[arg(short = 'm')]
    pub use_command_line: bool,

    /// Extended (debug-level) logging.
    #[arg(short = 'l')]
    pub extended_logging: bool,

    /// Serial device path.
    #[arg(short = 's', default_value = "/dev/ttyUSB0")]
    pub serial_device: String,

    /// Turbo hs-index (0..7).
    #[arg(short = 'b', default_value_t = 0)]
    pub turbo_index: u8,

    /// Bluetooth post-ACK delay multiplier.
    #[arg(short = 'd', default_value_t = 1)]
    pub bluetooth_delay: u32,

    /// Printer sink file path.
    #[arg(short = 'p')]
    pub printer_path: Option<String>,

    /// Translate ATASCII-like control codes in printer output.
    #[arg(short = 't')]
    pub printer_translate: bool,

    /// Flip the uppercase/lowercase requirement for PCL filenames.
    #[arg(short = 'u')]
    pub pcl_lowercase: bool,

    /// Block PERCOM get/set (force fixed enhanced-density geometry).
    #[arg(short = '8')]
    pub block_percom: bool,

    /// HS index used for turbo-speed negotiation.
    #[arg(short = 'i', default_value_t = 0)]
    pub hs_index: u8,

    /// Quartz frequency: pal, ntsc, ntscf, or an explicit Hz value.
    #[arg(short = 'q', default_value = "pal")]
    pub quartz: String,

    /// Non-linearity constant for the custom baud formula.
    #[arg(short = 'c', default_value_t = crate::serial::DEFAULT_NONLINEARITY)]
    pub nonlinearity: f64,

    /// Applies full13_force to every mounted disk drive slot.
    #[arg(short = 'f')]
    pub full13_force: bool,

    /// Delete-before-truncate on FOPEN write-create over an existing
    /// read-only target, rather than relying on host open-mode truncation.
    #[arg(long)]
    pub delete_before_truncate: bool,

    /// Drive slots: ATR image path, directory path, or `-` for empty.
    #[arg(value_name = "DRIVE")]
    pub drives: Vec<String>,
}

pub struct Config {
    pub use_command_line: bool,
    pub serial_device: String,
    pub turbo_index: u8,
    pub bluetooth_delay: u32,
    pub printer_path: Option<String>,
    pub printer_translate: bool,
    pub pcl_uppercase: bool,
    pub block_percom: bool,
    pub hs_index: u8,
    pub quartz_hz: f64,
    pub nonlinearity: f64,
    pub delete_before_truncate: bool,
    pub drives: Vec<DriveSlot>,
}

pub fn parse_quartz(spec: &str) -> f64 {
    match spec.to_ascii_lowercase().as_str() {
        "pal" => crate::serial::QUARTZ_PAL,
        "ntsc" => crate::serial::QUARTZ_NTSC,
        "ntscf" => crate::serial::QUARTZ_NTSC_FAKE,
        other => other.parse().unwrap_or(crate::serial::QUARTZ_PAL),
    }
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        let drives = cli
            .drives
            .iter()
            .map(|d| {
                if d == "-" {
                    DriveSlot::Empty
                } else if PathBuf::from(d).is_dir() {
                    DriveSlot::Pcl { path: d.clone() }
                } else {
                    DriveSlot::Disk { path: d.clone(), full13_force: cli.full13_force }
                }
            })
            .collect();
        Config {
            use_command_line: cli.use_command_line,
            serial_device: cli.serial_device,
            turbo_index: cli.turbo_index,
            bluetooth_delay: cli.bluetooth_delay,
            printer_path: cli.printer_path,
            printer_translate: cli.printer_translate,
            pcl_uppercase: !cli.pcl_lowercase,
            block_percom: cli.block_percom,
            hs_index: cli.hs_index,
            quartz_hz: parse_quartz(&cli.quartz),
            nonlinearity: cli.nonlinearity,
            delete_before_truncate: cli.delete_before_truncate,
            drives,
        }
    }
}

/// Advisory single-instance lockfile under a per-uid temp directory.
pub struct Lockfile {
    path: PathBuf,
}

impl Lockfile {
    pub fn acquire() -> Result<Self> {
        let uid = nix::unistd::Uid::current();
        let dir = std::env::temp_dir().join(format!("sio2em.{uid}"));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("sio2em.lock");
        match std::fs::OpenOptions::new().create_new(true).write(true).open(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(DaemonError::AlreadyRunning),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Installs a `ctrlc` handler that flips a shared flag; the dispatcher
/// loop observes it between frames, never mid-frame.
pub fn install_shutdown_handler() -> std::result::Result<Arc<AtomicBool>, ctrlc::Error> {
    let flag = Arc::new(AtomicBool::new(false));
    let flag_clone = Arc::clone(&flag);
    ctrlc::set_handler(move || {
        flag_clone.store(true, Ordering::Relaxed);
    })?;
    Ok(flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quartz_presets_resolve() {
        assert_eq!(parse_quartz("pal"), crate::serial::QUARTZ_PAL);
        assert_eq!(parse_quartz("NTSC"), crate::serial::QUARTZ_NTSC);
        assert!((parse_quartz("1000000") - 1_000_000.0).abs() < 1.0);
    }

    #[test]
    fn dash_drive_is_empty_slot() {
        let cli = Cli::parse_from(["sio2em", "-"]);
        let cfg = Config::from(cli);
        assert!(matches!(cfg.drives[0], DriveSlot::Empty));
    }
}
