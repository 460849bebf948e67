//! Line speed control and modem-control-line sensing for the serial bus.
//!
//! The protocol core never touches `termios` directly; it talks to a
//! [`LineSpeed`] trait object, so the desync/turbo logic in
//! [`crate::dispatcher`] is testable without a real tty.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("failed to open serial device {path}: {source}")]
    Open { path: String, source: io::Error },
    #[error("termios error: {0}")]
    Termios(#[from] nix::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;

/// One entry in the turbo speed ladder: an hs-index the host selects via
/// PERCOM/HSINDEX negotiation, and the nominal baud rate it maps to.
#[derive(Debug, Clone, Copy)]
pub struct SpeedEntry {
    pub hs_index: u8,
    pub baud: u32,
}

/// Computes the custom POKEY-derived baud for a given hs index.
///
/// `baud = round(quartz / (2 * (index + k)))`, where `k` is a small
/// non-linearity constant calibrated against the reference hardware.
pub fn custom_baud(quartz_hz: f64, k: f64, index: u8) -> u32 {
    (quartz_hz / (2.0 * (index as f64 + k))).round() as u32
}

pub const QUARTZ_PAL: f64 = 1_773_447.0;
pub const QUARTZ_NTSC: f64 = 1_789_790.0;
pub const QUARTZ_NTSC_FAKE: f64 = 1_790_000.0;
pub const DEFAULT_NONLINEARITY: f64 = 7.1861;
pub const STANDARD_BAUD: u32 = 19200;

/// Abstracts "set the line to this speed" / "sense the command line" so the
/// bus dispatcher can be driven by a fake in tests.
pub trait LineSpeed {
    fn set_baud(&mut self, baud: u32) -> Result<()>;
    /// Reads the modem-control input bits (`TIOCMGET`).
    fn read_modem_bits(&mut self) -> Result<i32>;
    fn flush(&mut self) -> Result<()>;
}

mod ioctl {
    use nix::{ioctl_read_bad, libc};
    ioctl_read_bad!(tiocmget, libc::TIOCMGET, libc::c_int);
}

pub struct TermiosLine {
    file: File,
}

impl TermiosLine {
    pub fn open(path: &str) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| SerialError::Open { path: path.to_string(), source })?;
        let fd = file.as_raw_fd();
        let mut settings = nix::sys::termios::tcgetattr(fd)?;
        nix::sys::termios::cfmakeraw(&mut settings);
        settings.control_flags |= nix::sys::termios::ControlFlags::CLOCAL
            | nix::sys::termios::ControlFlags::CREAD;
        nix::sys::termios::cfsetspeed(&mut settings, nix::sys::termios::BaudRate::B19200)?;
        settings.control_chars[nix::sys::termios::SpecialCharacterIndices::VMIN as usize] = 1;
        settings.control_chars[nix::sys::termios::SpecialCharacterIndices::VTIME as usize] = 0;
        nix::sys::termios::tcsetattr(fd, nix::sys::termios::SetArg::TCSANOW, &settings)?;
        Ok(Self { file })
    }

    fn fd(&self) -> i32 {
        self.file.as_raw_fd()
    }
}

impl LineSpeed for TermiosLine {
    fn set_baud(&mut self, baud: u32) -> Result<()> {
        let fd = self.fd();
        let mut settings = nix::sys::termios::tcgetattr(fd)?;
        if let Some(rate) = standard_rate(baud) {
            nix::sys::termios::cfsetspeed(&mut settings, rate)?;
        } else {
            // Custom/turbo rate: fall back to the nearest enumerated POSIX
            // rate so the line stays configured; platform-specific custom
            // divisor ioctls are out of scope here.
            nix::sys::termios::cfsetspeed(&mut settings, nix::sys::termios::BaudRate::B38400)?;
        }
        nix::sys::termios::tcsetattr(fd, nix::sys::termios::SetArg::TCSANOW, &settings)?;
        Ok(())
    }

    fn read_modem_bits(&mut self) -> Result<i32> {
        let mut bits: i32 = 0;
        unsafe { ioctl::tiocmget(self.fd(), &mut bits)? };
        Ok(bits)
    }

    fn flush(&mut self) -> Result<()> {
        nix::sys::termios::tcflush(self.fd(), nix::sys::termios::FlushArg::TCIOFLUSH)?;
        Ok(())
    }
}

fn standard_rate(baud: u32) -> Option<nix::sys::termios::BaudRate> {
    use nix::sys::termios::BaudRate::*;
    Some(match baud {
        9600 => B9600,
        19200 => B19200,
        38400 => B38400,
        57600 => B57600,
        115200 => B115200,
        _ => return None,
    })
}

/// Tracks the current turbo state; toggled by the dispatcher after
/// repeated desync failures.
pub struct FlowController<L: LineSpeed> {
    line: L,
    turbo: bool,
    hs_index: u8,
    quartz_hz: f64,
    nonlinearity: f64,
}

impl<L: LineSpeed> FlowController<L> {
    pub fn new(line: L, hs_index: u8, quartz_hz: f64, nonlinearity: f64) -> Self {
        Self { line, turbo: false, hs_index, quartz_hz, nonlinearity }
    }

    pub fn is_turbo(&self) -> bool {
        self.turbo
    }

    /// Switches speed to the opposite of the current mode and applies it
    /// to the line.
    pub fn toggle(&mut self) -> Result<()> {
        self.turbo = !self.turbo;
        let baud = if self.turbo {
            custom_baud(self.quartz_hz, self.nonlinearity, self.hs_index)
        } else {
            STANDARD_BAUD
        };
        self.line.set_baud(baud)
    }

    pub fn line_mut(&mut self) -> &mut L {
        &mut self.line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeLine {
        baud: u32,
        modem_bits: i32,
        flushed: u32,
    }

    impl LineSpeed for FakeLine {
        fn set_baud(&mut self, baud: u32) -> Result<()> {
            self.baud = baud;
            Ok(())
        }
        fn read_modem_bits(&mut self) -> Result<i32> {
            Ok(self.modem_bits)
        }
        fn flush(&mut self) -> Result<()> {
            self.flushed += 1;
            Ok(())
        }
    }

    #[test]
    fn custom_baud_matches_pokey_formula() {
        let baud = custom_baud(QUARTZ_PAL, DEFAULT_NONLINEARITY, 0);
        assert!((baud as i64 - 123_623).abs() < 50);
    }

    #[test]
    fn toggle_flips_turbo_and_applies_baud() {
        let line = FakeLine { baud: STANDARD_BAUD, modem_bits: 0, flushed: 0 };
        let mut fc = FlowController::new(line, 0, QUARTZ_PAL, DEFAULT_NONLINEARITY);
        assert!(!fc.is_turbo());
        fc.toggle().unwrap();
        assert!(fc.is_turbo());
        assert_ne!(fc.line_mut().baud, STANDARD_BAUD);
        fc.toggle().unwrap();
        assert!(!fc.is_turbo());
        assert_eq!(fc.line_mut().baud, STANDARD_BAUD);
    }
}
