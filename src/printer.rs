//! Printer responder: a write-only sink with an optional charset
//! translation for the platform's ATASCII-like control codes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrinterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PrinterError>;

/// Frame size implied by the write command's aux1 byte.
pub fn frame_size(aux1: u8) -> usize {
    match aux1 {
        b'D' => 0x14,
        b'S' => 0x1d,
        _ => 0x28,
    }
}

/// Translates one platform control byte to an ASCII approximation. Bytes
/// with no special meaning pass through unchanged.
pub fn translate_byte(b: u8) -> u8 {
    match b {
        0x9b => b'\n',  // EOL
        0x7d => b'.',   // clear
        0x7e => 0x08,   // backspace
        0x7f => b'\t',  // tab
        0xfd => 0x07,   // bell
        0x9c => 0x0c,   // form feed-ish
        other => other,
    }
}

pub struct PrinterSink {
    file: File,
    translate: bool,
}

impl PrinterSink {
    pub fn open(path: &str, translate: bool) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file, translate })
    }

    pub fn write_frame(&mut self, data: &[u8]) -> Result<()> {
        if self.translate {
            let translated: Vec<u8> = data.iter().copied().map(translate_byte).collect();
            self.file.write_all(&translated)?;
        } else {
            self.file.write_all(data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_selects_by_aux1() {
        assert_eq!(frame_size(b'D'), 0x14);
        assert_eq!(frame_size(b'S'), 0x1d);
        assert_eq!(frame_size(b'X'), 0x28);
    }

    #[test]
    fn translate_maps_eol_to_newline() {
        assert_eq!(translate_byte(0x9b), b'\n');
        assert_eq!(translate_byte(b'A'), b'A');
    }

    #[test]
    fn write_frame_appends_to_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        let mut sink = PrinterSink::open(&path, true).unwrap();
        sink.write_frame(b"HELLO\x9b").unwrap();
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"HELLO\n");
    }
}
