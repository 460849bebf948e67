//! ATR sector-image container: mount, geometry inference, seek (with the
//! boot-sector anomaly), sector I/O, and format.

use crate::devtable::Percom;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use thiserror::Error;

pub const ATR_SIGNATURE: u16 = 0x0296;
pub const HEADER_LEN: u64 = 16;

#[derive(Debug, Error)]
pub enum AtrError {
    #[error("bad ATR signature {0:#06x}")]
    BadSignature(u16),
    #[error("unsupported sector size {0}")]
    BadSectorSize(u16),
    #[error("sector {sector} out of range (max {max})")]
    SectorOutOfRange { sector: u32, max: u32 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AtrError>;

/// A mounted ATR image: an open file handle plus the geometry derived from
/// (or written to) its header.
pub struct AtrImage {
    pub file: File,
    pub read_only: bool,
    pub bps: u16,
    pub maxsec: u32,
    pub percom: Percom,
    /// True when sectors 1-3 of a 256-bps image occupy full 256-byte slots
    /// rather than the usual 128-byte boot-sector slots.
    pub full13: bool,
}

/// One row of the density-inference ladder used by both the mount path and
/// `mkatr`.
#[derive(Debug, Clone, Copy)]
pub struct GeometryRow {
    pub sectors: u32,
    pub tracks: u8,
    pub spt: u16,
    pub heads: u8,
    pub flags: u8,
}

pub fn infer_geometry(sectors: u32, bps: u16) -> GeometryRow {
    match sectors {
        720 => GeometryRow { sectors, tracks: 40, spt: 18, heads: 0, flags: if bps == 256 { 0x04 } else { 0 } },
        1040 => GeometryRow { sectors, tracks: 40, spt: 26, heads: 0, flags: 0x04 },
        1440 => GeometryRow { sectors, tracks: 40, spt: 18, heads: 1, flags: if bps == 256 { 0x04 } else { 0 } },
        2002 => GeometryRow { sectors, tracks: 77, spt: 26, heads: 0, flags: 0x06 },
        2880 => GeometryRow { sectors, tracks: 80, spt: 18, heads: 1, flags: if bps == 256 { 0x04 } else { 0 } },
        4004 => GeometryRow { sectors, tracks: 77, spt: 26, heads: 1, flags: 0x06 },
        5760 => GeometryRow { sectors, tracks: 80, spt: 36, heads: 1, flags: if bps == 256 { 0x04 } else { 0 } },
        other => {
            let heads = (other >> 16) as u8;
            let flags = 0x04 | if other > 65535 { 0x08 } else { 0 };
            GeometryRow { sectors: other, tracks: 1, spt: (other & 0xffff) as u16, heads, flags }
        }
    }
}

/// `setup_status`: derives the dynamic geometry-related status bits from
/// the current PERCOM.
pub fn geometry_status_bits(percom: &Percom) -> u8 {
    use crate::devtable::Status;
    let mut bits = 0u8;
    if percom.bps() >= 256 {
        bits |= Status::BIT_256_BYTE_SECTORS;
    }
    let enhanced = percom.bps() == 128
        && percom.spt() == 26
        && percom.heads == 0
        && percom.tracks == 40
        && percom.flags & Percom::FLAG_MFM != 0;
    if enhanced {
        bits |= Status::BIT_ENHANCED_DENSITY;
    }
    bits
}

impl AtrImage {
    pub fn mount(path: &str) -> Result<Self> {
        let (file, read_only) = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => (f, false),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                (OpenOptions::new().read(true).open(path)?, true)
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_file(file, read_only)
    }

    fn from_file(mut file: File, read_only: bool) -> Result<Self> {
        let mut hdr = [0u8; HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut hdr)?;
        let sig = u16::from_le_bytes([hdr[0], hdr[1]]);
        if sig != ATR_SIGNATURE {
            return Err(AtrError::BadSignature(sig));
        }
        let paragraphs_lo = u16::from_le_bytes([hdr[2], hdr[3]]) as u32;
        let paragraphs_hi = hdr[6] as u32;
        let paragraphs = paragraphs_lo | (paragraphs_hi << 16);
        let bps = u16::from_le_bytes([hdr[4], hdr[5]]);
        if ![128u16, 256, 512, 1024].contains(&bps) {
            return Err(AtrError::BadSectorSize(bps));
        }
        let payload_size = paragraphs as u64 * 16;
        let full13 = bps == 256 && payload_size % bps as u64 == 0;

        let sectors = if bps == 256 {
            if full13 {
                (payload_size / 256) as u32
            } else {
                // first 3 sectors are 128 bytes, rest are 256
                let remainder = payload_size.saturating_sub(3 * 128);
                3 + (remainder / 256) as u32
            }
        } else {
            (payload_size / bps as u64) as u32
        };

        let row = infer_geometry(sectors, bps);
        let mut percom = Percom::default();
        percom.tracks = row.tracks;
        percom.step_rate = 1;
        percom.set_spt(row.spt);
        percom.heads = row.heads;
        percom.flags = row.flags;
        percom.set_bps(bps);

        Ok(Self { file, read_only, bps, maxsec: sectors, percom, full13 })
    }

    /// `atr_seek`: translates a 1-based sector number to a byte offset,
    /// honoring the boot-sector anomaly for 256-bps images.
    pub fn seek_offset(&self, sector: u32) -> u64 {
        seek_offset_for(sector, self.bps, self.full13)
    }

    fn validate_sector(&self, sector: u32) -> Result<()> {
        if sector == 0 || sector > self.maxsec {
            return Err(AtrError::SectorOutOfRange { sector, max: self.maxsec });
        }
        Ok(())
    }

    /// Reads one sector's worth of payload bytes. The boot sectors of a
    /// 256-bps compact image only carry 128 bytes.
    pub fn read_sector(&mut self, sector: u32) -> Result<Vec<u8>> {
        self.validate_sector(sector)?;
        let len = self.sector_len(sector);
        let offset = self.seek_offset(sector);
        self.file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        match self.file.read_exact(&mut buf) {
            Ok(()) => Ok(buf),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(vec![0u8; len]),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_sector(&mut self, sector: u32, data: &[u8]) -> Result<()> {
        self.validate_sector(sector)?;
        if self.read_only {
            return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only mount").into());
        }
        let offset = self.seek_offset(sector);
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    pub fn sector_len(&self, sector: u32) -> usize {
        if self.bps == 256 && sector <= 3 {
            128
        } else {
            self.bps as usize
        }
    }

    /// `format_disk`: truncates and rewrites the header, then zero-fills
    /// every sector.
    pub fn format(&mut self, force_full13: bool) -> Result<()> {
        if self.read_only {
            return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only mount").into());
        }
        self.full13 = force_full13 && self.bps == 256;
        let sectors = self.maxsec;
        let payload_size: u64 = if self.bps == 256 {
            if self.full13 {
                sectors as u64 * 256
            } else {
                3 * 128 + (sectors.saturating_sub(3)) as u64 * 256
            }
        } else {
            sectors as u64 * self.bps as u64
        };
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        write_header(&mut self.file, payload_size, self.bps)?;
        self.file.set_len(HEADER_LEN + payload_size)?;
        Ok(())
    }

    pub fn percom_set(&mut self, incoming: &Percom) -> Result<()> {
        if incoming.tracks == 1 {
            // "large"/linear special case: ACK without mutating geometry.
            return Ok(());
        }
        let bps = incoming.bps();
        if ![128u16, 256, 512, 1024].contains(&bps) {
            return Err(AtrError::BadSectorSize(bps));
        }
        let mfm = incoming.flags & Percom::FLAG_MFM != 0;
        if (incoming.spt() > 18 || bps >= 256) && !mfm {
            return Err(AtrError::BadSectorSize(bps));
        }
        self.percom = *incoming;
        self.bps = bps;
        Ok(())
    }
}

/// `atr_seek` offset formula, factored out for unit testing without a
/// mounted file.
pub fn seek_offset_for(sector: u32, bps: u16, full13: bool) -> u64 {
    if bps == 256 && sector <= 3 {
        HEADER_LEN + (sector as u64 - 1) * 128
    } else if bps == 256 && !full13 {
        HEADER_LEN + 384 + (sector as u64 - 4) * 256
    } else {
        HEADER_LEN + (sector as u64 - 1) * bps as u64
    }
}

pub fn write_header(file: &mut File, payload_size: u64, bps: u16) -> std::io::Result<()> {
    let paragraphs = payload_size / 16;
    let lo = (paragraphs & 0xffff) as u16;
    let hi = (paragraphs >> 16) as u8;
    let mut hdr = [0u8; HEADER_LEN as usize];
    hdr[0..2].copy_from_slice(&ATR_SIGNATURE.to_le_bytes());
    hdr[2..4].copy_from_slice(&lo.to_le_bytes());
    hdr[4..6].copy_from_slice(&bps.to_le_bytes());
    hdr[6] = hi;
    file.write_all(&hdr)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn geometry_inference_matches_canonical_table() {
        let row = infer_geometry(720, 128);
        assert_eq!((row.tracks, row.spt, row.heads), (40, 18, 0));
        let row = infer_geometry(1040, 128);
        assert_eq!((row.tracks, row.spt, row.heads, row.flags), (40, 26, 0, 0x04));
        let row = infer_geometry(2880, 256);
        assert_eq!((row.tracks, row.spt, row.heads), (80, 18, 1));
    }

    #[test]
    fn boot_sector_offsets_compact_mode() {
        assert_eq!(seek_offset_for(1, 256, false), 16);
        assert_eq!(seek_offset_for(2, 256, false), 144);
        assert_eq!(seek_offset_for(3, 256, false), 272);
        assert_eq!(seek_offset_for(4, 256, false), 400);
    }

    #[test]
    fn boot_sector_offsets_full_mode() {
        assert_eq!(seek_offset_for(1, 256, true), 16);
        assert_eq!(seek_offset_for(2, 256, true), 272);
        assert_eq!(seek_offset_for(3, 256, true), 528);
        assert_eq!(seek_offset_for(4, 256, true), 784);
    }

    #[test]
    fn mount_then_format_round_trips() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        {
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            write_header(&mut f, 720 * 128, 128).unwrap();
            f.set_len(16 + 720 * 128).unwrap();
        }
        let mut img = AtrImage::mount(&path).unwrap();
        assert_eq!(img.maxsec, 720);
        assert_eq!(img.bps, 128);
        img.format(false).unwrap();
        let bytes1 = std::fs::read(&path).unwrap();
        img.format(false).unwrap();
        let bytes2 = std::fs::read(&path).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn percom_set_rejects_bad_sector_size() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        {
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            write_header(&mut f, 720 * 128, 128).unwrap();
            f.set_len(16 + 720 * 128).unwrap();
        }
        let mut img = AtrImage::mount(&path).unwrap();
        let mut bad = Percom::default();
        bad.tracks = 40;
        bad.set_bps(300);
        assert!(img.percom_set(&bad).is_err());
    }
}
