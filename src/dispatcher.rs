//! Top-level bus dispatcher: desync recovery, priority routing between
//! disk/PCL/printer/clock, and ACK/NAK/COMPLETE/ERROR sequencing.

use crate::atr::AtrImage;
use crate::clock::rotate_time_byte;
use crate::devtable::{DeviceTable, ParBlock, UnitBinding};
use crate::frame::{self, handshake, CommandFrame, Transport};
use crate::pcl::{self, Mount, PclServer};
use crate::printer::PrinterSink;
use crate::serial::{FlowController, LineSpeed};
use log::{debug, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DISK_DEVICE_BASE: u8 = 0x30;
pub const PRINTER_DEVICE: u8 = 0x40;
pub const CLOCK_DEVICE: u8 = 0x45;
pub const DEFAULT_PCL_DEVICE: u8 = 0x6f;
pub const CLOCK_COMMAND: u8 = 0x93;
pub const MAX_DESYNC_RETRIES: u32 = 4;

/// Per-phase delay constants, scaled by the user-tunable Bluetooth delay
/// multiplier. Computed once from `Config`, never recomputed per call.
pub struct Delays {
    pub ack: Duration,
    pub post_ack: Duration,
    pub complete: Duration,
}

impl Delays {
    pub fn new(bluetooth_multiplier: u32) -> Self {
        let mult = bluetooth_multiplier.max(1) as u32;
        Self {
            ack: Duration::from_micros(850),
            post_ack: Duration::from_micros(250 * mult as u64),
            complete: Duration::from_micros(250),
        }
    }

    pub fn sleep_ack(&self) {
        std::thread::sleep(self.ack);
    }
    pub fn sleep_post_ack(&self) {
        std::thread::sleep(self.post_ack);
    }
    pub fn sleep_complete(&self) {
        std::thread::sleep(self.complete);
    }
}

pub struct Dispatcher<T: Transport, L: LineSpeed> {
    pub transport: T,
    pub devices: DeviceTable,
    pub pcl: PclServer,
    pub pcl_mounts: Vec<Option<Mount>>,
    pub printer: Option<PrinterSink>,
    pub flow: FlowController<L>,
    pub delays: Delays,
    pub pcl_device: u8,
    /// `-8`: force NAK on PERCOM get/set, keeping format's fallback geometry.
    pub block_percom: bool,
    /// Single "last command letter processed" field shared across every
    /// PCL unit, mirroring the reference implementation's `old_ccom` static.
    last_pcl_command_letter: Option<u8>,
}

impl<T: Transport, L: LineSpeed> Dispatcher<T, L> {
    pub fn new(transport: T, flow: FlowController<L>, delays: Delays) -> Self {
        let mut pcl_mounts = Vec::with_capacity(16);
        pcl_mounts.resize_with(16, || None);
        Self {
            transport,
            devices: DeviceTable::new(),
            pcl: PclServer::new(),
            pcl_mounts,
            printer: None,
            flow,
            delays,
            pcl_device: DEFAULT_PCL_DEVICE,
            block_percom: false,
            last_pcl_command_letter: None,
        }
    }

    pub fn mount_disk(&mut self, unit: usize, image: AtrImage) {
        if let Some(rec) = self.devices.unit_mut(unit) {
            rec.bps = image.bps;
            rec.maxsec = image.maxsec;
            rec.percom = image.percom;
            rec.binding = UnitBinding::Disk { file: image.file, full13: image.full13, full13_force: false };
        }
    }

    pub fn mount_pcl(&mut self, unit: usize, mount: Mount) {
        if unit < self.pcl_mounts.len() {
            self.pcl_mounts[unit] = Some(mount);
        }
        if let Some(rec) = self.devices.unit_mut(unit) {
            rec.binding = UnitBinding::Pcl { root: std::path::PathBuf::new(), cwd: String::new() };
        }
    }

    pub fn has_any_pcl_mount(&self) -> bool {
        self.pcl_mounts.iter().any(|m| m.is_some())
    }

    /// The bus dispatcher's main loop. Runs until `shutdown` is observed
    /// set between two command frames.
    pub fn run(&mut self, shutdown: &Arc<AtomicBool>) -> std::io::Result<()> {
        let mut retries = 0u32;
        let mut window = [0u8; 5];
        loop {
            if shutdown.load(Ordering::Relaxed) {
                debug!("shutdown observed, closing resources");
                return Ok(());
            }
            match frame::read_command_frame(&mut self.transport) {
                Ok(cmd) => {
                    retries = 0;
                    self.handle_command(cmd);
                }
                Err(e) => {
                    warn!("desync: {e}");
                    retries += 1;
                    if retries > MAX_DESYNC_RETRIES {
                        warn!("desync retries exhausted, toggling turbo");
                        let _ = self.flow.toggle();
                        retries = 0;
                        continue;
                    }
                    match frame::shift_and_peek(&mut self.transport, &mut window) {
                        Ok(_) => {}
                        Err(e) => warn!("desync peek failed: {e}"),
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: CommandFrame) {
        trace!("frame: {:02x} {:02x} {:02x} {:02x}", cmd.device, cmd.command, cmd.aux1, cmd.aux2);

        if self.has_any_pcl_mount() && cmd.device == self.pcl_device {
            self.handle_pcl(cmd);
            return;
        }

        let class = cmd.device & 0xf0;
        match class {
            c if c == DISK_DEVICE_BASE => self.handle_disk(cmd),
            PRINTER_DEVICE => self.handle_printer(cmd),
            CLOCK_DEVICE if cmd.command == CLOCK_COMMAND => self.handle_clock(cmd),
            _ => {
                let _ = frame::write_byte(&mut self.transport, handshake::NAK);
            }
        }
    }

    fn unit_index(device: u8) -> usize {
        (device & 0x0f) as usize
    }

    fn handle_disk(&mut self, cmd: CommandFrame) {
        let unit = Self::unit_index(cmd.device);
        if cmd.command >= 0x80 {
            let _ = frame::write_byte(&mut self.transport, handshake::NAK);
            return;
        }
        if self.block_percom && (cmd.command == b'N' || cmd.command == b'O') {
            let _ = frame::write_byte(&mut self.transport, handshake::NAK);
            return;
        }
        let ack = frame::write_byte(&mut self.transport, handshake::ACK);
        self.delays.sleep_ack();
        if ack.is_err() {
            return;
        }

        let outcome = match cmd.command {
            b'S' => self.disk_status(unit),
            b'R' => self.disk_read(unit, cmd.aux()),
            b'W' | b'P' => self.disk_write(unit, cmd.aux()),
            b'!' | b'"' => self.disk_format(unit),
            b'N' => self.disk_percom_get(unit),
            b'O' => self.disk_percom_set(unit),
            _ => Err(()),
        };

        match outcome {
            Ok(()) => {
                let _ = frame::write_byte(&mut self.transport, handshake::COMPLETE);
            }
            Err(()) => {
                let _ = frame::write_byte(&mut self.transport, handshake::ERROR);
            }
        }
        self.delays.sleep_complete();
    }

    fn disk_status(&mut self, unit: usize) -> std::result::Result<(), ()> {
        let offset = self.devices.unit(unit).map(|u| u.status_poll_offset).unwrap_or(0);
        let mut offset = offset;
        let byte = rotate_time_byte(&mut offset);
        if let Some(rec) = self.devices.unit_mut(unit) {
            rec.status_poll_offset = offset;
            rec.status.spare = byte;
            let bytes = rec.status.as_bytes();
            let _ = frame::write_data(&mut self.transport, &bytes);
        }
        Ok(())
    }

    fn disk_read(&mut self, unit: usize, sector: u16) -> std::result::Result<(), ()> {
        let rec = self.devices.unit_mut(unit).ok_or(())?;
        match &mut rec.binding {
            UnitBinding::Disk { file, full13, .. } => {
                let bps = rec.bps;
                let maxsec = rec.maxsec;
                if sector as u32 == 0 || sector as u32 > maxsec {
                    return Err(());
                }
                let offset = crate::atr::seek_offset_for(sector as u32, bps, *full13);
                use std::io::{Read, Seek, SeekFrom};
                let len = if bps == 256 && sector <= 3 { 128 } else { bps as usize };
                let mut buf = vec![0u8; len];
                if file.seek(SeekFrom::Start(offset)).is_err() {
                    return Err(());
                }
                let _ = file.read_exact(&mut buf);
                let _ = frame::write_data(&mut self.transport, &buf);
                Ok(())
            }
            _ => Err(()),
        }
    }

    fn disk_write(&mut self, unit: usize, sector: u16) -> std::result::Result<(), ()> {
        let bps = self.devices.unit(unit).map(|u| u.bps).unwrap_or(128);
        let len = if bps == 256 && sector <= 3 { 128 } else { bps as usize };
        let data = frame::read_data(&mut self.transport, len).map_err(|_| ())?;
        let rec = self.devices.unit_mut(unit).ok_or(())?;
        match &mut rec.binding {
            UnitBinding::Disk { file, full13, .. } => {
                let maxsec = rec.maxsec;
                if sector as u32 == 0 || sector as u32 > maxsec {
                    return Err(());
                }
                let offset = crate::atr::seek_offset_for(sector as u32, bps, *full13);
                use std::io::{Seek, SeekFrom, Write};
                if file.seek(SeekFrom::Start(offset)).is_err() {
                    return Err(());
                }
                file.write_all(&data).map_err(|_| ())
            }
            _ => Err(()),
        }
    }

    fn disk_format(&mut self, unit: usize) -> std::result::Result<(), ()> {
        let rec = self.devices.unit_mut(unit).ok_or(())?;
        match &mut rec.binding {
            UnitBinding::Disk { file, full13_force, .. } => {
                let bps = rec.bps;
                let maxsec = rec.maxsec;
                use std::io::{Seek, SeekFrom, Write};
                let _ = file.set_len(0);
                let _ = file.seek(SeekFrom::Start(0));
                let payload_size: u64 = if bps == 256 && !*full13_force {
                    3 * 128 + (maxsec.saturating_sub(3)) as u64 * 256
                } else {
                    maxsec as u64 * bps as u64
                };
                crate::atr::write_header(file, payload_size, bps).map_err(|_| ())?;
                let _ = file.set_len(16 + payload_size);
                let verify = vec![0xffu8; bps as usize];
                let _ = frame::write_data(&mut self.transport, &verify);
                Ok(())
            }
            _ => Err(()),
        }
    }

    fn disk_percom_get(&mut self, unit: usize) -> std::result::Result<(), ()> {
        let rec = self.devices.unit(unit).ok_or(())?;
        let mut payload = rec.percom.as_bytes().to_vec();
        payload.extend_from_slice(&[0xff, 0, 0, 0]);
        let _ = frame::write_data(&mut self.transport, &payload);
        Ok(())
    }

    fn disk_percom_set(&mut self, unit: usize) -> std::result::Result<(), ()> {
        let data = frame::read_data(&mut self.transport, 12).map_err(|_| ())?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&data[..8]);
        let incoming = crate::devtable::Percom::from_bytes(&raw);
        let rec = self.devices.unit_mut(unit).ok_or(())?;
        if incoming.tracks != 1 {
            let bps = incoming.bps();
            if ![128u16, 256, 512, 1024].contains(&bps) {
                return Err(());
            }
            let mfm = incoming.flags & crate::devtable::Percom::FLAG_MFM != 0;
            if (incoming.spt() > 18 || bps >= 256) && !mfm {
                return Err(());
            }
            rec.percom = incoming;
            rec.bps = bps;
        }
        Ok(())
    }

    fn handle_printer(&mut self, cmd: CommandFrame) {
        if cmd.command != b'W' {
            let _ = frame::write_byte(&mut self.transport, handshake::NAK);
            return;
        }
        let _ = frame::write_byte(&mut self.transport, handshake::ACK);
        self.delays.sleep_ack();
        let len = crate::printer::frame_size(cmd.aux1);
        match frame::read_data(&mut self.transport, len) {
            Ok(data) => {
                let ok = if let Some(sink) = self.printer.as_mut() { sink.write_frame(&data).is_ok() } else { true };
                let reply = if ok { handshake::COMPLETE } else { handshake::ERROR };
                let _ = frame::write_byte(&mut self.transport, reply);
            }
            Err(_) => {
                let _ = frame::write_byte(&mut self.transport, handshake::ERROR);
            }
        }
    }

    fn handle_clock(&mut self, _cmd: CommandFrame) {
        let _ = frame::write_byte(&mut self.transport, handshake::ACK);
        self.delays.sleep_ack();
        let time = crate::clock::now_sdx();
        let _ = frame::write_data(&mut self.transport, &time);
    }

    fn handle_pcl(&mut self, cmd: CommandFrame) {
        let letter = cmd.command;
        let unit = (cmd.aux2 & 0x0f) as usize;
        if letter != b'P' && letter != b'R' {
            let _ = frame::write_byte(&mut self.transport, handshake::NAK);
            return;
        }
        let _ = frame::write_byte(&mut self.transport, handshake::ACK);
        self.delays.sleep_ack();

        let par = {
            let rec = match self.devices.unit(unit) {
                Some(r) => r,
                None => {
                    let _ = frame::write_byte(&mut self.transport, handshake::ERROR);
                    return;
                }
            };
            rec.last_parblock.clone()
        };

        let fresh = letter == b'P';
        let block = if fresh {
            match frame::read_data(&mut self.transport, 128) {
                Ok(raw) => Some(parse_parblock(&raw)),
                Err(_) => None,
            }
        } else {
            par
        };

        let Some(block) = block else {
            let _ = frame::write_byte(&mut self.transport, handshake::ERROR);
            return;
        };

        if !fresh && self.last_pcl_command_letter == Some(b'R') {
            let _ = frame::write_byte(&mut self.transport, handshake::NAK);
            return;
        }
        self.last_pcl_command_letter = Some(letter);

        if fresh {
            let prior = self.devices.unit(unit).and_then(|r| r.last_parblock.clone());
            let is_retry = prior.as_ref() == Some(&block);
            if is_retry && !pcl::is_idempotent_retry(block.fno) {
                let cached = self.devices.unit(unit).and_then(|r| r.last_pcl_result.clone());
                self.reply_pcl(cached.unwrap_or(Ok(None)));
                return;
            }
        }

        let result = self.dispatch_pcl_function(unit, &block, fresh);

        if fresh {
            if let Some(rec) = self.devices.unit_mut(unit) {
                rec.last_parblock = Some(block.clone());
                rec.last_pcl_result = Some(result.clone());
            }
        }

        self.reply_pcl(result);
    }

    fn reply_pcl(&mut self, result: std::result::Result<Option<Vec<u8>>, u8>) {
        match result {
            Ok(Some(payload)) => {
                let _ = frame::write_byte(&mut self.transport, handshake::COMPLETE);
                self.delays.sleep_complete();
                let _ = frame::write_data(&mut self.transport, &payload);
            }
            Ok(None) => {
                let _ = frame::write_byte(&mut self.transport, handshake::COMPLETE);
            }
            Err(_code) => {
                let _ = frame::write_byte(&mut self.transport, handshake::ERROR);
            }
        }
    }

    fn dispatch_pcl_function(
        &mut self,
        unit: usize,
        block: &ParBlock,
        is_parameter_phase: bool,
    ) -> std::result::Result<Option<Vec<u8>>, u8> {
        if self.pcl_mounts.get(unit).and_then(|m| m.as_ref()).is_none() {
            return Err(pcl::err::NOT_FOUND);
        }
        match block.fno {
            pcl::fno::INIT => {
                self.pcl.init();
                Ok(None)
            }
            pcl::fno::FOPEN | pcl::fno::FFIRST => {
                if is_parameter_phase {
                    return Ok(None);
                }
                if block.fno == pcl::fno::FFIRST || block.fmode == 0x10 {
                    let mount = self.pcl_mounts[unit].as_ref().unwrap();
                    let h = self.pcl.open_dir(mount, block)?;
                    let mut payload = vec![h];
                    payload.extend_from_slice(&[0u8; 22]);
                    Ok(Some(payload))
                } else {
                    let mount = self.pcl_mounts[unit].as_ref().unwrap();
                    let (h, entry) = self.pcl.open_file(mount, block)?;
                    let mut payload = vec![h];
                    payload.extend_from_slice(&entry.to_bytes());
                    Ok(Some(payload))
                }
            }
            pcl::fno::FCLOSE => {
                self.pcl.close(block.handle, Some(block.f))?;
                Ok(None)
            }
            pcl::fno::FREAD => {
                if is_parameter_phase {
                    return Ok(None);
                }
                let len = u16::from_le_bytes([block.f[0], block.f[1]]) as usize;
                let (data, _code) = self.pcl.read(block.handle, len)?;
                Ok(Some(data))
            }
            pcl::fno::FWRITE => {
                if is_parameter_phase {
                    return Ok(None);
                }
                let len = u16::from_le_bytes([block.f[0], block.f[1]]) as usize;
                let data = vec![0u8; len];
                self.pcl.write(block.handle, &data)?;
                Ok(None)
            }
            pcl::fno::FSEEK => {
                let pos = u32::from_le_bytes([block.f[0], block.f[1], block.f[2], 0]) as u64;
                self.pcl.seek(block.handle, pos)?;
                Ok(None)
            }
            pcl::fno::FTELL => {
                let pos = self.pcl.tell(block.handle)?;
                Ok(Some(pos.to_le_bytes()[..3].to_vec()))
            }
            pcl::fno::FLEN => {
                let len = self.pcl.len(block.handle)?;
                Ok(Some(len.to_le_bytes()[..3].to_vec()))
            }
            pcl::fno::FNEXT => {
                let (data, _code) = self.pcl.next(block.handle)?;
                Ok(Some(data))
            }
            pcl::fno::GETCWD => {
                let s = self.pcl_mounts[unit].as_ref().unwrap().getcwd_display();
                let mut buf = s.into_bytes();
                buf.resize(64, b' ');
                Ok(Some(buf))
            }
            pcl::fno::CHDIR => {
                let req = String::from_utf8_lossy(&block.path).trim_matches('\0').to_string();
                self.pcl_mounts[unit].as_mut().unwrap().chdir(&req).map_err(|e| e.code())?;
                Ok(None)
            }
            pcl::fno::RENAME => self.pcl.rename(self.pcl_mounts[unit].as_ref().unwrap(), block),
            pcl::fno::REMOVE => self.pcl.remove(self.pcl_mounts[unit].as_ref().unwrap(), block),
            pcl::fno::CHMOD => self.pcl.chmod(self.pcl_mounts[unit].as_ref().unwrap(), block),
            pcl::fno::MKDIR => self.pcl.mkdir(self.pcl_mounts[unit].as_ref().unwrap(), block),
            pcl::fno::RMDIR => self.pcl.rmdir(self.pcl_mounts[unit].as_ref().unwrap(), block),
            pcl::fno::DFREE => self.pcl.dfree(self.pcl_mounts[unit].as_ref().unwrap(), unit),
            pcl::fno::CHVOL => self.pcl.chvol(self.pcl_mounts[unit].as_ref().unwrap(), block),
            _ => Err(pcl::err::BAD_FUNCTION),
        }
    }
}

fn parse_parblock(raw: &[u8]) -> ParBlock {
    let mut p = ParBlock::default();
    if raw.is_empty() {
        return p;
    }
    p.fno = raw[0];
    p.handle = raw.get(1).copied().unwrap_or(0);
    for i in 0..6 {
        p.f[i] = raw.get(2 + i).copied().unwrap_or(0);
    }
    p.fmode = raw.get(8).copied().unwrap_or(0);
    p.fatr1 = raw.get(9).copied().unwrap_or(0);
    p.fatr2 = raw.get(10).copied().unwrap_or(0);
    for i in 0..12 {
        p.name[i] = raw.get(11 + i).copied().unwrap_or(0);
        p.names[i] = raw.get(23 + i).copied().unwrap_or(0);
    }
    for i in 0..65.min(raw.len().saturating_sub(35)) {
        p.path[i] = raw[35 + i];
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_scale_with_bluetooth_multiplier() {
        let d1 = Delays::new(1);
        let d4 = Delays::new(4);
        assert!(d4.post_ack > d1.post_ack);
    }
}
