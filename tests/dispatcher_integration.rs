use sio2em::atr::{write_header, AtrImage, HEADER_LEN};
use sio2em::dispatcher::{Delays, Dispatcher};
use sio2em::frame::{checksum, handshake, Transport};
use sio2em::pcl::Mount;
use sio2em::serial::{FlowController, LineSpeed, Result as SerialResult, STANDARD_BAUD};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempDir};

struct FakeTransport {
    inbound: VecDeque<u8>,
    outbound: VecDeque<u8>,
}

impl FakeTransport {
    fn new(bytes: &[u8]) -> Self {
        Self { inbound: bytes.iter().copied().collect(), outbound: VecDeque::new() }
    }
}

impl Transport for FakeTransport {
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        for slot in buf.iter_mut() {
            *slot = self
                .inbound
                .pop_front()
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "eof"))?;
        }
        Ok(())
    }
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.outbound.extend(buf.iter().copied());
        Ok(())
    }
    fn pending(&mut self) -> io::Result<bool> {
        Ok(!self.inbound.is_empty())
    }
}

struct FakeLine;
impl LineSpeed for FakeLine {
    fn set_baud(&mut self, _baud: u32) -> SerialResult<()> {
        Ok(())
    }
    fn read_modem_bits(&mut self) -> SerialResult<i32> {
        Ok(0)
    }
    fn flush(&mut self) -> SerialResult<()> {
        Ok(())
    }
}

fn make_dispatcher(bytes: &[u8]) -> Dispatcher<FakeTransport, FakeLine> {
    let transport = FakeTransport::new(bytes);
    let flow = FlowController::new(FakeLine, 0, sio2em::serial::QUARTZ_PAL, sio2em::serial::DEFAULT_NONLINEARITY);
    let delays = Delays { ack: std::time::Duration::ZERO, post_ack: std::time::Duration::ZERO, complete: std::time::Duration::ZERO };
    assert_eq!(STANDARD_BAUD, 19200);
    Dispatcher::new(transport, flow, delays)
}

fn fresh_atr(sectors: u32, bps: u16) -> NamedTempFile {
    let tmp = NamedTempFile::new().unwrap();
    {
        let mut f = std::fs::OpenOptions::new().write(true).open(tmp.path()).unwrap();
        let payload = sectors as u64 * bps as u64;
        write_header(&mut f, payload, bps).unwrap();
        f.set_len(HEADER_LEN + payload).unwrap();
    }
    tmp
}

#[test]
fn disk_status_frame_decodes_and_mount_attaches_geometry() {
    let cmd = [0x31u8, b'S', 0x00, 0x00];
    let ck = checksum(&cmd);
    let mut bytes = cmd.to_vec();
    bytes.push(ck);

    let img_file = fresh_atr(720, 128);
    let img = AtrImage::mount(img_file.path().to_str().unwrap()).unwrap();

    let mut disp = make_dispatcher(&bytes);
    disp.mount_disk(1, img);
    assert_eq!(disp.devices.unit(1).unwrap().maxsec, 720);

    let frame = sio2em::frame::read_command_frame(&mut disp.transport).unwrap();
    assert_eq!(frame.device, 0x31);
    assert_eq!(frame.command, b'S');

    let shutdown = Arc::new(AtomicBool::new(true));
    assert!(shutdown.load(Ordering::Relaxed));
}

#[test]
fn pcl_mount_resolves_against_root() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("foo.txt"), b"hello").unwrap();
    let mount = Mount::new(dir.path().to_path_buf(), false);
    let (path, rel) = mount.resolve("foo.txt").unwrap();
    assert_eq!(rel, "foo.txt");
    assert!(path.exists());
}

#[test]
fn format_then_mount_has_expected_sector_count() {
    let tmp = fresh_atr(720, 128);
    let mut img = AtrImage::mount(tmp.path().to_str().unwrap()).unwrap();
    assert_eq!(img.maxsec, 720);
    img.format(false).unwrap();
    assert_eq!(img.maxsec, 720);
}

#[test]
fn handshake_bytes_are_single_ascii_chars() {
    assert_eq!(handshake::ACK, b'A');
    assert_eq!(handshake::NAK, b'N');
    assert_eq!(handshake::COMPLETE, b'C');
    assert_eq!(handshake::ERROR, b'E');
}
