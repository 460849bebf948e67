pub mod atr;
pub mod clock;
pub mod daemon;
pub mod devtable;
pub mod dispatcher;
pub mod frame;
pub mod pcl;
pub mod printer;
pub mod serial;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Wires the configured drives, serial line, and printer into a running
/// [`dispatcher::Dispatcher`] and drives its loop until shutdown.
pub fn run(config: daemon::Config) -> std::io::Result<()> {
    let line = serial::TermiosLine::open(&config.serial_device)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    let flow = serial::FlowController::new(line, config.hs_index, config.quartz_hz, config.nonlinearity);
    let delays = dispatcher::Delays::new(config.bluetooth_delay);

    let serial_fd = SerialTransport::open(&config.serial_device)?;
    let mut disp = dispatcher::Dispatcher::new(serial_fd, flow, delays);
    disp.block_percom = config.block_percom;

    if let Some(path) = &config.printer_path {
        if let Ok(sink) = printer::PrinterSink::open(path, config.printer_translate) {
            disp.printer = Some(sink);
        } else {
            log::warn!("failed to open printer sink at {path}");
        }
    }

    for (i, slot) in config.drives.iter().enumerate() {
        let unit = i + 1;
        match slot {
            daemon::DriveSlot::Disk { path, .. } => match atr::AtrImage::mount(path) {
                Ok(img) => disp.mount_disk(unit, img),
                Err(e) => log::warn!("failed to mount {path}: {e}"),
            },
            daemon::DriveSlot::Pcl { path } => {
                let mount = pcl::Mount::new(std::path::PathBuf::from(path), config.pcl_uppercase);
                disp.mount_pcl(unit, mount);
            }
            daemon::DriveSlot::Empty => {}
        }
    }

    let shutdown: Arc<AtomicBool> = daemon::install_shutdown_handler()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    disp.run(&shutdown)
}

/// A real serial port as a [`frame::Transport`], backed by a raw fd so
/// `FIONREAD` can answer the desync-recovery "is a byte pending" query
/// without blocking.
pub struct SerialTransport {
    file: std::fs::File,
}

mod ioctl {
    use nix::{ioctl_read_bad, libc};
    ioctl_read_bad!(fionread, libc::FIONREAD, libc::c_int);
}

impl SerialTransport {
    pub fn open(path: &str) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }
}

impl frame::Transport for SerialTransport {
    fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        use std::io::Read;
        self.file.read_exact(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        use std::io::Write;
        self.file.write_all(buf)
    }

    fn pending(&mut self) -> std::io::Result<bool> {
        use std::os::unix::io::AsRawFd;
        let mut n: i32 = 0;
        unsafe {
            ioctl::fionread(self.file.as_raw_fd(), &mut n)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        }
        Ok(n > 0)
    }
}
