use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;
use nix::errno::Errno;
use nix::sys::epoll::EpollFlags;
use parking_lot::Mutex;

use crate::config::{Direction, Edge};
use crate::error::IrqError;
use crate::gpio::GpioDriver;

/// Driver for the legacy `/sys/class/gpio` interface.
pub struct GpioSysfsDriver {
    root: PathBuf,
    control: Mutex<Option<ControlFiles>>,
}

struct ControlFiles {
    export: File,
    unexport: File,
}

impl GpioSysfsDriver {
    /// Opens the shared `export`/`unexport` nodes under `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, IrqError> {
        let root = root.as_ref().to_path_buf();
        let export = Self::open_write(&root.join("export"))?;
        let unexport = Self::open_write(&root.join("unexport"))?;

        Ok(Self {
            root,
            control: Mutex::new(Some(ControlFiles { export, unexport })),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pin_node(&self, pin: u32, node: &str) -> PathBuf {
        self.root.join(format!("gpio{pin}")).join(node)
    }

    fn open_write(path: &Path) -> Result<File, IrqError> {
        OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| IrqError::Io(format!("open {}: {e}", path.display())))
    }

    fn write_node(&self, pin: u32, node: &str, token: &str) -> Result<(), IrqError> {
        let path = self.pin_node(pin, node);
        let mut file = Self::open_write(&path)?;
        file.write_all(token.as_bytes())
            .map_err(|e| IrqError::Io(format!("write {token:?} to {}: {e}", path.display())))
    }

    fn write_control(&self, pin: u32, export: bool) -> io::Result<()> {
        let control = self.control.lock();
        let control = control
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "driver released"))?;
        let mut file = if export {
            &control.export
        } else {
            &control.unexport
        };
        file.write_all(pin.to_string().as_bytes())
    }
}

impl GpioDriver for GpioSysfsDriver {
    fn export_pin(&self, pin: u32) -> Result<(), IrqError> {
        match self.write_control(pin, true) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(Errno::EBUSY as i32) => {
                debug!("pin {pin} already exported");
                Ok(())
            }
            Err(e) => Err(IrqError::Io(format!("export pin {pin}: {e}"))),
        }
    }

    fn unexport_pin(&self, pin: u32) -> Result<(), IrqError> {
        self.write_control(pin, false)
            .map_err(|e| IrqError::Io(format!("unexport pin {pin}: {e}")))
    }

    fn is_exported(&self, pin: u32) -> bool {
        fs::metadata(self.pin_node(pin, "edge")).is_ok()
    }

    fn set_direction(&self, pin: u32, direction: Direction) -> Result<(), IrqError> {
        self.write_node(pin, "direction", direction.as_sysfs_str())
    }

    fn set_edge(&self, pin: u32, edge: Edge) -> Result<(), IrqError> {
        self.write_node(pin, "edge", edge.as_sysfs_str())
    }

    fn open_value_fd(&self, pin: u32) -> Result<File, IrqError> {
        let path = self.pin_node(pin, "value");
        File::open(&path).map_err(|e| IrqError::Io(format!("open {}: {e}", path.display())))
    }

    fn clear_pending_event(&self, fd: &File) -> Result<(), IrqError> {
        let mut file = fd;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| IrqError::Io(format!("seek value: {e}")))?;
        let mut buf = [0u8; 8];
        loop {
            match file.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(IrqError::Io(format!("drain value: {e}"))),
            }
        }
    }

    fn read_value(&self, fd: &File) -> Result<bool, IrqError> {
        let mut file = fd;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| IrqError::Io(format!("seek value: {e}")))?;
        let mut byte = [0u8; 1];
        file.read_exact(&mut byte)
            .map_err(|e| IrqError::Io(format!("read value: {e}")))?;
        Ok(byte[0] == b'1')
    }

    fn readiness(&self) -> EpollFlags {
        EpollFlags::EPOLLPRI | EpollFlags::EPOLLERR
    }

    fn release(&self) {
        self.control.lock().take();
    }
}
