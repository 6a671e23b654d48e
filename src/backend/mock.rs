use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::fs::MetadataExt;
use std::os::unix::net::UnixStream;

use nix::sys::epoll::EpollFlags;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config::{Direction, Edge};
use crate::error::IrqError;
use crate::gpio::GpioDriver;

/// In-process stand-in for the kernel GPIO interface.
///
/// Value descriptors are one end of a socket pair; the driver keeps the other
/// end and writes a byte to it whenever an edge is simulated, so the descriptor
/// wakes epoll just like a sysfs value node would.
#[derive(Default)]
pub struct MockGpioDriver {
    pins: Mutex<FxHashMap<u32, MockPinState>>,
    export_delay: Mutex<u32>,
}

struct MockPinState {
    export_requests: u32,
    exported: bool,
    direction: Direction,
    edge: Edge,
    level: bool,
    trigger: Option<UnixStream>,
    // (st_dev, st_ino) of the reader end handed out by open_value_fd
    value_node: Option<(u64, u64)>,
}

impl Default for MockPinState {
    fn default() -> Self {
        Self {
            export_requests: 0,
            exported: false,
            direction: Direction::In,
            edge: Edge::None,
            level: false,
            trigger: None,
            value_node: None,
        }
    }
}

impl MockGpioDriver {
    /// Number of export writes a pin needs before its node appears.
    pub fn set_export_delay(&self, attempts: u32) {
        *self.export_delay.lock() = attempts;
    }

    pub fn export_requests(&self, pin: u32) -> u32 {
        self.pins
            .lock()
            .get(&pin)
            .map(|p| p.export_requests)
            .unwrap_or(0)
    }

    pub fn edge(&self, pin: u32) -> Option<Edge> {
        self.pins
            .lock()
            .get(&pin)
            .filter(|p| p.exported)
            .map(|p| p.edge)
    }

    pub fn direction(&self, pin: u32) -> Option<Direction> {
        self.pins
            .lock()
            .get(&pin)
            .filter(|p| p.exported)
            .map(|p| p.direction)
    }

    /// Signals one pending edge on `pin`. Returns false when nothing is
    /// watching the pin's value descriptor.
    pub fn trigger_edge(&self, pin: u32) -> bool {
        let pins = self.pins.lock();
        match pins.get(&pin).and_then(|p| p.trigger.as_ref()) {
            Some(mut trigger) => trigger.write_all(b"1").is_ok(),
            None => false,
        }
    }

    /// Drives the simulated line level, raising an edge when the transition
    /// matches the configured edge.
    pub fn set_level(&self, pin: u32, level: bool) -> Result<bool, IrqError> {
        let mut pins = self.pins.lock();
        let state = pins
            .get_mut(&pin)
            .filter(|p| p.exported)
            .ok_or_else(|| IrqError::Io(format!("gpio{pin} is not exported")))?;

        let old = state.level;
        state.level = level;

        let observed = match (old, level) {
            (false, true) => Edge::Rising,
            (true, false) => Edge::Falling,
            _ => return Ok(false),
        };
        if !edge_matches(state.edge, observed) {
            return Ok(false);
        }

        Ok(match state.trigger.as_mut() {
            Some(trigger) => trigger.write_all(b"1").is_ok(),
            None => false,
        })
    }

    fn with_exported<T>(
        &self,
        pin: u32,
        f: impl FnOnce(&mut MockPinState) -> T,
    ) -> Result<T, IrqError> {
        let mut pins = self.pins.lock();
        match pins.get_mut(&pin) {
            Some(state) if state.exported => Ok(f(state)),
            _ => Err(IrqError::Io(format!("gpio{pin}: no such device node"))),
        }
    }
}

impl GpioDriver for MockGpioDriver {
    fn export_pin(&self, pin: u32) -> Result<(), IrqError> {
        let delay = *self.export_delay.lock();
        let mut pins = self.pins.lock();
        let state = pins.entry(pin).or_default();
        state.export_requests += 1;
        if state.export_requests > delay {
            state.exported = true;
        }
        Ok(())
    }

    fn unexport_pin(&self, pin: u32) -> Result<(), IrqError> {
        let mut pins = self.pins.lock();
        match pins.get_mut(&pin) {
            Some(state) if state.exported => {
                *state = MockPinState {
                    export_requests: state.export_requests,
                    ..MockPinState::default()
                };
                Ok(())
            }
            _ => Err(IrqError::Io(format!("unexport pin {pin}: invalid argument"))),
        }
    }

    fn is_exported(&self, pin: u32) -> bool {
        self.pins.lock().get(&pin).is_some_and(|p| p.exported)
    }

    fn set_direction(&self, pin: u32, direction: Direction) -> Result<(), IrqError> {
        self.with_exported(pin, |state| state.direction = direction)
    }

    fn set_edge(&self, pin: u32, edge: Edge) -> Result<(), IrqError> {
        self.with_exported(pin, |state| state.edge = edge)
    }

    fn open_value_fd(&self, pin: u32) -> Result<File, IrqError> {
        let (reader, trigger) =
            UnixStream::pair().map_err(|e| IrqError::Io(format!("socket pair: {e}")))?;
        reader
            .set_nonblocking(true)
            .and_then(|_| trigger.set_nonblocking(true))
            .map_err(|e| IrqError::Io(format!("set nonblocking: {e}")))?;

        let file = File::from(OwnedFd::from(reader));
        let node = file_node(&file)?;
        self.with_exported(pin, |state| {
            state.trigger = Some(trigger);
            state.value_node = Some(node);
        })?;

        Ok(file)
    }

    fn clear_pending_event(&self, fd: &File) -> Result<(), IrqError> {
        let mut file = fd;
        let mut buf = [0u8; 64];
        loop {
            match file.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(IrqError::Io(format!("drain value: {e}"))),
            }
        }
    }

    fn read_value(&self, fd: &File) -> Result<bool, IrqError> {
        let node = file_node(fd)?;
        self.pins
            .lock()
            .values()
            .find(|p| p.exported && p.value_node == Some(node))
            .map(|p| p.level)
            .ok_or_else(|| IrqError::Io("read value: bad file descriptor".into()))
    }

    fn read_pin_value(&self, pin: u32) -> Result<bool, IrqError> {
        self.with_exported(pin, |state| state.level)
    }

    fn readiness(&self) -> EpollFlags {
        EpollFlags::EPOLLIN
    }
}

// Raw fd numbers are recycled as soon as a descriptor closes; the socket
// inode identifies the open file itself.
fn file_node(file: &File) -> Result<(u64, u64), IrqError> {
    let meta = file
        .metadata()
        .map_err(|e| IrqError::Io(format!("stat value descriptor: {e}")))?;
    Ok((meta.dev(), meta.ino()))
}

fn edge_matches(configured: Edge, observed: Edge) -> bool {
    match configured {
        Edge::None => false,
        Edge::Rising => observed == Edge::Rising,
        Edge::Falling => observed == Edge::Falling,
        Edge::Both => matches!(observed, Edge::Rising | Edge::Falling),
    }
}
