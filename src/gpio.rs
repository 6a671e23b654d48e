use std::fs::File;
use std::thread;

use log::{debug, warn};
use nix::sys::epoll::EpollFlags;

use crate::config::{Direction, Edge, InterruptConfig};
use crate::error::IrqError;

/// Kernel-facing half of the interrupt engine.
///
/// Implementations configure a pin for edge detection and hand back a value
/// descriptor that the dispatch loop registers with epoll using
/// [`GpioDriver::readiness`].
pub trait GpioDriver: Send + Sync {
    fn export_pin(&self, pin: u32) -> Result<(), IrqError>;
    fn unexport_pin(&self, pin: u32) -> Result<(), IrqError>;
    fn is_exported(&self, pin: u32) -> bool;
    fn set_direction(&self, pin: u32, direction: Direction) -> Result<(), IrqError>;
    fn set_edge(&self, pin: u32, edge: Edge) -> Result<(), IrqError>;
    fn open_value_fd(&self, pin: u32) -> Result<File, IrqError>;
    /// Drains the pending edge so the descriptor stops signalling.
    fn clear_pending_event(&self, fd: &File) -> Result<(), IrqError>;
    fn read_value(&self, fd: &File) -> Result<bool, IrqError>;
    /// Reads the level through a fresh descriptor so a watched descriptor's
    /// pending edge is left alone.
    fn read_pin_value(&self, pin: u32) -> Result<bool, IrqError> {
        let fd = self.open_value_fd(pin)?;
        self.read_value(&fd)
    }
    /// Epoll interest used when registering a value descriptor.
    fn readiness(&self) -> EpollFlags;
    /// Releases the shared export/unexport descriptors. Further exports fail.
    fn release(&self) {}
}

/// Exports `pin`, switches it to input and arms `edge`, retrying while the
/// kernel materializes the per-pin nodes. Returns the opened value descriptor
/// with any stale edge already drained.
pub(crate) fn prepare_pin<D: GpioDriver + ?Sized>(
    driver: &D,
    config: &InterruptConfig,
    pin: u32,
    edge: Edge,
) -> Result<File, IrqError> {
    let attempts = config.export_retries.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match configure_input(driver, pin, edge) {
            Ok(()) => {
                let fd = driver.open_value_fd(pin)?;
                if let Err(e) = driver.clear_pending_event(&fd) {
                    debug!("initial drain for pin {pin} failed: {e}");
                }
                return Ok(fd);
            }
            Err(e) => {
                debug!("configure pin {pin} attempt {attempt}/{attempts} failed: {e}");
                last_err = Some(e);
                if attempt < attempts {
                    thread::sleep(config.export_backoff());
                }
            }
        }
    }

    Err(IrqError::Io(format!(
        "pin {pin} not ready after {attempts} attempts: {}",
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn configure_input<D: GpioDriver + ?Sized>(
    driver: &D,
    pin: u32,
    edge: Edge,
) -> Result<(), IrqError> {
    if !driver.is_exported(pin) {
        driver.export_pin(pin)?;
        if !driver.is_exported(pin) {
            return Err(IrqError::Io(format!("gpio{pin} node not present yet")));
        }
    }
    driver.set_direction(pin, Direction::In)?;
    driver.set_edge(pin, edge)
}

/// Disarms and unexports `pin`. The edge reset is best-effort; the unexport
/// result is reported.
pub(crate) fn release_pin<D: GpioDriver + ?Sized>(driver: &D, pin: u32) -> Result<(), IrqError> {
    if let Err(e) = driver.set_edge(pin, Edge::None) {
        warn!("reset edge for pin {pin} failed: {e}");
    }
    driver.unexport_pin(pin)
}
