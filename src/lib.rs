pub mod backend;
mod config;
mod dispatch;
mod error;
mod gpio;
mod registry;
mod service;

pub use backend::{GpioSysfsDriver, MockGpioDriver};
pub use config::{DEFAULT_SYSFS_ROOT, Direction, Edge, InterruptConfig};
pub use error::IrqError;
pub use gpio::GpioDriver;
pub use registry::{
    CallbackEntry, CallbackId, CallbackSnapshot, InterruptCallback, PinConfig, PinRegistry,
    PinSnapshot,
};
pub use service::InterruptService;
