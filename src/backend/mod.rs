pub mod mock;
pub mod sysfs;

pub use mock::MockGpioDriver;
pub use sysfs::GpioSysfsDriver;
