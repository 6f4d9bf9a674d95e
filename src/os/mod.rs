//! OS abstraction layer: storage devices and platform hints

pub mod device;

pub use device::{Device, FileDevice, MemDevice};
