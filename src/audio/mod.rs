//! Audio subsystem module

pub mod capture;
pub mod device;

pub use capture::{CaptureSource, DeviceCapture};
pub use device::{find_input, validate_input, InputSummary};
