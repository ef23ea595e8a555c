//! Media input capture module

pub mod audio;

pub use audio::{list_devices, AudioDevice, DeviceKind, PulseMicrophone};
