//! Media output module

pub mod playback;

pub use playback::PulseSpeaker;
