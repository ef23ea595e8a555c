//! Audio device seams
//!
//! The session talks to the microphone and speaker only through these traits.
//! PulseAudio implementations live in `media_in` and `media_out`.

use crate::codec::AudioBuffer;
use crate::events::{FrameSink, SegmentSink};
use crate::schedule::SegmentId;
use async_trait::async_trait;

/// Errors acquiring or running the capture device
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("no input device available")]
    NoDevicesFound,

    #[error("capture device error: {0}")]
    Device(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors opening or driving the playback device
#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("playback device error: {0}")]
    Device(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A permission-gated capture device
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Acquire the device. Nothing is delivered until [`CaptureStream::start`].
    async fn acquire(&self) -> Result<Box<dyn CaptureStream>, CaptureError>;
}

/// An acquired microphone
pub trait CaptureStream: Send {
    /// Begin delivering fixed-size frames to `sink`.
    fn start(&mut self, sink: FrameSink);

    /// Stop delivering frames. The device stays acquired.
    fn disconnect(&mut self);

    /// Give the device back.
    fn release(self: Box<Self>);
}

/// A playback device that can be opened per session
#[async_trait]
pub trait PlaybackDevice: Send + Sync {
    /// Open an output. Finished segments are reported on `done`.
    async fn open(&self, done: SegmentSink) -> Result<Box<dyn PlaybackOutput>, PlaybackError>;
}

/// An open playback context with its own clock
pub trait PlaybackOutput: Send {
    /// Current output clock in seconds.
    fn now(&self) -> f64;

    /// Play `buffer` starting at clock time `start`.
    fn schedule(&mut self, id: SegmentId, start: f64, buffer: AudioBuffer);

    /// Stop a scheduled segment, whether or not it has started.
    fn cancel(&mut self, id: SegmentId);

    fn close(self: Box<Self>);
}
