//! Session event queue
//!
//! Every input to the session actor, whether a user command, a captured frame,
//! a transport message or a playback completion, is an [`Event`] on one
//! unbounded channel. Devices and the transport never see the channel itself;
//! they get a sink tagged with the generation of the session that created it.

use crate::devices::{CaptureStream, PlaybackOutput};
use crate::gemini::ApiResponse;
use crate::schedule::SegmentId;
use crate::session::{SessionError, SessionSnapshot};
use crate::transport::LiveTransport;
use tokio::sync::{mpsc, oneshot};

pub(crate) type EventTx = mpsc::UnboundedSender<Event>;
pub(crate) type EventRx = mpsc::UnboundedReceiver<Event>;

/// Everything acquired for one session
pub(crate) struct Resources {
    pub capture: Box<dyn CaptureStream>,
    pub output: Box<dyn PlaybackOutput>,
    pub transport: Box<dyn LiveTransport>,
}

pub(crate) enum Event {
    Start,
    Stop,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
    Opened {
        generation: u64,
        result: Result<Resources, SessionError>,
    },
    Frame {
        generation: u64,
        pcm: Vec<i16>,
    },
    Inbound {
        generation: u64,
        response: ApiResponse,
    },
    TransportClosed {
        generation: u64,
        reason: Option<String>,
    },
    TransportFailed {
        generation: u64,
        error: String,
    },
    SegmentFinished {
        generation: u64,
        id: SegmentId,
    },
    DeviceFailed {
        generation: u64,
        error: String,
    },
}

fn device_failed(tx: &EventTx, generation: u64, error: String) {
    let _ = tx.send(Event::DeviceFailed { generation, error });
}

/// Where the capture device delivers frames
#[derive(Clone)]
pub struct FrameSink {
    generation: u64,
    tx: EventTx,
}

impl FrameSink {
    pub(crate) fn new(generation: u64, tx: EventTx) -> Self {
        Self { generation, tx }
    }

    /// Hand one captured frame to the session.
    ///
    /// Returns `false` once the session is gone; capture should stop then.
    pub fn push(&self, pcm: Vec<i16>) -> bool {
        self.tx
            .send(Event::Frame {
                generation: self.generation,
                pcm,
            })
            .is_ok()
    }

    /// The microphone stopped working.
    pub fn failed(&self, error: impl Into<String>) {
        device_failed(&self.tx, self.generation, error.into());
    }
}

/// Where the transport delivers inbound traffic
#[derive(Clone)]
pub struct InboundSink {
    generation: u64,
    tx: EventTx,
}

impl InboundSink {
    pub(crate) fn new(generation: u64, tx: EventTx) -> Self {
        Self { generation, tx }
    }

    pub fn deliver(&self, response: ApiResponse) -> bool {
        self.tx
            .send(Event::Inbound {
                generation: self.generation,
                response,
            })
            .is_ok()
    }

    /// The remote side closed the connection.
    pub fn closed(&self, reason: Option<String>) {
        let _ = self.tx.send(Event::TransportClosed {
            generation: self.generation,
            reason,
        });
    }

    /// The connection failed.
    pub fn failed(&self, error: impl Into<String>) {
        let _ = self.tx.send(Event::TransportFailed {
            generation: self.generation,
            error: error.into(),
        });
    }
}

/// Where the playback device reports finished segments
#[derive(Clone)]
pub struct SegmentSink {
    generation: u64,
    tx: EventTx,
}

impl SegmentSink {
    pub(crate) fn new(generation: u64, tx: EventTx) -> Self {
        Self { generation, tx }
    }

    /// A sink with no session behind it, for driving an output on its own.
    pub fn detached() -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self { generation: 0, tx }
    }

    pub fn finished(&self, id: SegmentId) -> bool {
        self.tx
            .send(Event::SegmentFinished {
                generation: self.generation,
                id,
            })
            .is_ok()
    }

    /// The output stopped working.
    pub fn failed(&self, error: impl Into<String>) {
        device_failed(&self.tx, self.generation, error.into());
    }
}
