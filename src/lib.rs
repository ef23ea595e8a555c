//! livevoice - realtime voice sessions with the Gemini Live API
//!
//! Microphone audio is captured in fixed frames, encoded and streamed to the
//! model; model audio is decoded and scheduled for gapless playback while the
//! transcript of both sides is assembled turn by turn. [`LiveSession`] ties the
//! pieces together behind the device and transport traits.

#![forbid(unsafe_code)]

pub mod codec;
pub mod config;
pub mod devices;
pub mod events;
pub mod gemini;
pub mod gemini_client;
pub mod media_in;
pub mod media_out;
pub mod recorder;
pub mod schedule;
pub mod session;
pub mod transcript;
pub mod transport;

pub use config::LiveConfig;
pub use gemini_client::GeminiConnector;
pub use session::{LiveSession, Notice, SessionError, SessionHandle, SessionSnapshot, SessionState};
pub use transcript::{Speaker, TranscriptEntry};
