//! Remote endpoint seam

use crate::codec::EncodedChunk;
use crate::events::InboundSink;
use crate::gemini::Result;
use async_trait::async_trait;

/// Opens transport connections to the remote model
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a connection and complete the session handshake.
    ///
    /// Inbound traffic, closure and errors are reported through `inbound`.
    async fn open(&self, inbound: InboundSink) -> Result<Box<dyn LiveTransport>>;
}

/// An open connection
pub trait LiveTransport: Send {
    /// Queue one audio frame. Never waits for the network.
    fn send_audio(&mut self, chunk: EncodedChunk) -> Result<()>;

    /// Ask the remote side to close. Later calls are no-ops.
    fn close(&mut self);
}
