//! Gemini Live WebSocket transport
//!
//! The socket is split into a sink and a stream after the setup handshake.
//! A writer task drains an unbounded queue into the sink, so sends from the
//! capture loop never wait on the network, and a reader task turns server
//! frames into session events.

use crate::codec::EncodedChunk;
use crate::config::LiveConfig;
use crate::events::InboundSink;
use crate::gemini::{
    parse_server_frame, ApiResponse, BidiGenerateContentSetup, Blob, ClientMessage, GeminiError,
    RealtimeInput, Result,
};
use crate::transport::{Connector, LiveTransport};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Opens [`GeminiLiveClient`] connections for the session manager
pub struct GeminiConnector {
    config: Arc<LiveConfig>,
}

impl GeminiConnector {
    pub fn new(config: Arc<LiveConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for GeminiConnector {
    async fn open(&self, inbound: InboundSink) -> Result<Box<dyn LiveTransport>> {
        let client = GeminiLiveClient::connect(&self.config, inbound).await?;
        Ok(Box::new(client))
    }
}

/// One open Live API connection
pub struct GeminiLiveClient {
    writer_tx: Option<mpsc::UnboundedSender<Message>>,
    rx_task: JoinHandle<()>,
    _tx_task: JoinHandle<()>,
}

impl GeminiLiveClient {
    /// Connect, send the setup message and wait for `setupComplete`.
    pub async fn connect(config: &LiveConfig, inbound: InboundSink) -> Result<Self> {
        let url = config.endpoint_url().ok_or(GeminiError::MissingApiKey)?;

        info!("Connecting to Gemini Live API (model {})", config.model);
        let (ws, resp) = connect_async(url.as_str()).await?;
        debug!("WebSocket handshake status: {}", resp.status());

        let (mut sink, mut stream) = ws.split();

        let setup = ClientMessage::Setup(BidiGenerateContentSetup::for_audio(config));
        sink.send(Message::text(serde_json::to_string(&setup)?)).await?;
        debug!("Setup message sent, waiting for acknowledgment");

        tokio::time::timeout(config.setup_timeout, wait_for_setup_complete(&mut stream))
            .await
            .map_err(|_| {
                error!("Timeout waiting for setup complete message");
                GeminiError::Timeout
            })??;
        info!("Gemini session setup complete");

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let tx_task = tokio::spawn(write_loop(sink, writer_rx));
        let rx_task = tokio::spawn(read_loop(stream, inbound));

        Ok(Self {
            writer_tx: Some(writer_tx),
            rx_task,
            _tx_task: tx_task,
        })
    }

    fn queue(&self, msg: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        match &self.writer_tx {
            Some(tx) => tx
                .send(Message::text(json))
                .map_err(|_| GeminiError::ChannelClosed),
            None => Err(GeminiError::ConnectionClosed),
        }
    }
}

impl LiveTransport for GeminiLiveClient {
    fn send_audio(&mut self, chunk: EncodedChunk) -> Result<()> {
        let input = RealtimeInput::audio(Blob {
            mime_type: chunk.mime_type,
            data: chunk.data,
        });
        self.queue(&ClientMessage::RealtimeInput(input))
    }

    fn close(&mut self) {
        if self.writer_tx.is_none() {
            return;
        }
        if let Err(e) = self.queue(&ClientMessage::RealtimeInput(RealtimeInput::stream_end())) {
            debug!("Could not send audioStreamEnd: {}", e);
        }
        if let Some(tx) = self.writer_tx.take() {
            let _ = tx.send(Message::Close(None));
        }
        // Nothing the server says after this is of interest
        self.rx_task.abort();
        info!("Gemini connection close requested");
    }
}

impl Drop for GeminiLiveClient {
    fn drop(&mut self) {
        self.rx_task.abort();
    }
}

/// Read frames until `setupComplete`, failing on close or socket errors.
async fn wait_for_setup_complete(stream: &mut WsSource) -> Result<()> {
    while let Some(message) = stream.next().await {
        let text = match message? {
            Message::Text(text) => text.as_str().to_owned(),
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => text.to_owned(),
                Err(_) => continue,
            },
            Message::Close(frame) => {
                let reason = close_reason(frame.as_ref());
                error!("Server closed the connection during setup: {:?}", reason);
                return Err(match reason {
                    Some(reason) => GeminiError::Rejected(reason),
                    None => GeminiError::ConnectionClosed,
                });
            }
            _ => continue,
        };

        match parse_server_frame(&text) {
            Ok(responses) if responses.contains(&ApiResponse::SetupComplete) => return Ok(()),
            Ok(_) => debug!("Ignoring pre-setup message"),
            Err(e) => warn!("Failed to parse server message during setup: {}", e),
        }
    }
    Err(GeminiError::SetupNotComplete)
}

async fn write_loop(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!("WebSocket send failed: {}", e);
            break;
        }
        if is_close {
            break;
        }
    }
    debug!("Outbound message task terminated");
}

async fn read_loop(mut stream: WsSource, inbound: InboundSink) {
    info!("Inbound message task started");

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Received non-UTF-8 binary message ({} bytes)", bytes.len());
                    continue;
                }
            },
            Ok(Message::Close(frame)) => {
                let reason = close_reason(frame.as_ref());
                info!("WebSocket closed by server: {:?}", reason);
                inbound.closed(reason);
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                error!("WebSocket error: {}", e);
                inbound.failed(e.to_string());
                return;
            }
        };

        match parse_server_frame(&text) {
            Ok(responses) => {
                for response in responses {
                    if !inbound.deliver(response) {
                        debug!("Session gone, stopping inbound task");
                        return;
                    }
                }
            }
            Err(e) => {
                error!("Failed to parse server message: {}", e);
                debug!("Raw message: {}", text);
            }
        }
    }

    inbound.closed(None);
}

fn close_reason(frame: Option<&CloseFrame>) -> Option<String> {
    frame
        .map(|f| f.reason.as_str().to_owned())
        .filter(|reason| !reason.is_empty())
}
