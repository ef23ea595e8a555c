//! Gemini Live API wire types
//!
//! Serde models for the messages exchanged with the `BidiGenerateContent`
//! WebSocket endpoint, plus the translation of server frames into the
//! [`ApiResponse`] events the session consumes.

use crate::config::LiveConfig;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio_tungstenite::tungstenite::Error as WsError;


/// Output modality requested from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    Audio,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<ResponseModality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
}

/// Enables transcription for one direction of the conversation.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct AudioTranscriptionConfig {}

/// Inline binary data
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BidiGenerateContentSetup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<AudioTranscriptionConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<AudioTranscriptionConfig>,
}

impl BidiGenerateContentSetup {
    /// Audio-in/audio-out setup with transcription enabled both ways.
    pub fn for_audio(config: &LiveConfig) -> Self {
        let speech_config = config.voice_name.as_ref().map(|voice| SpeechConfig {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice.clone(),
                },
            },
        });

        Self {
            model: config.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                speech_config,
            }),
            system_instruction: config.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part {
                    text: Some(text.clone()),
                    inline_data: None,
                }],
            }),
            input_audio_transcription: Some(AudioTranscriptionConfig {}),
            output_audio_transcription: Some(AudioTranscriptionConfig {}),
        }
    }
}

/// A chunk of realtime input
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

impl RealtimeInput {
    pub fn audio(blob: Blob) -> Self {
        Self {
            audio: Some(blob),
            audio_stream_end: None,
        }
    }

    /// Tells the server the microphone was turned off.
    pub fn stream_end() -> Self {
        Self {
            audio: None,
            audio_stream_end: Some(true),
        }
    }
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(BidiGenerateContentSetup),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub input_transcription: Option<Transcription>,
    #[serde(default)]
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

/// Server -> client messages. Any combination of fields may be present.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<serde_json::Value>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

/// Error type for Gemini API operations
#[derive(Debug, thiserror::Error)]
pub enum GeminiError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("API key not configured")]
    MissingApiKey,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Server rejected the session: {0}")]
    Rejected(String),

    #[error("Setup not complete")]
    SetupNotComplete,

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, GeminiError>;

/// Response from the Gemini API
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    /// Setup has been completed
    SetupComplete,

    /// Transcription fragment of user input
    InputTranscription(String),

    /// Transcription fragment of the model's speech
    OutputTranscription(String),

    /// Text part of the model turn
    Text(String),

    /// Audio part of the model turn, still base64 encoded
    Audio {
        data: String,
        mime_type: Option<String>,
    },

    /// The model stopped talking because the user barged in
    Interrupted,

    /// The model finished its turn
    TurnComplete,

    /// Server will disconnect soon
    GoAway { time_left: Option<String> },
}

impl ServerMessage {
    /// Flatten this message into session events.
    ///
    /// Transcriptions come first and the turn boundary last, so a frame that
    /// carries both a fragment and `turnComplete` finalizes that fragment.
    pub fn into_responses(self) -> SmallVec<[ApiResponse; 4]> {
        let mut out = SmallVec::new();

        if self.setup_complete.is_some() {
            out.push(ApiResponse::SetupComplete);
        }

        if let Some(content) = self.server_content {
            if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
                out.push(ApiResponse::InputTranscription(t.text));
            }
            if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
                out.push(ApiResponse::OutputTranscription(t.text));
            }

            for part in content.model_turn.map(|turn| turn.parts).unwrap_or_default() {
                if let Some(text) = part.text.filter(|t| !t.is_empty()) {
                    out.push(ApiResponse::Text(text));
                } else if let Some(blob) = part.inline_data {
                    let mime_type = Some(blob.mime_type).filter(|m| !m.is_empty());
                    out.push(ApiResponse::Audio {
                        data: blob.data,
                        mime_type,
                    });
                }
            }

            if content.interrupted {
                out.push(ApiResponse::Interrupted);
            }
            if content.turn_complete {
                out.push(ApiResponse::TurnComplete);
            }
        }

        if let Some(go_away) = self.go_away {
            out.push(ApiResponse::GoAway {
                time_left: go_away.time_left,
            });
        }

        out
    }
}

/// Parse one text (or UTF-8 binary) frame from the server.
pub fn parse_server_frame(text: &str) -> Result<SmallVec<[ApiResponse; 4]>> {
    let message: ServerMessage = serde_json::from_str(text)?;
    if message.tool_call.is_some() {
        tracing::debug!("Ignoring tool call; no tools are declared for voice sessions");
    }
    Ok(message.into_responses())
}
