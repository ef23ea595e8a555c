//! Session configuration
//!
//! Everything the session manager and its devices need is carried in a
//! [`LiveConfig`], built once at startup and shared as `Arc<LiveConfig>`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Configuration for a live voice session
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Gemini API key. Sessions refuse to start without one.
    pub api_key: Option<String>,
    /// WebSocket endpoint, without the `key` query parameter
    pub endpoint: String,
    pub model: String,
    pub system_instruction: Option<String>,
    /// Prebuilt voice used for the model's speech
    pub voice_name: Option<String>,
    /// Capture sample rate sent to the endpoint
    pub input_sample_rate: u32,
    /// Playback sample rate; also the assumed rate of payloads without one
    pub output_sample_rate: u32,
    /// Samples per captured frame
    pub frame_samples: usize,
    pub setup_timeout: Duration,
    /// PulseAudio source name, `None` for the default
    pub input_device: Option<String>,
    /// PulseAudio sink name, `None` for the default
    pub output_device: Option<String>,
    /// Record each session under this directory when set
    pub record_dir: Option<PathBuf>,
    pub app_name: String,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            system_instruction: None,
            voice_name: Some("Orus".to_string()),
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            frame_samples: 320, // 20 ms at 16 kHz
            setup_timeout: Duration::from_secs(10),
            input_device: None,
            output_device: None,
            record_dir: None,
            app_name: "livevoice".to_string(),
        }
    }
}

impl LiveConfig {
    /// Build a configuration from the process environment.
    ///
    /// `GEMINI_API_KEY` supplies the key; `LIVEVOICE_*` variables override the
    /// remaining defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        config.api_key = non_empty("GEMINI_API_KEY");
        if let Some(model) = non_empty("LIVEVOICE_MODEL") {
            config.model = if model.starts_with("models/") {
                model
            } else {
                format!("models/{}", model)
            };
        }
        if let Some(voice) = non_empty("LIVEVOICE_VOICE") {
            config.voice_name = Some(voice);
        }
        config.system_instruction = non_empty("LIVEVOICE_SYSTEM_INSTRUCTION");
        config.input_device = non_empty("LIVEVOICE_INPUT_DEVICE");
        config.output_device = non_empty("LIVEVOICE_OUTPUT_DEVICE");
        config.record_dir = non_empty("LIVEVOICE_RECORD_DIR").map(PathBuf::from);
        if let Some(timeout) = non_empty("LIVEVOICE_SETUP_TIMEOUT_SECS") {
            let secs: u64 = timeout
                .trim()
                .parse()
                .with_context(|| format!("invalid LIVEVOICE_SETUP_TIMEOUT_SECS: {}", timeout))?;
            config.setup_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Full endpoint URL including the API key, if one is configured.
    pub fn endpoint_url(&self) -> Option<String> {
        self.api_key
            .as_ref()
            .map(|key| format!("{}?key={}", self.endpoint, key))
    }
}
