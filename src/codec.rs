//! PCM payload codec
//!
//! Outbound frames are 16-bit little-endian mono PCM, base64 encoded for the
//! `realtimeInput.audio` blob. Inbound model audio arrives the same way, with
//! the sample rate carried in the MIME type (`audio/pcm;rate=24000`).

use base64::engine::general_purpose;
use base64::Engine;

/// One encoded outbound audio frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub data: String,
    pub mime_type: String,
}

/// Decoded mono audio ready for playback
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Return this buffer at `rate`, resampling if needed.
    pub fn into_rate(self, rate: u32) -> AudioBuffer {
        if self.sample_rate == rate || rate == 0 {
            return self;
        }
        AudioBuffer {
            samples: resample_linear(&self.samples, self.sample_rate, rate),
            sample_rate: rate,
        }
    }
}

/// Errors decoding an inbound audio payload
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("PCM payload has odd length ({0} bytes)")]
    OddLength(usize),

    #[error("empty audio payload")]
    Empty,

    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),
}

/// MIME type for raw 16-bit PCM at `rate`.
pub fn pcm_mime(rate: u32) -> String {
    format!("audio/pcm;rate={}", rate)
}

/// Encode one captured frame for transmission.
pub fn encode_pcm16(samples: &[i16], sample_rate: u32) -> EncodedChunk {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    EncodedChunk {
        data: general_purpose::STANDARD.encode(&bytes),
        mime_type: pcm_mime(sample_rate),
    }
}

/// Decode a base64 PCM payload from the endpoint.
///
/// `default_rate` applies when the MIME type is missing or carries no rate.
pub fn decode_pcm16(
    data: &str,
    mime_type: Option<&str>,
    default_rate: u32,
) -> Result<AudioBuffer, DecodeError> {
    let sample_rate = match mime_type {
        Some(mime) => {
            let mime = mime.trim();
            let base = mime.split(';').next().unwrap_or("").trim();
            if !base.eq_ignore_ascii_case("audio/pcm") && !base.eq_ignore_ascii_case("audio/l16") {
                return Err(DecodeError::UnsupportedFormat(mime.to_string()));
            }
            parse_rate(mime).unwrap_or(default_rate)
        }
        None => default_rate,
    };

    let bytes = general_purpose::STANDARD.decode(data.trim())?;
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::OddLength(bytes.len()));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();

    Ok(AudioBuffer {
        samples,
        sample_rate,
    })
}

fn parse_rate(mime: &str) -> Option<u32> {
    mime.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("rate") {
            value.trim().parse().ok().filter(|rate| *rate > 0)
        } else {
            None
        }
    })
}

/// Linear-interpolation resampler for mono audio.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let out_len = ((samples.len() as u64 * to_rate as u64) / from_rate as u64).max(1) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] + (samples[next] - samples[idx]) * frac
        })
        .collect()
}
