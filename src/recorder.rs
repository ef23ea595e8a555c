//! Session recorder - saves both audio directions and the transcript to disk
//!
//! Each session gets its own directory under the configured root:
//!
//! ```text
//! recordings/session_20250603_153055/
//!     input.wav         microphone audio as sent
//!     output.wav        model audio as received
//!     transcript.jsonl  one finalized entry per line
//! ```
//!
//! Recording never interrupts a session. Write failures are logged and the
//! affected writer is dropped.

use crate::codec::AudioBuffer;
use crate::transcript::TranscriptEntry;
use chrono::Local;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

type WavFile = hound::WavWriter<BufWriter<File>>;

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

pub struct SessionRecorder {
    dir: PathBuf,
    input: Option<WavFile>,
    output: Option<WavFile>,
    output_rate: u32,
    transcript: Option<BufWriter<File>>,
}

fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

/// First free `session_<timestamp>[_n]` directory under `root`
fn session_dir(root: &Path) -> PathBuf {
    let ts = Local::now().format("%Y%m%d_%H%M%S").to_string();
    let base = root.join(format!("session_{}", ts));
    if !base.exists() {
        return base;
    }
    (1..)
        .map(|n| root.join(format!("session_{}_{}", ts, n)))
        .find(|dir| !dir.exists())
        .unwrap_or(base)
}

impl SessionRecorder {
    pub fn create(root: &Path, input_rate: u32, output_rate: u32) -> Result<Self, RecorderError> {
        let dir = session_dir(root);
        fs::create_dir_all(&dir)?;

        let input = hound::WavWriter::create(dir.join("input.wav"), wav_spec(input_rate))?;
        let output = hound::WavWriter::create(dir.join("output.wav"), wav_spec(output_rate))?;
        let transcript = BufWriter::new(File::create(dir.join("transcript.jsonl"))?);

        info!("Recording session to {:?}", dir);
        Ok(Self {
            dir,
            input: Some(input),
            output: Some(output),
            output_rate,
            transcript: Some(transcript),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_input(&mut self, pcm: &[i16]) {
        let Some(writer) = self.input.as_mut() else {
            return;
        };
        for &sample in pcm {
            if let Err(e) = writer.write_sample(sample) {
                error!("Failed to write input audio, disabling: {}", e);
                self.input = None;
                return;
            }
        }
    }

    pub fn write_output(&mut self, buffer: &AudioBuffer) {
        let Some(writer) = self.output.as_mut() else {
            return;
        };
        let resampled;
        let samples = if buffer.sample_rate == self.output_rate {
            &buffer.samples
        } else {
            resampled = buffer.clone().into_rate(self.output_rate);
            &resampled.samples
        };
        for &sample in samples {
            let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            if let Err(e) = writer.write_sample(value) {
                error!("Failed to write output audio, disabling: {}", e);
                self.output = None;
                return;
            }
        }
    }

    pub fn write_entry(&mut self, entry: &TranscriptEntry) {
        let Some(writer) = self.transcript.as_mut() else {
            return;
        };
        let result = serde_json::to_string(entry)
            .map_err(std::io::Error::from)
            .and_then(|line| writeln!(writer, "{}", line));
        if let Err(e) = result {
            error!("Failed to write transcript entry, disabling: {}", e);
            self.transcript = None;
        }
    }

    /// Flush and close every file.
    pub fn finish(self) {
        for (name, writer) in [("input", self.input), ("output", self.output)] {
            if let Some(writer) = writer {
                if let Err(e) = writer.finalize() {
                    error!("Failed to finalize {} audio: {}", name, e);
                }
            }
        }
        if let Some(mut writer) = self.transcript {
            if let Err(e) = writer.flush() {
                error!("Failed to flush transcript: {}", e);
            }
        }
        debug!("Closed recording in {:?}", self.dir);
    }
}
