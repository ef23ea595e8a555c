//! Transcript assembly
//!
//! The endpoint streams transcription fragments for both directions. They are
//! accumulated per speaker and only become log entries when the model signals
//! the end of a turn.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Who said it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// Local user, from input transcription
    User,
    /// Remote model, from output transcription
    Model,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => write!(f, "user"),
            Speaker::Model => write!(f, "model"),
        }
    }
}

/// One finalized utterance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
}

impl TranscriptEntry {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    user: String,
    model: String,
    log: Vec<TranscriptEntry>,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and return the speaker's text so far.
    pub fn push(&mut self, speaker: Speaker, fragment: &str) -> &str {
        let buf = self.buffer_mut(speaker);
        buf.push_str(fragment);
        buf
    }

    /// Close the current turn.
    ///
    /// Non-empty accumulators become entries, user first, and are appended to
    /// the log. Both accumulators are cleared.
    pub fn finish_turn(&mut self) -> SmallVec<[TranscriptEntry; 2]> {
        let mut finished = SmallVec::new();
        for speaker in [Speaker::User, Speaker::Model] {
            let text = std::mem::take(self.buffer_mut(speaker));
            if !text.is_empty() {
                finished.push(TranscriptEntry { speaker, text });
            }
        }
        self.log.extend(finished.iter().cloned());
        finished
    }

    pub fn pending(&self, speaker: Speaker) -> &str {
        match speaker {
            Speaker::User => &self.user,
            Speaker::Model => &self.model,
        }
    }

    /// Drop in-flight text without finalizing it.
    pub fn discard_pending(&mut self) {
        self.user.clear();
        self.model.clear();
    }

    pub fn log(&self) -> &[TranscriptEntry] {
        &self.log
    }

    fn buffer_mut(&mut self, speaker: Speaker) -> &mut String {
        match speaker {
            Speaker::User => &mut self.user,
            Speaker::Model => &mut self.model,
        }
    }
}
