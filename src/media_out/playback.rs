//! Scheduled playback using PulseAudio
//!
//! The output thread writes 20 ms blocks to a blocking playback stream and
//! mixes every scheduled segment into the block that covers it. Silence is
//! written between segments, so the frame counter doubles as the output
//! clock the session schedules against.

use crate::codec::AudioBuffer;
use crate::config::LiveConfig;
use crate::devices::{PlaybackDevice, PlaybackError, PlaybackOutput};
use crate::events::SegmentSink;
use crate::schedule::SegmentId;
use async_trait::async_trait;
use libpulse_binding as pulse;
use libpulse_simple_binding as psimple;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

const BLOCK_MS: u32 = 20;
/// Blocks the server may hold ahead of the speaker
const BUFFERED_BLOCKS: u32 = 3;

enum Command {
    Schedule {
        id: SegmentId,
        start: f64,
        buffer: AudioBuffer,
    },
    Cancel(SegmentId),
    Shutdown,
}

struct Voice {
    id: SegmentId,
    start_frame: u64,
    samples: Vec<f32>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Mixes scheduled segments into consecutive output blocks
struct Mixer {
    position: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    fn new() -> Self {
        Self {
            position: 0,
            voices: Vec::new(),
        }
    }

    /// Queue `samples` at `start_frame`. Frames that fall before the current
    /// position are dropped so the segment still ends where it was placed.
    fn schedule(&mut self, id: SegmentId, start_frame: u64, mut samples: Vec<f32>) {
        let late = self.position.saturating_sub(start_frame);
        if late > 0 {
            let skip = (late as usize).min(samples.len());
            debug!("{} starts {} frames late, trimming", id, late);
            samples.drain(..skip);
        }
        self.voices.push(Voice {
            id,
            start_frame: start_frame.max(self.position),
            samples,
        });
    }

    fn cancel(&mut self, id: SegmentId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|voice| voice.id != id);
        self.voices.len() != before
    }

    /// Fill `out` with the next block. Returns the segments that ended in it.
    fn render(&mut self, out: &mut [f32]) -> SmallVec<[SegmentId; 4]> {
        out.fill(0.0);
        let block_start = self.position;
        let block_end = block_start + out.len() as u64;

        for voice in &self.voices {
            let from = voice.start_frame.max(block_start);
            let to = voice.end_frame().min(block_end);
            for frame in from..to {
                let sample = voice.samples[(frame - voice.start_frame) as usize];
                out[(frame - block_start) as usize] += sample;
            }
        }
        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }

        let mut finished = SmallVec::new();
        self.voices.retain(|voice| {
            if voice.end_frame() <= block_end {
                finished.push(voice.id);
                false
            } else {
                true
            }
        });
        self.position = block_end;
        finished
    }
}

/// The PulseAudio speaker
pub struct PulseSpeaker {
    app_name: String,
    device: Option<String>,
    sample_rate: u32,
}

impl PulseSpeaker {
    pub fn new(config: &LiveConfig) -> Self {
        Self {
            app_name: config.app_name.clone(),
            device: config.output_device.clone(),
            sample_rate: config.output_sample_rate,
        }
    }
}

/// Keep the server-side buffer a few blocks deep so the frame clock stays
/// close to what is audible and cancellation takes effect quickly.
fn playback_buffer_attr(sample_rate: u32) -> pulse::def::BufferAttr {
    let block_bytes = (sample_rate * BLOCK_MS / 1000).max(1) * 2;
    pulse::def::BufferAttr {
        maxlength: block_bytes * BUFFERED_BLOCKS * 2,
        tlength: block_bytes * BUFFERED_BLOCKS,
        prebuf: block_bytes,
        minreq: block_bytes,
        fragsize: u32::MAX,
    }
}

fn open_stream(
    app_name: &str,
    device: Option<&str>,
    sample_rate: u32,
) -> Result<psimple::Simple, PlaybackError> {
    let spec = pulse::sample::Spec {
        format: pulse::sample::Format::S16le,
        channels: 1,
        rate: sample_rate,
    };
    if !spec.is_valid() {
        return Err(PlaybackError::Device(format!(
            "invalid playback format: {} Hz mono",
            sample_rate
        )));
    }

    psimple::Simple::new(
        None,
        app_name,
        pulse::stream::Direction::Playback,
        device,
        "model speech",
        &spec,
        None,
        Some(&playback_buffer_attr(sample_rate)),
    )
    .map_err(|e| PlaybackError::Device(format!("{}: {}", device.unwrap_or("default sink"), e)))
}

#[async_trait]
impl PlaybackDevice for PulseSpeaker {
    async fn open(&self, done: SegmentSink) -> Result<Box<dyn PlaybackOutput>, PlaybackError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let clock = Arc::new(AtomicU64::new(0));

        let app_name = self.app_name.clone();
        let device = self.device.clone();
        let sample_rate = self.sample_rate;
        let thread_clock = clock.clone();

        std::thread::Builder::new()
            .name("livevoice-playback".to_string())
            .spawn(move || {
                let stream = match open_stream(&app_name, device.as_deref(), sample_rate) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                info!(
                    "Speaker connected ({}, {} Hz)",
                    device.as_deref().unwrap_or("default"),
                    sample_rate
                );
                playback_loop(stream, cmd_rx, thread_clock, sample_rate, done);
                debug!("Speaker closed");
            })?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Box::new(PulseOutput {
                commands: cmd_tx,
                clock,
                sample_rate,
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PlaybackError::Device(
                "playback thread exited before opening the device".to_string(),
            )),
        }
    }
}

fn playback_loop(
    stream: psimple::Simple,
    commands: mpsc::Receiver<Command>,
    clock: Arc<AtomicU64>,
    sample_rate: u32,
    done: SegmentSink,
) {
    let block_frames = (sample_rate * BLOCK_MS / 1000).max(1) as usize;
    let mut mixer = Mixer::new();
    let mut block = vec![0f32; block_frames];
    let mut bytes = vec![0u8; block_frames * 2];

    loop {
        loop {
            match commands.try_recv() {
                Ok(Command::Schedule { id, start, buffer }) => {
                    let start_frame = (start.max(0.0) * sample_rate as f64).round() as u64;
                    mixer.schedule(id, start_frame, buffer.into_rate(sample_rate).samples);
                }
                Ok(Command::Cancel(id)) => {
                    if mixer.cancel(id) {
                        debug!("Cancelled {}", id);
                    }
                }
                Ok(Command::Shutdown) | Err(mpsc::TryRecvError::Disconnected) => {
                    if let Err(e) = stream.flush() {
                        warn!("Failed to flush playback stream: {}", e);
                    }
                    return;
                }
                Err(mpsc::TryRecvError::Empty) => break,
            }
        }

        let finished = mixer.render(&mut block);
        // The block is committed; anything scheduled from now on lands after it
        clock.store(mixer.position, Ordering::SeqCst);

        for (out, sample) in bytes.chunks_exact_mut(2).zip(&block) {
            let value = (sample * i16::MAX as f32) as i16;
            out.copy_from_slice(&value.to_le_bytes());
        }
        if let Err(e) = stream.write(&bytes) {
            error!("Failed to write audio: {}", e);
            done.failed(format!("speaker write failed: {}", e));
            return;
        }

        for id in finished {
            done.finished(id);
        }
    }
}

/// An open PulseAudio playback stream
pub struct PulseOutput {
    commands: mpsc::Sender<Command>,
    clock: Arc<AtomicU64>,
    sample_rate: u32,
}

impl PulseOutput {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Playback thread has exited");
        }
    }
}

impl PlaybackOutput for PulseOutput {
    fn now(&self) -> f64 {
        self.clock.load(Ordering::SeqCst) as f64 / self.sample_rate as f64
    }

    fn schedule(&mut self, id: SegmentId, start: f64, buffer: AudioBuffer) {
        self.send(Command::Schedule { id, start, buffer });
    }

    fn cancel(&mut self, id: SegmentId) {
        self.send(Command::Cancel(id));
    }

    fn close(self: Box<Self>) {
        self.send(Command::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::PlaybackScheduler;

    fn ids(scheduler: &mut PlaybackScheduler, durations: &[f64]) -> Vec<SegmentId> {
        durations
            .iter()
            .map(|d| scheduler.schedule(0.0, *d).id)
            .collect()
    }

    #[test]
    fn test_segments_play_back_to_back() {
        let mut scheduler = PlaybackScheduler::new();
        let seg = ids(&mut scheduler, &[0.004, 0.004]);
        let mut mixer = Mixer::new();
        mixer.schedule(seg[0], 0, vec![0.1; 4]);
        mixer.schedule(seg[1], 4, vec![0.2; 4]);

        let mut block = vec![0.0; 6];
        let finished = mixer.render(&mut block);
        assert_eq!(block, vec![0.1, 0.1, 0.1, 0.1, 0.2, 0.2]);
        assert_eq!(finished.as_slice(), &[seg[0]]);

        let finished = mixer.render(&mut block);
        assert_eq!(block, vec![0.2, 0.2, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(finished.as_slice(), &[seg[1]]);
        assert_eq!(mixer.position, 12);
    }

    #[test]
    fn test_late_start_keeps_its_end_frame() {
        let mut scheduler = PlaybackScheduler::new();
        let seg = ids(&mut scheduler, &[0.003, 0.002]);
        let mut mixer = Mixer::new();
        let mut block = vec![0.0; 4];
        mixer.render(&mut block);

        // Placed at frame 3 but the block holding it is already rendered
        mixer.schedule(seg[0], 3, vec![0.1, 0.2, 0.3]);
        mixer.schedule(seg[1], 6, vec![0.4, 0.4]);
        let finished = mixer.render(&mut block);
        assert_eq!(block, vec![0.2, 0.3, 0.4, 0.4]);
        assert_eq!(finished.as_slice(), &[seg[0], seg[1]]);
    }

    #[test]
    fn test_segment_entirely_in_the_past_finishes_silently() {
        let mut scheduler = PlaybackScheduler::new();
        let seg = ids(&mut scheduler, &[0.002]);
        let mut mixer = Mixer::new();
        let mut block = vec![0.0; 4];
        mixer.render(&mut block);

        mixer.schedule(seg[0], 1, vec![0.5, 0.5]);
        let finished = mixer.render(&mut block);
        assert_eq!(block, vec![0.0; 4]);
        assert_eq!(finished.as_slice(), &[seg[0]]);
    }

    #[test]
    fn test_playback_buffer_is_a_few_blocks() {
        let attr = playback_buffer_attr(24_000);
        // 20 ms of 16-bit mono at 24 kHz
        assert_eq!(attr.minreq, 960);
        assert_eq!(attr.prebuf, 960);
        assert_eq!(attr.tlength, 2_880);
        assert!(attr.maxlength >= attr.tlength);
    }

    #[test]
    fn test_cancel_silences_segment() {
        let mut scheduler = PlaybackScheduler::new();
        let seg = ids(&mut scheduler, &[0.008]);
        let mut mixer = Mixer::new();
        mixer.schedule(seg[0], 0, vec![0.3; 8]);

        let mut block = vec![0.0; 4];
        mixer.render(&mut block);
        assert!(mixer.cancel(seg[0]));
        assert!(!mixer.cancel(seg[0]));

        let finished = mixer.render(&mut block);
        assert_eq!(block, vec![0.0; 4]);
        assert!(finished.is_empty());
    }

    #[test]
    fn test_overlapping_segments_are_clamped() {
        let mut scheduler = PlaybackScheduler::new();
        let seg = ids(&mut scheduler, &[0.002, 0.002]);
        let mut mixer = Mixer::new();
        mixer.schedule(seg[0], 0, vec![0.8, -0.8]);
        mixer.schedule(seg[1], 0, vec![0.8, -0.8]);

        let mut block = vec![0.0; 2];
        let finished = mixer.render(&mut block);
        assert_eq!(block, vec![1.0, -1.0]);
        assert_eq!(finished.len(), 2);
    }
}
