//! Gapless playback scheduling
//!
//! The scheduler owns the playback cursor and the arena of segments that have
//! been handed to the output but have not finished playing. It knows nothing
//! about the device: callers pass in the device clock and forward the
//! returned start times.

use std::collections::BTreeMap;
use std::fmt;

/// Cursor value for a fresh or reset session
pub const INITIAL_CURSOR: f64 = 0.0;

/// Handle for one scheduled segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(u64);

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg#{}", self.0)
    }
}

/// A segment placed on the playback timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSegment {
    pub id: SegmentId,
    /// Start time on the output clock, in seconds
    pub start: f64,
    /// Duration in seconds
    pub duration: f64,
}

impl ScheduledSegment {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Playback cursor plus the pending segment arena
#[derive(Debug)]
pub struct PlaybackScheduler {
    cursor: f64,
    next_id: u64,
    pending: BTreeMap<SegmentId, ScheduledSegment>,
}

impl Default for PlaybackScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self {
            cursor: INITIAL_CURSOR,
            next_id: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Place a segment of `duration` seconds given the output's current clock.
    ///
    /// The segment starts at `max(cursor, clock)` and the cursor moves to its
    /// end, so consecutive segments never overlap however they arrive.
    pub fn schedule(&mut self, clock: f64, duration: f64) -> ScheduledSegment {
        let duration = if duration.is_finite() && duration > 0.0 {
            duration
        } else {
            0.0
        };
        let clock = if clock.is_finite() { clock } else { self.cursor };

        let start = self.cursor.max(clock);
        let segment = ScheduledSegment {
            id: SegmentId(self.next_id),
            start,
            duration,
        };
        self.next_id += 1;
        self.cursor = segment.end();
        self.pending.insert(segment.id, segment);
        segment
    }

    /// Forget a segment that finished playing. Unknown ids return `None`.
    pub fn complete(&mut self, id: SegmentId) -> Option<ScheduledSegment> {
        self.pending.remove(&id)
    }

    /// Remove every pending segment and reset the cursor.
    ///
    /// The returned segments still need cancelling on the output.
    pub fn drain(&mut self) -> Vec<ScheduledSegment> {
        let drained = std::mem::take(&mut self.pending).into_values().collect();
        self.cursor = INITIAL_CURSOR;
        drained
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
