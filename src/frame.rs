//! Frames and the pre-roll ring buffer.
//!
//! - `Frame`: immutable RGB pixel buffer with a sequence number and capture time.
//! - `PrerollBuffer`: bounded FIFO of the most recent frames, copied into a clip
//!   when recording starts so the clip has lead-in context.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Hard cap on pre-roll length regardless of configuration.
pub const MAX_PREROLL_SECS: f64 = 30.0;

/// Hard cap on buffered pre-roll frames (30 s at 30 fps).
pub const MAX_BUFFER_FRAMES: usize = 900;

/// Bytes per pixel; frames are always interleaved RGB.
pub const CHANNELS: usize = 3;

/// Seconds since the Unix epoch as `f64`.
pub fn now_epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded frame.
///
/// Pixels sit behind an `Arc<[u8]>`: clones handed to the detection queue and
/// the pre-roll buffer share the bytes, and nothing can mutate them.
#[derive(Clone, Debug)]
pub struct Frame {
    pixels: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Monotonically increasing per pipeline.
    pub seq: u64,
    /// Capture time, seconds since the Unix epoch.
    pub timestamp: f64,
}

impl Frame {
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, seq: u64, timestamp: f64) -> Self {
        Self {
            pixels: pixels.into(),
            width,
            height,
            seq,
            timestamp,
        }
    }

    /// Solid-color frame, mostly for tests and synthetic sources.
    pub fn filled(width: u32, height: u32, value: u8, seq: u64, timestamp: f64) -> Self {
        let len = width as usize * height as usize * CHANNELS;
        Self::new(vec![value; len], width, height, seq, timestamp)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * CHANNELS
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// A short read from a decode pipe shows up as a length mismatch here.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(anyhow!("frame {} has zero dimension", self.seq));
        }
        if self.pixels.len() != self.expected_len() {
            return Err(anyhow!(
                "frame {} is malformed: expected {} bytes for {}x{}, got {}",
                self.seq,
                self.expected_len(),
                self.width,
                self.height,
                self.pixels.len()
            ));
        }
        if !self.timestamp.is_finite() {
            return Err(anyhow!("frame {} has a non-finite timestamp", self.seq));
        }
        Ok(())
    }

    /// Same pixels, renumbered. Used when a reconnected source restarts at 1.
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ----------------------------------------------------------------------------
// PrerollBuffer
// ----------------------------------------------------------------------------

/// Bounded ring buffer for pre-roll frames.
///
/// - Capacity is `preroll_secs × fps`, clamped to `MAX_BUFFER_FRAMES`
/// - Always appended to, recording or not
/// - Oldest frame is evicted when full; order is strictly FIFO by `seq`
pub struct PrerollBuffer {
    buffer: VecDeque<Frame>,
    max_frames: usize,
}

impl PrerollBuffer {
    pub fn new(preroll_secs: f64, fps: u32) -> Self {
        Self::with_capacity(Self::capacity_for(preroll_secs, fps))
    }

    pub fn with_capacity(max_frames: usize) -> Self {
        let max_frames = max_frames.clamp(1, MAX_BUFFER_FRAMES);
        Self {
            buffer: VecDeque::with_capacity(max_frames),
            max_frames,
        }
    }

    pub fn capacity_for(preroll_secs: f64, fps: u32) -> usize {
        let secs = if preroll_secs.is_finite() {
            preroll_secs.clamp(0.0, MAX_PREROLL_SECS)
        } else {
            0.0
        };
        ((secs * fps as f64).ceil() as usize).max(1)
    }

    /// Push a frame, evicting the oldest when at capacity.
    pub fn push(&mut self, frame: Frame) {
        if let Some(newest) = self.buffer.back() {
            if frame.seq <= newest.seq {
                log::debug!(
                    "preroll: out-of-order frame seq={} after seq={}, dropped",
                    frame.seq,
                    newest.seq
                );
                return;
            }
        }
        while self.buffer.len() >= self.max_frames {
            self.buffer.pop_front();
        }
        self.buffer.push_back(frame);
    }

    /// Copy of every buffered frame, oldest first.
    pub fn snapshot(&self) -> Vec<Frame> {
        self.buffer.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<&Frame> {
        self.buffer.back()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_frames
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Memory usage estimate.
    pub fn memory_bytes(&self) -> usize {
        self.buffer.iter().map(|f| f.byte_len()).sum()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u64) -> Frame {
        Frame::filled(4, 2, seq as u8, seq, seq as f64 * 0.05)
    }

    #[test]
    fn frame_validate_detects_short_read() {
        let ok = frame(1);
        assert!(ok.validate().is_ok());

        let short = Frame::new(vec![0u8; 10], 4, 2, 2, 0.0);
        assert!(short.validate().is_err());

        let empty = Frame::new(Vec::new(), 0, 0, 3, 0.0);
        assert!(empty.validate().is_err());
    }

    #[test]
    fn frame_clones_share_pixels() {
        let a = frame(1);
        let b = a.clone();
        assert_eq!(a.pixels().as_ptr(), b.pixels().as_ptr());
    }

    #[test]
    fn preroll_capacity_is_seconds_times_fps() {
        assert_eq!(PrerollBuffer::capacity_for(3.0, 20), 60);
        assert_eq!(PrerollBuffer::capacity_for(0.0, 20), 1);
        assert_eq!(PrerollBuffer::capacity_for(0.25, 10), 3);
        assert_eq!(PrerollBuffer::capacity_for(120.0, 30), 900);
    }

    #[test]
    fn preroll_evicts_oldest_and_keeps_fifo_order() {
        let mut buf = PrerollBuffer::with_capacity(5);
        for seq in 1..=12 {
            buf.push(frame(seq));
        }
        assert_eq!(buf.len(), 5);
        let seqs: Vec<u64> = buf.snapshot().iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10, 11, 12]);
        assert_eq!(buf.latest().map(|f| f.seq), Some(12));
    }

    #[test]
    fn preroll_rejects_stale_sequence_numbers() {
        let mut buf = PrerollBuffer::with_capacity(5);
        buf.push(frame(3));
        buf.push(frame(2));
        buf.push(frame(3));
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn preroll_snapshot_is_independent_of_later_pushes() {
        let mut buf = PrerollBuffer::with_capacity(3);
        for seq in 1..=3 {
            buf.push(frame(seq));
        }
        let snap = buf.snapshot();
        buf.push(frame(4));
        assert_eq!(snap.len(), 3);
        assert_eq!(snap[0].seq, 1);
        assert_eq!(buf.snapshot()[0].seq, 2);
        assert_eq!(buf.memory_bytes(), 3 * 4 * 2 * 3);
    }
}
