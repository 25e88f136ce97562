//! Activity-triggered clip recording.
//!
//! `RecordingController` is a two-state machine (idle / recording) driven by
//! the objects observed in each detection batch. Every ingested frame goes
//! into the pre-roll buffer; while recording, frames also accumulate in the
//! active session. A finished session becomes a `FinishedClip`, which the
//! `ClipWriter` encodes and describes with a JSON sidecar.

mod encoder;
mod storage;

pub use encoder::{encoder_for, FfmpegCliEncoder, RawVideoEncoder, VideoEncoder};
pub use storage::{clip_stem, read_sidecar, write_atomic, ClipMetadata, ClipWriter};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::frame::{Frame, PrerollBuffer};
use crate::tracker::TrackedObject;

pub const DEFAULT_SECURITY_CLASSES: [&str; 6] =
    ["person", "car", "motorcycle", "bicycle", "bus", "truck"];
const DEFAULT_THRESHOLD: f32 = 0.5;
const DEFAULT_RECORDING_DURATION_SECS: f64 = 20.0;
const DEFAULT_PREROLL_SECS: f64 = 3.0;
const DEFAULT_FPS: u32 = 20;
const DEFAULT_MAX_CLIP_SECS: f64 = 60.0;

#[derive(Clone, Debug, PartialEq)]
pub struct RecorderConfig {
    pub security_classes: Vec<String>,
    /// Per-class overrides of `default_threshold`.
    pub class_thresholds: HashMap<String, f32>,
    pub default_threshold: f32,
    /// Quiet period after the last qualifying detection before a clip closes.
    pub recording_duration: f64,
    pub preroll_secs: f64,
    pub fps: u32,
    /// Sessions are cut at this length so held frames stay bounded; continued
    /// activity opens a new clip on the next batch.
    pub max_clip_secs: f64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            security_classes: DEFAULT_SECURITY_CLASSES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            class_thresholds: HashMap::new(),
            default_threshold: DEFAULT_THRESHOLD,
            recording_duration: DEFAULT_RECORDING_DURATION_SECS,
            preroll_secs: DEFAULT_PREROLL_SECS,
            fps: DEFAULT_FPS,
            max_clip_secs: DEFAULT_MAX_CLIP_SECS,
        }
    }
}

impl RecorderConfig {
    pub fn threshold_for(&self, label: &str) -> f32 {
        self.class_thresholds
            .get(label)
            .copied()
            .unwrap_or(self.default_threshold)
    }

    /// Security-relevant class, above its threshold, and not static.
    pub fn qualifies(&self, obj: &TrackedObject) -> bool {
        !obj.is_static
            && self.security_classes.iter().any(|c| c == &obj.label)
            && obj.confidence > self.threshold_for(&obj.label)
    }
}

// ----------------------------------------------------------------------------
// Session types
// ----------------------------------------------------------------------------

/// One entry of a clip's detection log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub timestamp: f64,
    pub label: String,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in pixels.
    pub bbox: [f32; 4],
    pub object_id: u64,
}

impl DetectionRecord {
    fn from_object(obj: &TrackedObject, now: f64) -> Self {
        Self {
            timestamp: now,
            label: obj.label.clone(),
            confidence: obj.confidence,
            bbox: obj.bbox.to_array(),
            object_id: obj.id,
        }
    }
}

/// The in-progress clip. At most one exists per controller.
#[derive(Debug)]
pub struct RecordingSession {
    pub video_id: String,
    /// Output path without extension; the encoder picks the extension.
    pub output_stem: PathBuf,
    pub start_time: f64,
    pub last_qualifying_time: f64,
    pub detections_log: Vec<DetectionRecord>,
    pub preroll_frames: usize,
    frames: Vec<Frame>,
}

impl RecordingSession {
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

/// A closed session, ready to encode.
#[derive(Debug)]
pub struct FinishedClip {
    pub camera_id: String,
    pub video_id: String,
    pub output_stem: PathBuf,
    pub start_time: f64,
    pub end_time: f64,
    pub fps: u32,
    pub preroll_frames: usize,
    pub frames: Vec<Frame>,
    pub detections: Vec<DetectionRecord>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RecordingStarted {
    pub video_id: String,
    pub start_time: f64,
    pub preroll_frames: usize,
    pub trigger_object_id: u64,
    pub trigger_label: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
}

fn new_video_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ----------------------------------------------------------------------------
// Controller
// ----------------------------------------------------------------------------

pub struct RecordingController {
    camera_id: String,
    config: RecorderConfig,
    recordings_root: PathBuf,
    preroll: PrerollBuffer,
    session: Option<RecordingSession>,
}

impl RecordingController {
    pub fn new(camera_id: &str, config: RecorderConfig, recordings_root: &Path) -> Self {
        let preroll = PrerollBuffer::new(config.preroll_secs, config.fps);
        Self {
            camera_id: camera_id.to_string(),
            config,
            recordings_root: recordings_root.to_path_buf(),
            preroll,
            session: None,
        }
    }

    pub fn state(&self) -> RecorderState {
        if self.session.is_some() {
            RecorderState::Recording
        } else {
            RecorderState::Idle
        }
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.session.as_ref()
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn preroll_len(&self) -> usize {
        self.preroll.len()
    }

    /// Feed the objects observed in the latest detection batch.
    ///
    /// Starts a session on the first qualifying object while idle. Every
    /// qualifying object is logged and refreshes the quiet-period timer.
    pub fn observe<'a, I>(&mut self, objects: I, now: f64) -> Option<RecordingStarted>
    where
        I: IntoIterator<Item = &'a TrackedObject>,
    {
        let mut started = None;
        for obj in objects {
            if !self.config.qualifies(obj) {
                continue;
            }
            if self.session.is_none() {
                let session = self.open_session(now);
                log::info!(
                    "recording started camera={} video_id={} trigger={}#{} conf={:.2} preroll_frames={}",
                    self.camera_id,
                    session.video_id,
                    obj.label,
                    obj.id,
                    obj.confidence,
                    session.preroll_frames
                );
                started = Some(RecordingStarted {
                    video_id: session.video_id.clone(),
                    start_time: now,
                    preroll_frames: session.preroll_frames,
                    trigger_object_id: obj.id,
                    trigger_label: obj.label.clone(),
                });
                self.session = Some(session);
            }
            if let Some(session) = self.session.as_mut() {
                session
                    .detections_log
                    .push(DetectionRecord::from_object(obj, now));
                session.last_qualifying_time = now;
            }
        }
        started
    }

    fn open_session(&self, now: f64) -> RecordingSession {
        let video_id = new_video_id();
        let frames = self.preroll.snapshot();
        RecordingSession {
            output_stem: clip_stem(&self.recordings_root, &self.camera_id, now, &video_id),
            video_id,
            start_time: now,
            last_qualifying_time: now,
            detections_log: Vec::new(),
            preroll_frames: frames.len(),
            frames,
        }
    }

    /// Close the session once the quiet period (or the clip length cap) elapses.
    pub fn poll(&mut self, now: f64) -> Option<FinishedClip> {
        let session = self.session.as_ref()?;
        let quiet = now - session.last_qualifying_time >= self.config.recording_duration;
        let too_long = now - session.start_time >= self.config.max_clip_secs;
        if !(quiet || too_long) {
            return None;
        }
        if too_long && !quiet {
            log::info!(
                "recording cut at max length camera={} video_id={}",
                self.camera_id,
                session.video_id
            );
        }
        self.finish(now)
    }

    /// Push a frame into the pre-roll and, while recording, the session.
    pub fn ingest_frame(&mut self, frame: &Frame) {
        self.preroll.push(frame.clone());
        if let Some(session) = self.session.as_mut() {
            session.frames.push(frame.clone());
        }
    }

    /// Close the active session regardless of timers.
    pub fn finish(&mut self, now: f64) -> Option<FinishedClip> {
        let session = self.session.take()?;
        log::info!(
            "recording stopped camera={} video_id={} frames={} detections={}",
            self.camera_id,
            session.video_id,
            session.frames.len(),
            session.detections_log.len()
        );
        Some(FinishedClip {
            camera_id: self.camera_id.clone(),
            video_id: session.video_id,
            output_stem: session.output_stem,
            start_time: session.start_time,
            end_time: now,
            fps: self.config.fps,
            preroll_frames: session.preroll_frames,
            frames: session.frames,
            detections: session.detections_log,
        })
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
