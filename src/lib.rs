//! camwatch
//!
//! Per-camera object tracking with activity-triggered clip recording.
//!
//! # Architecture
//!
//! Each camera runs an independent pipeline:
//!
//! 1. **Ingest**: a `FrameSource` (RTSP stream or local file) hands out RGB frames.
//! 2. **Detect**: every Nth frame goes through a bounded drop-oldest queue to
//!    one or more detector workers.
//! 3. **Track**: the newest detection result is folded into an `ObjectTracker`
//!    that keeps stable ids and marks objects that stop moving as static.
//! 4. **Record**: a `RecordingController` starts a clip (with pre-roll) when a
//!    moving object of a security class appears, and stops after a quiet period.
//! 5. **Persist**: a writer thread encodes the clip and writes a JSON sidecar.
//!
//! A `Supervisor` runs one pipeline per configured camera and isolates
//! failures: a bad camera config or a lost source affects only that camera.
//!
//! # Module Structure
//!
//! - `frame`: frames and the pre-roll ring buffer
//! - `ingest`: frame sources (RTSP, local files, `stub://` synthetic)
//! - `detect`: detector backends, registry and detection types
//! - `tracker`: object identity and static/moving state
//! - `recorder`: recording state machine, encoders and clip persistence
//! - `pipeline`, `supervisor`: threads, queues and lifecycle
//! - `config`, `events`, `error`: configuration, event sinks, failure taxonomy

pub mod config;
pub mod detect;
pub mod error;
pub mod events;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod queue;
pub mod recorder;
pub mod supervisor;
pub mod tracker;

pub use config::{
    CameraSettings, CamwatchConfig, DetectorSettings, EncoderKind, ReconnectSettings,
    SourceKind, SourceSettings,
};
pub use detect::{
    BackendRegistry, BoundingBox, Detection, DetectionBatch, DetectorBackend, SharedDetector,
    StubBackend, StubScene,
};
pub use error::PipelineError;
pub use events::{EventKind, EventSink, LogEventSink, MemoryEventSink, PipelineEvent};
pub use frame::{Frame, PrerollBuffer, MAX_BUFFER_FRAMES, MAX_PREROLL_SECS};
pub use ingest::{FileSource, FrameSource, RtspSource, SourceFactory, SourceStats};
pub use pipeline::{
    CameraPipeline, CameraSnapshot, PipelineExit, PipelineHandle, PipelineStats, StatsSnapshot,
};
pub use queue::DropOldestQueue;
pub use recorder::{
    ClipMetadata, ClipWriter, FinishedClip, RecorderConfig, RecorderState, RecordingController,
    VideoEncoder,
};
pub use supervisor::{CameraStatus, PipelineOutcome, Supervisor};
pub use tracker::{ObjectTracker, TrackedObject, TrackerConfig, TrackerEvent, TrackerUpdate};
