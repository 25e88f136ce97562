use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::PipelineError;
use crate::frame::MAX_PREROLL_SECS;
use crate::recorder::RecorderConfig;
use crate::tracker::TrackerConfig;

const DEFAULT_RECORDINGS_DIR: &str = "recordings";
const DEFAULT_DETECTOR_BACKEND: &str = "stub";
const DEFAULT_MODEL_INPUT_SIZE: u32 = 640;
const DEFAULT_MIN_CONFIDENCE: f32 = 0.25;
const DEFAULT_CAMERA_ID: &str = "front";
const DEFAULT_CAMERA_URL: &str = "stub://front";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 20;
const DEFAULT_DETECTION_STRIDE: u64 = 4;
const DEFAULT_DETECTOR_WORKERS: usize = 1;
const DEFAULT_FRAME_QUEUE_CAPACITY: usize = 2;
const DEFAULT_RESULT_QUEUE_CAPACITY: usize = 4;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;
const MAX_FPS: u32 = 120;
const MAX_DETECTOR_WORKERS: usize = 16;

// ----------------------------------------------------------------------------
// File representation
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
struct CamwatchConfigFile {
    recordings_dir: Option<PathBuf>,
    encoder: Option<String>,
    detector: Option<DetectorConfigFile>,
    tracker: Option<TrackerConfigFile>,
    recorder: Option<RecorderConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    reconnect: Option<ReconnectConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    min_confidence: Option<f32>,
    shared: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    max_tracking_distance: Option<f32>,
    min_area_overlap: Option<f32>,
    static_timeout: Option<f64>,
    position_tolerance: Option<f32>,
    max_age: Option<f64>,
    cleanup_interval: Option<f64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct RecorderConfigFile {
    security_classes: Option<Vec<String>>,
    class_thresholds: Option<HashMap<String, f32>>,
    default_threshold: Option<f32>,
    recording_duration: Option<f64>,
    preroll_secs: Option<f64>,
    max_clip_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    detection_stride: Option<u64>,
    detector_workers: Option<usize>,
    frame_queue_capacity: Option<usize>,
    result_queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct ReconnectConfigFile {
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    id: Option<String>,
    url: Option<String>,
    kind: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    max_frames: Option<u64>,
    pace: Option<bool>,
    enabled: Option<bool>,
    detection_stride: Option<u64>,
    recorder: Option<RecorderConfigFile>,
}

// ----------------------------------------------------------------------------
// Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    Ffmpeg,
    Raw,
}

impl EncoderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderKind::Ffmpeg => "ffmpeg",
            EncoderKind::Raw => "raw",
        }
    }
}

impl FromStr for EncoderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ffmpeg" => Ok(EncoderKind::Ffmpeg),
            "raw" => Ok(EncoderKind::Raw),
            other => Err(anyhow!("unknown encoder '{}' (expected ffmpeg or raw)", other)),
        }
    }
}

impl fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
    pub min_confidence: f32,
    /// One instance for all cameras (calls serialized) instead of one per camera.
    pub shared: bool,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_DETECTOR_BACKEND.to_string(),
            model_path: None,
            input_size: DEFAULT_MODEL_INPUT_SIZE,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            shared: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Live stream: `rtsp://` via GStreamer, or a synthetic `stub://` feed.
    Rtsp,
    /// Local file via FFmpeg, or a finite synthetic `stub://` clip.
    File,
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rtsp" | "stream" => Ok(SourceKind::Rtsp),
            "file" => Ok(SourceKind::File),
            other => Err(anyhow!("unknown source kind '{}' (expected rtsp or file)", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceSettings {
    pub kind: SourceKind,
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Length of a synthetic file source; ignored for real inputs.
    pub max_frames: Option<u64>,
}

impl SourceSettings {
    pub fn stub_stream(name: &str) -> Self {
        Self {
            kind: SourceKind::Rtsp,
            url: format!("stub://{}", name),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
            max_frames: None,
        }
    }

    pub fn stub_file(name: &str, max_frames: u64) -> Self {
        Self {
            kind: SourceKind::File,
            max_frames: Some(max_frames),
            ..Self::stub_stream(name)
        }
    }

    fn infer_kind(url: &str, max_frames: Option<u64>) -> SourceKind {
        if max_frames.is_some() {
            return SourceKind::File;
        }
        let lower = url.to_ascii_lowercase();
        if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") || lower.starts_with("stub://") {
            SourceKind::Rtsp
        } else {
            SourceKind::File
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectSettings {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Consecutive failed reconnects before giving up; 0 retries forever.
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            max_attempts: 0,
        }
    }
}

impl ReconnectSettings {
    /// Doubling backoff for the given 1-based attempt, capped at `max_backoff_ms`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Everything one camera pipeline needs.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub id: String,
    pub source: SourceSettings,
    /// Sleep to the source fps between frames (file sources read faster than real time).
    pub pace: bool,
    pub tracker: TrackerConfig,
    pub recorder: RecorderConfig,
    pub detection_stride: u64,
    pub detector_workers: usize,
    pub frame_queue_capacity: usize,
    pub result_queue_capacity: usize,
    pub reconnect: ReconnectSettings,
    /// Problem found while reading this camera's config entry, reported at validation.
    pub load_error: Option<String>,
}

impl CameraSettings {
    pub fn new(id: &str, source: SourceSettings) -> Self {
        let recorder = RecorderConfig {
            fps: source.fps,
            ..RecorderConfig::default()
        };
        Self {
            id: id.to_string(),
            source,
            pace: false,
            tracker: TrackerConfig::default(),
            recorder,
            detection_stride: DEFAULT_DETECTION_STRIDE,
            detector_workers: DEFAULT_DETECTOR_WORKERS,
            frame_queue_capacity: DEFAULT_FRAME_QUEUE_CAPACITY,
            result_queue_capacity: DEFAULT_RESULT_QUEUE_CAPACITY,
            reconnect: ReconnectSettings::default(),
            load_error: None,
        }
    }

    /// Per-camera checks. A failure here disables only this camera.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.check().map_err(|e| PipelineError::config(&self.id, e))
    }

    fn check(&self) -> Result<()> {
        if let Some(problem) = &self.load_error {
            return Err(anyhow!("{}", problem));
        }
        validate_camera_id(&self.id)?;

        let src = &self.source;
        if src.url.trim().is_empty() {
            return Err(anyhow!("source url must not be empty"));
        }
        if src.width == 0 || src.height == 0 {
            return Err(anyhow!("source size must be non-zero, got {}x{}", src.width, src.height));
        }
        if src.fps == 0 || src.fps > MAX_FPS {
            return Err(anyhow!("fps must be in 1..={}, got {}", MAX_FPS, src.fps));
        }
        if self.detection_stride == 0 {
            return Err(anyhow!("detection_stride must be >= 1"));
        }
        if self.detector_workers == 0 || self.detector_workers > MAX_DETECTOR_WORKERS {
            return Err(anyhow!("detector_workers must be in 1..={}", MAX_DETECTOR_WORKERS));
        }
        if self.frame_queue_capacity == 0 || self.result_queue_capacity == 0 {
            return Err(anyhow!("queue capacities must be >= 1"));
        }

        let t = &self.tracker;
        for (name, value) in [
            ("max_tracking_distance", t.max_tracking_distance as f64),
            ("position_tolerance", t.position_tolerance as f64),
            ("static_timeout", t.static_timeout),
            ("max_age", t.max_age),
            ("cleanup_interval", t.cleanup_interval),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(anyhow!("tracker.{} must be a positive number", name));
            }
        }
        if !(0.0..=1.0).contains(&t.min_area_overlap) {
            return Err(anyhow!("tracker.min_area_overlap must be in [0, 1]"));
        }
        if t.position_history < 3 || t.movement_history == 0 {
            return Err(anyhow!("tracker history lengths too short"));
        }

        let r = &self.recorder;
        if r.security_classes.is_empty() {
            return Err(anyhow!("recorder.security_classes must not be empty"));
        }
        let thresholds = std::iter::once(&r.default_threshold).chain(r.class_thresholds.values());
        for threshold in thresholds {
            if !(0.0..=1.0).contains(threshold) {
                return Err(anyhow!("recorder thresholds must be in [0, 1], got {}", threshold));
            }
        }
        if !r.recording_duration.is_finite() || r.recording_duration <= 0.0 {
            return Err(anyhow!("recorder.recording_duration must be positive"));
        }
        if !(0.0..=MAX_PREROLL_SECS).contains(&r.preroll_secs) {
            return Err(anyhow!("recorder.preroll_secs must be in [0, {}]", MAX_PREROLL_SECS));
        }
        if !r.max_clip_secs.is_finite() || r.max_clip_secs <= 0.0 {
            return Err(anyhow!("recorder.max_clip_secs must be positive"));
        }
        if r.fps != src.fps {
            return Err(anyhow!("recorder fps {} differs from source fps {}", r.fps, src.fps));
        }

        let rc = &self.reconnect;
        if rc.initial_backoff_ms == 0 || rc.initial_backoff_ms > rc.max_backoff_ms {
            return Err(anyhow!("reconnect backoff must satisfy 0 < initial <= max"));
        }
        Ok(())
    }
}

/// Camera ids end up in file names: `^[a-z0-9_-]{1,64}$`.
pub fn validate_camera_id(camera_id: &str) -> Result<()> {
    static CAMERA_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = CAMERA_ID_RE.get_or_init(|| regex::Regex::new(r"^[a-z0-9_-]{1,64}$").unwrap());
    if !re.is_match(camera_id) {
        return Err(anyhow!(
            "camera id '{}' must match ^[a-z0-9_-]{{1,64}}$",
            camera_id
        ));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// CamwatchConfig
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CamwatchConfig {
    pub recordings_dir: PathBuf,
    pub encoder: EncoderKind,
    pub detector: DetectorSettings,
    pub cameras: Vec<CameraSettings>,
}

impl Default for CamwatchConfig {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from(DEFAULT_RECORDINGS_DIR),
            encoder: EncoderKind::Ffmpeg,
            detector: DetectorSettings::default(),
            cameras: vec![CameraSettings::new(
                DEFAULT_CAMERA_ID,
                SourceSettings::stub_stream(DEFAULT_CAMERA_ID),
            )],
        }
    }
}

impl CamwatchConfig {
    /// Load from `CAMWATCH_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMWATCH_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from an explicit file (or defaults when `None`), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CamwatchConfigFile) -> Result<Self> {
        let recordings_dir = file
            .recordings_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORDINGS_DIR));
        let encoder = match file.encoder.as_deref() {
            Some(name) => name.parse()?,
            None => EncoderKind::Ffmpeg,
        };

        let detector_file = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector_file
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR_BACKEND.to_string()),
            model_path: detector_file.model_path,
            input_size: detector_file.input_size.unwrap_or(DEFAULT_MODEL_INPUT_SIZE),
            min_confidence: detector_file.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
            shared: detector_file.shared.unwrap_or(false),
        };

        let tracker = tracker_from_file(file.tracker.unwrap_or_default());
        let recorder_defaults = file.recorder.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();
        let reconnect_file = file.reconnect.unwrap_or_default();
        let reconnect = ReconnectSettings {
            initial_backoff_ms: reconnect_file
                .initial_backoff_ms
                .unwrap_or(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff_ms: reconnect_file.max_backoff_ms.unwrap_or(DEFAULT_MAX_BACKOFF_MS),
            max_attempts: reconnect_file.max_attempts.unwrap_or(0),
        };

        let camera_files = file.cameras.unwrap_or_else(|| {
            vec![CameraConfigFile {
                id: Some(DEFAULT_CAMERA_ID.to_string()),
                url: Some(DEFAULT_CAMERA_URL.to_string()),
                ..CameraConfigFile::default()
            }]
        });

        let mut cameras = Vec::with_capacity(camera_files.len());
        for (index, cam) in camera_files.into_iter().enumerate() {
            let id = cam.id.unwrap_or_else(|| format!("camera{}", index + 1));
            if !cam.enabled.unwrap_or(true) {
                log::info!("camera {} disabled in config", id);
                continue;
            }
            let url = cam.url.unwrap_or_default();
            let mut load_error = None;
            let kind = match cam.kind.as_deref().map(str::parse::<SourceKind>) {
                Some(Ok(kind)) => kind,
                Some(Err(e)) => {
                    load_error = Some(format!("{:#}", e));
                    SourceSettings::infer_kind(&url, cam.max_frames)
                }
                None => SourceSettings::infer_kind(&url, cam.max_frames),
            };
            let source = SourceSettings {
                kind,
                url,
                width: cam.width.unwrap_or(DEFAULT_WIDTH),
                height: cam.height.unwrap_or(DEFAULT_HEIGHT),
                fps: cam.fps.unwrap_or(DEFAULT_FPS),
                max_frames: cam.max_frames,
            };
            let recorder = recorder_from_files(
                &recorder_defaults,
                cam.recorder.as_ref(),
                source.fps,
            );
            cameras.push(CameraSettings {
                id,
                pace: cam.pace.unwrap_or(false),
                tracker: tracker.clone(),
                recorder,
                detection_stride: cam
                    .detection_stride
                    .or(pipeline.detection_stride)
                    .unwrap_or(DEFAULT_DETECTION_STRIDE),
                detector_workers: pipeline.detector_workers.unwrap_or(DEFAULT_DETECTOR_WORKERS),
                frame_queue_capacity: pipeline
                    .frame_queue_capacity
                    .unwrap_or(DEFAULT_FRAME_QUEUE_CAPACITY),
                result_queue_capacity: pipeline
                    .result_queue_capacity
                    .unwrap_or(DEFAULT_RESULT_QUEUE_CAPACITY),
                reconnect: reconnect.clone(),
                load_error,
                source,
            });
        }

        Ok(Self {
            recordings_dir,
            encoder,
            detector,
            cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("CAMWATCH_RECORDINGS_DIR") {
            if !dir.trim().is_empty() {
                self.recordings_dir = PathBuf::from(dir);
            }
        }
        if let Ok(backend) = std::env::var("CAMWATCH_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_string();
            }
        }
        if let Ok(encoder) = std::env::var("CAMWATCH_ENCODER") {
            if !encoder.trim().is_empty() {
                self.encoder = encoder.parse()?;
            }
        }
        if let Ok(shared) = std::env::var("CAMWATCH_DETECTOR_SHARED") {
            self.detector.shared = parse_bool(&shared)
                .ok_or_else(|| anyhow!("CAMWATCH_DETECTOR_SHARED must be true or false"))?;
        }
        Ok(())
    }

    /// Process-wide checks only; cameras are validated one by one at startup.
    fn validate(&self) -> Result<()> {
        if self.recordings_dir.as_os_str().is_empty() {
            return Err(anyhow!("recordings_dir must not be empty"));
        }
        if self.detector.backend.is_empty() {
            return Err(anyhow!("detector backend must not be empty"));
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector input_size must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.detector.min_confidence) {
            return Err(anyhow!("detector min_confidence must be in [0, 1]"));
        }
        if self.cameras.is_empty() {
            return Err(anyhow!("no cameras configured"));
        }
        Ok(())
    }
}

fn tracker_from_file(file: TrackerConfigFile) -> TrackerConfig {
    let defaults = TrackerConfig::default();
    TrackerConfig {
        max_tracking_distance: file
            .max_tracking_distance
            .unwrap_or(defaults.max_tracking_distance),
        min_area_overlap: file.min_area_overlap.unwrap_or(defaults.min_area_overlap),
        static_timeout: file.static_timeout.unwrap_or(defaults.static_timeout),
        position_tolerance: file.position_tolerance.unwrap_or(defaults.position_tolerance),
        max_age: file.max_age.unwrap_or(defaults.max_age),
        cleanup_interval: file.cleanup_interval.unwrap_or(defaults.cleanup_interval),
        ..defaults
    }
}

/// Camera-level recorder keys win over the top-level `recorder` section.
fn recorder_from_files(
    global: &RecorderConfigFile,
    camera: Option<&RecorderConfigFile>,
    fps: u32,
) -> RecorderConfig {
    let defaults = RecorderConfig::default();
    let pick = |f: fn(&RecorderConfigFile) -> Option<f64>| camera.and_then(f).or_else(|| f(global));
    let security_classes = camera
        .and_then(|c| c.security_classes.clone())
        .or_else(|| global.security_classes.clone())
        .map(|classes| classes.into_iter().map(|c| c.to_lowercase()).collect())
        .unwrap_or(defaults.security_classes);
    let camera_thresholds = camera.and_then(|c| c.class_thresholds.as_ref());
    let mut class_thresholds = HashMap::new();
    for thresholds in [global.class_thresholds.as_ref(), camera_thresholds].into_iter().flatten() {
        for (class, threshold) in thresholds {
            class_thresholds.insert(class.to_lowercase(), *threshold);
        }
    }
    RecorderConfig {
        security_classes,
        class_thresholds,
        default_threshold: camera
            .and_then(|c| c.default_threshold)
            .or(global.default_threshold)
            .unwrap_or(defaults.default_threshold),
        recording_duration: pick(|f| f.recording_duration).unwrap_or(defaults.recording_duration),
        preroll_secs: pick(|f| f.preroll_secs).unwrap_or(defaults.preroll_secs),
        max_clip_secs: pick(|f| f.max_clip_secs).unwrap_or(defaults.max_clip_secs),
        fps,
    }
}

fn read_config_file(path: &Path) -> Result<CamwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
