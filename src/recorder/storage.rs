//! Clip persistence: dated directory layout, encode with one retry, and the
//! JSON sidecar written beside each video.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DetectionRecord, FinishedClip, VideoEncoder};
use crate::error::PipelineError;

/// Metadata stored in the `.json` sidecar of every clip.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClipMetadata {
    pub video_id: String,
    pub filename: String,
    /// Video path relative to the recordings root.
    pub video_path: String,
    pub camera_id: String,
    pub start_time: f64,
    /// `start_time` as RFC 3339, UTC.
    pub started_at: String,
    pub end_time: f64,
    pub fps: u32,
    pub total_frames: usize,
    pub preroll_frames: usize,
    pub duration_seconds: f64,
    pub detections: Vec<DetectionRecord>,
}

fn utc(ts: f64) -> DateTime<Utc> {
    let secs = ts.floor();
    let nanos = ((ts - secs) * 1e9) as u32;
    DateTime::<Utc>::from_timestamp(secs as i64, nanos).unwrap_or_default()
}

/// `<root>/<YYYY>/<MM>/<DD>/<camera>_<YYYYmmdd_HHMMSS>_<video_id>`, no extension.
pub fn clip_stem(root: &Path, camera_id: &str, start_time: f64, video_id: &str) -> PathBuf {
    let at = utc(start_time);
    root.join(at.format("%Y").to_string())
        .join(at.format("%m").to_string())
        .join(at.format("%d").to_string())
        .join(format!(
            "{}_{}_{}",
            camera_id,
            at.format("%Y%m%d_%H%M%S"),
            video_id
        ))
}

/// Write via a sibling temp file and rename, so readers never see a partial file.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("create {}", tmp_path.display()))?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("rename {} -> {}", tmp_path.display(), path.display()))?;
    Ok(())
}

/// Read a clip sidecar back.
pub fn read_sidecar(path: &Path) -> Result<ClipMetadata> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read sidecar {}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| anyhow!("invalid sidecar {}: {}", path.display(), e))
}

// ----------------------------------------------------------------------------
// ClipWriter
// ----------------------------------------------------------------------------

pub struct ClipWriter {
    root: PathBuf,
    encoder: Arc<dyn VideoEncoder>,
}

impl ClipWriter {
    pub fn new(root: &Path, encoder: Arc<dyn VideoEncoder>) -> Self {
        Self {
            root: root.to_path_buf(),
            encoder,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Encode a finished clip and write its sidecar.
    ///
    /// A failed encode is retried once. If the retry fails too, partial output
    /// is removed and the frames are dropped with the clip.
    pub fn persist(&self, clip: FinishedClip) -> Result<ClipMetadata, PipelineError> {
        let camera_id = clip.camera_id.clone();
        let video_path = clip.output_stem.with_extension(self.encoder.extension());
        let sidecar_path = clip.output_stem.with_extension("json");

        if let Some(dir) = video_path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                PipelineError::encode(&camera_id, format!("create {}: {}", dir.display(), e))
            })?;
        }

        if let Err(first) = self.encoder.encode(&clip.frames, &video_path, clip.fps) {
            log::warn!(
                "encode failed, retrying camera={} video_id={} encoder={}: {:#}",
                camera_id,
                clip.video_id,
                self.encoder.name(),
                first
            );
            remove_partial(&video_path);
            if let Err(second) = self.encoder.encode(&clip.frames, &video_path, clip.fps) {
                log::error!(
                    "encode failed twice, discarding clip camera={} video_id={} frames={}: {:#}",
                    camera_id,
                    clip.video_id,
                    clip.frames.len(),
                    second
                );
                remove_partial(&video_path);
                return Err(PipelineError::encode(&camera_id, format!("{:#}", second)));
            }
        }

        let metadata = self.metadata_for(clip, &video_path);
        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| PipelineError::encode(&camera_id, e))?;
        write_atomic(&sidecar_path, &json)
            .map_err(|e| PipelineError::encode(&camera_id, format!("{:#}", e)))?;

        log::info!(
            "clip saved camera={} video_id={} path={} frames={}",
            camera_id,
            metadata.video_id,
            metadata.video_path,
            metadata.total_frames
        );
        Ok(metadata)
    }

    fn metadata_for(&self, clip: FinishedClip, video_path: &Path) -> ClipMetadata {
        let filename = video_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let relative = video_path
            .strip_prefix(&self.root)
            .unwrap_or(video_path)
            .to_string_lossy()
            .into_owned();
        let total_frames = clip.frames.len();
        let mut detections = clip.detections;
        detections.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));

        ClipMetadata {
            video_id: clip.video_id,
            filename,
            video_path: relative,
            camera_id: clip.camera_id,
            start_time: clip.start_time,
            started_at: utc(clip.start_time).to_rfc3339(),
            end_time: clip.end_time,
            fps: clip.fps,
            total_frames,
            preroll_frames: clip.preroll_frames,
            duration_seconds: total_frames as f64 / clip.fps.max(1) as f64,
            detections,
        }
    }
}

fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            log::warn!("failed to remove partial output {}: {}", path.display(), e);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::recorder::RawVideoEncoder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` calls, leaving a partial file behind each time.
    struct FlakyEncoder {
        failures: usize,
        calls: AtomicUsize,
    }

    impl VideoEncoder for FlakyEncoder {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn extension(&self) -> &'static str {
            "bin"
        }

        fn encode(&self, frames: &[Frame], path: &Path, _fps: u32) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            fs::write(path, b"partial")?;
            if call < self.failures {
                return Err(anyhow!("encoder crashed"));
            }
            fs::write(path, vec![0u8; frames.len()])?;
            Ok(())
        }
    }

    fn clip(root: &Path) -> FinishedClip {
        let start = 1_767_268_800.5; // 2026-01-01T12:00:00.5Z
        FinishedClip {
            camera_id: "front".to_string(),
            video_id: "0a1b2c3d".to_string(),
            output_stem: clip_stem(root, "front", start, "0a1b2c3d"),
            start_time: start,
            end_time: start + 2.0,
            fps: 10,
            preroll_frames: 3,
            frames: (1..=20).map(|s| Frame::filled(4, 4, 0, s, start)).collect(),
            detections: vec![
                DetectionRecord {
                    timestamp: start + 0.7,
                    label: "person".to_string(),
                    confidence: 0.81,
                    bbox: [1.5, 2.25, 40.0, 80.125],
                    object_id: 2,
                },
                DetectionRecord {
                    timestamp: start,
                    label: "person".to_string(),
                    confidence: 0.7731,
                    bbox: [0.0, 0.0, 40.0, 80.0],
                    object_id: 2,
                },
            ],
        }
    }

    #[test]
    fn clip_stem_uses_dated_layout() {
        let stem = clip_stem(Path::new("/rec"), "front", 1_767_268_800.5, "deadbeef");
        assert_eq!(
            stem,
            PathBuf::from("/rec/2026/01/01/front_20260101_120000_deadbeef")
        );
    }

    #[test]
    fn persist_writes_video_and_sidecar() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = ClipWriter::new(dir.path(), Arc::new(RawVideoEncoder));
        let clip = clip(dir.path());
        let original = clip.detections.clone();

        let meta = writer.persist(clip)?;
        assert_eq!(meta.total_frames, 20);
        assert_eq!(meta.duration_seconds, 2.0);
        assert_eq!(meta.video_path, "2026/01/01/front_20260101_120000_0a1b2c3d.rgb");
        assert_eq!(meta.started_at, "2026-01-01T12:00:00.500+00:00");

        let video = dir.path().join(&meta.video_path);
        assert_eq!(fs::metadata(&video)?.len(), 20 * 4 * 4 * 3);

        let sidecar = video.with_extension("json");
        let read = read_sidecar(&sidecar)?;
        assert_eq!(read, meta);
        assert_eq!(read.detections, vec![original[1].clone(), original[0].clone()]);
        Ok(())
    }

    #[test]
    fn persist_retries_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let encoder = Arc::new(FlakyEncoder {
            failures: 1,
            calls: AtomicUsize::new(0),
        });
        let writer = ClipWriter::new(dir.path(), encoder.clone());
        let meta = writer.persist(clip(dir.path()))?;
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(fs::metadata(dir.path().join(&meta.video_path))?.len(), 20);
        Ok(())
    }

    #[test]
    fn persistent_failure_discards_output() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let encoder = Arc::new(FlakyEncoder {
            failures: 5,
            calls: AtomicUsize::new(0),
        });
        let writer = ClipWriter::new(dir.path(), encoder.clone());
        let clip = clip(dir.path());
        let stem = clip.output_stem.clone();

        let err = writer.persist(clip).expect_err("must fail");
        assert_eq!(err.code(), "ENCODE");
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 2);
        assert!(!stem.with_extension("bin").exists());
        assert!(!stem.with_extension("json").exists());
        Ok(())
    }
}
