//! Local file frame source.
//!
//! `FileSource` decodes a local video file (feature `ingest-file-ffmpeg`) or,
//! for `stub://` paths, produces a finite synthetic clip. File sources read as
//! fast as they are pulled; timestamps are derived from the frame index so
//! tracker and recorder timing match the footage, not the wall clock.

use anyhow::{anyhow, Result};

#[cfg(feature = "ingest-file-ffmpeg")]
use super::file_ffmpeg::FfmpegFileSource;
use super::{synthetic_pixels, FrameSource, SourceStats};
use crate::config::SourceSettings;
use crate::frame::{now_epoch_secs, Frame};

/// Synthetic clips without an explicit length run for one minute.
const DEFAULT_SYNTHETIC_SECS: u64 = 60;

/// Local file frame source.
pub struct FileSource {
    backend: FileBackend,
}

enum FileBackend {
    Synthetic(SyntheticFileSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegFileSource),
}

impl FileSource {
    pub fn new(settings: SourceSettings) -> Result<Self> {
        if !is_local_file_path(&settings.url) {
            return Err(anyhow!(
                "file ingestion only supports local paths (no URL schemes), got '{}'",
                settings.url
            ));
        }
        if settings.url.starts_with("stub://") {
            Ok(Self {
                backend: FileBackend::Synthetic(SyntheticFileSource::new(settings)),
            })
        } else {
            #[cfg(feature = "ingest-file-ffmpeg")]
            {
                Ok(Self {
                    backend: FileBackend::Ffmpeg(FfmpegFileSource::new(settings)?),
                })
            }
            #[cfg(not(feature = "ingest-file-ffmpeg"))]
            {
                Err(anyhow!(
                    "file ingestion requires the ingest-file-ffmpeg feature"
                ))
            }
        }
    }
}

impl FrameSource for FileSource {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            FileBackend::Synthetic(source) => Ok(source.next_frame()),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.next_frame(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            FileBackend::Synthetic(source) => !source.finished(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.is_healthy(),
        }
    }

    fn stats(&self) -> SourceStats {
        match &self.backend {
            FileBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.stats(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

struct SyntheticFileSource {
    settings: SourceSettings,
    frame_count: u64,
    max_frames: u64,
    start_time: f64,
}

impl SyntheticFileSource {
    fn new(settings: SourceSettings) -> Self {
        let max_frames = settings
            .max_frames
            .unwrap_or(DEFAULT_SYNTHETIC_SECS * settings.fps.max(1) as u64);
        Self {
            settings,
            frame_count: 0,
            max_frames,
            start_time: now_epoch_secs(),
        }
    }

    fn connect(&mut self) -> Result<()> {
        log::info!(
            "file source connected to {} (synthetic, {} frames)",
            self.settings.url,
            self.max_frames
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Option<Frame> {
        if self.finished() {
            return None;
        }
        self.frame_count += 1;
        let pixels = synthetic_pixels(self.settings.width, self.settings.height, self.frame_count);
        let offset = (self.frame_count - 1) as f64 / self.settings.fps.max(1) as f64;
        Some(Frame::new(
            pixels,
            self.settings.width,
            self.settings.height,
            self.frame_count,
            self.start_time + offset,
        ))
    }

    fn finished(&self) -> bool {
        self.frame_count >= self.max_frames
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.settings.url.clone(),
        }
    }
}

fn is_local_file_path(path: &str) -> bool {
    if path.trim().is_empty() {
        return false;
    }
    if path.starts_with("stub://") {
        return true;
    }
    !path.contains("://")
}
