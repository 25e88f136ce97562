//! Frame ingestion sources.
//!
//! - RTSP streams (IP cameras, feature: rtsp-gstreamer)
//! - Local video files (feature: ingest-file-ffmpeg)
//! - `stub://` synthetic sources for tests and demos, available without features
//!
//! Sources hand out RGB `Frame`s scaled to the configured size. Sequence
//! numbers start at 1 per source instance; the pipeline renumbers across
//! reconnects.

pub mod file;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod rtsp;

pub use file::FileSource;
pub use rtsp::RtspSource;

use std::sync::Arc;

use anyhow::Result;

use crate::config::{SourceKind, SourceSettings};
use crate::frame::{Frame, CHANNELS};

/// A camera or file producing frames.
pub trait FrameSource: Send {
    /// Open the underlying stream. Called once per source instance.
    fn connect(&mut self) -> Result<()>;

    /// Next frame; `Ok(None)` at end of stream. Errors mean the source is
    /// broken and should be rebuilt.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;

    /// Release decoder resources. The source is not used afterwards.
    fn close(&mut self) {}
}

/// Statistics for a frame source.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub url: String,
}

/// Builds a fresh source; called again on every reconnect.
pub type SourceFactory = Arc<dyn Fn() -> Result<Box<dyn FrameSource>> + Send + Sync>;

/// Open the source described by `settings` (not yet connected).
pub fn open_source(settings: &SourceSettings) -> Result<Box<dyn FrameSource>> {
    match settings.kind {
        SourceKind::Rtsp => Ok(Box::new(RtspSource::new(settings.clone())?)),
        SourceKind::File => Ok(Box::new(FileSource::new(settings.clone())?)),
    }
}

/// Factory that reopens `settings` on every call.
pub fn source_factory(settings: SourceSettings) -> SourceFactory {
    Arc::new(move || open_source(&settings))
}

/// Slowly drifting gradient. Cheap to make and visibly changes over time in
/// recorded clips.
pub(crate) fn synthetic_pixels(width: u32, height: u32, frame_count: u64) -> Vec<u8> {
    let row_bytes = width as usize * CHANNELS;
    let mut pixels = vec![0u8; row_bytes * height as usize];
    let shift = (frame_count / 2) as usize;
    for (y, row) in pixels.chunks_exact_mut(row_bytes.max(1)).enumerate() {
        for (i, px) in row.iter_mut().enumerate() {
            *px = ((i / CHANNELS + y + shift) % 256) as u8;
        }
    }
    pixels
}
