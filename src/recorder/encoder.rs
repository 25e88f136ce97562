use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

use crate::config::EncoderKind;
use crate::frame::Frame;

/// Turns an ordered frame sequence into a video file.
pub trait VideoEncoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// File extension of the produced video, without the dot.
    fn extension(&self) -> &'static str;

    fn encode(&self, frames: &[Frame], path: &Path, fps: u32) -> Result<()>;
}

pub fn encoder_for(kind: EncoderKind) -> Arc<dyn VideoEncoder> {
    match kind {
        EncoderKind::Ffmpeg => Arc::new(FfmpegCliEncoder::default()),
        EncoderKind::Raw => Arc::new(RawVideoEncoder),
    }
}

/// All frames must share the first frame's dimensions.
fn uniform_size(frames: &[Frame]) -> Result<(u32, u32)> {
    let first = frames
        .first()
        .ok_or_else(|| anyhow!("clip has no frames"))?;
    for frame in frames {
        frame.validate()?;
        if frame.width != first.width || frame.height != first.height {
            return Err(anyhow!(
                "frame {} is {}x{}, clip is {}x{}",
                frame.seq,
                frame.width,
                frame.height,
                first.width,
                first.height
            ));
        }
    }
    Ok((first.width, first.height))
}

// ----------------------------------------------------------------------------
// Raw rgb24
// ----------------------------------------------------------------------------

/// Concatenated rgb24 frames. Needs no external tools; play back with
/// `ffplay -f rawvideo -pixel_format rgb24 -video_size WxH`.
pub struct RawVideoEncoder;

impl VideoEncoder for RawVideoEncoder {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn extension(&self) -> &'static str {
        "rgb"
    }

    fn encode(&self, frames: &[Frame], path: &Path, _fps: u32) -> Result<()> {
        uniform_size(frames)?;
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        for frame in frames {
            out.write_all(frame.pixels())?;
        }
        out.flush()?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// ffmpeg CLI
// ----------------------------------------------------------------------------

/// H.264 MP4 via an `ffmpeg` child process fed rawvideo on stdin.
pub struct FfmpegCliEncoder {
    pub binary: PathBuf,
    pub crf: u32,
    pub preset: String,
}

impl Default for FfmpegCliEncoder {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
            crf: 23,
            preset: "fast".to_string(),
        }
    }
}

impl FfmpegCliEncoder {
    fn args(&self, width: u32, height: u32, fps: u32, path: &Path) -> Vec<String> {
        vec![
            "-y".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{}x{}", width, height),
            "-r".into(),
            fps.max(1).to_string(),
            "-i".into(),
            "-".into(),
            // yuv420p needs even dimensions
            "-vf".into(),
            "scale=trunc(iw/2)*2:trunc(ih/2)*2".into(),
            "-c:v".into(),
            "libx264".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-crf".into(),
            self.crf.to_string(),
            "-preset".into(),
            self.preset.clone(),
            path.to_string_lossy().into_owned(),
        ]
    }
}

impl VideoEncoder for FfmpegCliEncoder {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn extension(&self) -> &'static str {
        "mp4"
    }

    fn encode(&self, frames: &[Frame], path: &Path, fps: u32) -> Result<()> {
        let (width, height) = uniform_size(frames)?;
        let mut child = Command::new(&self.binary)
            .args(self.args(width, height, fps, path))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {}", self.binary.display()))?;

        let write_result = match child.stdin.take() {
            Some(mut stdin) => frames
                .iter()
                .try_for_each(|frame| stdin.write_all(frame.pixels())),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "ffmpeg stdin unavailable",
            )),
        };

        let output = child.wait_with_output().context("wait for ffmpeg")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "ffmpeg exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }
        write_result.context("write frames to ffmpeg")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_encoder_concatenates_frames() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clip.rgb");
        let frames: Vec<Frame> = (1..=3).map(|s| Frame::filled(2, 2, s as u8, s, 0.0)).collect();
        RawVideoEncoder.encode(&frames, &path, 20)?;
        let bytes = std::fs::read(&path)?;
        assert_eq!(bytes.len(), 3 * 2 * 2 * 3);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[bytes.len() - 1], 3);
        Ok(())
    }

    #[test]
    fn encoders_reject_empty_and_mixed_clips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("clip.rgb");
        assert!(RawVideoEncoder.encode(&[], &path, 20).is_err());

        let mixed = vec![Frame::filled(2, 2, 0, 1, 0.0), Frame::filled(4, 2, 0, 2, 0.0)];
        assert!(RawVideoEncoder.encode(&mixed, &path, 20).is_err());
    }

    #[test]
    fn ffmpeg_args_match_h264_profile() {
        let args = FfmpegCliEncoder::default().args(640, 480, 20, Path::new("/rec/a.mp4"));
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt rgb24 -s 640x480 -r 20 -i -"));
        assert!(joined.contains("-c:v libx264 -pix_fmt yuv420p -crf 23 -preset fast"));
        assert_eq!(args.last().map(String::as_str), Some("/rec/a.mp4"));
    }

    #[test]
    fn missing_ffmpeg_binary_is_an_error() {
        let encoder = FfmpegCliEncoder {
            binary: PathBuf::from("/nonexistent/ffmpeg-camwatch"),
            ..FfmpegCliEncoder::default()
        };
        let frames = vec![Frame::filled(2, 2, 0, 1, 0.0)];
        assert!(encoder
            .encode(&frames, Path::new("/tmp/never.mp4"), 20)
            .is_err());
    }
}
