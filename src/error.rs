//! Failure taxonomy shared by pipelines and the supervisor.
//!
//! Internals use `anyhow` with context; these variants only appear at the
//! seams where the kind of failure decides what happens next:
//!
//! - `Source`: reconnect with backoff, never crash the pipeline.
//! - `Detector`: log, skip that frame's detection.
//! - `Encode`: retry once, then discard the raw clip data.
//! - `Config`: disable the one camera at startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source error on camera {camera_id}: {message}")]
    Source { camera_id: String, message: String },

    #[error("detector error on camera {camera_id}: {message}")]
    Detector { camera_id: String, message: String },

    #[error("encode error on camera {camera_id}: {message}")]
    Encode { camera_id: String, message: String },

    #[error("config error on camera {camera_id}: {message}")]
    Config { camera_id: String, message: String },
}

impl PipelineError {
    pub fn source(camera_id: &str, err: impl std::fmt::Display) -> Self {
        Self::Source {
            camera_id: camera_id.to_string(),
            message: err.to_string(),
        }
    }

    pub fn detector(camera_id: &str, err: impl std::fmt::Display) -> Self {
        Self::Detector {
            camera_id: camera_id.to_string(),
            message: err.to_string(),
        }
    }

    pub fn encode(camera_id: &str, err: impl std::fmt::Display) -> Self {
        Self::Encode {
            camera_id: camera_id.to_string(),
            message: err.to_string(),
        }
    }

    pub fn config(camera_id: &str, err: impl std::fmt::Display) -> Self {
        Self::Config {
            camera_id: camera_id.to_string(),
            message: err.to_string(),
        }
    }

    pub fn camera_id(&self) -> &str {
        match self {
            Self::Source { camera_id, .. }
            | Self::Detector { camera_id, .. }
            | Self::Encode { camera_id, .. }
            | Self::Config { camera_id, .. } => camera_id,
        }
    }

    /// Stable short code for structured logs and status reports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Source { .. } => "SOURCE",
            Self::Detector { .. } => "DETECTOR",
            Self::Encode { .. } => "ENCODE",
            Self::Config { .. } => "CONFIG",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_carries_camera_and_code() {
        let err = PipelineError::encode("front", "ffmpeg exited with status 1");
        assert_eq!(err.camera_id(), "front");
        assert_eq!(err.code(), "ENCODE");
        assert_eq!(
            err.to_string(),
            "encode error on camera front: ffmpeg exited with status 1"
        );
    }

    #[test]
    fn error_converts_into_anyhow_and_downcasts() {
        let err: anyhow::Error = PipelineError::config("yard", "fps must be >= 1").into();
        let back = err
            .downcast_ref::<PipelineError>()
            .expect("pipeline error survives anyhow");
        assert_eq!(back.code(), "CONFIG");
    }
}
