use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Detector backend trait.
///
/// `detect` takes `&mut self`; a backend shared by several detector workers is
/// wrapped in a `Mutex` and every call takes the lock (see `SharedDetector`).
/// Implementations must treat the frame as read-only and must not keep it past
/// the call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame. Labels are class-name strings, confidences in `[0, 1]`.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, called once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
