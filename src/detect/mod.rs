//! Object detection: backend trait, built-in backends, and the shared-detector registry.

mod backend;
pub mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{StubBackend, StubScene};
pub use registry::{detect_locked, shared_detector, BackendRegistry, SharedDetector};
pub use result::{BoundingBox, Detection, DetectionBatch};

#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
