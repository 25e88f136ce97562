use anyhow::Result;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

/// Layout of the synthetic scene, in frames.
#[derive(Clone, Copy, Debug)]
pub struct StubScene {
    /// A person walks through during the first `walk_frames` of every cycle.
    pub cycle_frames: u64,
    pub walk_frames: u64,
    /// A car parked in the lower-left corner for the whole run.
    pub parked_car: bool,
}

impl Default for StubScene {
    fn default() -> Self {
        Self {
            cycle_frames: 600,
            walk_frames: 160,
            parked_car: true,
        }
    }
}

/// Stub backend for tests and demos. Derives detections from the frame number,
/// never from pixels, so runs are reproducible.
pub struct StubBackend {
    scene: StubScene,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            scene: StubScene::default(),
        }
    }

    pub fn with_scene(scene: StubScene) -> Self {
        Self { scene }
    }

    fn walker(&self, frame: &Frame) -> Option<Detection> {
        let cycle = self.scene.cycle_frames.max(1);
        let walk = self.scene.walk_frames.min(cycle);
        let phase = frame.seq % cycle;
        if phase >= walk {
            return None;
        }
        let (w, h) = (frame.width as f32, frame.height as f32);
        let progress = phase as f32 / walk.max(1) as f32;
        let cx = w * (0.3 + 0.6 * progress);
        let cy = h * 0.5;
        Some(Detection::new(
            "person",
            0.78,
            BoundingBox::from_center(cx, cy, w * 0.08, h * 0.25),
        ))
    }

    fn parked_car(&self, frame: &Frame) -> Option<Detection> {
        if !self.scene.parked_car {
            return None;
        }
        let (w, h) = (frame.width as f32, frame.height as f32);
        Some(Detection::new(
            "car",
            0.82,
            BoundingBox::from_center(w * 0.15, h * 0.7, w * 0.2, h * 0.2),
        ))
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        Ok(self
            .parked_car(frame)
            .into_iter()
            .chain(self.walker(frame))
            .collect())
    }
}
