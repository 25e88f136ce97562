use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left, `(x2, y2)` bottom-right.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Box of the given size centered on `(cx, cy)`.
    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self {
            x1: cx - width / 2.0,
            y1: cy - height / 2.0,
            x2: cx + width / 2.0,
            y2: cy + height / 2.0,
        }
    }

    #[inline]
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    #[inline]
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    #[inline]
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Signed area; negative when the corners are swapped.
    #[inline]
    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Finite coordinates and a strictly positive area.
    pub fn is_well_formed(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
            && self.x2 > self.x1
            && self.y2 > self.y1
    }

    /// Intersection-over-union in `[0, 1]`. Degenerate boxes overlap nothing.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area().max(0.0) + other.area().max(0.0) - inter;
        if union <= 0.0 || !union.is_finite() {
            return 0.0;
        }
        (inter / union).clamp(0.0, 1.0)
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// One detector output for one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            confidence,
            bbox,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        self.bbox.center()
    }

    /// Rejects NaN/infinite values and empty or inverted boxes.
    pub fn is_well_formed(&self) -> bool {
        self.bbox.is_well_formed()
            && self.confidence.is_finite()
            && (0.0..=1.0).contains(&self.confidence)
            && !self.label.is_empty()
    }
}

/// Result of one detector call, as it travels through the result queue.
#[derive(Clone, Debug, Default)]
pub struct DetectionBatch {
    pub frame_seq: u64,
    pub timestamp: f64,
    pub detections: Vec<Detection>,
    pub latency_ms: f64,
}
