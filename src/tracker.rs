//! Per-camera object tracker.
//!
//! Assigns stable ids to detections across frames with a greedy nearest-cost
//! match, and classifies each tracked object as static or moving. Static
//! objects (a parked car, a bin left by the gate) stay tracked but stop
//! counting as activity.

use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::detect::{BoundingBox, Detection};

const DEFAULT_MAX_TRACKING_DISTANCE: f32 = 100.0;
const DEFAULT_MIN_AREA_OVERLAP: f32 = 0.1;
const DEFAULT_STATIC_TIMEOUT_SECS: f64 = 30.0;
const DEFAULT_POSITION_TOLERANCE: f32 = 50.0;
const DEFAULT_MAX_AGE_SECS: f64 = 3.0;
const DEFAULT_CLEANUP_INTERVAL_SECS: f64 = 5.0;
const DEFAULT_POSITION_HISTORY: usize = 30;
const DEFAULT_MOVEMENT_HISTORY: usize = 10;

/// Weight of `(1 - iou)` in the match cost, in pixels.
const OVERLAP_COST_WEIGHT: f32 = 100.0;
/// Movement samples averaged when judging "still moving".
const RECENT_MOVEMENTS: usize = 5;
/// Positions used when the static window holds fewer than three.
const SPARSE_WINDOW_FALLBACK: usize = 10;
/// Average-movement threshold as a fraction of `position_tolerance`.
/// The same band is used to enter and to leave the static state.
const MOVEMENT_FRACTION: f32 = 0.1;

#[derive(Clone, Debug, PartialEq)]
pub struct TrackerConfig {
    pub max_tracking_distance: f32,
    pub min_area_overlap: f32,
    pub static_timeout: f64,
    pub position_tolerance: f32,
    pub max_age: f64,
    pub cleanup_interval: f64,
    pub position_history: usize,
    pub movement_history: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_tracking_distance: DEFAULT_MAX_TRACKING_DISTANCE,
            min_area_overlap: DEFAULT_MIN_AREA_OVERLAP,
            static_timeout: DEFAULT_STATIC_TIMEOUT_SECS,
            position_tolerance: DEFAULT_POSITION_TOLERANCE,
            max_age: DEFAULT_MAX_AGE_SECS,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL_SECS,
            position_history: DEFAULT_POSITION_HISTORY,
            movement_history: DEFAULT_MOVEMENT_HISTORY,
        }
    }
}

// ----------------------------------------------------------------------------
// Tracked objects
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct TrackedObject {
    pub id: u64,
    pub label: String,
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub first_seen: f64,
    pub last_seen: f64,
    /// Recent `(x, y, t)` centers, oldest first.
    pub positions: VecDeque<(f32, f32, f64)>,
    /// Recent per-match center displacements in pixels.
    pub movements: VecDeque<f32>,
    pub is_static: bool,
    pub static_since: Option<f64>,
}

impl TrackedObject {
    fn new(id: u64, det: &Detection, now: f64, config: &TrackerConfig) -> Self {
        let (cx, cy) = det.center();
        let mut positions = VecDeque::with_capacity(config.position_history);
        positions.push_back((cx, cy, now));
        Self {
            id,
            label: det.label.clone(),
            bbox: det.bbox,
            confidence: det.confidence,
            first_seen: now,
            last_seen: now,
            positions,
            movements: VecDeque::with_capacity(config.movement_history),
            is_static: false,
            static_since: None,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        self.bbox.center()
    }

    /// Mean of the most recent movement samples, 0 with no samples.
    pub fn avg_recent_movement(&self) -> f32 {
        let n = self.movements.len().min(RECENT_MOVEMENTS);
        if n == 0 {
            return 0.0;
        }
        self.movements.iter().rev().take(n).sum::<f32>() / n as f32
    }

    fn apply_match(&mut self, det: &Detection, now: f64, config: &TrackerConfig) {
        let (px, py) = self.center();
        let (cx, cy) = det.center();
        let moved = (cx - px).hypot(cy - py);

        self.bbox = det.bbox;
        self.confidence = det.confidence;
        self.last_seen = now;

        push_bounded(&mut self.positions, (cx, cy, now), config.position_history);
        push_bounded(&mut self.movements, moved, config.movement_history);
    }
}

fn push_bounded<T>(fifo: &mut VecDeque<T>, value: T, cap: usize) {
    fifo.push_back(value);
    while fifo.len() > cap.max(1) {
        fifo.pop_front();
    }
}

/// Whether `obj` should be static at `now`.
///
/// Objects younger than `static_timeout` or with fewer than three positions are
/// never static. An object that is already static stays static until its
/// recent average movement exceeds `0.1 × position_tolerance`; a single spike
/// that leaves the average in band does not flip it.
pub fn check_if_static(
    obj: &TrackedObject,
    now: f64,
    static_timeout: f64,
    position_tolerance: f32,
) -> bool {
    if obj.positions.len() < 3 || now - obj.first_seen < static_timeout {
        return false;
    }

    let threshold = MOVEMENT_FRACTION * position_tolerance;
    let avg = obj.avg_recent_movement();
    if obj.is_static {
        return avg <= threshold;
    }

    let cutoff = now - static_timeout;
    let mut window: Vec<(f32, f32)> = obj
        .positions
        .iter()
        .filter(|(_, _, t)| *t >= cutoff)
        .map(|(x, y, _)| (*x, *y))
        .collect();
    if window.len() < 3 {
        let skip = obj.positions.len().saturating_sub(SPARSE_WINDOW_FALLBACK);
        window = obj
            .positions
            .iter()
            .skip(skip)
            .map(|(x, y, _)| (*x, *y))
            .collect();
    }

    let (mut min_x, mut min_y) = (f32::INFINITY, f32::INFINITY);
    let (mut max_x, mut max_y) = (f32::NEG_INFINITY, f32::NEG_INFINITY);
    for (x, y) in &window {
        min_x = min_x.min(*x);
        min_y = min_y.min(*y);
        max_x = max_x.max(*x);
        max_y = max_y.max(*y);
    }
    let max_movement = (max_x - min_x).hypot(max_y - min_y);

    max_movement <= position_tolerance && avg <= threshold
}

// ----------------------------------------------------------------------------
// Events and update summary
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerEventKind {
    BecameStatic,
    ResumedMoving,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackerEvent {
    pub object_id: u64,
    pub label: String,
    pub kind: TrackerEventKind,
    pub timestamp: f64,
}

/// Outcome of one `update` call.
#[derive(Clone, Debug, Default)]
pub struct TrackerUpdate {
    /// Ids of existing objects that received a detection, in commit order.
    pub matched: Vec<u64>,
    /// Ids of objects spawned from unclaimed detections.
    pub created: Vec<u64>,
    /// Malformed detections discarded before matching.
    pub dropped: usize,
    pub events: Vec<TrackerEvent>,
}

impl TrackerUpdate {
    /// Every object touched by this batch.
    pub fn observed(&self) -> impl Iterator<Item = u64> + '_ {
        self.matched.iter().chain(self.created.iter()).copied()
    }
}

// ----------------------------------------------------------------------------
// Tracker
// ----------------------------------------------------------------------------

pub struct ObjectTracker {
    config: TrackerConfig,
    objects: BTreeMap<u64, TrackedObject>,
    next_id: u64,
    last_cleanup: Option<f64>,
}

impl ObjectTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            objects: BTreeMap::new(),
            next_id: 1,
            last_cleanup: None,
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Fold one frame's detections into the tracked set.
    pub fn update(&mut self, detections: &[Detection], now: f64) -> TrackerUpdate {
        let mut summary = TrackerUpdate::default();

        let valid: Vec<&Detection> = detections.iter().filter(|d| d.is_well_formed()).collect();
        summary.dropped = detections.len() - valid.len();
        if summary.dropped > 0 {
            log::debug!("tracker: dropped {} malformed detections", summary.dropped);
        }

        let mut candidates: Vec<(f32, u64, usize)> = Vec::new();
        for (id, obj) in &self.objects {
            let (ox, oy) = obj.center();
            for (idx, det) in valid.iter().enumerate() {
                if det.label != obj.label {
                    continue;
                }
                let (dx, dy) = det.center();
                let distance = (dx - ox).hypot(dy - oy);
                let overlap = obj.bbox.iou(&det.bbox);
                if distance > self.config.max_tracking_distance
                    || overlap < self.config.min_area_overlap
                {
                    continue;
                }
                let cost = distance + (1.0 - overlap) * OVERLAP_COST_WEIGHT;
                candidates.push((cost, *id, idx));
            }
        }
        candidates.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut claimed_objects = HashSet::new();
        let mut claimed_dets = vec![false; valid.len()];
        for (_, id, idx) in candidates {
            if claimed_dets[idx] || claimed_objects.contains(&id) {
                continue;
            }
            claimed_dets[idx] = true;
            claimed_objects.insert(id);
            if let Some(obj) = self.objects.get_mut(&id) {
                obj.apply_match(valid[idx], now, &self.config);
                summary.matched.push(id);
            }
        }

        for (idx, det) in valid.iter().enumerate() {
            if claimed_dets[idx] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            self.objects
                .insert(id, TrackedObject::new(id, det, now, &self.config));
            summary.created.push(id);
        }

        summary.events = self.evaluate_static(now);
        summary
    }

    fn evaluate_static(&mut self, now: f64) -> Vec<TrackerEvent> {
        let mut events = Vec::new();
        for obj in self.objects.values_mut() {
            let should_be_static = check_if_static(
                obj,
                now,
                self.config.static_timeout,
                self.config.position_tolerance,
            );
            if should_be_static == obj.is_static {
                continue;
            }
            obj.is_static = should_be_static;
            let kind = if should_be_static {
                obj.static_since = Some(now);
                TrackerEventKind::BecameStatic
            } else {
                obj.static_since = None;
                TrackerEventKind::ResumedMoving
            };
            events.push(TrackerEvent {
                object_id: obj.id,
                label: obj.label.clone(),
                kind,
                timestamp: now,
            });
        }
        events
    }

    /// Remove objects not seen for more than `max_age`. Returns removed ids.
    pub fn cleanup(&mut self, now: f64) -> Vec<u64> {
        let max_age = self.config.max_age;
        let stale: Vec<u64> = self
            .objects
            .values()
            .filter(|obj| now - obj.last_seen > max_age)
            .map(|obj| obj.id)
            .collect();
        for id in &stale {
            self.objects.remove(id);
        }
        self.last_cleanup = Some(now);
        stale
    }

    /// `cleanup` at most once per `cleanup_interval`.
    pub fn maybe_cleanup(&mut self, now: f64) -> Vec<u64> {
        match self.last_cleanup {
            Some(last) if now - last < self.config.cleanup_interval => Vec::new(),
            Some(_) => self.cleanup(now),
            None => {
                self.last_cleanup = Some(now);
                Vec::new()
            }
        }
    }

    pub fn objects(&self) -> impl Iterator<Item = &TrackedObject> {
        self.objects.values()
    }

    pub fn get(&self, id: u64) -> Option<&TrackedObject> {
        self.objects.get(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Objects seen within the last `window` seconds.
    pub fn active_count(&self, now: f64, window: f64) -> usize {
        self.objects
            .values()
            .filter(|obj| now - obj.last_seen <= window)
            .count()
    }

    /// Next id that will be assigned.
    pub fn next_id(&self) -> u64 {
        self.next_id
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn det(label: &str, cx: f32, cy: f32) -> Detection {
        Detection::new(label, 0.8, BoundingBox::from_center(cx, cy, 100.0, 100.0))
    }

    #[test]
    fn identity_is_stable_across_small_moves() {
        let mut tracker = ObjectTracker::new(TrackerConfig::default());
        let first = tracker.update(&[det("person", 150.0, 150.0)], 0.0);
        assert_eq!(first.created, vec![1]);

        let second = tracker.update(&[det("person", 160.0, 155.0)], 0.2);
        assert_eq!(second.matched, vec![1]);
        assert!(second.created.is_empty());
        assert_eq!(tracker.len(), 1);

        let obj = tracker.get(1).expect("object 1");
        assert_eq!(obj.positions.len(), 2);
        assert_eq!(obj.movements.len(), 1);
        assert!((obj.movements[0] - 125f32.sqrt()).abs() < 1e-4);
        assert_eq!(obj.last_seen, 0.2);
    }

    #[test]
    fn labels_never_cross_match() {
        let mut tracker = ObjectTracker::new(TrackerConfig::default());
        tracker.update(&[det("person", 150.0, 150.0)], 0.0);
        let update = tracker.update(&[det("car", 150.0, 150.0)], 0.1);
        assert!(update.matched.is_empty());
        assert_eq!(update.created, vec![2]);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn far_or_non_overlapping_detection_spawns_new_object() {
        let mut tracker = ObjectTracker::new(TrackerConfig::default());
        tracker.update(&[det("person", 100.0, 100.0)], 0.0);
        // 95 px away: within distance, but the 100 px boxes barely overlap
        let update = tracker.update(&[det("person", 195.0, 100.0)], 0.1);
        assert_eq!(update.created, vec![2]);
    }

    #[test]
    fn greedy_match_prefers_lowest_cost() {
        let mut tracker = ObjectTracker::new(TrackerConfig::default());
        tracker.update(&[det("person", 100.0, 100.0), det("person", 400.0, 100.0)], 0.0);
        let update = tracker.update(&[det("person", 405.0, 100.0), det("person", 110.0, 100.0)], 0.1);
        assert_eq!(update.matched.len(), 2);
        assert_eq!(tracker.get(1).map(|o| o.center().0), Some(110.0));
        assert_eq!(tracker.get(2).map(|o| o.center().0), Some(405.0));
    }

    #[test]
    fn malformed_detections_are_dropped() {
        let mut tracker = ObjectTracker::new(TrackerConfig::default());
        let bad = Detection::new("person", 0.9, BoundingBox::new(f32::NAN, 0.0, 1.0, 1.0));
        let inverted = Detection::new("person", 0.9, BoundingBox::new(10.0, 10.0, 0.0, 0.0));
        let update = tracker.update(&[bad, inverted, det("person", 50.0, 50.0)], 0.0);
        assert_eq!(update.dropped, 2);
        assert_eq!(update.created, vec![1]);
    }

    #[test]
    fn stationary_object_becomes_static_exactly_once() {
        let config = TrackerConfig {
            static_timeout: 5.0,
            ..TrackerConfig::default()
        };
        let mut tracker = ObjectTracker::new(config);
        let mut became_static = 0;
        let mut t = 0.0;
        while t <= 8.0 {
            let update = tracker.update(&[det("car", 300.0, 300.0)], t);
            let obj = tracker.get(1).expect("car");
            if t < 5.0 {
                assert!(!obj.is_static, "static too early at t={}", t);
            }
            became_static += update
                .events
                .iter()
                .filter(|e| e.kind == TrackerEventKind::BecameStatic)
                .count();
            t += 0.5;
        }
        assert_eq!(became_static, 1);
        let obj = tracker.get(1).expect("car");
        assert!(obj.is_static);
        assert_eq!(obj.static_since, Some(5.0));
    }

    #[test]
    fn single_spike_does_not_flip_static_object() {
        let config = TrackerConfig {
            static_timeout: 2.0,
            ..TrackerConfig::default()
        };
        let mut tracker = ObjectTracker::new(config);
        let mut t = 0.0;
        while t <= 3.0 {
            tracker.update(&[det("car", 300.0, 300.0)], t);
            t += 0.25;
        }
        assert!(tracker.get(1).expect("car").is_static);

        // one 6 px jump (threshold is 5 px): last-5 average stays in band
        let spike = tracker.update(&[det("car", 306.0, 300.0)], 3.25);
        assert!(spike.events.is_empty());
        assert!(tracker.get(1).expect("car").is_static);

        // sustained movement pushes the average out of band
        let mut resumed = false;
        let mut x = 306.0;
        for step in 0..5 {
            x += 20.0;
            let update = tracker.update(&[det("car", x, 300.0)], 3.5 + step as f64 * 0.25);
            resumed |= update
                .events
                .iter()
                .any(|e| e.kind == TrackerEventKind::ResumedMoving);
        }
        assert!(resumed);
        let obj = tracker.get(1).expect("car");
        assert!(!obj.is_static);
        assert_eq!(obj.static_since, None);
    }

    #[test]
    fn check_if_static_needs_three_positions_and_age() {
        let mut tracker = ObjectTracker::new(TrackerConfig::default());
        tracker.update(&[det("car", 10.0, 10.0)], 0.0);
        tracker.update(&[det("car", 10.0, 10.0)], 1.0);
        let obj = tracker.get(1).expect("car");
        assert!(!check_if_static(obj, 100.0, 30.0, 50.0));
        tracker.update(&[det("car", 10.0, 10.0)], 2.0);
        let obj = tracker.get(1).expect("car");
        assert!(!check_if_static(obj, 29.9, 30.0, 50.0));
        // sparse window: falls back to the last positions
        assert!(check_if_static(obj, 100.0, 30.0, 50.0));
    }

    #[test]
    fn cleanup_removes_stale_objects_and_ids_are_not_reused() {
        let mut tracker = ObjectTracker::new(TrackerConfig::default());
        tracker.update(&[det("person", 100.0, 100.0)], 0.0);
        tracker.update(&[det("car", 500.0, 100.0)], 2.0);

        assert!(tracker.maybe_cleanup(2.0).is_empty());
        assert!(tracker.maybe_cleanup(4.0).is_empty(), "interval not yet elapsed");
        assert_eq!(tracker.maybe_cleanup(7.1), vec![1, 2]);
        assert!(tracker.is_empty());

        let update = tracker.update(&[det("person", 100.0, 100.0)], 7.2);
        assert_eq!(update.created, vec![3]);
    }

    #[test]
    fn active_count_uses_last_seen_window() {
        let mut tracker = ObjectTracker::new(TrackerConfig::default());
        tracker.update(&[det("person", 100.0, 100.0)], 0.0);
        tracker.update(&[det("car", 500.0, 100.0)], 1.5);
        assert_eq!(tracker.active_count(2.0, 1.0), 1);
        assert_eq!(tracker.active_count(2.0, 5.0), 2);
    }
}
