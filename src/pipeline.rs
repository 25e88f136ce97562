//! One camera end to end.
//!
//! Threads per camera:
//! - reader/fold: pulls frames, reconnects on failure, offers every
//!   `detection_stride`th frame for detection, and folds the newest detection
//!   result into the tracker and recorder
//! - detector worker(s): frame queue → detector → result queue
//! - clip writer: encodes finished clips and writes sidecars
//!
//! Both queues drop their oldest entry when full; the fold never waits on
//! detection. Tracker and recorder live behind one per-camera mutex.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::Serialize;

use crate::config::{CameraSettings, SourceKind};
use crate::detect::{detect_locked, DetectionBatch, SharedDetector};
use crate::error::PipelineError;
use crate::events::{EventKind, EventSink, PipelineEvent};
use crate::frame::{now_epoch_secs, Frame};
use crate::ingest::{FrameSource, SourceFactory};
use crate::queue::DropOldestQueue;
use crate::recorder::{ClipWriter, FinishedClip, RecorderState, RecordingController, VideoEncoder};
use crate::tracker::{ObjectTracker, TrackedObject, TrackerEventKind};

/// Upper bound on any single blocking wait, so the stop flag is seen promptly.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Objects seen this recently count as "tracked" in snapshots.
const ACTIVE_WINDOW_SECS: f64 = 1.0;

// ----------------------------------------------------------------------------
// Shared state and statistics
// ----------------------------------------------------------------------------

/// Per-camera mutable state, guarded by one mutex.
pub struct CameraState {
    pub tracker: ObjectTracker,
    pub recorder: RecordingController,
    pub last_seq: u64,
    pub last_timestamp: f64,
    last_applied_seq: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CameraSnapshot {
    pub camera_id: String,
    pub recording: bool,
    pub active_video_id: Option<String>,
    pub tracked_objects: usize,
    pub active_objects: usize,
    pub static_objects: usize,
    pub preroll_frames: usize,
    pub last_seq: u64,
    pub last_timestamp: f64,
}

#[derive(Default)]
pub struct PipelineStats {
    pub frames_read: AtomicU64,
    pub frames_offered: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub results_discarded: AtomicU64,
    pub detections_run: AtomicU64,
    pub detector_errors: AtomicU64,
    pub reconnects: AtomicU64,
    pub clips_saved: AtomicU64,
    pub clips_failed: AtomicU64,
}

/// Plain copy of `PipelineStats` at one instant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_read: u64,
    pub frames_offered: u64,
    pub frames_dropped: u64,
    pub malformed_frames: u64,
    pub results_discarded: u64,
    pub detections_run: u64,
    pub detector_errors: u64,
    pub reconnects: u64,
    pub clips_saved: u64,
    pub clips_failed: u64,
}

impl PipelineStats {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_read: load(&self.frames_read),
            frames_offered: load(&self.frames_offered),
            frames_dropped: load(&self.frames_dropped),
            malformed_frames: load(&self.malformed_frames),
            results_discarded: load(&self.results_discarded),
            detections_run: load(&self.detections_run),
            detector_errors: load(&self.detector_errors),
            reconnects: load(&self.reconnects),
            clips_saved: load(&self.clips_saved),
            clips_failed: load(&self.clips_failed),
        }
    }
}

/// How a pipeline ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineExit {
    EndOfStream,
    Stopped,
}

fn lock_state(state: &Mutex<CameraState>) -> MutexGuard<'_, CameraState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Sleep up to `total`, waking every `WAIT_SLICE` to check `stop`.
/// Returns false if stopped.
fn sleep_observing(stop: &AtomicBool, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(WAIT_SLICE));
    }
}

// ----------------------------------------------------------------------------
// CameraPipeline
// ----------------------------------------------------------------------------

pub struct CameraPipeline {
    settings: CameraSettings,
    recordings_root: PathBuf,
    source_factory: SourceFactory,
    detector: SharedDetector,
    encoder: Arc<dyn VideoEncoder>,
    sink: Arc<dyn EventSink>,
    stop: Arc<AtomicBool>,
}

impl CameraPipeline {
    pub fn new(
        settings: CameraSettings,
        recordings_root: &Path,
        source_factory: SourceFactory,
        detector: SharedDetector,
        encoder: Arc<dyn VideoEncoder>,
        sink: Arc<dyn EventSink>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            settings,
            recordings_root: recordings_root.to_path_buf(),
            source_factory,
            detector,
            encoder,
            sink,
            stop,
        }
    }

    /// Start the pipeline thread.
    pub fn spawn(self) -> Result<PipelineHandle> {
        let camera_id = self.settings.id.clone();
        let state = Arc::new(Mutex::new(CameraState {
            tracker: ObjectTracker::new(self.settings.tracker.clone()),
            recorder: RecordingController::new(
                &camera_id,
                self.settings.recorder.clone(),
                &self.recordings_root,
            ),
            last_seq: 0,
            last_timestamp: 0.0,
            last_applied_seq: 0,
        }));
        let stats = Arc::new(PipelineStats::default());
        let stop = self.stop.clone();

        let runner = PipelineRunner {
            pipeline: self,
            state: state.clone(),
            stats: stats.clone(),
            halt: Arc::new(AtomicBool::new(false)),
        };
        let thread = thread::Builder::new()
            .name(format!("camwatch-{}", camera_id))
            .spawn(move || runner.run())
            .map_err(|e| anyhow!("spawn pipeline thread for {}: {}", camera_id, e))?;

        log::info!("pipeline started camera={}", camera_id);
        Ok(PipelineHandle {
            camera_id,
            state,
            stats,
            stop,
            thread: Some(thread),
        })
    }
}

// ----------------------------------------------------------------------------
// PipelineHandle
// ----------------------------------------------------------------------------

pub struct PipelineHandle {
    camera_id: String,
    state: Arc<Mutex<CameraState>>,
    stats: Arc<PipelineStats>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<PipelineExit, PipelineError>>>,
}

impl PipelineHandle {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// Ask the pipeline (and every pipeline sharing its stop flag) to stop.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for the pipeline thread. Active clips are flushed before it exits.
    pub fn join(mut self) -> Result<PipelineExit, PipelineError> {
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                Err(PipelineError::source(&self.camera_id, "pipeline thread panicked"))
            }),
            None => Ok(PipelineExit::Stopped),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn snapshot(&self) -> CameraSnapshot {
        let st = lock_state(&self.state);
        let session = st.recorder.session();
        CameraSnapshot {
            camera_id: self.camera_id.clone(),
            recording: st.recorder.state() == RecorderState::Recording,
            active_video_id: session.map(|s| s.video_id.clone()),
            tracked_objects: st.tracker.len(),
            active_objects: st.tracker.active_count(st.last_timestamp, ACTIVE_WINDOW_SECS),
            static_objects: st.tracker.objects().filter(|o| o.is_static).count(),
            preroll_frames: st.recorder.preroll_len(),
            last_seq: st.last_seq,
            last_timestamp: st.last_timestamp,
        }
    }
}

// ----------------------------------------------------------------------------
// Runner (pipeline thread)
// ----------------------------------------------------------------------------

struct PipelineRunner {
    pipeline: CameraPipeline,
    state: Arc<Mutex<CameraState>>,
    stats: Arc<PipelineStats>,
    /// Set when this pipeline exits for any reason; stops its own workers.
    halt: Arc<AtomicBool>,
}

impl PipelineRunner {
    fn camera_id(&self) -> &str {
        &self.pipeline.settings.id
    }

    fn emit(&self, event: PipelineEvent) {
        self.pipeline.sink.emit(event);
    }

    fn stopped(&self) -> bool {
        self.pipeline.stop.load(Ordering::SeqCst)
    }

    fn run(self) -> Result<PipelineExit, PipelineError> {
        let settings = &self.pipeline.settings;
        let frames = Arc::new(DropOldestQueue::<Frame>::new(settings.frame_queue_capacity));
        let results = Arc::new(DropOldestQueue::<DetectionBatch>::new(
            settings.result_queue_capacity,
        ));

        let workers: Vec<JoinHandle<()>> = (0..settings.detector_workers)
            .filter_map(|index| match self.spawn_detector_worker(index, &frames, &results) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    log::error!("camera {}: {:#}", self.camera_id(), e);
                    None
                }
            })
            .collect();

        let (clip_tx, clip_rx) = mpsc::channel::<FinishedClip>();
        let writer = self.spawn_clip_writer(clip_rx);

        let outcome = self.read_loop(&frames, &results, &clip_tx);

        self.halt.store(true, Ordering::SeqCst);
        frames.notify_all();
        for worker in workers {
            if worker.join().is_err() {
                log::error!("camera {}: detector worker panicked", self.camera_id());
            }
        }

        // Flush the active session before releasing the writer.
        let flushed = {
            let mut st = lock_state(&self.state);
            let now = if st.last_timestamp > 0.0 {
                st.last_timestamp
            } else {
                now_epoch_secs()
            };
            st.recorder.finish(now)
        };
        if let Some(clip) = flushed {
            self.emit(
                PipelineEvent::new(self.camera_id(), EventKind::RecordingStopped, clip.end_time)
                    .with_detail(format!("video_id={} reason=shutdown", clip.video_id)),
            );
            if clip_tx.send(clip).is_err() {
                log::error!("camera {}: clip writer gone, final clip lost", self.camera_id());
            }
        }
        drop(clip_tx);
        match writer {
            Ok(handle) => {
                if handle.join().is_err() {
                    log::error!("camera {}: clip writer panicked", self.camera_id());
                }
            }
            Err(e) => log::error!("camera {}: {:#}", self.camera_id(), e),
        }

        match &outcome {
            Ok(exit) => log::info!("pipeline finished camera={} exit={:?}", self.camera_id(), exit),
            Err(e) => log::error!("pipeline failed camera={}: {}", self.camera_id(), e),
        }
        outcome
    }

    fn spawn_detector_worker(
        &self,
        index: usize,
        frames: &Arc<DropOldestQueue<Frame>>,
        results: &Arc<DropOldestQueue<DetectionBatch>>,
    ) -> Result<JoinHandle<()>> {
        let camera_id = self.camera_id().to_string();
        let frames = frames.clone();
        let results = results.clone();
        let detector = self.pipeline.detector.clone();
        let sink = self.pipeline.sink.clone();
        let stats = self.stats.clone();
        let stop = self.pipeline.stop.clone();
        let halt = self.halt.clone();

        thread::Builder::new()
            .name(format!("camwatch-{}-det{}", camera_id, index))
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) && !halt.load(Ordering::SeqCst) {
                    let Some(frame) = frames.pop_timeout(WAIT_SLICE) else {
                        continue;
                    };
                    let started = Instant::now();
                    match detect_locked(&detector, &frame) {
                        Ok(detections) => {
                            PipelineStats::bump(&stats.detections_run, 1);
                            let batch = DetectionBatch {
                                frame_seq: frame.seq,
                                timestamp: frame.timestamp,
                                detections,
                                latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                            };
                            results.push(batch);
                        }
                        Err(e) => {
                            PipelineStats::bump(&stats.detector_errors, 1);
                            let err = PipelineError::detector(&camera_id, format!("{:#}", e));
                            log::warn!("{} (frame {} skipped)", err, frame.seq);
                            sink.emit(
                                PipelineEvent::new(&camera_id, EventKind::DetectorFailed, frame.timestamp)
                                    .with_detail(format!("seq={}", frame.seq)),
                            );
                        }
                    }
                }
            })
            .map_err(|e| anyhow!("spawn detector worker {}: {}", index, e))
    }

    fn spawn_clip_writer(&self, clips: mpsc::Receiver<FinishedClip>) -> Result<JoinHandle<()>> {
        let camera_id = self.camera_id().to_string();
        let writer = ClipWriter::new(&self.pipeline.recordings_root, self.pipeline.encoder.clone());
        let sink = self.pipeline.sink.clone();
        let stats = self.stats.clone();

        thread::Builder::new()
            .name(format!("camwatch-{}-writer", camera_id))
            .spawn(move || {
                for clip in clips {
                    let video_id = clip.video_id.clone();
                    let end_time = clip.end_time;
                    match writer.persist(clip) {
                        Ok(meta) => {
                            PipelineStats::bump(&stats.clips_saved, 1);
                            sink.emit(
                                PipelineEvent::new(&camera_id, EventKind::ClipSaved, end_time)
                                    .with_detail(format!(
                                        "video_id={} path={} frames={}",
                                        meta.video_id, meta.video_path, meta.total_frames
                                    )),
                            );
                        }
                        Err(e) => {
                            PipelineStats::bump(&stats.clips_failed, 1);
                            sink.emit(
                                PipelineEvent::new(&camera_id, EventKind::ClipFailed, end_time)
                                    .with_detail(format!("video_id={} {}", video_id, e)),
                            );
                        }
                    }
                }
            })
            .map_err(|e| anyhow!("spawn clip writer: {}", e))
    }

    /// Pull frames until end of stream, stop, or too many consecutive failures.
    fn read_loop(
        &self,
        frames: &DropOldestQueue<Frame>,
        results: &DropOldestQueue<DetectionBatch>,
        clips: &mpsc::Sender<FinishedClip>,
    ) -> Result<PipelineExit, PipelineError> {
        let settings = &self.pipeline.settings;
        let stride = settings.detection_stride.max(1);
        let frame_interval = Duration::from_secs_f64(1.0 / settings.source.fps.max(1) as f64);

        let mut source: Option<Box<dyn FrameSource>> = None;
        let mut cursor = SourceCursor::new(settings.source.kind, settings.source.fps);
        let mut failures: u32 = 0;
        let mut seq: u64 = 0;
        let mut pace_next = Instant::now();

        let exit = loop {
            if self.stopped() {
                break Ok(PipelineExit::Stopped);
            }

            let Some(src) = source.as_mut() else {
                match self.open_source() {
                    Ok(opened) => {
                        let skip = cursor.opened();
                        if skip > 0 {
                            log::info!(
                                "camera {}: resuming file source at frame {}",
                                self.camera_id(),
                                skip + 1
                            );
                        }
                        source = Some(opened);
                        pace_next = Instant::now();
                    }
                    Err(e) => {
                        if let Err(fatal) = self.source_failed(&mut failures, &format!("{:#}", e)) {
                            break Err(fatal);
                        }
                    }
                }
                continue;
            };

            let failure = match src.next_frame() {
                Ok(Some(_)) if cursor.replayed() => None,
                Ok(Some(frame)) => match frame.validate() {
                    Ok(()) => {
                        failures = 0;
                        seq += 1;
                        let timestamp = cursor.rebase(frame.timestamp);
                        let frame = frame.with_seq(seq).with_timestamp(timestamp);
                        PipelineStats::bump(&self.stats.frames_read, 1);
                        if seq % stride == 0 {
                            PipelineStats::bump(&self.stats.frames_offered, 1);
                            let dropped = frames.push(frame.clone());
                            PipelineStats::bump(&self.stats.frames_dropped, dropped as u64);
                        }
                        self.fold(&frame, results, clips);

                        if settings.pace {
                            pace_next += frame_interval;
                            let now = Instant::now();
                            if pace_next > now {
                                sleep_observing(&self.pipeline.stop, pace_next - now);
                            } else {
                                pace_next = now;
                            }
                        }
                        None
                    }
                    Err(e) => {
                        PipelineStats::bump(&self.stats.malformed_frames, 1);
                        Some(format!("malformed frame: {:#}", e))
                    }
                },
                Ok(None) => break Ok(PipelineExit::EndOfStream),
                Err(e) => Some(format!("{:#}", e)),
            };

            if let Some(reason) = failure {
                if let Some(mut broken) = source.take() {
                    broken.close();
                }
                cursor.lost();
                if let Err(fatal) = self.source_failed(&mut failures, &reason) {
                    break Err(fatal);
                }
            }
        };

        if let Some(mut src) = source {
            src.close();
        }
        exit
    }

    fn open_source(&self) -> Result<Box<dyn FrameSource>> {
        let mut source = (self.pipeline.source_factory)()?;
        source.connect()?;
        self.emit(PipelineEvent::new(
            self.camera_id(),
            EventKind::SourceConnected,
            now_epoch_secs(),
        ));
        Ok(source)
    }

    /// Count a failure and back off, or give up once the attempt budget is spent.
    fn source_failed(&self, failures: &mut u32, reason: &str) -> Result<(), PipelineError> {
        *failures += 1;
        let reconnect = &self.pipeline.settings.reconnect;
        if reconnect.max_attempts > 0 && *failures > reconnect.max_attempts {
            let err = PipelineError::source(
                self.camera_id(),
                format!("giving up after {} attempts: {}", reconnect.max_attempts, reason),
            );
            self.emit(
                PipelineEvent::new(self.camera_id(), EventKind::SourceLost, now_epoch_secs())
                    .with_detail(reason.to_string()),
            );
            return Err(err);
        }

        let backoff = reconnect.backoff_for(*failures);
        PipelineStats::bump(&self.stats.reconnects, 1);
        log::warn!(
            "camera {}: source failed ({}), reconnect attempt {} in {:?}",
            self.camera_id(),
            reason,
            failures,
            backoff
        );
        self.emit(
            PipelineEvent::new(self.camera_id(), EventKind::ReconnectAttempt, now_epoch_secs())
                .with_detail(format!("attempt={} reason={}", failures, reason)),
        );
        sleep_observing(&self.pipeline.stop, backoff);
        Ok(())
    }

    /// Apply the newest detection result and advance the recorder by one frame.
    fn fold(
        &self,
        frame: &Frame,
        results: &DropOldestQueue<DetectionBatch>,
        clips: &mpsc::Sender<FinishedClip>,
    ) {
        let camera_id = self.camera_id();
        let mut events = Vec::new();
        let mut finished = None;
        {
            let mut guard = lock_state(&self.state);
            let st = &mut *guard;

            if let Some((batch, discarded)) = results.drain_latest() {
                PipelineStats::bump(&self.stats.results_discarded, discarded as u64);
                if batch.frame_seq > st.last_applied_seq {
                    st.last_applied_seq = batch.frame_seq;
                    let now = batch.timestamp;
                    let update = st.tracker.update(&batch.detections, now);
                    for ev in &update.events {
                        let kind = match ev.kind {
                            TrackerEventKind::BecameStatic => EventKind::ObjectBecameStatic,
                            TrackerEventKind::ResumedMoving => EventKind::ObjectResumedMoving,
                        };
                        events.push(
                            PipelineEvent::new(camera_id, kind, ev.timestamp)
                                .with_object(ev.object_id)
                                .with_detail(ev.label.clone()),
                        );
                    }
                    let observed: Vec<&TrackedObject> = update
                        .observed()
                        .filter_map(|id| st.tracker.get(id))
                        .collect();
                    if let Some(started) = st.recorder.observe(observed, now) {
                        events.push(
                            PipelineEvent::new(camera_id, EventKind::RecordingStarted, started.start_time)
                                .with_object(started.trigger_object_id)
                                .with_detail(format!(
                                    "video_id={} label={} preroll_frames={}",
                                    started.video_id, started.trigger_label, started.preroll_frames
                                )),
                        );
                    }
                } else {
                    PipelineStats::bump(&self.stats.results_discarded, 1);
                }
            }

            st.tracker.maybe_cleanup(frame.timestamp);
            if let Some(clip) = st.recorder.poll(frame.timestamp) {
                events.push(
                    PipelineEvent::new(camera_id, EventKind::RecordingStopped, clip.end_time)
                        .with_detail(format!("video_id={} frames={}", clip.video_id, clip.frames.len())),
                );
                finished = Some(clip);
            }
            st.recorder.ingest_frame(frame);
            st.last_seq = frame.seq;
            st.last_timestamp = frame.timestamp;
        }

        for event in events {
            self.emit(event);
        }
        if let Some(clip) = finished {
            if clips.send(clip).is_err() {
                log::error!("camera {}: clip writer gone, clip dropped", camera_id);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// SourceCursor
// ----------------------------------------------------------------------------

/// Position and clock continuity across source reopens.
///
/// A reopened file starts again at its first frame; the frames already
/// delivered are skipped. Timestamps from a reopened source are shifted so the
/// camera's clock never runs backwards. File sources always continue one frame
/// after the last delivered timestamp; live sources are shifted only when
/// their clock is behind.
#[derive(Debug)]
struct SourceCursor {
    resume_files: bool,
    frame_secs: f64,
    /// Frames pulled from the current source instance, skipped ones included.
    consumed: u64,
    skip: u64,
    resume_at: u64,
    offset: Option<f64>,
    last_timestamp: Option<f64>,
}

impl SourceCursor {
    fn new(kind: SourceKind, fps: u32) -> Self {
        Self {
            resume_files: kind == SourceKind::File,
            frame_secs: 1.0 / fps.max(1) as f64,
            consumed: 0,
            skip: 0,
            resume_at: 0,
            offset: None,
            last_timestamp: None,
        }
    }

    /// A new source instance is open. Returns how many frames it will skip.
    fn opened(&mut self) -> u64 {
        self.consumed = 0;
        self.skip = if self.resume_files { self.resume_at } else { 0 };
        self.offset = None;
        self.skip
    }

    fn lost(&mut self) {
        self.resume_at = self.resume_at.max(self.consumed);
    }

    /// Counts one pulled frame; true if an earlier instance already delivered it.
    fn replayed(&mut self) -> bool {
        self.consumed += 1;
        self.consumed <= self.skip
    }

    fn rebase(&mut self, timestamp: f64) -> f64 {
        let (resume_files, frame_secs) = (self.resume_files, self.frame_secs);
        let last = self.last_timestamp;
        let offset = *self.offset.get_or_insert_with(|| match last {
            Some(last) if resume_files || timestamp <= last => last + frame_secs - timestamp,
            _ => 0.0,
        });
        let rebased = match last {
            Some(last) => (timestamp + offset).max(last),
            None => timestamp + offset,
        };
        self.last_timestamp = Some(rebased);
        rebased
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceSettings;
    use crate::detect::{shared_detector, BoundingBox, Detection, DetectorBackend};
    use crate::events::MemoryEventSink;
    use crate::ingest::SourceStats;
    use crate::recorder::RawVideoEncoder;
    use std::sync::atomic::AtomicUsize;

    /// Finite scripted source: fails once after `fail_after` frames if set.
    struct ScriptedSource {
        frames: u64,
        produced: u64,
        fail_after: Option<u64>,
        fps: u32,
        t0: f64,
    }

    impl FrameSource for ScriptedSource {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn next_frame(&mut self) -> Result<Option<Frame>> {
            if Some(self.produced) == self.fail_after {
                self.fail_after = None;
                return Err(anyhow!("short read"));
            }
            if self.produced >= self.frames {
                return Ok(None);
            }
            self.produced += 1;
            let ts = self.t0 + self.produced as f64 / self.fps as f64;
            Ok(Some(Frame::filled(32, 24, 0, self.produced, ts)))
        }

        fn is_healthy(&self) -> bool {
            true
        }

        fn stats(&self) -> SourceStats {
            SourceStats {
                frames_captured: self.produced,
                url: "test://scripted".to_string(),
            }
        }
    }

    struct PersonBackend;

    impl DetectorBackend for PersonBackend {
        fn name(&self) -> &'static str {
            "person"
        }

        fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
            let x = 5.0 + frame.seq as f32 * 0.5;
            Ok(vec![Detection::new("person", 0.9, BoundingBox::new(x, 2.0, x + 8.0, 20.0))])
        }
    }

    struct FailingBackend;

    /// Detects nothing, remembers the timestamp of every frame it saw.
    struct StampBackend(Arc<Mutex<Vec<f64>>>);

    impl DetectorBackend for StampBackend {
        fn name(&self) -> &'static str {
            "stamp"
        }

        fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
            self.0.lock().unwrap().push(frame.timestamp);
            Ok(Vec::new())
        }
    }

    impl DetectorBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            Err(anyhow!("model crashed"))
        }
    }

    fn settings(id: &str) -> CameraSettings {
        let mut cam = CameraSettings::new(id, SourceSettings::stub_file(id, 1));
        cam.source.fps = 50;
        cam.recorder.fps = 50;
        cam.recorder.recording_duration = 0.5;
        cam.recorder.preroll_secs = 0.2;
        cam.pace = true;
        cam.reconnect.initial_backoff_ms = 10;
        cam.reconnect.max_backoff_ms = 20;
        cam
    }

    fn scripted(frames: u64, fail_after: Option<u64>, opens: Arc<AtomicUsize>) -> SourceFactory {
        Arc::new(move || {
            let n = opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSource {
                frames,
                produced: 0,
                fail_after: if n == 0 { fail_after } else { None },
                fps: 50,
                t0: 1_000.0 + n as f64 * 100.0,
            }) as Box<dyn FrameSource>)
        })
    }

    #[test]
    fn pipeline_records_and_flushes_on_end_of_stream() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = Arc::new(MemoryEventSink::new());
        let opens = Arc::new(AtomicUsize::new(0));
        let handle = CameraPipeline::new(
            settings("front"),
            dir.path(),
            scripted(60, None, opens),
            shared_detector(PersonBackend),
            Arc::new(RawVideoEncoder),
            sink.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .spawn()?;

        assert_eq!(handle.join()?, PipelineExit::EndOfStream);
        assert!(sink.count(EventKind::RecordingStarted) >= 1);
        assert_eq!(
            sink.count(EventKind::RecordingStarted),
            sink.count(EventKind::RecordingStopped)
        );
        assert_eq!(
            sink.count(EventKind::ClipSaved),
            sink.count(EventKind::RecordingStopped)
        );
        assert_eq!(sink.count(EventKind::ClipFailed), 0);
        Ok(())
    }

    #[test]
    fn pipeline_reconnects_after_short_read_and_renumbers() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = Arc::new(MemoryEventSink::new());
        let opens = Arc::new(AtomicUsize::new(0));
        let mut cam = settings("yard");
        cam.source.kind = SourceKind::Rtsp;
        let handle = CameraPipeline::new(
            cam,
            dir.path(),
            scripted(10, Some(5), opens.clone()),
            shared_detector(PersonBackend),
            Arc::new(RawVideoEncoder),
            sink.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .spawn()?;

        while !handle.is_finished() {
            thread::sleep(Duration::from_millis(10));
        }
        let (stats, snapshot) = (handle.stats(), handle.snapshot());
        assert_eq!(handle.join()?, PipelineExit::EndOfStream);

        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert_eq!(stats.reconnects, 1);
        assert_eq!(stats.frames_read, 15);
        assert_eq!(snapshot.last_seq, 15);
        assert_eq!(sink.count(EventKind::ReconnectAttempt), 1);
        assert_eq!(sink.count(EventKind::SourceConnected), 2);
        Ok(())
    }

    #[test]
    fn file_source_resumes_with_monotonic_timestamps() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = Arc::new(MemoryEventSink::new());
        let opens = Arc::new(AtomicUsize::new(0));
        let counted = opens.clone();
        // The reopened file restarts at frame 1 with an earlier clock.
        let factory: SourceFactory = Arc::new(move || {
            let n = counted.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedSource {
                frames: 20,
                produced: 0,
                fail_after: if n == 0 { Some(8) } else { None },
                fps: 50,
                t0: if n == 0 { 1_000.0 } else { 500.0 },
            }) as Box<dyn FrameSource>)
        });
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let mut cam = settings("shed");
        cam.pace = false;
        cam.detection_stride = 1;
        cam.frame_queue_capacity = 32;
        let handle = CameraPipeline::new(
            cam,
            dir.path(),
            factory,
            shared_detector(StampBackend(stamps.clone())),
            Arc::new(RawVideoEncoder),
            sink.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .spawn()?;

        while !handle.is_finished() {
            thread::sleep(Duration::from_millis(10));
        }
        let (stats, snapshot) = (handle.stats(), handle.snapshot());
        assert_eq!(handle.join()?, PipelineExit::EndOfStream);

        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert_eq!(stats.frames_read, 20);
        assert_eq!(snapshot.last_seq, 20);
        // frame 8 was at 1000.16; frames 9..=20 continue 20 ms apart
        assert!((snapshot.last_timestamp - 1_000.40).abs() < 1e-6);
        let stamps = stamps.lock().unwrap();
        assert!(stamps.windows(2).all(|w| w[0] <= w[1]));
        assert!(stamps.iter().all(|&t| t > 1_000.0));
        Ok(())
    }

    #[test]
    fn cursor_shifts_a_lagging_live_clock_forward() {
        let mut cursor = SourceCursor::new(SourceKind::Rtsp, 10);
        assert_eq!(cursor.opened(), 0);
        assert!(!cursor.replayed());
        assert_eq!(cursor.rebase(100.0), 100.0);
        assert!(!cursor.replayed());
        assert_eq!(cursor.rebase(100.1), 100.1);
        cursor.lost();

        // live sources never skip, but a clock behind the last frame is shifted
        assert_eq!(cursor.opened(), 0);
        assert!(!cursor.replayed());
        assert!((cursor.rebase(50.0) - 100.2).abs() < 1e-9);
        assert!((cursor.rebase(50.1) - 100.3).abs() < 1e-9);
        cursor.lost();

        // a clock that is already ahead is left alone
        cursor.opened();
        assert_eq!(cursor.rebase(200.0), 200.0);
        // and never steps back within one instance
        assert_eq!(cursor.rebase(199.0), 200.0);
    }

    #[test]
    fn cursor_skips_frames_a_file_already_delivered() {
        let mut cursor = SourceCursor::new(SourceKind::File, 10);
        cursor.opened();
        for _ in 0..3 {
            assert!(!cursor.replayed());
        }
        cursor.lost();

        assert_eq!(cursor.opened(), 3);
        assert!(cursor.replayed());
        assert!(cursor.replayed());
        // failing again mid-skip keeps the furthest position
        cursor.lost();
        assert_eq!(cursor.opened(), 3);
        for _ in 0..3 {
            assert!(cursor.replayed());
        }
        assert!(!cursor.replayed());
    }

    #[test]
    fn pipeline_gives_up_after_max_attempts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = Arc::new(MemoryEventSink::new());
        let mut cam = settings("gate");
        cam.reconnect.max_attempts = 2;
        let factory: SourceFactory = Arc::new(|| Err(anyhow!("connection refused")));
        let handle = CameraPipeline::new(
            cam,
            dir.path(),
            factory,
            shared_detector(PersonBackend),
            Arc::new(RawVideoEncoder),
            sink.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .spawn()?;

        let err = handle.join().expect_err("source lost");
        assert_eq!(err.code(), "SOURCE");
        assert_eq!(err.camera_id(), "gate");
        assert_eq!(sink.count(EventKind::ReconnectAttempt), 2);
        assert_eq!(sink.count(EventKind::SourceLost), 1);
        Ok(())
    }

    #[test]
    fn detector_errors_are_counted_not_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = Arc::new(MemoryEventSink::new());
        let opens = Arc::new(AtomicUsize::new(0));
        let handle = CameraPipeline::new(
            settings("drive"),
            dir.path(),
            scripted(40, None, opens),
            shared_detector(FailingBackend),
            Arc::new(RawVideoEncoder),
            sink.clone(),
            Arc::new(AtomicBool::new(false)),
        )
        .spawn()?;

        while !handle.is_finished() {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = handle.stats();
        assert_eq!(handle.join()?, PipelineExit::EndOfStream);
        assert_eq!(stats.frames_read, 40);
        assert!(stats.detector_errors >= 1);
        assert_eq!(stats.detections_run, 0);
        assert_eq!(sink.count(EventKind::RecordingStarted), 0);
        Ok(())
    }

    #[test]
    fn stop_flag_ends_a_live_pipeline_promptly() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sink = Arc::new(MemoryEventSink::new());
        let opens = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let handle = CameraPipeline::new(
            settings("porch"),
            dir.path(),
            scripted(u64::MAX, None, opens),
            shared_detector(PersonBackend),
            Arc::new(RawVideoEncoder),
            sink.clone(),
            stop.clone(),
        )
        .spawn()?;

        thread::sleep(Duration::from_millis(300));
        let started = Instant::now();
        handle.stop();
        assert_eq!(handle.join()?, PipelineExit::Stopped);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(stop.load(Ordering::SeqCst));
        // any session open at shutdown was flushed to the writer
        assert_eq!(
            sink.count(EventKind::RecordingStarted),
            sink.count(EventKind::ClipSaved)
        );
        Ok(())
    }
}
