//! Tracker and recorder driven together, frame by frame, in the same order the
//! camera pipeline folds detection results.

use std::path::Path;

use camwatch::recorder::RecordingStarted;
use camwatch::tracker::TrackerEventKind;
use camwatch::{
    BoundingBox, Detection, FinishedClip, Frame, ObjectTracker, RecorderConfig, RecorderState,
    RecordingController, TrackedObject, TrackerConfig,
};

const FPS: u32 = 10;

struct Run {
    started: Vec<RecordingStarted>,
    clips: Vec<FinishedClip>,
    became_static: Vec<(u64, f64)>,
    resumed: Vec<(u64, f64)>,
}

/// Parked car from t=0, a person walking past at t=10..12, the car driving
/// off at t=15..17, then an empty scene.
fn scene(frame: u64) -> Vec<Detection> {
    let t = frame as f32 / FPS as f32;
    let mut dets = Vec::new();
    if frame < 150 {
        dets.push(Detection::new("car", 0.82, BoundingBox::new(100.0, 300.0, 180.0, 360.0)));
    } else if frame < 170 {
        let dx = (frame - 149) as f32 * 10.0;
        dets.push(Detection::new(
            "car",
            0.82,
            BoundingBox::new(100.0 + dx, 300.0, 180.0 + dx, 360.0),
        ));
    }
    if (100..120).contains(&frame) {
        let x = 200.0 + (t - 10.0) * 80.0;
        dets.push(Detection::new("person", 0.78, BoundingBox::new(x, 100.0, x + 40.0, 220.0)));
    }
    dets
}

fn run(frames: u64) -> Run {
    let mut tracker = ObjectTracker::new(TrackerConfig {
        static_timeout: 2.0,
        ..TrackerConfig::default()
    });
    let mut recorder = RecordingController::new(
        "driveway",
        RecorderConfig {
            recording_duration: 1.0,
            preroll_secs: 0.5,
            fps: FPS,
            ..RecorderConfig::default()
        },
        Path::new("/recordings"),
    );

    let mut out = Run {
        started: Vec::new(),
        clips: Vec::new(),
        became_static: Vec::new(),
        resumed: Vec::new(),
    };
    let mut ingested_in_session = 0usize;

    for frame_no in 0..frames {
        let now = frame_no as f64 / FPS as f64;
        let update = tracker.update(&scene(frame_no), now);
        for ev in &update.events {
            match ev.kind {
                TrackerEventKind::BecameStatic => out.became_static.push((ev.object_id, now)),
                TrackerEventKind::ResumedMoving => out.resumed.push((ev.object_id, now)),
            }
        }
        let observed: Vec<&TrackedObject> =
            update.observed().filter_map(|id| tracker.get(id)).collect();
        if let Some(started) = recorder.observe(observed, now) {
            out.started.push(started);
        }
        tracker.maybe_cleanup(now);
        if let Some(clip) = recorder.poll(now) {
            assert_eq!(clip.frames.len(), clip.preroll_frames + ingested_in_session);
            out.clips.push(clip);
            ingested_in_session = 0;
        }
        recorder.ingest_frame(&Frame::filled(32, 24, 0, frame_no + 1, now));
        if recorder.state() == RecorderState::Recording {
            ingested_in_session += 1;
        }
    }
    if let Some(clip) = recorder.finish(frames as f64 / FPS as f64) {
        out.clips.push(clip);
    }
    out
}

#[test]
fn parked_car_stops_counting_once_static() {
    let run = run(200);

    // The car arriving triggers a clip until it is judged static.
    assert_eq!(run.became_static, vec![(1, 2.0)]);
    let first = &run.clips[0];
    assert_eq!(run.started[0].trigger_label, "car");
    assert_eq!(first.preroll_frames, 0);
    assert!(first.detections.iter().all(|d| d.object_id == 1));
    assert!(first.detections.iter().all(|d| d.timestamp < 2.0));
    assert!(first.end_time > 2.8 && first.end_time < 3.1);
}

#[test]
fn walker_past_static_car_records_only_the_walker() {
    let run = run(200);
    assert_eq!(run.clips.len(), 3);

    let second = &run.clips[1];
    assert_eq!(run.started[1].trigger_label, "person");
    assert_eq!(run.started[1].trigger_object_id, 2);
    assert_eq!(second.preroll_frames, 5);
    assert!(second.detections.iter().all(|d| d.label == "person" && d.object_id == 2));
    assert!((second.start_time - 10.0).abs() < 1e-9);
    assert!(second.end_time > 12.8 && second.end_time < 13.1);
}

#[test]
fn car_driving_off_resumes_and_records_again() {
    let run = run(200);

    assert_eq!(run.resumed.len(), 1);
    let (id, at) = run.resumed[0];
    assert_eq!(id, 1);
    assert!(at > 15.0 && at < 15.5);

    let third = &run.clips[2];
    assert_eq!(run.started[2].trigger_label, "car");
    assert!(third.detections.iter().all(|d| d.object_id == 1));
    assert!(third.end_time > 17.8 && third.end_time < 18.1);
    // Same identity throughout: the car was never re-created.
    assert!(run.clips.iter().flat_map(|c| &c.detections).all(|d| d.object_id <= 2));
}

#[test]
fn clip_frames_are_preroll_plus_ingested() {
    let run = run(200);
    for (clip, started) in run.clips.iter().zip(&run.started) {
        assert_eq!(clip.preroll_frames, started.preroll_frames);
        assert!(clip.frames.len() > clip.preroll_frames);
        let seqs: Vec<u64> = clip.frames.iter().map(|f| f.seq).collect();
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1));
    }
}
