//! demo - end-to-end synthetic run for camwatch
//!
//! Runs a few `stub://` file cameras through the full pipeline with the stub
//! detector (a parked car plus a person walking through now and then) and the
//! raw encoder, then writes a JSON summary next to the recorded clips.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use camwatch::recorder::write_atomic;
use camwatch::{
    BackendRegistry, CameraSettings, CameraStatus, CamwatchConfig, DetectorBackend,
    DetectorSettings, EncoderKind, EventKind, MemoryEventSink, SourceSettings, StubBackend,
    StubScene, Supervisor,
};

const DEMO_WIDTH: u32 = 320;
const DEMO_HEIGHT: u32 = 240;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Length of each synthetic camera clip in seconds.
    #[arg(long, default_value_t = 20)]
    seconds: u64,
    /// Frames per second for the synthetic sources.
    #[arg(long, default_value_t = 10)]
    fps: u32,
    /// Recordings root and summary directory.
    #[arg(long, default_value = "demo_out")]
    out: String,
    /// Number of cameras.
    #[arg(long, default_value_t = 2)]
    cameras: usize,
    /// Optional seed; varies when people walk through each camera's scene.
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Serialize)]
struct DemoSummary {
    seed: Option<u64>,
    cameras: Vec<CameraStatus>,
    events: BTreeMap<String, usize>,
    clips: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.fps == 0 {
        return Err(anyhow!("fps must be >= 1"));
    }
    if args.cameras == 0 {
        return Err(anyhow!("cameras must be >= 1"));
    }

    let out_dir = PathBuf::from(&args.out);
    fs::create_dir_all(&out_dir)?;

    stage("configure cameras");
    let total_frames = args.seconds.saturating_mul(args.fps as u64).max(1);
    let cameras = (1..=args.cameras)
        .map(|n| {
            let id = format!("cam{}", n);
            let source = SourceSettings {
                width: DEMO_WIDTH,
                height: DEMO_HEIGHT,
                fps: args.fps,
                ..SourceSettings::stub_file(&id, total_frames)
            };
            let mut camera = CameraSettings::new(&id, source);
            camera.recorder.recording_duration = 2.0;
            camera.recorder.preroll_secs = 1.0;
            camera
        })
        .collect();
    let cfg = CamwatchConfig {
        recordings_dir: out_dir.clone(),
        encoder: EncoderKind::Raw,
        detector: DetectorSettings::default(),
        cameras,
    };

    let mut registry = BackendRegistry::with_builtin(&cfg.detector)?;
    if let Some(seed) = args.seed {
        let rng = Mutex::new(StdRng::seed_from_u64(seed));
        let fps = args.fps as u64;
        // Each camera instantiates its own detector, so each draws its own scene.
        registry.register("stub", move || {
            let mut rng = rng.lock().map_err(|_| anyhow!("demo rng lock poisoned"))?;
            let scene = StubScene {
                cycle_frames: rng.gen_range(fps * 4..=fps * 10),
                walk_frames: rng.gen_range(fps..=fps * 3),
                parked_car: rng.gen_bool(0.5),
            };
            log::info!(
                "stub scene cycle_frames={} walk_frames={} parked_car={}",
                scene.cycle_frames,
                scene.walk_frames,
                scene.parked_car
            );
            Ok(Box::new(StubBackend::with_scene(scene)) as Box<dyn DetectorBackend>)
        });
    }

    stage("run pipelines");
    let sink = Arc::new(MemoryEventSink::new());
    let mut supervisor = Supervisor::start(&cfg, &registry, sink.clone())?;
    for err in supervisor.failed() {
        log::warn!("camera rejected: {}", err);
    }
    while !supervisor.is_idle() {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    let statuses = supervisor.statuses();
    let outcomes = supervisor.wait();
    for outcome in &outcomes {
        if let Err(e) = &outcome.result {
            log::warn!("camera {} failed: {}", outcome.camera_id, e);
        }
    }

    stage("write summary");
    let mut events = BTreeMap::new();
    for event in sink.events() {
        *events.entry(event.kind.as_str().to_string()).or_insert(0) += 1;
    }
    let clips: Vec<String> = sink
        .events()
        .into_iter()
        .filter(|e| e.kind == EventKind::ClipSaved)
        .map(|e| format!("{}: {}", e.camera_id, e.detail))
        .collect();
    let summary = DemoSummary {
        seed: args.seed,
        cameras: statuses,
        events,
        clips,
    };
    let summary_path = out_dir.join("summary.json");
    let bytes = serde_json::to_vec_pretty(&summary).context("serialize demo summary")?;
    write_atomic(&summary_path, &bytes)?;

    println!(
        "demo complete: cameras={} clips={} summary={}",
        outcomes.len(),
        summary.clips.len(),
        summary_path.display()
    );
    Ok(())
}

fn stage(name: &str) {
    log::info!("== {} ==", name);
}
