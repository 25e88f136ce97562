//! camwatchd - multi-camera tracking and recording daemon
//!
//! This daemon:
//! 1. Loads camera, detector and recorder settings (file + env overrides)
//! 2. Starts one pipeline per camera (bad cameras are reported and skipped)
//! 3. Logs pipeline events and periodic per-camera status
//! 4. On Ctrl-C (or when every file-driven camera has finished) stops all
//!    pipelines, flushing active recordings

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use camwatch::{BackendRegistry, CamwatchConfig, LogEventSink, Supervisor};

#[derive(Parser, Debug)]
#[command(
    name = "camwatchd",
    version,
    about = "Track objects per camera and record clips when something moves"
)]
struct Args {
    /// Config file (.toml or .json).
    #[arg(long, env = "CAMWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit.
    #[arg(long)]
    check: bool,

    /// Seconds between status log lines (0 disables).
    #[arg(long, env = "CAMWATCH_STATUS_INTERVAL", default_value_t = 60)]
    status_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = CamwatchConfig::load_from(args.config.as_deref())?;
    let registry = BackendRegistry::with_builtin(&cfg.detector)?;

    if args.check {
        let mut invalid = 0usize;
        for camera in &cfg.cameras {
            match camera.validate() {
                Ok(()) => log::info!(
                    "camera ok id={} url={} size={}x{} fps={}",
                    camera.id,
                    camera.source.url,
                    camera.source.width,
                    camera.source.height,
                    camera.source.fps
                ),
                Err(e) => {
                    invalid += 1;
                    log::error!("{}", e);
                }
            }
        }
        log::info!(
            "config checked cameras={} invalid={} detector={} backends={:?} encoder={}",
            cfg.cameras.len(),
            invalid,
            cfg.detector.backend,
            registry.list(),
            cfg.encoder
        );
        if invalid > 0 {
            return Err(anyhow!("{} camera(s) failed validation", invalid));
        }
        return Ok(());
    }

    let mut supervisor = Supervisor::start(&cfg, &registry, Arc::new(LogEventSink))?;
    if supervisor.running() == 0 {
        return Err(anyhow!(
            "no camera could be started ({} rejected)",
            supervisor.failed().len()
        ));
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!(
        "camwatchd running cameras={} recordings_dir={} (Ctrl-C to stop)",
        supervisor.running(),
        cfg.recordings_dir.display()
    );

    let status_every = Duration::from_secs(args.status_interval);
    let mut last_status = Instant::now();
    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, stopping pipelines...");
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }
        if supervisor.is_idle() {
            log::info!("all pipelines finished");
            break;
        }
        if !status_every.is_zero() && last_status.elapsed() >= status_every {
            last_status = Instant::now();
            for status in supervisor.statuses() {
                log::info!(
                    "status camera={} running={} recording={} tracked={} static={} frames={} dropped={} clips={}",
                    status.camera_id,
                    status.running,
                    status.snapshot.recording,
                    status.snapshot.tracked_objects,
                    status.snapshot.static_objects,
                    status.stats.frames_read,
                    status.stats.frames_dropped,
                    status.stats.clips_saved
                );
            }
        }
    }

    let outcomes = supervisor.stop_all();
    let errors = outcomes.iter().filter(|o| o.result.is_err()).count();
    log::info!("camwatchd stopped pipelines={} errors={}", outcomes.len(), errors);
    Ok(())
}
