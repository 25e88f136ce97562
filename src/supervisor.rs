//! Multi-camera supervisor.
//!
//! Starts one `CameraPipeline` per configured camera. A camera that fails
//! validation (or whose detector cannot be built) is recorded in `failed()`
//! and skipped; the others keep running. All pipelines share one stop flag.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::{CameraSettings, CamwatchConfig};
use crate::detect::{BackendRegistry, SharedDetector};
use crate::error::PipelineError;
use crate::events::EventSink;
use crate::ingest::{source_factory, SourceFactory};
use crate::pipeline::{CameraPipeline, CameraSnapshot, PipelineExit, PipelineHandle, StatsSnapshot};
use crate::recorder::encoder_for;

#[derive(Clone, Debug, Serialize)]
pub struct CameraStatus {
    pub camera_id: String,
    pub running: bool,
    pub snapshot: CameraSnapshot,
    pub stats: StatsSnapshot,
}

/// Result of one joined pipeline.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub camera_id: String,
    pub result: Result<PipelineExit, PipelineError>,
}

pub struct Supervisor {
    handles: Vec<PipelineHandle>,
    failed: Vec<PipelineError>,
    stop: Arc<AtomicBool>,
}

impl Supervisor {
    /// Start every camera in `config` with sources built from its settings.
    pub fn start(
        config: &CamwatchConfig,
        registry: &BackendRegistry,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        Self::start_with_sources(config, registry, sink, |camera| {
            source_factory(camera.source.clone())
        })
    }

    /// Like `start`, with the frame source for each camera supplied by `sources`.
    pub fn start_with_sources<F>(
        config: &CamwatchConfig,
        registry: &BackendRegistry,
        sink: Arc<dyn EventSink>,
        sources: F,
    ) -> Result<Self>
    where
        F: Fn(&CameraSettings) -> SourceFactory,
    {
        std::fs::create_dir_all(&config.recordings_dir).with_context(|| {
            format!("create recordings dir {}", config.recordings_dir.display())
        })?;

        let stop = Arc::new(AtomicBool::new(false));
        let encoder = encoder_for(config.encoder);
        let shared = if config.detector.shared {
            Some(
                registry
                    .default_detector(true)
                    .context("build shared detector")?,
            )
        } else {
            None
        };

        let mut supervisor = Self {
            handles: Vec::with_capacity(config.cameras.len()),
            failed: Vec::new(),
            stop: stop.clone(),
        };
        let mut seen = HashSet::new();

        for camera in &config.cameras {
            if !seen.insert(camera.id.clone()) {
                supervisor.reject(PipelineError::config(&camera.id, "duplicate camera id"));
                continue;
            }
            if let Err(err) = camera.validate() {
                supervisor.reject(err);
                continue;
            }
            let detector: SharedDetector = match &shared {
                Some(detector) => detector.clone(),
                None => match registry.default_detector(false) {
                    Ok(detector) => detector,
                    Err(e) => {
                        supervisor.reject(PipelineError::detector(&camera.id, format!("{:#}", e)));
                        continue;
                    }
                },
            };

            let pipeline = CameraPipeline::new(
                camera.clone(),
                &config.recordings_dir,
                sources(camera),
                detector,
                encoder.clone(),
                sink.clone(),
                stop.clone(),
            );
            match pipeline.spawn() {
                Ok(handle) => supervisor.handles.push(handle),
                Err(e) => supervisor.reject(PipelineError::source(&camera.id, format!("{:#}", e))),
            }
        }

        log::info!(
            "supervisor started cameras={} failed={} detector={} shared={}",
            supervisor.handles.len(),
            supervisor.failed.len(),
            registry.default_name().unwrap_or("none"),
            config.detector.shared
        );
        Ok(supervisor)
    }

    fn reject(&mut self, err: PipelineError) {
        log::warn!("camera disabled: {}", err);
        self.failed.push(err);
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Cameras that could not be started.
    pub fn failed(&self) -> &[PipelineError] {
        &self.failed
    }

    pub fn running(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    pub fn is_idle(&self) -> bool {
        self.running() == 0
    }

    pub fn statuses(&self) -> Vec<CameraStatus> {
        self.handles
            .iter()
            .map(|h| CameraStatus {
                camera_id: h.camera_id().to_string(),
                running: !h.is_finished(),
                snapshot: h.snapshot(),
                stats: h.stats(),
            })
            .collect()
    }

    /// Signal every pipeline to stop and join them.
    pub fn stop_all(&mut self) -> Vec<PipelineOutcome> {
        self.stop.store(true, Ordering::SeqCst);
        self.wait()
    }

    /// Join every pipeline without signalling (file-driven runs end on their own).
    pub fn wait(&mut self) -> Vec<PipelineOutcome> {
        let outcomes: Vec<PipelineOutcome> = self
            .handles
            .drain(..)
            .map(|handle| {
                let camera_id = handle.camera_id().to_string();
                PipelineOutcome {
                    camera_id,
                    result: handle.join(),
                }
            })
            .collect();
        for outcome in &outcomes {
            if let Err(e) = &outcome.result {
                log::warn!("camera {} ended with error: {}", outcome.camera_id, e);
            }
        }
        outcomes
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.stop_all();
        }
    }
}
