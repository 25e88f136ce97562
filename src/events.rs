//! Observability events emitted by camera pipelines.

use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ObjectBecameStatic,
    ObjectResumedMoving,
    RecordingStarted,
    RecordingStopped,
    ClipSaved,
    ClipFailed,
    SourceConnected,
    ReconnectAttempt,
    SourceLost,
    DetectorFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ObjectBecameStatic => "object_became_static",
            EventKind::ObjectResumedMoving => "object_resumed_moving",
            EventKind::RecordingStarted => "recording_started",
            EventKind::RecordingStopped => "recording_stopped",
            EventKind::ClipSaved => "clip_saved",
            EventKind::ClipFailed => "clip_failed",
            EventKind::SourceConnected => "source_connected",
            EventKind::ReconnectAttempt => "reconnect_attempt",
            EventKind::SourceLost => "source_lost",
            EventKind::DetectorFailed => "detector_failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub camera_id: String,
    pub object_id: Option<u64>,
    pub kind: EventKind,
    pub timestamp: f64,
    /// Free-form context: video id, label, attempt number, error text.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl PipelineEvent {
    pub fn new(camera_id: &str, kind: EventKind, timestamp: f64) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            object_id: None,
            kind,
            timestamp,
            detail: String::new(),
        }
    }

    pub fn with_object(mut self, object_id: u64) -> Self {
        self.object_id = Some(object_id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// Receives pipeline events. Called from pipeline threads; must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Writes each event as one `log` line.
#[derive(Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn emit(&self, event: PipelineEvent) {
        let object = event
            .object_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "-".to_string());
        match event.kind {
            EventKind::ClipFailed | EventKind::SourceLost => log::warn!(
                "event camera={} kind={} object={} ts={:.3} {}",
                event.camera_id,
                event.kind,
                object,
                event.timestamp,
                event.detail
            ),
            _ => log::info!(
                "event camera={} kind={} object={} ts={:.3} {}",
                event.camera_id,
                event.kind,
                object,
                event.timestamp,
                event.detail
            ),
        }
    }
}

/// Keeps every event in memory. For tests and the demo summary.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .map(|events| events.iter().filter(|e| e.kind == kind).count())
            .unwrap_or(0)
    }

    pub fn for_camera(&self, camera_id: &str) -> Vec<PipelineEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.camera_id == camera_id)
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_counts_by_kind_and_camera() {
        let sink = MemoryEventSink::new();
        sink.emit(PipelineEvent::new("front", EventKind::RecordingStarted, 1.0).with_detail("ab12cd34"));
        sink.emit(PipelineEvent::new("front", EventKind::ObjectBecameStatic, 2.0).with_object(3));
        sink.emit(PipelineEvent::new("yard", EventKind::RecordingStarted, 2.5));

        assert_eq!(sink.count(EventKind::RecordingStarted), 2);
        assert_eq!(sink.for_camera("front").len(), 2);
        assert_eq!(sink.events()[1].object_id, Some(3));
    }

    #[test]
    fn event_serializes_with_snake_case_kind() -> anyhow::Result<()> {
        let event = PipelineEvent::new("front", EventKind::ReconnectAttempt, 3.5).with_detail("attempt=2");
        let json = serde_json::to_string(&event)?;
        assert!(json.contains("\"kind\":\"reconnect_attempt\""));
        let back: PipelineEvent = serde_json::from_str(&json)?;
        assert_eq!(back, event);
        Ok(())
    }
}
