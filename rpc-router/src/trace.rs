use serde::Serialize;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceAction {
    Start,
    Result,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub stage: &'static str,
    pub action: TraceAction,
    pub summary: String,
    pub duration_us: u64,
}

/// Ordered record of what each pipeline stage did for one request.
///
/// Owned by the request and passed down explicitly. A disabled trace drops every entry,
/// so callers can record unconditionally.
#[derive(Debug, Default)]
pub struct RouteTrace {
    enabled: bool,
    entries: Vec<TraceEntry>,
}

impl RouteTrace {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Vec::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn start(&mut self, stage: &'static str) {
        self.push(stage, TraceAction::Start, String::new(), Duration::ZERO);
    }

    pub fn result(&mut self, stage: &'static str, summary: &str, duration: Duration) {
        self.push(stage, TraceAction::Result, summary.to_string(), duration);
    }

    pub fn error(&mut self, stage: &'static str, summary: String, duration: Duration) {
        self.push(stage, TraceAction::Error, summary, duration);
    }

    fn push(
        &mut self,
        stage: &'static str,
        action: TraceAction,
        summary: String,
        duration: Duration,
    ) {
        if !self.enabled {
            return;
        }
        self.entries.push(TraceEntry {
            stage,
            action,
            summary,
            duration_us: duration.as_micros() as u64,
        });
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }
}
