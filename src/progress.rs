//! Sync progress events and reporting.
//!
//! The sync orchestrator emits one [`ProgressEvent`] per completed URL plus
//! `start`/`complete` markers. Over HTTP these travel as server-sent events;
//! on the CLI a [`ProgressReporter`] writes them to **stderr** (human or
//! JSON lines) so stdout remains parseable for scripts.

use std::io::Write;

use serde::Serialize;

/// Terminal status of one URL within a sync run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    New,
    Updated,
    Skipped,
    Empty,
    Error,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageStatus::New => "new",
            PageStatus::Updated => "updated",
            PageStatus::Skipped => "skipped",
            PageStatus::Empty => "empty",
            PageStatus::Error => "error",
        }
    }
}

/// Aggregate counters across one sync or ingest run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub new_pages: u64,
    pub updated_pages: u64,
    pub skipped_pages: u64,
    pub empty_pages: u64,
    pub errors: u64,
}

impl SyncStats {
    pub fn record(&mut self, status: PageStatus) {
        match status {
            PageStatus::New => self.new_pages += 1,
            PageStatus::Updated => self.updated_pages += 1,
            PageStatus::Skipped => self.skipped_pages += 1,
            PageStatus::Empty => self.empty_pages += 1,
            PageStatus::Error => self.errors += 1,
        }
    }
}

/// A discrete status update emitted during a pipeline run.
///
/// Serializes to the bare payload (no enum tag); the event kind travels
/// separately as the SSE event name, see [`ProgressEvent::name`].
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum ProgressEvent {
    Start {
        total: usize,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        current: usize,
        total: usize,
        url: String,
        status: PageStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        chunks: Option<usize>,
        stats: SyncStats,
    },
    Complete {
        total: usize,
        stats: SyncStats,
    },
}

impl ProgressEvent {
    /// SSE event name for this payload.
    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::Start { .. } => "start",
            ProgressEvent::Progress { .. } => "progress",
            ProgressEvent::Complete { .. } => "complete",
        }
    }
}

/// Reports sync progress. Implementations write to stderr.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Human-friendly progress: "sync  3 / 10  updated  https://acme.test/docs".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &ProgressEvent) {
        let line = match event {
            ProgressEvent::Start { total } => format!("sync  starting  {} urls\n", total),
            ProgressEvent::Progress {
                current,
                total,
                url,
                status,
                error,
                ..
            } => match error {
                Some(msg) => format!(
                    "sync  {} / {}  {}  {}  ({})\n",
                    current,
                    total,
                    status.as_str(),
                    url,
                    msg
                ),
                None => format!("sync  {} / {}  {}  {}\n", current, total, status.as_str(), url),
            },
            ProgressEvent::Complete { total, stats } => format!(
                "sync  done  {} urls  new={} updated={} skipped={} empty={} errors={}\n",
                total,
                stats.new_pages,
                stats.updated_pages,
                stats.skipped_pages,
                stats.empty_pages,
                stats.errors
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &ProgressEvent) {
        let obj = serde_json::json!({
            "event": event.name(),
            "data": event,
        });
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &ProgressEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
