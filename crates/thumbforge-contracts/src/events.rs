use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only JSONL event log shared by the index and the orchestrator.
///
/// - default fields are `type`, `session_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
/// - a disabled writer builds the event but never touches the filesystem
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: Option<PathBuf>,
    session_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: Some(path.into()),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: None,
                session_id: String::new(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.path.is_some()
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let event = self.build_event(event_type, payload);
        if let Some(path) = self.inner.path.as_deref() {
            self.append_line(path, &serde_json::to_string(&event)?)?;
        }
        Ok(event)
    }

    fn build_event(&self, event_type: &str, payload: EventPayload) -> Value {
        let mut fields = EventPayload::from_iter([
            ("type".to_string(), Value::from(event_type)),
            ("session_id".to_string(), Value::from(self.inner.session_id.as_str())),
            ("ts".to_string(), Value::from(timestamp_micros())),
        ]);
        fields.extend(payload);
        Value::Object(fields)
    }

    fn append_line(&self, path: &Path, line: &str) -> anyhow::Result<()> {
        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir)?,
            _ => {}
        }
        let _held = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log mutex poisoned"))?;
        let mut log = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(log, "{line}")?;
        Ok(())
    }

    /// Emits and swallows I/O failures; the event log never aborts the
    /// operation it is describing.
    pub fn record(&self, event_type: &str, payload: EventPayload) {
        if let Err(err) = self.emit(event_type, payload) {
            tracing::warn!(event_type, error = %err, "event log append failed");
        }
    }
}

impl Default for EventWriter {
    fn default() -> Self {
        Self::disabled()
    }
}

pub fn payload(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}

fn timestamp_micros() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
