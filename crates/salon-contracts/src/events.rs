use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for `events.jsonl`.
///
/// - default fields are `type`, `session_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
///
/// A memory sink keeps emitted events in process instead of on disk.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    sink: EventSink,
    session_id: String,
    lock: Mutex<Vec<Value>>,
}

#[derive(Debug)]
enum EventSink {
    File(PathBuf),
    Memory,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self::with_sink(EventSink::File(path.into()), session_id.into())
    }

    pub fn memory(session_id: impl Into<String>) -> Self {
        Self::with_sink(EventSink::Memory, session_id.into())
    }

    fn with_sink(sink: EventSink, session_id: String) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                sink,
                session_id,
                lock: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.inner.sink {
            EventSink::File(path) => Some(path.as_path()),
            EventSink::Memory => None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }
        let event = Value::Object(event);

        let mut guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        match &self.inner.sink {
            EventSink::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let line = serde_json::to_string(&event)?;
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
            EventSink::Memory => guard.push(event.clone()),
        }

        Ok(event)
    }

    /// Events held by a memory sink, oldest first. File sinks return nothing.
    pub fn recorded(&self) -> Vec<Value> {
        match self.inner.lock.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn recorded_types(&self) -> Vec<String> {
        self.recorded()
            .iter()
            .filter_map(|event| event.get("type").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
