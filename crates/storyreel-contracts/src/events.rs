use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// One line of `events.jsonl`. The envelope fields are reserved; if the
/// caller's fields carry any of them they are dropped, so every line is
/// guaranteed to name its real event and run.
#[derive(Debug, Serialize)]
struct EventRecord<'a> {
    event: &'a str,
    run_id: &'a str,
    ts: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

/// Append-only writer for the run's event log.
///
/// Takes any `json!` object as the per-event fields and serializes one
/// compact record per line. The log file is opened on first emit and held
/// for the writer's lifetime; cloning shares the handle, so the cache, the
/// engine, and any background worker can all log through one writer.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    run_id: String,
    file: Mutex<Option<File>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                run_id: run_id.into(),
                file: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event: &str, fields: Value) -> anyhow::Result<()> {
        let mut fields = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("detail".to_string(), other);
                map
            }
        };
        for reserved in ["event", "run_id", "ts"] {
            fields.remove(reserved);
        }
        let record = EventRecord {
            event,
            run_id: &self.inner.run_id,
            ts: now_utc_iso(),
            fields,
        };
        let line = serde_json::to_string(&record)?;

        let mut guard = self
            .inner
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        if guard.is_none() {
            if let Some(parent) = self.inner.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            *guard = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.inner.path)?,
            );
        }
        if let Some(file) = guard.as_mut() {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
