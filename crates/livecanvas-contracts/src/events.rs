use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Controller-facing lifecycle and result events, one per stdout line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Status {
    Starting,
    Started,
    ImageGenerated,
    Error { message: String },
    Shutdown,
    Stopped,
}

impl Status {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Line-oriented status writer shared by the ingestor and the control loop.
#[derive(Clone)]
pub struct StatusSink {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl std::fmt::Debug for StatusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusSink").finish_non_exhaustive()
    }
}

impl StatusSink {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Arc::new(Mutex::new(Box::new(out))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }

    pub fn emit(&self, status: &Status) -> anyhow::Result<()> {
        let line = serde_json::to_string(status)?;
        let mut out = self
            .out
            .lock()
            .map_err(|_| anyhow::anyhow!("status sink lock poisoned"))?;
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }
}

/// JSONL session log shared by every component of one process.
///
/// The file is opened once in append mode. Each record carries `type`,
/// `session_id`, a per-session `seq` and an RFC 3339 `ts`; those keys are
/// owned by the log and win over payload keys of the same name.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<SessionLog>,
}

#[derive(Debug)]
struct SessionLog {
    path: PathBuf,
    session_id: String,
    file: Mutex<LogFile>,
}

#[derive(Debug)]
struct LogFile {
    handle: File,
    next_seq: u64,
}

impl EventWriter {
    pub fn open(path: impl Into<PathBuf>, session_id: impl Into<String>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open session log {}", path.display()))?;
        Ok(Self {
            inner: Arc::new(SessionLog {
                path,
                session_id: session_id.into(),
                file: Mutex::new(LogFile {
                    handle,
                    next_seq: 0,
                }),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Appends one record. Object payloads are merged into the record, any
    /// other value is stored under `data`.
    pub fn record(&self, event_type: &str, payload: Value) -> anyhow::Result<Value> {
        let mut event = match payload {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            other => Map::from_iter([("data".to_string(), other)]),
        };

        let mut file = self
            .inner
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("session log lock poisoned"))?;
        event.insert("type".to_string(), Value::from(event_type));
        event.insert(
            "session_id".to_string(),
            Value::from(self.inner.session_id.as_str()),
        );
        event.insert("seq".to_string(), Value::from(file.next_seq));
        event.insert(
            "ts".to_string(),
            Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        file.handle.write_all(&line)?;
        file.next_seq += 1;
        Ok(Value::Object(event))
    }
}

/// Records an event when a session log is configured. Log failures go to
/// stderr and never interrupt the caller.
pub fn record_event(events: Option<&EventWriter>, event_type: &str, payload: Value) {
    let Some(events) = events else {
        return;
    };
    if let Err(err) = events.record(event_type, payload) {
        eprintln!(
            "failed to record {event_type} in {}: {err:#}",
            events.path().display()
        );
    }
}
