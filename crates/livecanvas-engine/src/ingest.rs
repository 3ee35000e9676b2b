use std::io::BufRead;
use std::sync::mpsc::{SyncSender, TrySendError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use livecanvas_contracts::{
    decode_command_bytes, record_event, Command, EventWriter, ParameterUpdate, Status,
    StatusSink,
};
use serde_json::json;

use crate::shutdown::ShutdownSignal;

const QUEUE_FULL_POLL: Duration = Duration::from_millis(5);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IngestStop {
    EndOfInput,
    ShutdownCommand,
    ShutdownSignaled,
    QueueClosed,
    ReadError,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IngestSummary {
    pub lines: usize,
    pub updates: usize,
    pub rejected: usize,
    pub stop: IngestStop,
}

/// Reads line-delimited JSON commands and hands parameter updates to the
/// control loop. The only component that touches the input stream.
pub struct CommandIngestor {
    queue: SyncSender<ParameterUpdate>,
    shutdown: ShutdownSignal,
    status: StatusSink,
    events: Option<EventWriter>,
}

impl CommandIngestor {
    pub fn new(
        queue: SyncSender<ParameterUpdate>,
        shutdown: ShutdownSignal,
        status: StatusSink,
        events: Option<EventWriter>,
    ) -> Self {
        Self {
            queue,
            shutdown,
            status,
            events,
        }
    }

    pub fn spawn<R>(self, reader: R) -> Result<thread::JoinHandle<IngestSummary>>
    where
        R: BufRead + Send + 'static,
    {
        thread::Builder::new()
            .name("livecanvas-ingest".to_string())
            .spawn(move || self.run(reader))
            .context("failed to spawn command ingest thread")
    }

    /// Consumes `self` so the queue sender is dropped when reading stops,
    /// letting the control loop see the disconnect.
    pub fn run<R: BufRead>(self, mut reader: R) -> IngestSummary {
        let mut lines = 0;
        let mut updates = 0;
        let mut rejected = 0;
        let mut buf = Vec::new();

        let stop = loop {
            if self.shutdown.is_triggered() {
                break IngestStop::ShutdownSignaled;
            }
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break IngestStop::EndOfInput,
                Ok(_) => {}
                Err(err) => {
                    eprintln!("command input read failed: {err}");
                    break IngestStop::ReadError;
                }
            }
            lines += 1;

            match decode_command_bytes(&buf) {
                Ok(None) => {}
                Ok(Some(Command::Shutdown)) => {
                    self.shutdown.trigger();
                    break IngestStop::ShutdownCommand;
                }
                Ok(Some(Command::ParameterUpdate(update))) => match self.enqueue(update) {
                    Ok(()) => updates += 1,
                    Err(stop) => break stop,
                },
                Err(err) => {
                    rejected += 1;
                    self.report_rejected(&String::from_utf8_lossy(&buf), &err.to_string());
                }
            }
        };

        IngestSummary {
            lines,
            updates,
            rejected,
            stop,
        }
    }

    fn enqueue(&self, update: ParameterUpdate) -> Result<(), IngestStop> {
        let mut pending = update;
        loop {
            match self.queue.try_send(pending) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(returned)) => {
                    if self.shutdown.is_triggered() {
                        return Err(IngestStop::ShutdownSignaled);
                    }
                    pending = returned;
                    thread::sleep(QUEUE_FULL_POLL);
                }
                Err(TrySendError::Disconnected(_)) => return Err(IngestStop::QueueClosed),
            }
        }
    }

    fn report_rejected(&self, line: &str, error: &str) {
        let status = Status::error(format!("Error decoding JSON: {error}"));
        if let Err(err) = self.status.emit(&status) {
            eprintln!("failed to report rejected command: {err:#}");
        }
        record_event(
            self.events.as_ref(),
            "command_rejected",
            json!({
                "error": error,
                "line": line.trim_end(),
            }),
        );
    }
}
