use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Result};
use image::{Rgb, RgbImage};
use serde_json::Value;

use crate::synthesis::{RenderRequest, SynthesisEngine};

/// In-memory status output that tests can inspect after the fact.
#[derive(Clone, Default)]
pub(crate) struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub(crate) fn lines(&self) -> Vec<Value> {
        let raw = String::from_utf8(self.0.lock().unwrap().clone()).unwrap();
        raw.lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    pub(crate) fn statuses(&self) -> Vec<String> {
        self.lines()
            .iter()
            .filter_map(|row| row.get("status").and_then(Value::as_str).map(str::to_string))
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Counts calls and records every request it was asked to render.
#[derive(Clone, Default)]
pub(crate) struct StubEngine {
    pub(crate) calls: Arc<AtomicUsize>,
    pub(crate) seen: Arc<Mutex<Vec<RenderRequest>>>,
    pub(crate) fail: bool,
    pub(crate) latency: Duration,
}

impl StubEngine {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub(crate) fn slow(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_request(&self) -> Option<RenderRequest> {
        self.seen.lock().unwrap().last().cloned()
    }
}

impl SynthesisEngine for StubEngine {
    fn name(&self) -> &str {
        "stub"
    }

    fn render(&mut self, request: &RenderRequest) -> Result<RgbImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(request.clone());
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if self.fail {
            bail!("stub engine out of memory");
        }
        Ok(RgbImage::from_pixel(
            request.width,
            request.height,
            Rgb([(request.seed % 256) as u8, 0, 0]),
        ))
    }
}
