use std::path::PathBuf;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use image::RgbImage;
use livecanvas_contracts::{
    record_event, EventWriter, GenerationRequest, ParameterUpdate, Status, StatusSink,
};
use serde_json::json;

use crate::config::{EngineFailurePolicy, IdleBackoffSettings, LoopSettings};
use crate::publish::{blank_canvas, OutputWriter};
use crate::shutdown::ShutdownSignal;
use crate::synthesis::{RenderRequest, SynthesisEngine};
use crate::tracker::TriggerState;

/// Why `ControlLoop::run` returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoopExit {
    /// The shutdown signal was set.
    ShutdownRequested,
    /// The ingestor went away and every queued update has been handled.
    InputClosed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TickAction {
    Clean,
    Rendered { published: bool },
    Placeholder { published: bool },
    RenderFailed,
    ShutdownObserved,
    InputClosed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tick {
    pub drained: usize,
    pub action: TickAction,
}

#[derive(Debug, Default)]
struct Drain {
    applied: usize,
    shutdown: bool,
    disconnected: bool,
}

/// Sleep between idle iterations, doubling from `min` up to `max`.
#[derive(Debug, Clone)]
pub struct IdleBackoff {
    settings: IdleBackoffSettings,
    current: Duration,
}

impl IdleBackoff {
    pub fn new(settings: IdleBackoffSettings) -> Self {
        Self {
            current: settings.min,
            settings,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn wait(&mut self) {
        if !self.current.is_zero() {
            thread::sleep(self.current);
        }
        self.advance();
    }

    pub fn reset(&mut self) {
        self.current = self.settings.min;
    }

    fn advance(&mut self) {
        let next = if self.current.is_zero() {
            Duration::from_millis(1)
        } else {
            self.current.saturating_mul(2)
        };
        self.current = next.min(self.settings.max);
    }
}

/// Drains parameter updates, decides whether a render is due, and publishes
/// the result. Sole owner of the parameter state.
pub struct ControlLoop<E> {
    engine: E,
    writer: OutputWriter,
    queue: Receiver<ParameterUpdate>,
    shutdown: ShutdownSignal,
    status: StatusSink,
    events: Option<EventWriter>,
    settings: LoopSettings,
    state: TriggerState,
}

impl<E: SynthesisEngine> ControlLoop<E> {
    pub fn new(
        engine: E,
        output_path: impl Into<PathBuf>,
        queue: Receiver<ParameterUpdate>,
        shutdown: ShutdownSignal,
        status: StatusSink,
        settings: LoopSettings,
    ) -> Self {
        Self {
            engine,
            writer: OutputWriter::new(output_path, settings.publish_retry),
            queue,
            shutdown,
            status,
            events: None,
            settings,
            state: TriggerState::default(),
        }
    }

    pub fn with_events(mut self, events: Option<EventWriter>) -> Self {
        self.events = events;
        self
    }

    pub fn with_initial_request(mut self, request: GenerationRequest) -> Self {
        self.state = TriggerState::new(request);
        self
    }

    pub fn state(&self) -> &TriggerState {
        &self.state
    }

    pub fn writer(&self) -> &OutputWriter {
        &self.writer
    }

    /// Runs until shutdown is signalled or the input side is gone. Only a
    /// fatal engine failure (per `EngineFailurePolicy::Fatal`) is an error;
    /// the shutdown signal is set before it is returned.
    pub fn run(&mut self) -> Result<LoopExit> {
        let mut backoff = IdleBackoff::new(self.settings.idle_backoff);
        loop {
            if self.shutdown.is_triggered() {
                return Ok(LoopExit::ShutdownRequested);
            }
            let tick = match self.tick() {
                Ok(tick) => tick,
                Err(err) => {
                    self.shutdown.trigger();
                    return Err(err);
                }
            };
            match tick.action {
                TickAction::ShutdownObserved => return Ok(LoopExit::ShutdownRequested),
                TickAction::InputClosed => return Ok(LoopExit::InputClosed),
                TickAction::Clean if tick.drained == 0 => backoff.wait(),
                _ => backoff.reset(),
            }
        }
    }

    /// One iteration: drain, dirty check, and at most one render + publish.
    pub fn tick(&mut self) -> Result<Tick> {
        let drain = self.drain();
        let drained = drain.applied;
        if drain.shutdown {
            return Ok(Tick {
                drained,
                action: TickAction::ShutdownObserved,
            });
        }
        if !self.state.is_dirty() {
            let action = if drain.disconnected {
                TickAction::InputClosed
            } else {
                TickAction::Clean
            };
            return Ok(Tick { drained, action });
        }

        let request = self.state.mark_triggered();
        record_event(
            self.events.as_ref(),
            "render_triggered",
            json!({ "request": request }),
        );
        let action = if request.has_prompt() {
            self.render_and_publish(&request)?
        } else {
            let canvas = blank_canvas(request.width, request.height);
            TickAction::Placeholder {
                published: self.publish(&canvas, true),
            }
        };
        Ok(Tick { drained, action })
    }

    fn drain(&mut self) -> Drain {
        let mut drain = Drain::default();
        loop {
            if self.shutdown.is_triggered() {
                drain.shutdown = true;
                break;
            }
            match self.queue.try_recv() {
                Ok(update) => {
                    if self.settings.debug {
                        eprintln!(
                            "Updated parameters {}",
                            serde_json::to_string(&update).unwrap_or_default()
                        );
                    }
                    self.state.apply(&update);
                    drain.applied += 1;
                    record_event(
                        self.events.as_ref(),
                        "parameters_updated",
                        json!({ "update": update }),
                    );
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    drain.disconnected = true;
                    break;
                }
            }
        }
        drain
    }

    fn render_and_publish(&mut self, request: &GenerationRequest) -> Result<TickAction> {
        let render = RenderRequest::from_generation(request);
        let frame = match self.engine.render(&render) {
            Ok(frame) => frame,
            Err(err) => {
                record_event(
                    self.events.as_ref(),
                    "render_failed",
                    json!({
                        "engine": self.engine.name(),
                        "error": format!("{err:#}"),
                    }),
                );
                return match self.settings.engine_failure {
                    EngineFailurePolicy::Skip => {
                        eprintln!(
                            "{} render failed, keeping previous output: {err:#}",
                            self.engine.name()
                        );
                        Ok(TickAction::RenderFailed)
                    }
                    EngineFailurePolicy::Fatal => {
                        Err(err.context(format!("{} render failed", self.engine.name())))
                    }
                };
            }
        };

        let published = self.publish(&frame, false);
        if published {
            if let Err(err) = self.status.emit(&Status::ImageGenerated) {
                eprintln!("failed to report image_generated: {err:#}");
            }
        }
        Ok(TickAction::Rendered { published })
    }

    /// Never fails the loop; a missed publish is retried on the next change.
    fn publish(&self, frame: &RgbImage, placeholder: bool) -> bool {
        match self.writer.publish(frame) {
            Ok(report) if report.published => {
                record_event(
                    self.events.as_ref(),
                    "artifact_published",
                    json!({
                        "path": report.final_path.to_string_lossy(),
                        "attempts": report.attempts,
                        "bytes": report.bytes,
                        "sha256": report.sha256,
                        "placeholder": placeholder,
                    }),
                );
                true
            }
            Ok(report) => {
                let error = report.error.unwrap_or_default();
                eprintln!(
                    "Failed to rename {} to {} after {} attempts. Error: {error}",
                    report.temp_path.display(),
                    report.final_path.display(),
                    report.attempts,
                );
                record_event(
                    self.events.as_ref(),
                    "publish_failed",
                    json!({
                        "path": report.final_path.to_string_lossy(),
                        "attempts": report.attempts,
                        "error": error,
                    }),
                );
                false
            }
            Err(err) => {
                eprintln!("failed to publish frame: {err:#}");
                record_event(
                    self.events.as_ref(),
                    "publish_failed",
                    json!({
                        "path": self.writer.final_path().to_string_lossy(),
                        "error": format!("{err:#}"),
                    }),
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;
    use std::path::{Path, PathBuf};
    use std::sync::mpsc::{self, SyncSender};
    use std::thread;
    use std::time::Duration;

    use image::{GenericImageView, Rgb};
    use livecanvas_contracts::{decode_command, Command, EventWriter, ParameterUpdate, StatusSink};
    use serde_json::Value;

    use super::{ControlLoop, IdleBackoff, LoopExit, TickAction};
    use crate::config::{EngineFailurePolicy, IdleBackoffSettings, LoopSettings};
    use crate::ingest::{CommandIngestor, IngestStop};
    use crate::publish::RetryPolicy;
    use crate::shutdown::ShutdownSignal;
    use crate::testing::{SharedBuffer, StubEngine};

    struct Harness {
        _temp: tempfile::TempDir,
        output: PathBuf,
        tx: SyncSender<ParameterUpdate>,
        shutdown: ShutdownSignal,
        status: SharedBuffer,
        engine: StubEngine,
        control: ControlLoop<StubEngine>,
    }

    fn settings() -> LoopSettings {
        LoopSettings {
            publish_retry: RetryPolicy {
                attempts: 3,
                delay: Duration::from_millis(1),
            },
            idle_backoff: IdleBackoffSettings {
                min: Duration::from_millis(1),
                max: Duration::from_millis(2),
            },
            ..LoopSettings::default()
        }
    }

    fn harness_with(engine: StubEngine, settings: LoopSettings) -> anyhow::Result<Harness> {
        let temp = tempfile::tempdir()?;
        let output = temp.path().join("canvas.png");
        let (tx, rx) = mpsc::sync_channel(16);
        let shutdown = ShutdownSignal::new();
        let status = SharedBuffer::default();
        let control = ControlLoop::new(
            engine.clone(),
            &output,
            rx,
            shutdown.clone(),
            StatusSink::new(status.clone()),
            settings,
        );
        Ok(Harness {
            _temp: temp,
            output,
            tx,
            shutdown,
            status,
            engine,
            control,
        })
    }

    fn harness() -> anyhow::Result<Harness> {
        harness_with(StubEngine::default(), settings())
    }

    fn prompt(text: &str) -> ParameterUpdate {
        ParameterUpdate {
            prompt: Some(text.to_string()),
            ..ParameterUpdate::default()
        }
    }

    fn small(update: ParameterUpdate) -> ParameterUpdate {
        ParameterUpdate {
            width: Some(24),
            height: Some(16),
            ..update
        }
    }

    fn read_dims(path: &Path) -> anyhow::Result<(u32, u32)> {
        Ok(image::open(path)?.dimensions())
    }

    #[test]
    fn defaults_do_not_render_until_changed() -> anyhow::Result<()> {
        let mut h = harness()?;
        let tick = h.control.tick()?;
        assert_eq!(tick.action, TickAction::Clean);
        assert_eq!(tick.drained, 0);
        assert_eq!(h.engine.call_count(), 0);
        assert!(!h.output.exists());
        Ok(())
    }

    #[test]
    fn identical_update_twice_renders_once() -> anyhow::Result<()> {
        let mut h = harness()?;
        let update = small(prompt("a paper boat"));

        h.tx.send(update.clone())?;
        let first = h.control.tick()?;
        assert_eq!(first.action, TickAction::Rendered { published: true });

        h.tx.send(update)?;
        let second = h.control.tick()?;
        assert_eq!(second.drained, 1);
        assert_eq!(second.action, TickAction::Clean);

        assert_eq!(h.engine.call_count(), 1);
        assert_eq!(h.status.statuses(), vec!["image_generated".to_string()]);
        Ok(())
    }

    #[test]
    fn queued_updates_coalesce_into_one_render() -> anyhow::Result<()> {
        let mut h = harness()?;
        h.tx.send(small(prompt("first")))?;
        h.tx.send(ParameterUpdate {
            seed: Some(77),
            ..ParameterUpdate::default()
        })?;
        h.tx.send(prompt("third"))?;
        h.tx.send(ParameterUpdate {
            guidance_scale: Some(1.5),
            steps: Some(4),
            ..ParameterUpdate::default()
        })?;

        let tick = h.control.tick()?;
        assert_eq!(tick.drained, 4);
        assert_eq!(tick.action, TickAction::Rendered { published: true });
        assert_eq!(h.engine.call_count(), 1);

        let rendered = h.engine.last_request().expect("render recorded");
        assert_eq!(rendered.prompt, "third");
        assert_eq!(rendered.seed, 77);
        assert_eq!(rendered.steps, 4);
        assert_eq!(rendered.guidance_scale, 1.5);
        assert_eq!((rendered.width, rendered.height), (24, 16));
        assert_eq!(rendered.negative_prompt, "nsfw, nude");
        Ok(())
    }

    #[test]
    fn empty_prompt_publishes_blank_placeholder() -> anyhow::Result<()> {
        let mut h = harness()?;
        h.tx.send(ParameterUpdate {
            prompt: Some("   ".to_string()),
            width: Some(40),
            height: Some(30),
            ..ParameterUpdate::default()
        })?;

        let tick = h.control.tick()?;
        assert_eq!(tick.action, TickAction::Placeholder { published: true });
        assert_eq!(h.engine.call_count(), 0);
        assert!(h.status.statuses().is_empty());

        let canvas = image::open(&h.output)?.to_rgb8();
        assert_eq!(canvas.dimensions(), (40, 30));
        assert!(canvas.pixels().all(|pixel| *pixel == Rgb([255, 255, 255])));
        assert!(!h.control.state().is_dirty());
        Ok(())
    }

    #[test]
    fn null_prompt_publishes_blank_placeholder() -> anyhow::Result<()> {
        let mut h = harness()?;
        let decoded = decode_command(r#"{"prompt": null, "width": 12, "height": 10}"#)?;
        let Some(Command::ParameterUpdate(update)) = decoded else {
            panic!("expected a parameter update, got {decoded:?}");
        };
        h.tx.send(update)?;

        let tick = h.control.tick()?;
        assert_eq!(tick.action, TickAction::Placeholder { published: true });
        assert_eq!(h.engine.call_count(), 0);
        assert_eq!(read_dims(&h.output)?, (12, 10));
        Ok(())
    }

    #[test]
    fn same_full_parameter_set_does_not_retrigger() -> anyhow::Result<()> {
        let mut h = harness()?;
        let full = ParameterUpdate {
            prompt: Some("lantern festival".to_string()),
            negative_prompt: Some("blurry".to_string()),
            seed: Some(1234),
            steps: Some(8),
            guidance_scale: Some(3.25),
            height: Some(16),
            width: Some(16),
        };

        h.tx.send(full.clone())?;
        h.control.tick()?;
        let after_first = h.control.state().last_triggered().clone();
        h.tx.send(full)?;
        let tick = h.control.tick()?;

        assert_eq!(tick.action, TickAction::Clean);
        assert!(!h.control.state().is_dirty());
        assert_eq!(h.control.state().last_triggered(), &after_first);
        assert_eq!(h.engine.call_count(), 1);
        Ok(())
    }

    #[test]
    fn shutdown_before_drain_skips_rendering() -> anyhow::Result<()> {
        let mut h = harness()?;
        h.tx.send(small(prompt("never drawn")))?;
        h.shutdown.trigger();

        let tick = h.control.tick()?;
        assert_eq!(tick.action, TickAction::ShutdownObserved);
        assert_eq!(tick.drained, 0);
        assert_eq!(h.control.run()?, LoopExit::ShutdownRequested);
        assert_eq!(h.engine.call_count(), 0);
        Ok(())
    }

    #[test]
    fn skip_policy_keeps_previous_output_and_waits_for_change() -> anyhow::Result<()> {
        let mut h = harness_with(StubEngine::failing(), settings())?;
        h.tx.send(small(prompt("doomed")))?;

        let tick = h.control.tick()?;
        assert_eq!(tick.action, TickAction::RenderFailed);
        assert!(!h.control.state().is_dirty());
        assert!(!h.output.exists());
        assert!(h.status.statuses().is_empty());

        assert_eq!(h.control.tick()?.action, TickAction::Clean);
        h.tx.send(prompt("doomed again"))?;
        assert_eq!(h.control.tick()?.action, TickAction::RenderFailed);
        assert_eq!(h.engine.call_count(), 2);
        Ok(())
    }

    #[test]
    fn fatal_policy_stops_the_loop() -> anyhow::Result<()> {
        let settings = LoopSettings {
            engine_failure: EngineFailurePolicy::Fatal,
            ..settings()
        };
        let mut h = harness_with(StubEngine::failing(), settings)?;
        h.tx.send(small(prompt("doomed")))?;

        let err = h.control.run().unwrap_err();
        assert!(format!("{err:#}").contains("stub render failed"));
        assert!(h.shutdown.is_triggered());
        Ok(())
    }

    #[test]
    fn failed_publish_is_not_fatal() -> anyhow::Result<()> {
        let mut h = harness()?;
        fs::create_dir(&h.output)?;
        fs::write(h.output.join("lock"), b"held")?;
        h.tx.send(small(prompt("blocked")))?;

        let tick = h.control.tick()?;
        assert_eq!(tick.action, TickAction::Rendered { published: false });
        assert!(h.status.statuses().is_empty());
        assert!(h.control.writer().temp_path().exists());

        fs::remove_dir_all(&h.output)?;
        h.tx.send(prompt("unblocked"))?;
        let tick = h.control.tick()?;
        assert_eq!(tick.action, TickAction::Rendered { published: true });
        assert_eq!(read_dims(&h.output)?, (24, 16));
        Ok(())
    }

    #[test]
    fn input_close_finishes_queued_work_first() -> anyhow::Result<()> {
        let mut h = harness()?;
        h.tx.send(small(prompt("last words")))?;
        drop(h.tx);

        assert_eq!(h.control.run()?, LoopExit::InputClosed);
        assert_eq!(h.engine.call_count(), 1);
        assert_eq!(read_dims(&h.output)?, (24, 16));
        Ok(())
    }

    #[test]
    fn shutdown_during_render_lets_publish_complete() -> anyhow::Result<()> {
        let mut h = harness_with(StubEngine::slow(Duration::from_millis(80)), settings())?;
        h.tx.send(small(prompt("slow brush")))?;

        let remote = h.shutdown.clone();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.trigger();
        });

        assert_eq!(h.control.run()?, LoopExit::ShutdownRequested);
        trigger.join().expect("trigger thread panicked");
        assert_eq!(h.engine.call_count(), 1);
        assert_eq!(read_dims(&h.output)?, (24, 16));
        assert_eq!(h.status.statuses(), vec!["image_generated".to_string()]);
        Ok(())
    }

    #[test]
    fn malformed_input_does_not_block_later_commands() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let output = temp.path().join("canvas.png");
        let events_path = temp.path().join("events.jsonl");
        let events = EventWriter::open(&events_path, "session-test")?;
        let (tx, rx) = mpsc::sync_channel(4);
        let shutdown = ShutdownSignal::new();
        let status = SharedBuffer::default();
        let engine = StubEngine::default();

        let input = "{oops\n{\"prompt\": \"recovered\", \"width\": 8, \"height\": 8}\n";
        let ingest = CommandIngestor::new(
            tx,
            shutdown.clone(),
            StatusSink::new(status.clone()),
            Some(events.clone()),
        )
        .spawn(Cursor::new(input))?;

        let mut control = ControlLoop::new(
            engine.clone(),
            &output,
            rx,
            shutdown,
            StatusSink::new(status.clone()),
            settings(),
        )
        .with_events(Some(events));
        assert_eq!(control.run()?, LoopExit::InputClosed);

        let summary = ingest.join().expect("ingest thread panicked");
        assert_eq!(summary.stop, IngestStop::EndOfInput);
        assert_eq!(summary.rejected, 1);
        assert_eq!(
            engine.last_request().map(|request| request.prompt),
            Some("recovered".to_string())
        );
        assert_eq!(
            status.statuses(),
            vec!["error".to_string(), "image_generated".to_string()]
        );

        let raw = fs::read_to_string(&events_path)?;
        let types: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert!(types.contains(&"command_rejected".to_string()));
        assert!(types.contains(&"parameters_updated".to_string()));
        assert!(types.contains(&"render_triggered".to_string()));
        assert!(types.contains(&"artifact_published".to_string()));
        Ok(())
    }

    #[test]
    fn idle_backoff_doubles_then_resets() {
        let mut backoff = IdleBackoff::new(IdleBackoffSettings {
            min: Duration::ZERO,
            max: Duration::from_millis(4),
        });
        backoff.wait();
        assert_eq!(backoff.current(), Duration::from_millis(1));
        backoff.wait();
        backoff.wait();
        assert_eq!(backoff.current(), Duration::from_millis(4));
        backoff.wait();
        assert_eq!(backoff.current(), Duration::from_millis(4));
        backoff.reset();
        assert_eq!(backoff.current(), Duration::ZERO);
    }
}
