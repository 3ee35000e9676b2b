use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use livecanvas_contracts::{record_event, EventWriter, Status, StatusSink};
use livecanvas_engine::{
    default_engine_registry, CommandIngestor, ControlLoop, EngineFailurePolicy, LoopExit,
    LoopSettings, ShutdownSignal, SynthesisEngine,
};
use serde_json::json;
use uuid::Uuid;

const DEFAULT_OUTPUT_IMAGE_PATH: &str = "live-canvas-generate-image-output.png";
const QUEUE_CAPACITY_MAX: usize = 4096;
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Parser)]
#[command(
    name = "livecanvas-rs",
    version,
    about = "Re-renders an image whenever JSON parameter updates arrive on stdin"
)]
struct Cli {
    #[arg(long, default_value = DEFAULT_OUTPUT_IMAGE_PATH)]
    output_image_path: PathBuf,
    #[arg(long, default_value = "dryrun")]
    engine: String,
    /// Artificial per-render delay for the dryrun engine.
    #[arg(long, default_value_t = 0)]
    dryrun_latency_ms: u64,
    #[arg(long, default_value_t = 6)]
    warmup_passes: usize,
    /// Append a JSONL session log here.
    #[arg(long)]
    events: Option<PathBuf>,
    /// skip | fatal
    #[arg(long)]
    on_engine_error: Option<EngineFailurePolicy>,
    #[arg(long)]
    queue_capacity: Option<usize>,
    #[arg(long)]
    debug: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("livecanvas-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let shutdown = ShutdownSignal::new();
    let on_signal = shutdown.clone();
    // The first SIGINT/SIGTERM stops cooperatively; a second one while a
    // render is still running exits immediately.
    ctrlc::set_handler(move || {
        if !on_signal.interrupt() {
            std::process::exit(FORCED_EXIT_CODE);
        }
    })
    .context("failed to install signal handler")?;

    run_with(
        &cli,
        BufReader::new(io::stdin()),
        StatusSink::stdout(),
        shutdown,
    )
}

/// Full session lifecycle over an arbitrary command stream and status sink.
fn run_with<R>(cli: &Cli, input: R, status: StatusSink, shutdown: ShutdownSignal) -> Result<i32>
where
    R: BufRead + Send + 'static,
{
    status.emit(&Status::Starting)?;

    let settings = loop_settings(cli, LoopSettings::from_env());
    let startup = open_session_log(cli)
        .and_then(|events| prepare_engine(cli).map(|engine| (events, engine)));
    let (events, engine) = match startup {
        Ok(ready) => ready,
        Err(err) => {
            status.emit(&Status::error(format!("{err:#}")))?;
            return Ok(1);
        }
    };
    status.emit(&Status::Started)?;
    record_event(
        events.as_ref(),
        "session_started",
        json!({
            "engine": engine.name(),
            "output": cli.output_image_path.to_string_lossy(),
            "queue_capacity": settings.queue_capacity,
        }),
    );

    let (tx, rx) = mpsc::sync_channel(settings.queue_capacity);
    let ingest = CommandIngestor::new(tx, shutdown.clone(), status.clone(), events.clone())
        .spawn(input)?;

    let mut control = ControlLoop::new(
        engine,
        &cli.output_image_path,
        rx,
        shutdown.clone(),
        status.clone(),
        settings,
    )
    .with_events(events.clone());
    let outcome = control.run();

    // A reader still blocked on stdin is left behind; process exit reaps it.
    let ingest_summary = if ingest.is_finished() {
        ingest.join().ok()
    } else {
        None
    };
    if let Some(summary) = ingest_summary {
        if cli.debug {
            eprintln!(
                "ingest finished: {} lines, {} updates, {} rejected ({:?})",
                summary.lines, summary.updates, summary.rejected, summary.stop
            );
        }
    }

    let (final_status, code) = match outcome {
        Err(err) => (Status::error(format!("{err:#}")), 1),
        Ok(_) if shutdown.was_interrupted() => (Status::Stopped, 0),
        Ok(LoopExit::ShutdownRequested | LoopExit::InputClosed) => (Status::Shutdown, 0),
    };
    record_event(
        events.as_ref(),
        "session_finished",
        json!({ "status": final_status, "exit_code": code }),
    );
    status.emit(&final_status)?;
    Ok(code)
}

/// Environment-derived settings with CLI flags taking precedence.
fn loop_settings(cli: &Cli, mut settings: LoopSettings) -> LoopSettings {
    if let Some(policy) = cli.on_engine_error {
        settings.engine_failure = policy;
    }
    if let Some(capacity) = cli.queue_capacity {
        settings.queue_capacity = capacity.clamp(1, QUEUE_CAPACITY_MAX);
    }
    settings.debug = cli.debug;
    settings
}

fn open_session_log(cli: &Cli) -> Result<Option<EventWriter>> {
    cli.events
        .as_ref()
        .map(|path| EventWriter::open(path, Uuid::new_v4().to_string()))
        .transpose()
}

fn prepare_engine(cli: &Cli) -> Result<Box<dyn SynthesisEngine>> {
    ensure_output_parent(&cli.output_image_path)?;

    let mut engines = default_engine_registry(Duration::from_millis(cli.dryrun_latency_ms));
    let available = engines.names();
    let mut engine = engines.take(&cli.engine).with_context(|| {
        format!(
            "unknown engine: {} (available: {})",
            cli.engine,
            available.join(", ")
        )
    })?;
    engine
        .warmup(cli.warmup_passes)
        .with_context(|| format!("{} warmup failed", engine.name()))?;
    Ok(engine)
}

fn ensure_output_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory {}", parent.display())),
        _ => Ok(()),
    }
}
