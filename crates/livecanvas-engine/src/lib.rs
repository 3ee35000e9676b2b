//! Live re-render loop: stdin commands in, atomically published frames out.
//!
//! The [`CommandIngestor`] reads controller lines on its own thread and feeds
//! a bounded queue. The [`ControlLoop`] owns all parameter state, drains the
//! queue, and re-renders through a [`SynthesisEngine`] only when parameters
//! actually change. Frames reach disk through [`OutputWriter`], which never
//! exposes a partial file. Both sides stop cooperatively on a shared
//! [`ShutdownSignal`].

pub mod config;
pub mod control;
pub mod ingest;
pub mod publish;
pub mod shutdown;
pub mod synthesis;
pub mod tracker;

#[cfg(test)]
mod testing;

pub use config::{EngineFailurePolicy, IdleBackoffSettings, LoopSettings};
pub use control::{ControlLoop, IdleBackoff, LoopExit, Tick, TickAction};
pub use ingest::{CommandIngestor, IngestStop, IngestSummary};
pub use publish::{blank_canvas, OutputWriter, PublishReport, RetryPolicy};
pub use shutdown::ShutdownSignal;
pub use synthesis::{
    default_engine_registry, render_seed, DryrunEngine, EngineRegistry, RenderRequest,
    SynthesisEngine,
};
pub use tracker::TriggerState;
