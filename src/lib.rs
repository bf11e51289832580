//! Resumable stage orchestration for media processing pipelines.
//!
//! A job runs an ordered list of stages (extract audio, voice detection,
//! transcription, translation, subtitles), each as an external program in
//! its own environment. Every attempt leaves a versioned manifest, so a
//! re-run skips stages whose inputs and outputs are unchanged.

pub mod cache;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fsio;
pub mod logging;
pub mod manifest;
pub mod orchestrator;
pub mod predictor;
pub mod registry;
pub mod remote;
pub mod state_machine;
pub mod ui;

pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use orchestrator::{CancellationToken, ForceRerun, JobContext, RunOptions, StageOrchestrator};
pub use state_machine::{Job, JobResult, JobStatus, StageKind, StageStatus};
