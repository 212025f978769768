//! stratus-orchestrator — the job lifecycle state machine.
//!
//! `JobProcessor` advances locked job rows through provisioning, runner
//! handoff, health polling, and teardown. It talks to clouds through
//! `stratus_offers::ComputeBackend` and to provisioned instances through
//! the `runner` collaborator traits; both are injected, so the whole
//! machine is testable with in-process mocks.

pub mod error;
pub mod processor;
pub mod runner;

pub use error::{ProcessError, ProcessResult};
pub use processor::{JobProcessor, ProcessorConfig};
pub use runner::{CodeSource, JobSpec, LogChunk, LogSink, PullResponse, RunnerClient, RunnerConnector};
