//! Collaborator interfaces around a provisioned instance.
//!
//! The SSH transport, the runner RPC framing, and the log storage format
//! all live out of tree; the orchestrator only needs these contracts.

use std::sync::Arc;

use stratus_offers::BoxFuture;
use stratus_state::{JobId, JobStatus, RunId};

/// What the remote runner needs to know to execute a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub run_name: String,
    pub job_id: JobId,
    pub replica_num: u32,
    pub submission_num: u32,
}

/// One log line pulled from the runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub timestamp_ms: u64,
    pub message: Vec<u8>,
}

/// Everything the runner reported since the last pull.
#[derive(Debug, Clone, Default)]
pub struct PullResponse {
    /// Job state transitions, oldest first.
    pub job_states: Vec<JobStatus>,
    pub runner_logs: Vec<LogChunk>,
    pub job_logs: Vec<LogChunk>,
    /// High-water mark to pass as `since_ms` on the next pull.
    pub last_updated_ms: u64,
}

/// The five operations the orchestrator needs from a connected runner.
pub trait RunnerClient: Send + Sync {
    fn healthcheck(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    fn submit<'a>(&'a self, spec: &'a JobSpec) -> BoxFuture<'a, anyhow::Result<()>>;

    fn upload_code<'a>(&'a self, code: &'a [u8]) -> BoxFuture<'a, anyhow::Result<()>>;

    fn run(&self) -> BoxFuture<'_, anyhow::Result<()>>;

    fn pull(&self, since_ms: u64) -> BoxFuture<'_, anyhow::Result<PullResponse>>;
}

/// Opens (or reuses) the SSH tunnel to an instance's runner.
pub trait RunnerConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        hostname: &'a str,
        ssh_port: u16,
    ) -> BoxFuture<'a, anyhow::Result<Arc<dyn RunnerClient>>>;
}

/// Fetches the code artifact uploaded alongside a job submission.
pub trait CodeSource: Send + Sync {
    fn fetch(&self, run_id: RunId) -> BoxFuture<'_, anyhow::Result<Vec<u8>>>;
}

/// Append-only sink for pulled runner/job logs.
pub trait LogSink: Send + Sync {
    fn write_logs<'a>(
        &'a self,
        run_id: RunId,
        job_id: JobId,
        runner_logs: &'a [LogChunk],
        job_logs: &'a [LogChunk],
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}
