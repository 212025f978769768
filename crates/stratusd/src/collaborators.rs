//! Filesystem-backed collaborator implementations.
//!
//! Cloud backends and the SSH runner transport are registered by
//! deployments out of tree; what the daemon can provide on its own is a
//! code artifact source and a log sink rooted in the data directory.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use stratus_offers::BoxFuture;
use stratus_orchestrator::{CodeSource, LogChunk, LogSink, RunnerClient, RunnerConnector};

/// Reads code artifacts from `{root}/code/{run_id}.tar`.
pub struct FsCodeSource {
    root: PathBuf,
}

impl FsCodeSource {
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            root: data_dir.join("code"),
        }
    }
}

impl CodeSource for FsCodeSource {
    fn fetch(&self, run_id: Uuid) -> BoxFuture<'_, anyhow::Result<Vec<u8>>> {
        Box::pin(async move {
            let path = self.root.join(format!("{run_id}.tar"));
            let bytes = tokio::fs::read(&path).await?;
            debug!(path = %path.display(), size = bytes.len(), "code artifact read");
            Ok(bytes)
        })
    }
}

#[derive(Serialize)]
struct LogRecord<'a> {
    timestamp_ms: u64,
    stream: &'static str,
    message: &'a str,
}

/// Appends pulled logs as JSON lines under `{root}/logs/{run_id}/{job_id}.jsonl`.
pub struct JsonlLogSink {
    root: PathBuf,
}

impl JsonlLogSink {
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            root: data_dir.join("logs"),
        }
    }

    fn render(stream: &'static str, chunks: &[LogChunk], out: &mut Vec<u8>) -> anyhow::Result<()> {
        for chunk in chunks {
            let message = String::from_utf8_lossy(&chunk.message);
            let record = LogRecord {
                timestamp_ms: chunk.timestamp_ms,
                stream,
                message: &message,
            };
            serde_json::to_writer(&mut *out, &record)?;
            out.push(b'\n');
        }
        Ok(())
    }
}

impl LogSink for JsonlLogSink {
    fn write_logs<'a>(
        &'a self,
        run_id: Uuid,
        job_id: Uuid,
        runner_logs: &'a [LogChunk],
        job_logs: &'a [LogChunk],
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let dir = self.root.join(run_id.to_string());
            tokio::fs::create_dir_all(&dir).await?;

            let mut buf = Vec::new();
            Self::render("runner", runner_logs, &mut buf)?;
            Self::render("job", job_logs, &mut buf)?;
            if buf.is_empty() {
                return Ok(());
            }

            let path = dir.join(format!("{job_id}.jsonl"));
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(&buf).await?;
            // Dropping a tokio File may discard buffered writes.
            file.flush().await?;
            Ok(())
        })
    }
}

/// Placeholder connector for deployments that have not registered a
/// runner transport. With no cloud backends registered nothing ever
/// provisions, so this is never reached; if a backend is added without
/// a transport, polling fails loudly instead of hanging.
pub struct UnconfiguredConnector;

impl RunnerConnector for UnconfiguredConnector {
    fn connect<'a>(
        &'a self,
        hostname: &'a str,
        ssh_port: u16,
    ) -> BoxFuture<'a, anyhow::Result<Arc<dyn RunnerClient>>> {
        Box::pin(async move {
            anyhow::bail!("no runner transport configured (cannot reach {hostname}:{ssh_port})")
        })
    }
}
