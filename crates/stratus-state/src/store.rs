//! StateStore — redb-backed persistence for runs and jobs.
//!
//! Provides typed CRUD over runs and jobs plus the two lock primitives the
//! dispatcher depends on: an atomic claim (assign a fresh lock token to
//! eligible jobs) and a conditional lock renewal (`WHERE id=? AND
//! lock_token=?` semantics). All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;
use uuid::Uuid;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(RUNS).map_err(map_err!(Table))?;
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Runs ───────────────────────────────────────────────────────

    /// Insert or update a run.
    pub fn put_run(&self, run: &Run) -> StateResult<()> {
        let key = run.table_key();
        let value = serde_json::to_vec(run).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RUNS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "run stored");
        Ok(())
    }

    /// Get a run by id.
    pub fn get_run(&self, id: RunId) -> StateResult<Option<Run>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNS).map_err(map_err!(Table))?;
        match table.get(id.to_string().as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let run: Run =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(run))
            }
            None => Ok(None),
        }
    }

    /// List all runs.
    pub fn list_runs(&self) -> StateResult<Vec<Run>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RUNS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let run: Run =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(run);
        }
        Ok(results)
    }

    /// Delete a run by id. Returns true if it existed.
    pub fn delete_run(&self, id: RunId) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(RUNS).map_err(map_err!(Table))?;
            existed = table
                .remove(id.to_string().as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, existed, "run deleted");
        Ok(existed)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert or update a job row.
    ///
    /// The lock columns are owned by `claim_jobs`/`renew_lock`/
    /// `release_lock`: when the row already exists, its persisted
    /// `lock_token`/`lock_expires_at` win over the caller's copy, so a
    /// domain write carrying a stale claim-time expiry cannot roll back
    /// a renewal that landed in between.
    pub fn put_job(&self, job: &Job) -> StateResult<()> {
        let key = job.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let stored_lock = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let stored: Job =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    Some((stored.lock_token, stored.lock_expires_at))
                }
                None => None,
            };
            let mut row = job.clone();
            if let Some((token, expires_at)) = stored_lock {
                row.lock_token = token;
                row.lock_expires_at = expires_at;
            }
            let value = serde_json::to_vec(&row).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a job by run and job id.
    pub fn get_job(&self, run_id: RunId, job_id: JobId) -> StateResult<Option<Job>> {
        let key = job_table_key(run_id, job_id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let job: Job =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// List all jobs belonging to a run.
    pub fn list_jobs_for_run(&self, run_id: RunId) -> StateResult<Vec<Job>> {
        let prefix = format!("{run_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                continue;
            }
            let job: Job =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(job);
        }
        Ok(results)
    }

    /// List every job row in the store.
    pub fn list_jobs(&self) -> StateResult<Vec<Job>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let job: Job =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(job);
        }
        Ok(results)
    }

    // ── Lock primitives ────────────────────────────────────────────

    /// Atomically claim up to `limit` eligible jobs.
    ///
    /// A job is eligible when it is not in a terminal state and its lock is
    /// absent or already expired. Each claimed job gets a fresh lock token
    /// and `lock_expires_at = now + lock_timeout`, persisted in the same
    /// write transaction, so two concurrent claimants can never both own
    /// a live lock on the same row.
    pub fn claim_jobs(&self, limit: usize, lock_timeout: Duration) -> StateResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = epoch_ms();
        let expires = now + lock_timeout.as_millis() as u64;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut claimed = Vec::new();
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;

            let mut candidates = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let job: Job =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if job.status.is_finished() {
                    continue;
                }
                if job.lock_token.is_some() && job.lock_expires_at >= now {
                    continue;
                }
                candidates.push(job);
                if candidates.len() == limit {
                    break;
                }
            }

            for mut job in candidates {
                job.lock_token = Some(Uuid::new_v4());
                job.lock_expires_at = expires;
                let value = serde_json::to_vec(&job).map_err(map_err!(Serialize))?;
                table
                    .insert(job.table_key().as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
                claimed.push(job);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "jobs claimed");
        }
        Ok(claimed)
    }

    /// Conditionally extend a job's lock.
    ///
    /// Equivalent to `UPDATE jobs SET lock_expires_at=? WHERE id=? AND
    /// lock_token=?`: returns true only if the row still carries `token`.
    pub fn renew_lock(
        &self,
        run_id: RunId,
        job_id: JobId,
        token: Uuid,
        lock_timeout: Duration,
    ) -> StateResult<bool> {
        let key = job_table_key(run_id, job_id);
        let expires = epoch_ms() + lock_timeout.as_millis() as u64;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let renewed;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let current = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let job: Job = serde_json::from_slice(guard.value())
                        .map_err(map_err!(Deserialize))?;
                    Some(job)
                }
                None => None,
            };
            match current {
                Some(mut job) if job.lock_token == Some(token) => {
                    job.lock_expires_at = expires;
                    let value = serde_json::to_vec(&job).map_err(map_err!(Serialize))?;
                    table
                        .insert(key.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    renewed = true;
                }
                _ => renewed = false,
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(renewed)
    }

    /// Release a job's lock if `token` still matches. A stale token is a
    /// silent no-op — someone else owns the row now.
    pub fn release_lock(&self, run_id: RunId, job_id: JobId, token: Uuid) -> StateResult<()> {
        let key = job_table_key(run_id, job_id);

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let current = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let job: Job = serde_json::from_slice(guard.value())
                        .map_err(map_err!(Deserialize))?;
                    Some(job)
                }
                None => None,
            };
            if let Some(mut job) = current
                && job.lock_token == Some(token)
            {
                job.lock_token = None;
                job.lock_expires_at = 0;
                let value = serde_json::to_vec(&job).map_err(map_err!(Serialize))?;
                table
                    .insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}
