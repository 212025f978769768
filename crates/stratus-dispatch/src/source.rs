//! Work item and work source abstractions.
//!
//! A `WorkSource` is the storage-side half of a pipeline: it hands out
//! lock-claimed items and renews or releases their locks with conditional
//! updates. The dispatcher is generic over the source, so jobs, volumes,
//! or probes can each run their own pipeline over the same machinery.

use std::time::Duration;

use uuid::Uuid;

use stratus_state::{Job, StateStore};

/// A lockable, persisted work item.
pub trait WorkItem: Clone + Send + Sync + 'static {
    /// Stable identity of this item.
    fn item_id(&self) -> Uuid;

    /// The lock token this claimant holds, if any.
    fn lock_token(&self) -> Option<Uuid>;

    /// Epoch ms after which the lock is no longer valid.
    fn lock_expires_at(&self) -> u64;

    /// Record a successfully renewed expiry in the in-memory copy.
    fn set_lock_expires_at(&mut self, at: u64);
}

/// Storage adapter for one pipeline's work items.
///
/// All methods map to row-level conditional updates in the backing store;
/// `renew` returns whether the update affected a row (i.e. whether the
/// token still matched).
pub trait WorkSource: Send + Sync + 'static {
    type Item: WorkItem;

    /// Atomically claim up to `limit` eligible items, assigning each a
    /// fresh lock valid for `lock_timeout`.
    fn claim(&self, limit: usize, lock_timeout: Duration) -> anyhow::Result<Vec<Self::Item>>;

    /// Conditionally extend an item's lock. False means someone else's
    /// token is on the row now.
    fn renew(&self, item: &Self::Item, lock_timeout: Duration) -> anyhow::Result<bool>;

    /// Release an item's lock (no-op if the token is stale).
    fn release(&self, item: &Self::Item) -> anyhow::Result<()>;
}

impl WorkItem for Job {
    fn item_id(&self) -> Uuid {
        self.id
    }

    fn lock_token(&self) -> Option<Uuid> {
        self.lock_token
    }

    fn lock_expires_at(&self) -> u64 {
        self.lock_expires_at
    }

    fn set_lock_expires_at(&mut self, at: u64) {
        self.lock_expires_at = at;
    }
}

/// The job pipeline's work source: claims job rows from the state store.
#[derive(Clone)]
pub struct JobSource {
    store: StateStore,
}

impl JobSource {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

impl WorkSource for JobSource {
    type Item = Job;

    fn claim(&self, limit: usize, lock_timeout: Duration) -> anyhow::Result<Vec<Job>> {
        Ok(self.store.claim_jobs(limit, lock_timeout)?)
    }

    fn renew(&self, job: &Job, lock_timeout: Duration) -> anyhow::Result<bool> {
        let Some(token) = job.lock_token else {
            return Ok(false);
        };
        Ok(self
            .store
            .renew_lock(job.run_id, job.id, token, lock_timeout)?)
    }

    fn release(&self, job: &Job) -> anyhow::Result<()> {
        if let Some(token) = job.lock_token {
            self.store.release_lock(job.run_id, job.id, token)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_state::JobStatus;

    #[test]
    fn job_source_claims_and_renews() {
        let store = StateStore::open_in_memory().unwrap();
        let run_id = Uuid::new_v4();
        store
            .put_job(&Job::new(run_id, 0, JobStatus::Submitted))
            .unwrap();

        let source = JobSource::new(store);
        let claimed = source.claim(10, Duration::from_secs(60)).unwrap();
        assert_eq!(claimed.len(), 1);

        assert!(source.renew(&claimed[0], Duration::from_secs(60)).unwrap());
        source.release(&claimed[0]).unwrap();

        // Released rows are claimable again.
        let again = source.claim(10, Duration::from_secs(60)).unwrap();
        assert_eq!(again.len(), 1);
        assert_ne!(again[0].lock_token, claimed[0].lock_token);
    }

    #[test]
    fn renew_without_token_is_zero_rows() {
        let store = StateStore::open_in_memory().unwrap();
        let source = JobSource::new(store);
        let job = Job::new(Uuid::new_v4(), 0, JobStatus::Pending);
        assert!(!source.renew(&job, Duration::from_secs(60)).unwrap());
    }
}
