//! Replica scaler — reconciles a run's replica count through job rows.
//!
//! The scaler never talks to a cloud: an upscale creates Submitted job
//! rows for the dispatcher to pick up on its next fetch cycle, and a
//! downscale marks rows Terminating for the orchestrator to tear down.
//! Callers clamp the desired count to the run's replica range before
//! invoking `scale`; the scaler performs no clamping of its own.

use std::collections::HashSet;

use tracing::{debug, info};

use stratus_state::{
    Job, JobId, JobStatus, Run, StateStore, StateResult, TerminationReason, epoch_ms,
};

/// The job-row changes one scaling decision implies.
#[derive(Debug, Clone, Default)]
pub struct ScalePlan {
    /// Fresh Submitted rows to insert (upscale).
    pub new_jobs: Vec<Job>,
    /// Existing rows to mark Terminating with reason ScaledDown (downscale).
    pub terminate: Vec<JobId>,
}

impl ScalePlan {
    pub fn is_empty(&self) -> bool {
        self.new_jobs.is_empty() && self.terminate.is_empty()
    }
}

/// Compute the plan for scaling `run` by `diff` replicas (signed).
///
/// Upscale reuses the lowest unused `replica_num` first, so gaps left by
/// terminated replicas fill before the range extends. Downscale picks the
/// least advanced non-terminal job each time (Pending/Submitted before
/// Provisioning before Running), ties broken by highest `replica_num`.
pub fn scale(run: &Run, jobs: &[Job], diff: i64) -> ScalePlan {
    if diff == 0 {
        return ScalePlan::default();
    }

    let mut plan = ScalePlan::default();

    if diff > 0 {
        let mut used: HashSet<u32> = jobs
            .iter()
            .filter(|j| !j.status.is_finished())
            .map(|j| j.replica_num)
            .collect();
        for _ in 0..diff {
            let replica_num = (0..).find(|n| !used.contains(n)).unwrap_or(0);
            used.insert(replica_num);
            debug!(run = %run.id, replica_num, "planning new replica");
            plan.new_jobs.push(Job::new(run.id, replica_num, JobStatus::Submitted));
        }
    } else {
        let mut candidates: Vec<&Job> = jobs
            .iter()
            .filter(|j| !j.status.is_finished() && j.status != JobStatus::Terminating)
            .collect();
        // Least advanced first; within a rank, highest replica_num first.
        candidates.sort_by(|a, b| {
            a.status
                .progress_rank()
                .cmp(&b.status.progress_rank())
                .then(b.replica_num.cmp(&a.replica_num))
        });
        for job in candidates.into_iter().take((-diff) as usize) {
            debug!(run = %run.id, job = %job.id, replica_num = job.replica_num, "planning termination");
            plan.terminate.push(job.id);
        }
    }

    plan
}

/// Persist a scale plan: insert new rows, mark victims Terminating.
pub fn apply_plan(store: &StateStore, run: &Run, plan: &ScalePlan) -> StateResult<()> {
    for job in &plan.new_jobs {
        store.put_job(job)?;
    }
    for job_id in &plan.terminate {
        if let Some(mut job) = store.get_job(run.id, *job_id)? {
            job.status = JobStatus::Terminating;
            job.termination_reason = Some(TerminationReason::ScaledDown);
            job.updated_at = epoch_ms();
            store.put_job(&job)?;
        }
    }
    if !plan.is_empty() {
        info!(
            run = %run.id,
            created = plan.new_jobs.len(),
            terminating = plan.terminate.len(),
            "scale plan applied"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_state::{Profile, Range, Requirements};
    use uuid::Uuid;

    fn test_run() -> Run {
        Run {
            id: Uuid::new_v4(),
            name: "svc".to_string(),
            profile: Profile::default(),
            requirements: Requirements::default(),
            replicas: Range::new(0, 2),
            created_at: epoch_ms(),
        }
    }

    fn job_with_status(run: &Run, replica_num: u32, status: JobStatus) -> Job {
        let mut job = Job::new(run.id, replica_num, status);
        job.status = status;
        job
    }

    #[test]
    fn zero_diff_is_noop() {
        let run = test_run();
        let jobs = vec![job_with_status(&run, 0, JobStatus::Running)];
        assert!(scale(&run, &jobs, 0).is_empty());
    }

    #[test]
    fn upscale_from_one_running_adds_replica_one() {
        let run = test_run();
        let jobs = vec![job_with_status(&run, 0, JobStatus::Running)];

        let plan = scale(&run, &jobs, 1);
        assert_eq!(plan.new_jobs.len(), 1);
        assert_eq!(plan.new_jobs[0].replica_num, 1);
        assert_eq!(plan.new_jobs[0].status, JobStatus::Submitted);
        assert!(plan.terminate.is_empty());
    }

    #[test]
    fn upscale_reuses_gaps_before_extending() {
        let run = test_run();
        let jobs = vec![
            job_with_status(&run, 0, JobStatus::Running),
            job_with_status(&run, 1, JobStatus::Terminated), // Gap.
            job_with_status(&run, 2, JobStatus::Running),
        ];

        let plan = scale(&run, &jobs, 2);
        let nums: Vec<u32> = plan.new_jobs.iter().map(|j| j.replica_num).collect();
        assert_eq!(nums, vec![1, 3]);
    }

    #[test]
    fn downscale_picks_least_advanced() {
        let run = test_run();
        let provisioning = job_with_status(&run, 0, JobStatus::Provisioning);
        let running = job_with_status(&run, 1, JobStatus::Running);
        let jobs = vec![provisioning.clone(), running.clone()];

        let plan = scale(&run, &jobs, -1);
        assert_eq!(plan.terminate, vec![provisioning.id]);
        assert!(plan.new_jobs.is_empty());
    }

    #[test]
    fn downscale_ties_break_by_highest_replica_num() {
        let run = test_run();
        let low = job_with_status(&run, 0, JobStatus::Running);
        let high = job_with_status(&run, 1, JobStatus::Running);
        let jobs = vec![low, high.clone()];

        let plan = scale(&run, &jobs, -1);
        assert_eq!(plan.terminate, vec![high.id]);
    }

    #[test]
    fn downscale_skips_terminal_and_terminating() {
        let run = test_run();
        let done = job_with_status(&run, 0, JobStatus::Done);
        let terminating = job_with_status(&run, 1, JobStatus::Terminating);
        let running = job_with_status(&run, 2, JobStatus::Running);
        let jobs = vec![done, terminating, running.clone()];

        let plan = scale(&run, &jobs, -2);
        // Only the running job is eligible.
        assert_eq!(plan.terminate, vec![running.id]);
    }

    #[test]
    fn apply_plan_persists_rows() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run();
        store.put_run(&run).unwrap();

        let existing = job_with_status(&run, 0, JobStatus::Running);
        store.put_job(&existing).unwrap();

        // Upscale: 1 running → 2 jobs total.
        let jobs = store.list_jobs_for_run(run.id).unwrap();
        let plan = scale(&run, &jobs, 1);
        apply_plan(&store, &run, &plan).unwrap();

        let jobs = store.list_jobs_for_run(run.id).unwrap();
        assert_eq!(jobs.len(), 2);
        let new = jobs.iter().find(|j| j.replica_num == 1).unwrap();
        assert_eq!(new.status, JobStatus::Submitted);

        // Downscale: the not-yet-provisioned Submitted row goes first.
        let plan = scale(&run, &jobs, -1);
        apply_plan(&store, &run, &plan).unwrap();
        let jobs = store.list_jobs_for_run(run.id).unwrap();
        let terminated: Vec<_> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Terminating)
            .collect();
        assert_eq!(terminated.len(), 1);
        assert_eq!(
            terminated[0].termination_reason,
            Some(TerminationReason::ScaledDown)
        );
    }
}
