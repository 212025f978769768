//! The job lifecycle state machine.
//!
//! `JobProcessor::process` is the dispatcher's processing callback for
//! the job pipeline. Each call advances one job one step:
//!
//! ```text
//! Pending → Submitted → Provisioning → {Running | Failed}
//! Running → {Running (no-op poll) | Terminating | Failed}
//! Terminating → Terminated
//! ```
//!
//! Failed never re-enters Pending in place: if the retry window is open,
//! a *new* job row with an incremented `submission_num` is created and
//! the failed row stays behind as immutable history. Re-processing a
//! terminal job is a no-op, and a job never regresses to a less advanced
//! state outside that explicit resubmission path.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use stratus_offers::{ComputeBackend, ResolveContext, resolve_offers};
use stratus_state::{
    Job, JobErrorCode, JobStatus, ProvisioningData, StateStore, TerminationReason, epoch_ms,
};

use crate::error::{ProcessError, ProcessResult};
use crate::runner::{CodeSource, JobSpec, LogSink, RunnerClient, RunnerConnector};

/// Tunables for the state machine.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// How long a provisioned runner may stay unreachable before the job
    /// fails with `WaitingRunnerLimitExceeded`.
    pub runner_boot_timeout: Duration,
    /// SSH connect attempts per poll of a running job.
    pub connect_attempts: u32,
    /// Fixed delay between those attempts.
    pub connect_retry_delay: Duration,
    /// Cap passed to the offer resolver.
    pub max_offers: Option<usize>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            runner_boot_timeout: Duration::from_secs(600),
            connect_attempts: 3,
            connect_retry_delay: Duration::from_secs(1),
            max_offers: None,
        }
    }
}

/// Drives job rows through provisioning, runner polling, and teardown.
pub struct JobProcessor {
    store: StateStore,
    backends: Vec<Arc<dyn ComputeBackend>>,
    connector: Arc<dyn RunnerConnector>,
    code: Arc<dyn CodeSource>,
    logs: Arc<dyn LogSink>,
    config: ProcessorConfig,
}

impl JobProcessor {
    pub fn new(
        store: StateStore,
        backends: Vec<Arc<dyn ComputeBackend>>,
        connector: Arc<dyn RunnerConnector>,
        code: Arc<dyn CodeSource>,
        logs: Arc<dyn LogSink>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            backends,
            connector,
            code,
            logs,
            config,
        }
    }

    /// Advance one job one step. Invoked by a dispatcher worker with the
    /// lock held; transient failures return early and rely on the next
    /// fetch cycle.
    pub async fn process(&self, job: Job) -> ProcessResult<()> {
        if job.status.is_finished() {
            debug!(job = %job.id, status = ?job.status, "job already terminal; nothing to do");
            return Ok(());
        }
        match job.status {
            JobStatus::Pending => self.promote(job),
            JobStatus::Submitted => self.provision(job).await,
            JobStatus::Provisioning | JobStatus::Pulling => self.poll_provisioning(job).await,
            JobStatus::Running => self.poll_running(job).await,
            JobStatus::Terminating => self.teardown(job).await,
            // is_finished() covered above.
            _ => Ok(()),
        }
    }

    /// Pending rows (fresh resubmissions) re-enter the provisioning path.
    fn promote(&self, mut job: Job) -> ProcessResult<()> {
        job.status = JobStatus::Submitted;
        job.updated_at = epoch_ms();
        self.store.put_job(&job)?;
        debug!(job = %job.id, "job promoted to submitted");
        Ok(())
    }

    /// Pick a backend+offer and launch an instance.
    async fn provision(&self, mut job: Job) -> ProcessResult<()> {
        let run = self
            .store
            .get_run(job.run_id)?
            .ok_or(ProcessError::RunNotFound(job.run_id))?;

        let ctx = ResolveContext::default();
        let candidates = resolve_offers(
            &self.backends,
            &run.profile,
            &run.requirements,
            &ctx,
            self.config.max_offers,
        )
        .await;

        for (backend, offer) in candidates {
            if !offer.availability.is_available() {
                continue;
            }
            match backend.launch(&job, &offer).await {
                Ok(provisioning) => {
                    info!(
                        job = %job.id,
                        backend = %provisioning.backend,
                        region = %provisioning.region,
                        instance = %provisioning.instance_type.name,
                        price = provisioning.price,
                        "instance launched"
                    );
                    job.provisioning = Some(provisioning);
                    job.status = JobStatus::Provisioning;
                    job.updated_at = epoch_ms();
                    self.store.put_job(&job)?;
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        job = %job.id,
                        backend = backend.name(),
                        instance = %offer.instance.name,
                        error = %e,
                        "launch failed; trying next offer"
                    );
                }
            }
        }

        if job.retry_active(epoch_ms()) {
            info!(job = %job.id, "no usable offers; retry window open, staying submitted");
            return Ok(());
        }
        self.fail(&mut job, JobErrorCode::NoInstanceMatchingRequirements)
    }

    /// Health-check the runner; once reachable, hand it the job.
    async fn poll_provisioning(&self, mut job: Job) -> ProcessResult<()> {
        let provisioning = job
            .provisioning
            .clone()
            .ok_or(ProcessError::MissingProvisioningData(job.id))?;

        match self.connect_healthy(&provisioning).await {
            Ok(client) => {
                let run = self
                    .store
                    .get_run(job.run_id)?
                    .ok_or(ProcessError::RunNotFound(job.run_id))?;
                let spec = JobSpec {
                    run_name: run.name.clone(),
                    job_id: job.id,
                    replica_num: job.replica_num,
                    submission_num: job.submission_num,
                };
                client.submit(&spec).await?;
                let code = self.code.fetch(run.id).await?;
                client.upload_code(&code).await?;
                client.run().await?;

                job.status = JobStatus::Running;
                job.updated_at = epoch_ms();
                self.store.put_job(&job)?;
                info!(job = %job.id, host = %provisioning.hostname, "job running");
                Ok(())
            }
            Err(e) => {
                let age_ms = epoch_ms().saturating_sub(job.created_at);
                if age_ms > self.config.runner_boot_timeout.as_millis() as u64 {
                    warn!(
                        job = %job.id,
                        age_secs = age_ms / 1000,
                        "runner never became reachable; giving up"
                    );
                    self.fail(&mut job, JobErrorCode::WaitingRunnerLimitExceeded)?;
                    self.terminate_instance(&provisioning).await;
                    Ok(())
                } else {
                    // Normal while the instance boots; next cycle retries.
                    debug!(job = %job.id, error = %e, "runner not reachable yet");
                    Ok(())
                }
            }
        }
    }

    /// Poll a running job's runner with a bounded number of connect
    /// attempts; exhausting them means the capacity is gone.
    async fn poll_running(&self, mut job: Job) -> ProcessResult<()> {
        let provisioning = job
            .provisioning
            .clone()
            .ok_or(ProcessError::MissingProvisioningData(job.id))?;

        let mut last_err = None;
        for attempt in 1..=self.config.connect_attempts {
            match self.pull_once(&mut job, &provisioning).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(
                        job = %job.id,
                        attempt,
                        max = self.config.connect_attempts,
                        error = %e,
                        "runner poll attempt failed"
                    );
                    last_err = Some(e);
                    if attempt < self.config.connect_attempts {
                        tokio::time::sleep(self.config.connect_retry_delay).await;
                    }
                }
            }
        }

        warn!(
            job = %job.id,
            host = %provisioning.hostname,
            error = %last_err.map(|e| e.to_string()).unwrap_or_default(),
            "runner unreachable; treating as lost capacity"
        );
        self.fail(&mut job, JobErrorCode::InterruptedByNoCapacity)?;
        // The instance may technically still be alive, but its
        // reachability can no longer be trusted.
        self.terminate_instance(&provisioning).await;

        if job.retry_active(epoch_ms()) && provisioning.spot {
            let next = job.resubmission();
            self.store.put_job(&next)?;
            info!(
                job = %job.id,
                next_job = %next.id,
                submission_num = next.submission_num,
                "spot interruption; resubmitted as new job row"
            );
        }
        Ok(())
    }

    /// One connect + pull + state adoption pass for a running job.
    async fn pull_once(
        &self,
        job: &mut Job,
        provisioning: &ProvisioningData,
    ) -> anyhow::Result<()> {
        let client = self
            .connector
            .connect(&provisioning.hostname, provisioning.ssh_port)
            .await?;
        let resp = client.pull(job.last_pulled_at).await?;

        if !resp.runner_logs.is_empty() || !resp.job_logs.is_empty() {
            if let Err(e) = self
                .logs
                .write_logs(job.run_id, job.id, &resp.runner_logs, &resp.job_logs)
                .await
            {
                warn!(job = %job.id, error = %e, "log sink write failed");
            }
        }

        job.last_pulled_at = resp.last_updated_ms.max(job.last_pulled_at);

        if let Some(&latest) = resp.job_states.last() {
            if latest.progress_rank() < job.status.progress_rank() {
                warn!(
                    job = %job.id,
                    current = ?job.status,
                    reported = ?latest,
                    "runner reported a less advanced state; ignoring"
                );
            } else if latest != job.status {
                debug!(job = %job.id, from = ?job.status, to = ?latest, "adopting runner-reported state");
                job.status = latest;
                job.updated_at = epoch_ms();
            }
        }

        self.store.put_job(job)?;
        Ok(())
    }

    /// Tear down the backing instance and finish the row.
    async fn teardown(&self, mut job: Job) -> ProcessResult<()> {
        if let Some(provisioning) = job.provisioning.clone() {
            self.terminate_instance(&provisioning).await;
        }
        job.status = JobStatus::Terminated;
        job.updated_at = epoch_ms();
        self.store.put_job(&job)?;
        info!(job = %job.id, reason = ?job.termination_reason, "job terminated");
        Ok(())
    }

    fn fail(&self, job: &mut Job, code: JobErrorCode) -> ProcessResult<()> {
        job.status = JobStatus::Failed;
        job.error_code = Some(code);
        job.termination_reason = Some(TerminationReason::Failed);
        job.updated_at = epoch_ms();
        self.store.put_job(job)?;
        warn!(job = %job.id, code = ?code, "job failed");
        Ok(())
    }

    async fn connect_healthy(
        &self,
        provisioning: &ProvisioningData,
    ) -> anyhow::Result<Arc<dyn RunnerClient>> {
        let client = self
            .connector
            .connect(&provisioning.hostname, provisioning.ssh_port)
            .await?;
        client.healthcheck().await?;
        Ok(client)
    }

    /// Best-effort instance termination; failures are logged, not raised.
    async fn terminate_instance(&self, provisioning: &ProvisioningData) {
        let Some(backend) = self
            .backends
            .iter()
            .find(|b| b.name() == provisioning.backend)
        else {
            warn!(
                backend = %provisioning.backend,
                instance = %provisioning.instance_id,
                "no such backend registered; cannot terminate instance"
            );
            return;
        };
        if let Err(e) = backend
            .terminate(&provisioning.instance_id, &provisioning.region)
            .await
        {
            warn!(
                instance = %provisioning.instance_id,
                region = %provisioning.region,
                error = %e,
                "instance termination failed"
            );
        } else {
            info!(instance = %provisioning.instance_id, "instance terminated");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use stratus_offers::{BackendCapabilities, BoxFuture};
    use stratus_state::{
        InstanceOffer, InstanceResources, InstanceType, OfferAvailability, Profile, Range,
        Requirements, RetryPolicy, Run,
    };
    use uuid::Uuid;

    use crate::runner::{LogChunk, PullResponse};

    // ── Mock collaborators ─────────────────────────────────────────

    struct MockBackend {
        name: String,
        offers: Vec<InstanceOffer>,
        launches: AtomicUsize,
        terminated: StdMutex<Vec<String>>,
        fail_launch: bool,
    }

    impl MockBackend {
        fn with_offers(offers: Vec<InstanceOffer>) -> Arc<Self> {
            Arc::new(Self {
                name: "aws".to_string(),
                offers,
                launches: AtomicUsize::new(0),
                terminated: StdMutex::new(Vec::new()),
                fail_launch: false,
            })
        }

        fn empty() -> Arc<Self> {
            Self::with_offers(Vec::new())
        }
    }

    impl stratus_offers::ComputeBackend for MockBackend {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> BackendCapabilities {
            BackendCapabilities::default()
        }

        fn get_offers<'a>(
            &'a self,
            _requirements: &'a Requirements,
        ) -> BoxFuture<'a, anyhow::Result<Vec<InstanceOffer>>> {
            Box::pin(async move { Ok(self.offers.clone()) })
        }

        fn launch<'a>(
            &'a self,
            _job: &'a Job,
            offer: &'a InstanceOffer,
        ) -> BoxFuture<'a, anyhow::Result<ProvisioningData>> {
            Box::pin(async move {
                if self.fail_launch {
                    anyhow::bail!("insufficient capacity");
                }
                self.launches.fetch_add(1, Ordering::SeqCst);
                Ok(ProvisioningData {
                    backend: self.name.clone(),
                    region: offer.region.clone(),
                    instance_type: offer.instance.clone(),
                    price: offer.price,
                    hostname: "198.51.100.7".to_string(),
                    ssh_port: 22,
                    instance_id: "i-0abc".to_string(),
                    spot: offer.instance.resources.spot,
                })
            })
        }

        fn terminate<'a>(
            &'a self,
            instance_id: &'a str,
            _region: &'a str,
        ) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                self.terminated.lock().unwrap().push(instance_id.to_string());
                Ok(())
            })
        }
    }

    #[derive(Default)]
    struct MockRunner {
        healthy: std::sync::atomic::AtomicBool,
        submitted: StdMutex<Vec<JobSpec>>,
        uploaded: AtomicUsize,
        ran: AtomicUsize,
        pull_response: StdMutex<PullResponse>,
    }

    impl crate::runner::RunnerClient for MockRunner {
        fn healthcheck(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                if self.healthy.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    anyhow::bail!("runner not ready")
                }
            })
        }

        fn submit<'a>(&'a self, spec: &'a JobSpec) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                self.submitted.lock().unwrap().push(spec.clone());
                Ok(())
            })
        }

        fn upload_code<'a>(&'a self, _code: &'a [u8]) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                self.uploaded.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }

        fn run(&self) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                self.ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }

        fn pull(&self, _since_ms: u64) -> BoxFuture<'_, anyhow::Result<PullResponse>> {
            Box::pin(async move { Ok(self.pull_response.lock().unwrap().clone()) })
        }
    }

    /// Connector that either refuses every connection or hands out one
    /// shared mock runner.
    struct MockConnector {
        runner: Option<Arc<MockRunner>>,
        connects: AtomicUsize,
    }

    impl MockConnector {
        fn unreachable() -> Arc<Self> {
            Arc::new(Self {
                runner: None,
                connects: AtomicUsize::new(0),
            })
        }

        fn with_runner(runner: Arc<MockRunner>) -> Arc<Self> {
            Arc::new(Self {
                runner: Some(runner),
                connects: AtomicUsize::new(0),
            })
        }
    }

    impl crate::runner::RunnerConnector for MockConnector {
        fn connect<'a>(
            &'a self,
            _hostname: &'a str,
            _ssh_port: u16,
        ) -> BoxFuture<'a, anyhow::Result<Arc<dyn crate::runner::RunnerClient>>> {
            Box::pin(async move {
                self.connects.fetch_add(1, Ordering::SeqCst);
                match &self.runner {
                    Some(runner) => {
                        Ok(runner.clone() as Arc<dyn crate::runner::RunnerClient>)
                    }
                    None => anyhow::bail!("connection refused"),
                }
            })
        }
    }

    struct MockCode;

    impl CodeSource for MockCode {
        fn fetch(&self, _run_id: Uuid) -> BoxFuture<'_, anyhow::Result<Vec<u8>>> {
            Box::pin(async move { Ok(b"artifact".to_vec()) })
        }
    }

    #[derive(Default)]
    struct MockLogs {
        writes: StdMutex<Vec<(Uuid, usize, usize)>>,
    }

    impl LogSink for MockLogs {
        fn write_logs<'a>(
            &'a self,
            _run_id: Uuid,
            job_id: Uuid,
            runner_logs: &'a [LogChunk],
            job_logs: &'a [LogChunk],
        ) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async move {
                self.writes
                    .lock()
                    .unwrap()
                    .push((job_id, runner_logs.len(), job_logs.len()));
                Ok(())
            })
        }
    }

    // ── Fixtures ───────────────────────────────────────────────────

    fn test_offer(spot: bool) -> InstanceOffer {
        InstanceOffer {
            backend: "aws".to_string(),
            region: "us-east-1".to_string(),
            availability_zones: None,
            instance: InstanceType {
                name: "g5.xlarge".to_string(),
                resources: InstanceResources {
                    cpus: 4,
                    memory_mb: 16 * 1024,
                    gpus: Vec::new(),
                    disk_gb: 100,
                    spot,
                },
            },
            price: 1.0,
            availability: OfferAvailability::Available,
            blocks: 1,
            total_blocks: 1,
        }
    }

    fn test_run(store: &StateStore) -> Run {
        let run = Run {
            id: Uuid::new_v4(),
            name: "svc".to_string(),
            profile: Profile::default(),
            requirements: Requirements::default(),
            replicas: Range::new(0, 4),
            created_at: epoch_ms(),
        };
        store.put_run(&run).unwrap();
        run
    }

    fn fast_config() -> ProcessorConfig {
        ProcessorConfig {
            connect_retry_delay: Duration::from_millis(1),
            ..ProcessorConfig::default()
        }
    }

    fn processor(
        store: StateStore,
        backend: Arc<MockBackend>,
        connector: Arc<MockConnector>,
        logs: Arc<MockLogs>,
    ) -> JobProcessor {
        JobProcessor::new(
            store,
            vec![backend],
            connector,
            Arc::new(MockCode),
            logs,
            fast_config(),
        )
    }

    fn provisioned_job(run: &Run, status: JobStatus, spot: bool) -> Job {
        let mut job = Job::new(run.id, 0, status);
        job.provisioning = Some(ProvisioningData {
            backend: "aws".to_string(),
            region: "us-east-1".to_string(),
            instance_type: test_offer(spot).instance,
            price: 1.0,
            hostname: "198.51.100.7".to_string(),
            ssh_port: 22,
            instance_id: "i-0abc".to_string(),
            spot,
        });
        job
    }

    // ── Tests ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn submitted_job_provisions_on_first_offer() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run(&store);
        let job = Job::new(run.id, 0, JobStatus::Submitted);
        store.put_job(&job).unwrap();

        let backend = MockBackend::with_offers(vec![test_offer(false)]);
        let p = processor(
            store.clone(),
            backend.clone(),
            MockConnector::unreachable(),
            Arc::new(MockLogs::default()),
        );
        p.process(job.clone()).await.unwrap();

        let stored = store.get_job(run.id, job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Provisioning);
        assert!(stored.provisioning.is_some());
        assert_eq!(backend.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn offer_exhaustion_fails_without_retry() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run(&store);
        let job = Job::new(run.id, 0, JobStatus::Submitted);
        store.put_job(&job).unwrap();

        let p = processor(
            store.clone(),
            MockBackend::empty(),
            MockConnector::unreachable(),
            Arc::new(MockLogs::default()),
        );
        p.process(job.clone()).await.unwrap();

        let stored = store.get_job(run.id, job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            stored.error_code,
            Some(JobErrorCode::NoInstanceMatchingRequirements)
        );
    }

    #[tokio::test]
    async fn offer_exhaustion_with_open_retry_window_stays_submitted() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run(&store);
        let mut job = Job::new(run.id, 0, JobStatus::Submitted);
        job.retry = Some(RetryPolicy {
            enabled: true,
            duration_secs: 3600,
        });
        store.put_job(&job).unwrap();

        let p = processor(
            store.clone(),
            MockBackend::empty(),
            MockConnector::unreachable(),
            Arc::new(MockLogs::default()),
        );
        p.process(job.clone()).await.unwrap();

        let stored = store.get_job(run.id, job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Submitted);
        assert_eq!(stored.error_code, None);
    }

    #[tokio::test]
    async fn unreachable_runner_within_boot_window_is_not_a_failure() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run(&store);
        let job = provisioned_job(&run, JobStatus::Provisioning, false);
        store.put_job(&job).unwrap();

        let p = processor(
            store.clone(),
            MockBackend::empty(),
            MockConnector::unreachable(),
            Arc::new(MockLogs::default()),
        );
        p.process(job.clone()).await.unwrap();

        // Freshly created: well within the 600s boot timeout.
        let stored = store.get_job(run.id, job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Provisioning);
    }

    #[tokio::test]
    async fn runner_boot_timeout_fails_exactly_once() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run(&store);
        let mut job = provisioned_job(&run, JobStatus::Provisioning, false);
        job.created_at = epoch_ms() - 700_000; // Past the 600s timeout.
        store.put_job(&job).unwrap();

        let backend = MockBackend::empty();
        let p = processor(
            store.clone(),
            backend.clone(),
            MockConnector::unreachable(),
            Arc::new(MockLogs::default()),
        );
        p.process(job.clone()).await.unwrap();

        let stored = store.get_job(run.id, job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            stored.error_code,
            Some(JobErrorCode::WaitingRunnerLimitExceeded)
        );
        assert_eq!(backend.terminated.lock().unwrap().len(), 1);

        // Re-processing the terminal row is a no-op.
        p.process(stored.clone()).await.unwrap();
        assert_eq!(backend.terminated.lock().unwrap().len(), 1);
        let after = store.get_job(run.id, job.id).unwrap().unwrap();
        assert_eq!(after, stored);
        // No retry rows were spawned.
        assert_eq!(store.list_jobs_for_run(run.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn healthy_runner_receives_submit_upload_run() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run(&store);
        let job = provisioned_job(&run, JobStatus::Provisioning, false);
        store.put_job(&job).unwrap();

        let runner = Arc::new(MockRunner::default());
        runner.healthy.store(true, Ordering::SeqCst);

        let p = processor(
            store.clone(),
            MockBackend::empty(),
            MockConnector::with_runner(runner.clone()),
            Arc::new(MockLogs::default()),
        );
        p.process(job.clone()).await.unwrap();

        let stored = store.get_job(run.id, job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);

        let submitted = runner.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].run_name, "svc");
        assert_eq!(submitted[0].job_id, job.id);
        assert_eq!(runner.uploaded.load(Ordering::SeqCst), 1);
        assert_eq!(runner.ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn running_pull_appends_logs_and_adopts_latest_state() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run(&store);
        let job = provisioned_job(&run, JobStatus::Running, false);
        store.put_job(&job).unwrap();

        let runner = Arc::new(MockRunner::default());
        runner.healthy.store(true, Ordering::SeqCst);
        *runner.pull_response.lock().unwrap() = PullResponse {
            job_states: vec![JobStatus::Running, JobStatus::Done],
            runner_logs: vec![LogChunk {
                timestamp_ms: 1,
                message: b"boot".to_vec(),
            }],
            job_logs: vec![LogChunk {
                timestamp_ms: 2,
                message: b"hello".to_vec(),
            }],
            last_updated_ms: 42,
        };

        let logs = Arc::new(MockLogs::default());
        let p = processor(
            store.clone(),
            MockBackend::empty(),
            MockConnector::with_runner(runner),
            logs.clone(),
        );
        p.process(job.clone()).await.unwrap();

        let stored = store.get_job(run.id, job.id).unwrap().unwrap();
        // Latest of the reported transitions wins.
        assert_eq!(stored.status, JobStatus::Done);
        assert_eq!(stored.last_pulled_at, 42);
        assert_eq!(logs.writes.lock().unwrap().as_slice(), &[(job.id, 1, 1)]);
    }

    #[tokio::test]
    async fn running_never_regresses_to_reported_earlier_state() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run(&store);
        let job = provisioned_job(&run, JobStatus::Running, false);
        store.put_job(&job).unwrap();

        let runner = Arc::new(MockRunner::default());
        *runner.pull_response.lock().unwrap() = PullResponse {
            job_states: vec![JobStatus::Provisioning],
            ..PullResponse::default()
        };

        let p = processor(
            store.clone(),
            MockBackend::empty(),
            MockConnector::with_runner(runner),
            Arc::new(MockLogs::default()),
        );
        p.process(job.clone()).await.unwrap();

        let stored = store.get_job(run.id, job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn spot_interruption_fails_and_resubmits_once() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run(&store);
        let mut job = provisioned_job(&run, JobStatus::Running, true);
        job.retry = Some(RetryPolicy {
            enabled: true,
            duration_secs: 3600,
        });
        store.put_job(&job).unwrap();

        let backend = MockBackend::empty();
        let connector = MockConnector::unreachable();
        let p = processor(
            store.clone(),
            backend.clone(),
            connector.clone(),
            Arc::new(MockLogs::default()),
        );
        p.process(job.clone()).await.unwrap();

        // Three bounded connect attempts, no more.
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);

        let jobs = store.list_jobs_for_run(run.id).unwrap();
        assert_eq!(jobs.len(), 2);

        let failed = jobs.iter().find(|j| j.id == job.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(
            failed.error_code,
            Some(JobErrorCode::InterruptedByNoCapacity)
        );

        let fresh = jobs.iter().find(|j| j.id != job.id).unwrap();
        assert_eq!(fresh.status, JobStatus::Pending);
        assert_eq!(fresh.submission_num, job.submission_num + 1);
        assert_eq!(fresh.replica_num, job.replica_num);

        // Untrusted instance is forced to terminate.
        assert_eq!(backend.terminated.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lost_capacity_without_retry_leaves_no_new_rows() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run(&store);
        let job = provisioned_job(&run, JobStatus::Running, true);
        store.put_job(&job).unwrap();

        let p = processor(
            store.clone(),
            MockBackend::empty(),
            MockConnector::unreachable(),
            Arc::new(MockLogs::default()),
        );
        p.process(job.clone()).await.unwrap();

        let jobs = store.list_jobs_for_run(run.id).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn on_demand_interruption_does_not_resubmit() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run(&store);
        let mut job = provisioned_job(&run, JobStatus::Running, false); // Not spot.
        job.retry = Some(RetryPolicy {
            enabled: true,
            duration_secs: 3600,
        });
        store.put_job(&job).unwrap();

        let p = processor(
            store.clone(),
            MockBackend::empty(),
            MockConnector::unreachable(),
            Arc::new(MockLogs::default()),
        );
        p.process(job.clone()).await.unwrap();

        assert_eq!(store.list_jobs_for_run(run.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminating_job_tears_down_and_keeps_reason() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run(&store);
        let mut job = provisioned_job(&run, JobStatus::Terminating, false);
        job.termination_reason = Some(TerminationReason::ScaledDown);
        store.put_job(&job).unwrap();

        let backend = MockBackend::empty();
        let p = processor(
            store.clone(),
            backend.clone(),
            MockConnector::unreachable(),
            Arc::new(MockLogs::default()),
        );
        p.process(job.clone()).await.unwrap();

        let stored = store.get_job(run.id, job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Terminated);
        assert_eq!(stored.termination_reason, Some(TerminationReason::ScaledDown));
        assert_eq!(backend.terminated.lock().unwrap().as_slice(), &["i-0abc"]);
    }

    #[tokio::test]
    async fn pending_job_is_promoted_to_submitted() {
        let store = StateStore::open_in_memory().unwrap();
        let run = test_run(&store);
        let job = Job::new(run.id, 0, JobStatus::Pending);
        store.put_job(&job).unwrap();

        let p = processor(
            store.clone(),
            MockBackend::empty(),
            MockConnector::unreachable(),
            Arc::new(MockLogs::default()),
        );
        p.process(job.clone()).await.unwrap();

        let stored = store.get_job(run.id, job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Submitted);
    }
}
