//! Domain types for the Stratus state store.
//!
//! These types represent the persisted state of runs, jobs, and the
//! scheduling constraints (requirements, profiles) attached to them,
//! plus the transient instance offers produced during scheduling.
//! All persisted types are serializable to/from JSON for storage in
//! redb tables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a run.
pub type RunId = Uuid;

/// Unique identifier for a job (one replica submission of a run).
pub type JobId = Uuid;

/// Current Unix epoch in milliseconds.
///
/// Lock expiries are millisecond-precision; everything else just reuses
/// the same clock.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Range ─────────────────────────────────────────────────────────

/// An inclusive `[min, max]` numeric constraint.
///
/// Either bound may be absent, meaning unconstrained on that side.
/// `Range::default()` is fully unconstrained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Range<T: Copy + Ord> {
    pub min: Option<T>,
    pub max: Option<T>,
}

impl<T: Copy + Ord> Range<T> {
    /// A range with both bounds set.
    pub fn new(min: T, max: T) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    /// A range pinned to exactly one value.
    pub fn exact(value: T) -> Self {
        Self::new(value, value)
    }

    /// A range with only a lower bound.
    pub fn at_least(min: T) -> Self {
        Self {
            min: Some(min),
            max: None,
        }
    }

    /// Whether a value satisfies this range.
    pub fn contains(&self, value: T) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }

    /// Intersect two ranges. Returns `None` if the intersection is empty.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        let max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        if let (Some(lo), Some(hi)) = (min, max)
            && lo > hi
        {
            return None;
        }
        Some(Self { min, max })
    }

    /// Whether neither bound is set.
    pub fn is_unconstrained(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }
}

// ── Job ───────────────────────────────────────────────────────────

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Submitted,
    Provisioning,
    Pulling,
    Running,
    Terminating,
    Terminated,
    Aborted,
    Failed,
    Done,
}

impl JobStatus {
    /// Whether this status is terminal — the job row will never change again.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobStatus::Terminated | JobStatus::Aborted | JobStatus::Failed | JobStatus::Done
        )
    }

    /// How far along the lifecycle this status is.
    ///
    /// Used by the downscaler to pick the least-advanced replica first.
    pub fn progress_rank(&self) -> u8 {
        match self {
            JobStatus::Pending | JobStatus::Submitted => 0,
            JobStatus::Provisioning => 1,
            JobStatus::Pulling | JobStatus::Running => 2,
            JobStatus::Terminating => 3,
            JobStatus::Terminated | JobStatus::Aborted | JobStatus::Failed | JobStatus::Done => 4,
        }
    }
}

/// Stable error code attached to a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorCode {
    NoInstanceMatchingRequirements,
    WaitingRunnerLimitExceeded,
    InterruptedByNoCapacity,
    TerminatedByUser,
    InternalError,
}

/// Why a job was (or is being) terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    ScaledDown,
    StoppedByUser,
    InterruptedBySpot,
    Failed,
}

/// Retry policy for a job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub enabled: bool,
    /// Window (seconds since job creation) within which retries are allowed.
    pub duration_secs: u64,
}

/// Snapshot of the offer chosen for a job, taken at provisioning time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningData {
    pub backend: String,
    pub region: String,
    pub instance_type: InstanceType,
    pub price: f64,
    pub hostname: String,
    pub ssh_port: u16,
    pub instance_id: String,
    pub spot: bool,
}

/// One replica submission of a run.
///
/// The `lock_token` / `lock_expires_at` pair makes every job a claimable
/// pipeline item: at most one dispatcher holds a live lock at a time,
/// enforced by the store's conditional updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub run_id: RunId,
    /// Which replica of the run this job backs.
    pub replica_num: u32,
    /// Incremented each time the job is resubmitted as a fresh row.
    pub submission_num: u32,
    pub status: JobStatus,
    pub error_code: Option<JobErrorCode>,
    pub termination_reason: Option<TerminationReason>,
    pub retry: Option<RetryPolicy>,
    pub provisioning: Option<ProvisioningData>,
    /// Opaque proof of lock ownership; `None` when unclaimed.
    pub lock_token: Option<Uuid>,
    /// Epoch ms after which the lock is considered expired. 0 = unlocked.
    pub lock_expires_at: u64,
    /// Epoch ms up to which runner logs/states have been pulled.
    pub last_pulled_at: u64,
    /// Epoch ms when this row was created.
    pub created_at: u64,
    /// Epoch ms of the last status change.
    pub updated_at: u64,
}

impl Job {
    /// Create a fresh job row for a run replica.
    pub fn new(run_id: RunId, replica_num: u32, status: JobStatus) -> Self {
        let now = epoch_ms();
        Self {
            id: Uuid::new_v4(),
            run_id,
            replica_num,
            submission_num: 0,
            status,
            error_code: None,
            termination_reason: None,
            retry: None,
            provisioning: None,
            lock_token: None,
            lock_expires_at: 0,
            last_pulled_at: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the retry window is still open at `now` (epoch ms).
    pub fn retry_active(&self, now: u64) -> bool {
        match self.retry {
            Some(policy) if policy.enabled => {
                now.saturating_sub(self.created_at) <= policy.duration_secs * 1000
            }
            _ => false,
        }
    }

    /// A fresh Pending row resubmitting this job with the next submission_num.
    pub fn resubmission(&self) -> Self {
        let now = epoch_ms();
        Self {
            id: Uuid::new_v4(),
            run_id: self.run_id,
            replica_num: self.replica_num,
            submission_num: self.submission_num + 1,
            status: JobStatus::Pending,
            error_code: None,
            termination_reason: None,
            retry: self.retry,
            provisioning: None,
            lock_token: None,
            lock_expires_at: 0,
            last_pulled_at: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build the composite key for the jobs table.
    pub fn table_key(&self) -> String {
        job_table_key(self.run_id, self.id)
    }
}

/// Composite key `{run_id}:{job_id}` for the jobs table.
///
/// Prefix-scanning by run_id gives all jobs of a run.
pub fn job_table_key(run_id: RunId, job_id: JobId) -> String {
    format!("{run_id}:{job_id}")
}

// ── Run ───────────────────────────────────────────────────────────

/// A declarative run specification: one service or task, scaled over
/// `replicas` jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub name: String,
    pub profile: Profile,
    pub requirements: Requirements,
    /// Allowed replica count range for this run.
    pub replicas: Range<u32>,
    pub created_at: u64,
}

impl Run {
    pub fn table_key(&self) -> String {
        self.id.to_string()
    }
}

// ── Requirements ──────────────────────────────────────────────────

/// GPU vendor. `Google` covers TPU-like accelerators that cannot be
/// subdivided into fractional blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Google,
    Intel,
}

/// GPU constraints within a resources spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GpuSpec {
    pub count: Range<u32>,
    pub memory_mb: Range<u64>,
    /// Allowed vendors; `None` = any.
    pub vendors: Option<Vec<GpuVendor>>,
    /// Allowed GPU model names; `None` = any.
    pub names: Option<Vec<String>>,
    /// Minimum CUDA compute capability, e.g. (8, 0).
    pub compute_capability: Option<(u32, u32)>,
}

/// How many fractional blocks to split an instance into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockCount {
    /// The whole instance as a single block.
    #[default]
    Whole,
    /// Exactly this many blocks.
    Exact(u32),
    /// As many blocks as CPU and GPU counts evenly allow.
    Auto,
}

/// Hardware constraints for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourcesSpec {
    pub cpu: Range<u32>,
    pub memory_mb: Range<u64>,
    pub gpu: GpuSpec,
    pub disk_gb: Range<u64>,
    pub blocks: BlockCount,
}

/// Scheduling requirements: hardware plus price/capacity constraints.
///
/// Every field is either concrete, a range, or unset ("unconstrained,
/// inherit from the other side when combined").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Requirements {
    pub resources: ResourcesSpec,
    pub max_price: Option<f64>,
    /// `Some(true)` = spot only, `Some(false)` = on-demand only, `None` = either.
    pub spot: Option<bool>,
    /// Capacity reservation to consume, if any.
    pub reservation: Option<String>,
}

// ── Profile ───────────────────────────────────────────────────────

/// Whether a job may run on preemptible capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpotPolicy {
    /// Defer to the other side when combining; resolver treats as "either".
    #[default]
    Auto,
    Spot,
    OnDemand,
}

impl SpotPolicy {
    /// The concrete spot requirement this policy implies, if any.
    pub fn as_spot(&self) -> Option<bool> {
        match self {
            SpotPolicy::Auto => None,
            SpotPolicy::Spot => Some(true),
            SpotPolicy::OnDemand => Some(false),
        }
    }
}

/// Scheduling-affecting knobs orthogonal to hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Profile {
    /// Allowed backends; `None` = all configured.
    pub backends: Option<Vec<String>>,
    pub regions: Option<Vec<String>>,
    pub availability_zones: Option<Vec<String>>,
    /// Allowed instance type names; `None` = any.
    pub instance_types: Option<Vec<String>>,
    pub spot_policy: SpotPolicy,
    pub max_price: Option<f64>,
    /// Idle seconds before auto-termination; negative = never.
    pub idle_duration_secs: Option<i64>,
    pub reservation: Option<String>,
    /// Arbitrary tags applied to provisioned instances.
    pub tags: HashMap<String, String>,
}

// ── Instance offers ───────────────────────────────────────────────

/// A single GPU on an instance type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gpu {
    pub name: String,
    pub vendor: GpuVendor,
    pub memory_mb: u64,
}

/// Hardware shape of an instance type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceResources {
    pub cpus: u32,
    pub memory_mb: u64,
    pub gpus: Vec<Gpu>,
    pub disk_gb: u64,
    pub spot: bool,
}

/// A named instance type with its resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    pub name: String,
    pub resources: InstanceResources,
}

/// Backend-reported availability of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferAvailability {
    Available,
    NotAvailable,
    NoQuota,
    Unknown,
}

impl OfferAvailability {
    /// Unknown counts as available — the backend simply didn't say.
    pub fn is_available(&self) -> bool {
        matches!(self, OfferAvailability::Available | OfferAvailability::Unknown)
    }
}

/// A priced, region-scoped instance type advertised by a backend.
///
/// Produced transiently per scheduling decision; only the chosen offer's
/// snapshot (`ProvisioningData`) outlives the decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceOffer {
    pub backend: String,
    pub region: String,
    /// Zones this offer is valid in; `None` = all zones of the region.
    pub availability_zones: Option<Vec<String>>,
    pub instance: InstanceType,
    pub price: f64,
    pub availability: OfferAvailability,
    /// Which fractional slice of the host this offer represents.
    pub blocks: u32,
    pub total_blocks: u32,
}
