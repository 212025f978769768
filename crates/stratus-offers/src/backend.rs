//! The cloud backend capability interface.
//!
//! Per-provider SDK clients live out of tree; the core only sees this
//! trait. Methods return boxed futures so backends stay object-safe and
//! registries can hold `Arc<dyn ComputeBackend>`.

use stratus_state::{InstanceOffer, Job, ProvisioningData, Requirements};

pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// What a backend can do beyond plain instance launches. Used to narrow
/// the candidate backend set before offers are even queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackendCapabilities {
    /// Multi-node (cluster) jobs.
    pub multinode: bool,
    /// Privileged containers.
    pub privileged: bool,
    /// Creating instances directly (needed for instance-local volumes).
    pub create_instance: bool,
    /// Capacity reservations.
    pub reservations: bool,
}

/// A single cloud provider, abstracted to the operations the scheduler
/// and orchestrator need.
pub trait ComputeBackend: Send + Sync {
    /// Stable backend name ("aws", "gcp", ...), matching profile allow-lists.
    fn name(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities;

    /// Raw instance offers matching the requirements. May serve cached
    /// results; profile-level filtering happens in the resolver.
    fn get_offers<'a>(
        &'a self,
        requirements: &'a Requirements,
    ) -> BoxFuture<'a, anyhow::Result<Vec<InstanceOffer>>>;

    /// Launch an instance for the job on the given offer.
    fn launch<'a>(
        &'a self,
        job: &'a Job,
        offer: &'a InstanceOffer,
    ) -> BoxFuture<'a, anyhow::Result<ProvisioningData>>;

    /// Terminate a previously launched instance.
    fn terminate<'a>(
        &'a self,
        instance_id: &'a str,
        region: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>>;
}
