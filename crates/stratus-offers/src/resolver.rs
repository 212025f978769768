//! Offer resolution — filter and order the multi-backend instance catalog.
//!
//! Given the effective (already combined) profile and requirements, the
//! resolver narrows the candidate backend set by capability, queries each
//! surviving backend for raw offers, applies profile allow-lists and
//! placement constraints, optionally splits offers into fractional
//! blocks, and returns an ordered list usable for provisioning.

use std::sync::Arc;

use tracing::{debug, warn};

use stratus_state::{
    BlockCount, GpuVendor, InstanceOffer, Profile, Requirements,
};

use crate::backend::ComputeBackend;

/// A placement group the offers must be compatible with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementGroup {
    pub name: String,
    pub backend: String,
    pub region: String,
}

/// Job-shaped constraints that narrow the backend set before any offers
/// are queried.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    /// Multi-node run: restrict to backends supporting multinode.
    pub multinode: bool,
    /// For non-master nodes of a multi-node run: pin backend and region
    /// to exactly the master node's.
    pub master: Option<(String, String)>,
    /// Privileged containers requested.
    pub privileged: bool,
    /// Instance-local volumes requested: backend must create instances.
    pub requires_instance_volumes: bool,
    /// Mounted volumes pin offers to their (backend, region).
    pub volume_pins: Vec<(String, String)>,
    /// Requested placement group, if any.
    pub placement_group: Option<PlacementGroup>,
}

/// Resolve the ordered `(backend, offer)` candidates for one scheduling
/// decision.
///
/// Backends whose offer query fails are logged and skipped — a flaky
/// provider never fails the whole resolution. The result is capped to
/// `max_offers` and stable-sorted with unavailable/no-quota offers pushed
/// to the end (equal availability keeps backend-query order).
pub async fn resolve_offers(
    backends: &[Arc<dyn ComputeBackend>],
    profile: &Profile,
    requirements: &Requirements,
    ctx: &ResolveContext,
    max_offers: Option<usize>,
) -> Vec<(Arc<dyn ComputeBackend>, InstanceOffer)> {
    let mut results: Vec<(Arc<dyn ComputeBackend>, InstanceOffer)> = Vec::new();

    for backend in backends {
        if !backend_eligible(backend.as_ref(), profile, requirements, ctx) {
            debug!(backend = backend.name(), "backend excluded by capability/constraint");
            continue;
        }

        let offers = match backend.get_offers(requirements).await {
            Ok(offers) => offers,
            Err(e) => {
                warn!(backend = backend.name(), error = %e, "offer query failed; skipping backend");
                continue;
            }
        };

        for offer in offers {
            let Some(offer) = filter_offer(offer, profile, ctx) else {
                continue;
            };
            if !gpus_allowed(&offer, &requirements.resources.gpu) {
                continue;
            }
            let Some(offer) = split_into_blocks(offer, requirements.resources.blocks) else {
                continue;
            };
            results.push((backend.clone(), offer));
        }
    }

    if let Some(cap) = max_offers {
        results.truncate(cap);
    }
    // Stable: equal availability keeps backend-query order.
    results.sort_by_key(|(_, offer)| !offer.availability.is_available());
    results
}

/// Capability/constraint narrowing of the candidate backend set
/// (each requirement applies independently).
fn backend_eligible(
    backend: &dyn ComputeBackend,
    profile: &Profile,
    requirements: &Requirements,
    ctx: &ResolveContext,
) -> bool {
    if let Some(allowed) = &profile.backends
        && !allowed.iter().any(|b| b == backend.name())
    {
        return false;
    }

    let caps = backend.capabilities();
    if ctx.multinode && !caps.multinode {
        return false;
    }
    if ctx.privileged && !caps.privileged {
        return false;
    }
    if ctx.requires_instance_volumes && !caps.create_instance {
        return false;
    }
    if requirements.reservation.is_some() && !caps.reservations {
        return false;
    }
    if let Some((master_backend, _)) = &ctx.master
        && master_backend != backend.name()
    {
        return false;
    }
    if !ctx.volume_pins.is_empty()
        && !ctx.volume_pins.iter().any(|(b, _)| b == backend.name())
    {
        return false;
    }
    true
}

/// Apply profile allow-lists and placement constraints to one offer.
///
/// Zone restriction narrows the offer's zone list to the intersection
/// with the allowed set; the offer is dropped only when the intersection
/// is empty.
fn filter_offer(
    mut offer: InstanceOffer,
    profile: &Profile,
    ctx: &ResolveContext,
) -> Option<InstanceOffer> {
    if let Some(regions) = &profile.regions
        && !regions.iter().any(|r| r == &offer.region)
    {
        return None;
    }
    if let Some(types) = &profile.instance_types
        && !types.iter().any(|t| t == &offer.instance.name)
    {
        return None;
    }
    if let Some((_, master_region)) = &ctx.master
        && master_region != &offer.region
    {
        return None;
    }
    if !ctx.volume_pins.is_empty()
        && !ctx
            .volume_pins
            .iter()
            .any(|(b, r)| b == &offer.backend && r == &offer.region)
    {
        return None;
    }
    if let Some(group) = &ctx.placement_group
        && (group.backend != offer.backend || group.region != offer.region)
    {
        return None;
    }

    if let Some(allowed_zones) = &profile.availability_zones {
        match offer.availability_zones.take() {
            Some(zones) => {
                let narrowed: Vec<String> = zones
                    .into_iter()
                    .filter(|z| allowed_zones.contains(z))
                    .collect();
                if narrowed.is_empty() {
                    return None;
                }
                offer.availability_zones = Some(narrowed);
            }
            // Offer valid in all zones of the region: narrow to the allowed set.
            None => offer.availability_zones = Some(allowed_zones.clone()),
        }
    }

    Some(offer)
}

/// GPU name/vendor allow-lists, re-checked resolver-side since backend
/// offer queries may serve cached results.
fn gpus_allowed(offer: &InstanceOffer, spec: &stratus_state::GpuSpec) -> bool {
    let gpus = &offer.instance.resources.gpus;
    if let Some(names) = &spec.names
        && !gpus.iter().all(|g| names.iter().any(|n| n == &g.name))
    {
        return false;
    }
    if let Some(vendors) = &spec.vendors
        && !gpus.iter().all(|g| vendors.contains(&g.vendor))
    {
        return false;
    }
    true
}

/// GPU count for divisibility checks. Accelerators that cannot be
/// subdivided (TPU-like) count as 1.
fn divisible_gpu_count(offer: &InstanceOffer) -> u32 {
    let gpus = &offer.instance.resources.gpus;
    if gpus.iter().any(|g| g.vendor == GpuVendor::Google) {
        1
    } else {
        gpus.len() as u32
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

/// Fractional-allocation pass: split an offer into blocks if its CPU and
/// GPU counts divide evenly, producing a proportionally scaled-down offer
/// tagged `(blocks, total_blocks)`. Returns the offer unchanged for
/// `BlockCount::Whole`, or `None` if the requested split is impossible.
fn split_into_blocks(offer: InstanceOffer, requested: BlockCount) -> Option<InstanceOffer> {
    let cpus = offer.instance.resources.cpus;
    let gpu_count = divisible_gpu_count(&offer);

    let total = match requested {
        BlockCount::Whole => return Some(offer),
        BlockCount::Exact(n) => n,
        BlockCount::Auto => {
            if gpu_count == 0 {
                cpus
            } else {
                gcd(cpus, gpu_count)
            }
        }
    };
    if total == 0 {
        return None;
    }
    if total == 1 {
        return Some(offer);
    }
    if cpus % total != 0 {
        return None;
    }
    if gpu_count != 0 && gpu_count % total != 0 {
        return None;
    }

    let mut scaled = offer;
    let resources = &mut scaled.instance.resources;
    resources.cpus /= total;
    resources.memory_mb /= u64::from(total);
    let keep = resources.gpus.len() / total as usize;
    resources.gpus.truncate(keep);
    scaled.price /= f64::from(total);
    scaled.blocks = 1;
    scaled.total_blocks = total;
    Some(scaled)
}
