//! Requirement/profile combination algebra.
//!
//! Fleet-level and run-level constraints are combined field by field into
//! the effective constraint set. Combinators are pure and total except
//! where two sides are mutually exclusive, which is a typed
//! `CombineError` — callers must treat the pair as un-schedulable and
//! surface it, never silently pick one side.

use thiserror::Error;

use stratus_state::{
    BlockCount, GpuSpec, Profile, Range, Requirements, ResourcesSpec, SpotPolicy,
};

/// A fleet/run constraint pair that cannot be reconciled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CombineError {
    #[error("no overlap for {field}")]
    EmptyRange { field: &'static str },

    #[error("spot mismatch: {left} vs {right}")]
    SpotMismatch { left: bool, right: bool },

    #[error("spot policy mismatch: {left:?} vs {right:?}")]
    SpotPolicyMismatch { left: SpotPolicy, right: SpotPolicy },

    #[error("reservation mismatch: {left} vs {right}")]
    ReservationMismatch { left: String, right: String },

    #[error("idle duration sign mismatch: {left} vs {right}")]
    IdleDurationMismatch { left: i64, right: i64 },

    #[error("block count mismatch")]
    BlockCountMismatch,
}

/// Intersect two optional allow-lists. `None` means unconstrained and
/// yields the other side unchanged; left-side order is preserved.
fn intersect_list<T: Clone + PartialEq>(
    left: &Option<Vec<T>>,
    right: &Option<Vec<T>>,
) -> Option<Vec<T>> {
    match (left, right) {
        (None, None) => None,
        (Some(l), None) => Some(l.clone()),
        (None, Some(r)) => Some(r.clone()),
        (Some(l), Some(r)) => Some(l.iter().filter(|v| r.contains(v)).cloned().collect()),
    }
}

fn intersect_range<T: Copy + Ord>(
    left: &Range<T>,
    right: &Range<T>,
    field: &'static str,
) -> Result<Range<T>, CombineError> {
    left.intersect(right)
        .ok_or(CombineError::EmptyRange { field })
}

/// Most restrictive price cap wins.
fn combine_max_price(left: Option<f64>, right: Option<f64>) -> Option<f64> {
    match (left, right) {
        (Some(l), Some(r)) => Some(l.min(r)),
        (l, r) => l.or(r),
    }
}

/// Combine concrete spot requirements: equal or one-sided.
fn combine_spot(left: Option<bool>, right: Option<bool>) -> Result<Option<bool>, CombineError> {
    match (left, right) {
        (Some(l), Some(r)) if l != r => Err(CombineError::SpotMismatch { left: l, right: r }),
        (l, r) => Ok(l.or(r)),
    }
}

/// `Auto` yields to the other side; two differing concrete policies conflict.
fn combine_spot_policy(left: SpotPolicy, right: SpotPolicy) -> Result<SpotPolicy, CombineError> {
    match (left, right) {
        (SpotPolicy::Auto, other) | (other, SpotPolicy::Auto) => Ok(other),
        (l, r) if l == r => Ok(l),
        (l, r) => Err(CombineError::SpotPolicyMismatch { left: l, right: r }),
    }
}

/// Equal if both set, else whichever is set.
fn combine_reservation(
    left: &Option<String>,
    right: &Option<String>,
) -> Result<Option<String>, CombineError> {
    match (left, right) {
        (Some(l), Some(r)) if l != r => Err(CombineError::ReservationMismatch {
            left: l.clone(),
            right: r.clone(),
        }),
        (l, r) => Ok(l.clone().or_else(|| r.clone())),
    }
}

/// Minimum idle duration, but a negative value ("never terminate") cannot
/// be combined with a non-negative one — the sign mismatch signals
/// incompatible intent.
fn combine_idle_duration(
    left: Option<i64>,
    right: Option<i64>,
) -> Result<Option<i64>, CombineError> {
    match (left, right) {
        (Some(l), Some(r)) if (l < 0) != (r < 0) => {
            Err(CombineError::IdleDurationMismatch { left: l, right: r })
        }
        (Some(l), Some(r)) => Ok(Some(l.min(r))),
        (l, r) => Ok(l.or(r)),
    }
}

/// `Whole` yields to the other side; two differing concrete counts conflict.
fn combine_blocks(left: BlockCount, right: BlockCount) -> Result<BlockCount, CombineError> {
    match (left, right) {
        (BlockCount::Whole, other) | (other, BlockCount::Whole) => Ok(other),
        (l, r) if l == r => Ok(l),
        _ => Err(CombineError::BlockCountMismatch),
    }
}

/// Combine two GPU specs. Vendor/name allow-lists intersect; the compute
/// capability floor takes the higher of the two.
fn combine_gpu(left: &GpuSpec, right: &GpuSpec) -> Result<GpuSpec, CombineError> {
    let compute_capability = match (left.compute_capability, right.compute_capability) {
        (Some(l), Some(r)) => Some(l.max(r)),
        (l, r) => l.or(r),
    };
    Ok(GpuSpec {
        count: intersect_range(&left.count, &right.count, "gpu.count")?,
        memory_mb: intersect_range(&left.memory_mb, &right.memory_mb, "gpu.memory_mb")?,
        vendors: intersect_list(&left.vendors, &right.vendors),
        names: intersect_list(&left.names, &right.names),
        compute_capability,
    })
}

/// Combine two hardware resource specs field by field.
pub fn combine_resources(
    left: &ResourcesSpec,
    right: &ResourcesSpec,
) -> Result<ResourcesSpec, CombineError> {
    Ok(ResourcesSpec {
        cpu: intersect_range(&left.cpu, &right.cpu, "cpu")?,
        memory_mb: intersect_range(&left.memory_mb, &right.memory_mb, "memory_mb")?,
        gpu: combine_gpu(&left.gpu, &right.gpu)?,
        disk_gb: intersect_range(&left.disk_gb, &right.disk_gb, "disk_gb")?,
        blocks: combine_blocks(left.blocks, right.blocks)?,
    })
}

/// Combine fleet-level and run-level requirements into the effective set.
pub fn combine_requirements(
    fleet: &Requirements,
    run: &Requirements,
) -> Result<Requirements, CombineError> {
    Ok(Requirements {
        resources: combine_resources(&fleet.resources, &run.resources)?,
        max_price: combine_max_price(fleet.max_price, run.max_price),
        spot: combine_spot(fleet.spot, run.spot)?,
        reservation: combine_reservation(&fleet.reservation, &run.reservation)?,
    })
}

/// Combine fleet-level and run-level profiles into the effective profile.
///
/// Tags are a dictionary union with the run side winning on collisions.
pub fn combine_profiles(fleet: &Profile, run: &Profile) -> Result<Profile, CombineError> {
    let mut tags = fleet.tags.clone();
    tags.extend(run.tags.clone());

    Ok(Profile {
        backends: intersect_list(&fleet.backends, &run.backends),
        regions: intersect_list(&fleet.regions, &run.regions),
        availability_zones: intersect_list(&fleet.availability_zones, &run.availability_zones),
        instance_types: intersect_list(&fleet.instance_types, &run.instance_types),
        spot_policy: combine_spot_policy(fleet.spot_policy, run.spot_policy)?,
        max_price: combine_max_price(fleet.max_price, run.max_price),
        idle_duration_secs: combine_idle_duration(fleet.idle_duration_secs, run.idle_duration_secs)?,
        reservation: combine_reservation(&fleet.reservation, &run.reservation)?,
        tags,
    })
}
