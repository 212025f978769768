//! stratus-offers — constraint algebra and offer resolution.
//!
//! Two pieces, both consumed by the orchestrator and by plan-preview
//! paths:
//!
//! - `combine`: pure field-by-field combination of fleet- and run-level
//!   profiles/requirements into the effective constraint set, with a
//!   typed `CombineError` for mutually exclusive pairs.
//! - `resolver`: capability narrowing of the backend set, per-backend
//!   offer queries, profile allow-list filtering, zone narrowing,
//!   fractional block splitting, and availability-aware ordering.
//!
//! The `ComputeBackend` trait is the only view the core has of a cloud
//! provider; SDK clients implement it out of tree.

pub mod backend;
pub mod combine;
pub mod resolver;

pub use backend::{BackendCapabilities, BoxFuture, ComputeBackend};
pub use combine::{CombineError, combine_profiles, combine_requirements, combine_resources};
pub use resolver::{PlacementGroup, ResolveContext, resolve_offers};
