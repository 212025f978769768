//! stratus-scale — replica reconciliation for service runs.
//!
//! An external autoscaling control loop decides the desired replica
//! count (clamped to the run's replica range); this crate turns the
//! signed difference into job-row changes. The dispatcher and
//! orchestrator do the actual provisioning and teardown.

pub mod scaler;

pub use scaler::{ScalePlan, apply_plan, scale};
