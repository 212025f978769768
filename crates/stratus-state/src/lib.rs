//! stratus-state — embedded state store for the Stratus control plane.
//!
//! Persists runs and their job rows in redb and exposes the two lock
//! primitives every pipeline dispatcher builds on:
//!
//! - `claim_jobs`: atomically assign a fresh lock token to eligible rows
//! - `renew_lock`: conditional `WHERE id=? AND lock_token=?` renewal
//!
//! Mutual exclusion across dispatcher processes rests entirely on these
//! row-level conditional updates — there is no separate lock service.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
