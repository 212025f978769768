//! redb table definitions for the Stratus state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Jobs use composite `{run_id}:{job_id}` keys so a run's jobs can
//! be enumerated with a prefix scan.

use redb::TableDefinition;

/// Run specs keyed by `{run_id}`.
pub const RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("runs");

/// Job rows keyed by `{run_id}:{job_id}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");
