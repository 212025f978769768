//! stratus-dispatch — the locked work-dispatch primitive.
//!
//! Every Stratus background pipeline (jobs today; volumes and probes are
//! built the same way) is an instance of the `LockedDispatcher`:
//!
//! ```text
//! LockedDispatcher
//!   ├── fetch loop      claim unlocked items → bounded queue
//!   ├── heartbeat loop  renew in-flight locks (conditional updates)
//!   └── worker loops    queue → process(item) → untrack + release
//! ```
//!
//! Back-pressure comes from the queue bounds: the fetcher stops claiming
//! once `ceil(workers * lower_limit_factor)` items are queued, and the
//! queue holds at most `ceil(workers * upper_limit_factor)`. That bounds
//! memory and caps how many locks each heartbeat sweep has to renew.
//!
//! Ordering across items is best-effort FIFO by fetch time only; requeues
//! and backoff can reorder. Shutdown is cooperative — loops check a flag
//! between iterations and in-flight process calls finish first.

pub mod dispatcher;
pub mod heartbeat;
pub mod source;

pub use dispatcher::{DispatcherConfig, LockedDispatcher, ProcessFn};
pub use heartbeat::Heartbeater;
pub use source::{JobSource, WorkItem, WorkSource};
