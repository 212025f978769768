//! Lock heartbeating for checked-out work items.
//!
//! The heartbeater tracks every item the dispatcher currently has in
//! flight and keeps its lock alive with conditional renewals, so another
//! dispatcher process cannot steal the row mid-processing.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use stratus_state::epoch_ms;

use crate::source::{WorkItem, WorkSource};

/// Tracks in-flight items and renews their locks.
///
/// The tracked map is the only shared mutable state inside a dispatcher
/// process; the fetch loop, workers, and the heartbeat tick all touch it
/// through the internal async mutex.
pub struct Heartbeater<I: WorkItem> {
    tracked: Mutex<HashMap<Uuid, I>>,
}

impl<I: WorkItem> Heartbeater<I> {
    pub fn new() -> Self {
        Self {
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Start heartbeating an item the fetcher just claimed.
    pub async fn track(&self, item: I) {
        let mut tracked = self.tracked.lock().await;
        tracked.insert(item.item_id(), item);
    }

    /// Stop heartbeating an item (processing finished, either way).
    pub async fn untrack(&self, id: Uuid) {
        let mut tracked = self.tracked.lock().await;
        tracked.remove(&id);
    }

    /// Number of items currently tracked.
    pub async fn tracked_count(&self) -> usize {
        self.tracked.lock().await.len()
    }

    /// One heartbeat pass: sweep expired items, renew those close to expiry.
    ///
    /// Items whose lock already lapsed are dropped with a warning — they
    /// are presumed reclaimed by another dispatcher (or abandoned for the
    /// next fetch cycle). Items within `margin` of expiry get a conditional
    /// renewal; a zero-row renewal is logged and the item is deliberately
    /// left tracked, because untracking here would race a freshly started
    /// iteration holding a different token. The next expiry sweep removes
    /// it instead.
    pub async fn tick<S>(&self, source: &S, lock_timeout: Duration, margin: Duration)
    where
        S: WorkSource<Item = I>,
    {
        let now = epoch_ms();
        let margin_ms = margin.as_millis() as u64;
        let mut tracked = self.tracked.lock().await;

        let expired: Vec<Uuid> = tracked
            .values()
            .filter(|item| item.lock_expires_at() < now)
            .map(|item| item.item_id())
            .collect();
        for id in expired {
            warn!(item_id = %id, "lock expired while in flight; dropping from heartbeat");
            tracked.remove(&id);
        }

        for item in tracked.values_mut() {
            if item.lock_expires_at().saturating_sub(now) > margin_ms {
                continue;
            }
            match source.renew(item, lock_timeout) {
                Ok(true) => {
                    item.set_lock_expires_at(now + lock_timeout.as_millis() as u64);
                    debug!(item_id = %item.item_id(), "lock renewed");
                }
                Ok(false) => {
                    // Someone else's token is on the row. Leave the item
                    // tracked; the expiry sweep will take it out.
                    warn!(
                        item_id = %item.item_id(),
                        "lock renewal affected no rows; item no longer owned"
                    );
                }
                Err(e) => {
                    warn!(item_id = %item.item_id(), error = %e, "lock renewal failed");
                }
            }
        }
    }
}

impl<I: WorkItem> Default for Heartbeater<I> {
    fn default() -> Self {
        Self::new()
    }
}
