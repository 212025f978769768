//! LockedDispatcher — fetch, heartbeat, and process persisted work items.
//!
//! Gives an at-most-one-concurrent-owner processing guarantee over a large
//! backlog of persisted items without any coordinator beyond the storage
//! layer's conditional updates:
//!
//! - the fetch loop claims unlocked items into a bounded queue
//! - the heartbeat loop keeps in-flight locks alive
//! - worker loops pull from the queue and run the process callback
//!
//! Multiple dispatcher processes can run the same pipeline concurrently
//! across a fleet; lock tokens keep them from processing the same row.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::heartbeat::Heartbeater;
use crate::source::{WorkItem, WorkSource};

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>;

/// The pluggable processing callback invoked for each claimed item.
pub type ProcessFn<I> = Arc<dyn Fn(I) -> BoxFuture + Send + Sync>;

/// Tunables for a dispatcher pipeline.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Concurrent worker loops.
    pub workers: usize,
    /// How long a claimed lock is valid before renewal.
    pub lock_timeout: Duration,
    /// Heartbeat sweep period.
    pub heartbeat_period: Duration,
    /// Renew locks within this margin of expiry. Must comfortably exceed
    /// the heartbeat period.
    pub heartbeat_margin: Duration,
    /// Fetch while queue size < ceil(workers * lower_limit_factor).
    pub lower_limit_factor: f64,
    /// Queue capacity = ceil(workers * upper_limit_factor).
    pub upper_limit_factor: f64,
    /// Delay ladder walked on consecutive empty fetches.
    pub empty_fetch_backoff: Vec<Duration>,
    /// Jitter fraction applied to each backoff step (±).
    pub backoff_jitter: f64,
    /// Poll period while the queue is saturated.
    pub queue_poll: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            lock_timeout: Duration::from_secs(60),
            heartbeat_period: Duration::from_secs(1),
            heartbeat_margin: Duration::from_secs(30),
            lower_limit_factor: 2.0,
            upper_limit_factor: 4.0,
            empty_fetch_backoff: vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
            backoff_jitter: 0.2,
            queue_poll: Duration::from_millis(100),
        }
    }
}

impl DispatcherConfig {
    fn queue_capacity(&self) -> usize {
        ((self.workers as f64) * self.upper_limit_factor).ceil() as usize
    }

    fn fetch_threshold(&self) -> usize {
        ((self.workers as f64) * self.lower_limit_factor).ceil() as usize
    }

    /// The jittered backoff delay after `empty_count` consecutive empty
    /// fetches (1-based). An empty ladder falls back to the queue poll
    /// period.
    fn backoff_delay(&self, empty_count: u32) -> Duration {
        if self.empty_fetch_backoff.is_empty() {
            return self.queue_poll;
        }
        let idx = (empty_count.saturating_sub(1) as usize).min(self.empty_fetch_backoff.len() - 1);
        let base = self.empty_fetch_backoff[idx];
        let factor =
            rand::thread_rng().gen_range(1.0 - self.backoff_jitter..=1.0 + self.backoff_jitter);
        base.mul_f64(factor)
    }
}

/// A running dispatcher pipeline over one work source.
pub struct LockedDispatcher<S: WorkSource> {
    source: Arc<S>,
    process: ProcessFn<S::Item>,
    config: DispatcherConfig,
    heartbeater: Arc<Heartbeater<S::Item>>,
    /// Ids currently queued or being processed in this process. Guards
    /// against double-queueing; scoped to this dispatcher instance.
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    /// Debounced wakeup for the fetch loop.
    hint: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<S: WorkSource> LockedDispatcher<S> {
    pub fn new(source: S, process: ProcessFn<S::Item>, config: DispatcherConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            source: Arc::new(source),
            process,
            config,
            heartbeater: Arc::new(Heartbeater::new()),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            hint: Arc::new(Notify::new()),
            shutdown_tx,
            shutdown_rx,
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the fetch loop, the heartbeat loop, and the worker loops.
    pub fn start(&self) {
        let capacity = self.config.queue_capacity().max(1);
        let (tx, rx) = mpsc::channel::<S::Item>(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());

        handles.push(tokio::spawn(fetch_loop(
            self.source.clone(),
            self.heartbeater.clone(),
            self.in_flight.clone(),
            self.hint.clone(),
            tx,
            self.config.clone(),
            self.shutdown_rx.clone(),
        )));

        handles.push(tokio::spawn(heartbeat_loop(
            self.source.clone(),
            self.heartbeater.clone(),
            self.config.clone(),
            self.shutdown_rx.clone(),
        )));

        for worker_id in 0..self.config.workers {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                self.source.clone(),
                self.heartbeater.clone(),
                self.in_flight.clone(),
                self.process.clone(),
                rx.clone(),
                self.shutdown_rx.clone(),
            )));
        }

        info!(workers = self.config.workers, capacity, "dispatcher started");
    }

    /// Wake the fetch loop immediately instead of waiting out its backoff.
    ///
    /// Hints are debounced: multiple hints before the fetcher consumes one
    /// collapse into a single wakeup, and a hint is never a guarantee that
    /// a fetch observes the new row.
    pub fn hint(&self) {
        self.hint.notify_one();
    }

    /// Cooperative shutdown: flips the running flag and waits for all
    /// loops to finish. In-flight process calls run to completion.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.hint.notify_waiters();

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("dispatcher stopped");
    }

    /// Number of items currently heartbeated by this dispatcher.
    pub async fn in_flight_count(&self) -> usize {
        self.heartbeater.tracked_count().await
    }
}

/// Claims eligible items into the bounded queue, backing off on empty
/// fetches and waking early on hints.
async fn fetch_loop<S: WorkSource>(
    source: Arc<S>,
    heartbeater: Arc<Heartbeater<S::Item>>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    hint: Arc<Notify>,
    tx: mpsc::Sender<S::Item>,
    config: DispatcherConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut empty_count: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let queued = tx.max_capacity() - tx.capacity();
        if queued >= config.fetch_threshold() {
            // Queue is full enough; idle briefly.
            tokio::select! {
                _ = tokio::time::sleep(config.queue_poll) => {}
                _ = shutdown.changed() => break,
            }
            continue;
        }

        let limit = config.queue_capacity() - queued;
        let claimed = match source.claim(limit, config.lock_timeout) {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "claim failed");
                Vec::new()
            }
        };

        if claimed.is_empty() {
            empty_count += 1;
            let delay = config.backoff_delay(empty_count);
            debug!(empty_count, ?delay, "no eligible items; backing off");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = hint.notified() => {
                    debug!("fetch hint received");
                }
                _ = shutdown.changed() => break,
            }
            continue;
        }

        empty_count = 0;
        for item in claimed {
            let id = item.item_id();
            {
                let mut in_flight = in_flight.lock().await;
                if !in_flight.insert(id) {
                    // Already queued or processing in this instance.
                    debug!(item_id = %id, "item already in flight; skipping");
                    continue;
                }
            }
            heartbeater.track(item.clone()).await;
            if tx.send(item).await.is_err() {
                // Workers are gone; we are shutting down.
                heartbeater.untrack(id).await;
                in_flight.lock().await.remove(&id);
                return;
            }
        }
    }
}

/// Periodically sweeps and renews in-flight locks.
async fn heartbeat_loop<S: WorkSource>(
    source: Arc<S>,
    heartbeater: Arc<Heartbeater<S::Item>>,
    config: DispatcherConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.heartbeat_period) => {
                heartbeater
                    .tick(source.as_ref(), config.lock_timeout, config.heartbeat_margin)
                    .await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Pulls items from the queue and runs the process callback. Errors are
/// logged and swallowed — a failing item never takes the loop down.
async fn worker_loop<S: WorkSource>(
    worker_id: usize,
    source: Arc<S>,
    heartbeater: Arc<Heartbeater<S::Item>>,
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
    process: ProcessFn<S::Item>,
    rx: Arc<Mutex<mpsc::Receiver<S::Item>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let item = {
            let mut rx = rx.lock().await;
            tokio::select! {
                item = rx.recv() => item,
                _ = shutdown.changed() => None,
            }
        };
        let Some(item) = item else {
            debug!(worker_id, "worker loop exiting");
            break;
        };

        let id = item.item_id();
        debug!(worker_id, item_id = %id, "processing item");

        // The callback runs in its own task: a panic surfaces as a join
        // error here instead of killing the worker loop, and the
        // untrack/release below always runs.
        match tokio::spawn((process)(item.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(worker_id, item_id = %id, error = %e, "processing failed");
            }
            Err(e) => {
                error!(worker_id, item_id = %id, error = %e, "processing panicked");
            }
        }

        // Release tracking regardless of outcome.
        heartbeater.untrack(id).await;
        if let Err(e) = source.release(&item) {
            warn!(item_id = %id, error = %e, "lock release failed");
        }
        in_flight.lock().await.remove(&id);
    }
}
