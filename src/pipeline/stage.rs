//! Generic concurrent pipeline stage.
//!
//! A `PipelineStage` turns a fallible processing function into a managed
//! worker pool:
//!
//! - Unbounded intake: `receive` never blocks past an O(1) enqueue
//! - Token-bucket admission for fresh items (backpressure lives in the
//!   rate limiter, not in caller blocking)
//! - Exponential backoff on transient failures, keyed per item
//! - Optional downstream stage that successful results are forwarded to
//! - Graceful shutdown with a broadcast channel
//!
//! Failures are classified by the handler: `Transient` errors retry
//! forever with growing delay, `Terminal` errors drop the item after the
//! handler has recorded the outcome itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::limiter::AdmissionGate;

/// Errors returned by stage processing functions.
///
/// The variant decides what the stage does with the item afterwards.
#[derive(Debug, Error)]
pub enum StageError {
    /// Retryable failure: the item is re-enqueued with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Non-retryable failure: the item is forgotten. The handler is
    /// expected to have persisted any terminal state before returning this.
    #[error("terminal failure: {0}")]
    Terminal(String),
}

impl StageError {
    /// Wraps an error as a transient (retryable) stage failure.
    pub fn transient(err: impl std::fmt::Display) -> Self {
        StageError::Transient(err.to_string())
    }

    /// Wraps an error as a terminal (non-retryable) stage failure.
    pub fn terminal(err: impl std::fmt::Display) -> Self {
        StageError::Terminal(err.to_string())
    }
}

/// Identity used for per-item retry bookkeeping.
pub trait StageKey {
    /// Stable key for this item; backoff history is tracked under it.
    fn stage_key(&self) -> String;
}

/// Processing function of a stage.
#[async_trait]
pub trait StageHandler<I>: Send + Sync {
    /// Result type forwarded to the downstream stage on success.
    type Output: Send + 'static;

    async fn handle(&self, item: I) -> Result<Self::Output, StageError>;
}

/// Accepts items into a stage. Implemented by [`StageSender`] so stages
/// can be chained without knowing each other's concrete types.
pub trait StageInlet<T>: Send + Sync {
    /// Enqueues an item; never blocks.
    fn receive(&self, item: T);
}

/// Configuration shared by the stage's workers.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Base delay applied after an item's first transient failure.
    pub failure_base_delay: Duration,
    /// Upper bound for the exponential backoff delay.
    pub failure_max_delay: Duration,
    /// Fresh-item admissions per second.
    pub rate_per_second: usize,
    /// Instantaneous admission burst.
    pub burst: usize,
    /// Number of concurrent workers.
    pub workers: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            failure_base_delay: Duration::from_millis(100),
            failure_max_delay: Duration::from_secs(30),
            rate_per_second: 10,
            burst: 10,
            workers: 2,
        }
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Default)]
pub struct StageStats {
    processed: AtomicU64,
    transient_failures: AtomicU64,
    terminal_failures: AtomicU64,
}

impl StageStats {
    /// Items processed successfully.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Attempts that failed with a transient error and were re-enqueued.
    pub fn transient_failures(&self) -> u64 {
        self.transient_failures.load(Ordering::Relaxed)
    }

    /// Items dropped after a terminal error.
    pub fn terminal_failures(&self) -> u64 {
        self.terminal_failures.load(Ordering::Relaxed)
    }
}

/// Cloneable intake handle for a stage.
pub struct StageSender<I> {
    stage_name: String,
    tx: mpsc::UnboundedSender<Envelope<I>>,
}

impl<I> Clone for StageSender<I> {
    fn clone(&self) -> Self {
        Self {
            stage_name: self.stage_name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<I: Send + 'static> StageInlet<I> for StageSender<I> {
    fn receive(&self, item: I) {
        if self
            .tx
            .send(Envelope {
                item,
                is_retry: false,
            })
            .is_err()
        {
            warn!(stage = %self.stage_name, "item dropped: stage has shut down");
        }
    }
}

struct Envelope<I> {
    item: I,
    is_retry: bool,
}

/// A rate-limited, retrying worker-pool stage.
pub struct PipelineStage<I, O> {
    name: String,
    config: StageConfig,
    gate: Arc<AdmissionGate>,
    handler: Arc<dyn StageHandler<I, Output = O>>,
    downstream: Option<Arc<dyn StageInlet<O>>>,
    tx: mpsc::UnboundedSender<Envelope<I>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope<I>>>>,
    failures: Arc<Mutex<HashMap<String, u32>>>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<StageStats>,
}

impl<I, O> PipelineStage<I, O>
where
    I: StageKey + Clone + Send + 'static,
    O: Send + 'static,
{
    /// Creates a stage. Workers do not run until [`PipelineStage::start`].
    pub fn new(
        name: impl Into<String>,
        config: StageConfig,
        handler: Arc<dyn StageHandler<I, Output = O>>,
        downstream: Option<Arc<dyn StageInlet<O>>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            name: name.into(),
            gate: Arc::new(AdmissionGate::new(config.rate_per_second, config.burst)),
            config,
            handler,
            downstream,
            tx,
            rx: Mutex::new(Some(rx)),
            failures: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
            worker_handles: Mutex::new(Vec::new()),
            stats: Arc::new(StageStats::default()),
        }
    }

    /// Returns a cloneable intake handle usable before and after `start`.
    pub fn sender(&self) -> StageSender<I> {
        StageSender {
            stage_name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }

    /// Stage name used in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stage counters.
    pub fn stats(&self) -> Arc<StageStats> {
        Arc::clone(&self.stats)
    }

    /// Launches the configured number of worker loops.
    ///
    /// Calling `start` twice is a no-op (logged at warn).
    pub fn start(self: &Arc<Self>) {
        let rx = {
            let mut slot = self.rx.lock().expect("stage receiver lock poisoned");
            match slot.take() {
                Some(rx) => rx,
                None => {
                    warn!(stage = %self.name, "stage already started");
                    return;
                }
            }
        };

        let rx = Arc::new(AsyncMutex::new(rx));
        let mut handles = self
            .worker_handles
            .lock()
            .expect("stage handle lock poisoned");

        for worker in 0..self.config.workers.max(1) {
            let stage = Arc::clone(self);
            let rx = Arc::clone(&rx);
            let shutdown = self.shutdown_tx.subscribe();

            handles.push(tokio::spawn(async move {
                stage.worker_loop(worker, rx, shutdown).await;
            }));
        }

        info!(
            stage = %self.name,
            workers = self.config.workers.max(1),
            rate = self.config.rate_per_second,
            burst = self.config.burst,
            "pipeline stage started"
        );
    }

    /// Signals all workers to stop and waits for in-flight attempts to
    /// finish. Queued-but-undelivered retries are dropped.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        let handles: Vec<JoinHandle<()>> = {
            let mut slot = self
                .worker_handles
                .lock()
                .expect("stage handle lock poisoned");
            slot.drain(..).collect()
        };

        for handle in handles {
            if let Err(e) = handle.await {
                error!(stage = %self.name, error = %e, "stage worker panicked during shutdown");
            }
        }

        info!(stage = %self.name, "pipeline stage stopped");
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker: usize,
        rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Envelope<I>>>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        debug!(stage = %self.name, worker, "stage worker started");

        loop {
            let envelope = {
                let mut guard = rx.lock().await;
                tokio::select! {
                    _ = shutdown.recv() => None,
                    env = guard.recv() => env,
                }
            };

            let Some(envelope) = envelope else {
                break;
            };

            // Fresh items pass the admission gate; retries already paid
            // their backoff delay.
            if !envelope.is_retry {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = self.gate.acquire() => {}
                }
            }

            self.attempt(worker, envelope).await;
        }

        debug!(stage = %self.name, worker, "stage worker stopped");
    }

    async fn attempt(&self, worker: usize, envelope: Envelope<I>) {
        let key = envelope.item.stage_key();
        let item = envelope.item.clone();

        match self.handler.handle(envelope.item).await {
            Ok(output) => {
                self.forget(&key);
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                if let Some(downstream) = &self.downstream {
                    downstream.receive(output);
                }
            }
            Err(StageError::Transient(reason)) => {
                self.stats.transient_failures.fetch_add(1, Ordering::Relaxed);
                let delay = self.next_delay(&key);
                warn!(
                    stage = %self.name,
                    worker,
                    key = %key,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "transient failure, re-enqueueing with backoff"
                );

                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // Send failure means the stage shut down; the retry is
                    // dropped, which is the documented cancellation behavior.
                    let _ = tx.send(Envelope {
                        item,
                        is_retry: true,
                    });
                });
            }
            Err(StageError::Terminal(reason)) => {
                self.forget(&key);
                self.stats.terminal_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    stage = %self.name,
                    worker,
                    key = %key,
                    reason = %reason,
                    "terminal failure, dropping item"
                );
            }
        }
    }

    /// Records one more failure for `key` and returns the backoff delay:
    /// `min(base * 2^(failures - 1), max)`.
    fn next_delay(&self, key: &str) -> Duration {
        let failures = {
            let mut failures = self.failures.lock().expect("stage failure lock poisoned");
            let count = failures.entry(key.to_string()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };

        let exponent = failures.saturating_sub(1).min(32);
        let delay = self
            .config
            .failure_base_delay
            .saturating_mul(1u32 << exponent.min(31));
        delay.min(self.config.failure_max_delay)
    }

    fn forget(&self, key: &str) {
        self.failures
            .lock()
            .expect("stage failure lock poisoned")
            .remove(key);
    }
}
