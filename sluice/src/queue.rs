//! Per-source admission queues and the capacity reconcile task.
//!
//! ## Metrics
//!
//! `weightedqueue_dropped_batches_total{source}`: Batches dropped by capacity limits
//! `weightedqueue_queue_length{source}`: Current queue length per source
//!
//! Admission applies a two-level limit: a global occupancy ceiling that
//! protects the downstream, and a per-source cap that keeps any one source
//! from monopolising the buffer pool between reconciles. The reconcile task
//! realigns the queue set and the per-queue caps with the weight table every
//! [`RECONCILE_INTERVAL`].

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};

use crate::{batch::Batch, control::Control};

/// Period of the reconcile pass.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

/// Errors surfaced to the host by [`QueueManager::admit`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum AdmitError {
    /// Global occupancy is at the configured ceiling. Retryable
    /// backpressure: the host may re-offer the batch once the dispatcher has
    /// drained.
    #[error("global queue full: backpressure, occupancy at {capacity}")]
    GlobalFull {
        /// The configured global capacity.
        capacity: usize,
    },
}

/// A bounded FIFO of batches with a mutable capacity.
///
/// The buffer owns its stored batches exclusively until dequeue. All
/// operations take the buffer's own lock; critical sections are amortised
/// O(1) except for `set_cap` and `close`, which are O(dropped).
#[derive(Debug)]
pub struct SourceQueue {
    inner: Mutex<QueueInner>,
}

#[derive(Debug)]
struct QueueInner {
    items: VecDeque<Batch>,
    cap: usize,
}

impl SourceQueue {
    fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                cap,
            }),
        }
    }

    /// Append a batch, refusing when the buffer is at capacity.
    fn push(&self, batch: Batch) -> bool {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.items.len() >= inner.cap {
            return false;
        }
        inner.items.push_back(batch);
        true
    }

    /// Pop the oldest batch, if any.
    fn pop(&self) -> Option<Batch> {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .items
            .pop_front()
    }

    /// The current number of buffered batches.
    ///
    /// # Panics
    ///
    /// Panics if the queue lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").items.len()
    }

    /// Whether the buffer holds no batches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a new capacity, returning how many batches were dropped.
    ///
    /// Shrinking below the current length drops from the tail: the newest
    /// arrivals are the least starved, and keeping the head preserves
    /// delivery order for the batches already buffered.
    fn set_cap(&self, cap: usize) -> usize {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.cap = cap;
        let mut dropped = 0;
        while inner.items.len() > inner.cap {
            inner.items.pop_back();
            dropped += 1;
        }
        dropped
    }

    /// Drop every buffered batch, returning how many were drained.
    fn close(&self) -> usize {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let drained = inner.items.len();
        inner.items.clear();
        drained
    }
}

/// The per-source queue set, global occupancy accounting, and the admission
/// policy.
#[derive(Debug)]
pub struct QueueManager {
    /// Resource attribute key naming the source of a group.
    source_attribute: String,
    /// Ceiling on the summed length of all queues.
    max_total_capacity: usize,
    /// Shared control state, consulted for the source set.
    control: Arc<Control>,
    /// The queue set. Structural churn is rare; per-batch work takes only the
    /// read lock plus the target buffer's own lock.
    queues: RwLock<FxHashMap<String, Arc<SourceQueue>>>,
    /// Summed length of all queues. Strictly consistent at the enqueue
    /// boundary: admission reserves before pushing.
    occupancy: AtomicUsize,
}

impl QueueManager {
    /// Create a new [`QueueManager`].
    #[must_use]
    pub fn new(source_attribute: String, max_total_capacity: usize, control: Arc<Control>) -> Self {
        Self {
            source_attribute,
            max_total_capacity,
            control,
            queues: RwLock::new(FxHashMap::default()),
            occupancy: AtomicUsize::new(0),
        }
    }

    /// The summed length of all queues.
    #[must_use]
    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::SeqCst)
    }

    /// The current length of a source's queue, if the source is known.
    ///
    /// # Panics
    ///
    /// Panics if the queues lock is poisoned.
    #[must_use]
    pub fn queue_len(&self, source: &str) -> Option<usize> {
        self.queues
            .read()
            .expect("queues lock poisoned")
            .get(source)
            .map(|queue| queue.len())
    }

    /// Admit a batch, one resource group at a time.
    ///
    /// Groups without a usable source attribute are skipped with a warning.
    /// A group bound for a full per-source queue is dropped and counted,
    /// non-fatally. Each buffered group is deep-copied into a fresh
    /// single-group batch; the caller keeps ownership of its input.
    ///
    /// # Errors
    ///
    /// Returns [`AdmitError::GlobalFull`] when global occupancy is at the
    /// ceiling, failing the whole remaining batch. The error is retryable
    /// backpressure.
    ///
    /// # Panics
    ///
    /// Panics if a queue lock is poisoned.
    pub fn admit(&self, batch: &Batch) -> Result<(), AdmitError> {
        for group in &batch.groups {
            let Some(source) = group.source(&self.source_attribute) else {
                warn!(
                    attribute = %self.source_attribute,
                    "resource group missing source attribute, skipping"
                );
                continue;
            };

            let queue = self.queue_for(source);

            // Reserve a slot before the copy. Undone on any failure so the
            // occupancy count never exceeds the ceiling, even with admitters
            // racing.
            let prior = self.occupancy.fetch_add(1, Ordering::SeqCst);
            if prior >= self.max_total_capacity {
                self.occupancy.fetch_sub(1, Ordering::SeqCst);
                counter!(
                    "weightedqueue_dropped_batches_total",
                    "source" => source.to_string()
                )
                .increment(1);
                warn!(source, "global capacity exceeded, rejecting batch");
                return Err(AdmitError::GlobalFull {
                    capacity: self.max_total_capacity,
                });
            }

            if queue.push(Batch::single(group.clone())) {
                gauge!(
                    "weightedqueue_queue_length",
                    "source" => source.to_string()
                )
                .set(queue.len() as f64);
            } else {
                self.occupancy.fetch_sub(1, Ordering::SeqCst);
                counter!(
                    "weightedqueue_dropped_batches_total",
                    "source" => source.to_string()
                )
                .increment(1);
                warn!(source, "per-queue capacity exceeded, dropping batch");
            }
        }
        Ok(())
    }

    /// Pop the oldest batch from a source's queue.
    ///
    /// Occupancy is decremented at the pop: once a batch has left its buffer
    /// its fate downstream no longer affects the occupancy count.
    ///
    /// # Panics
    ///
    /// Panics if a queue lock is poisoned.
    #[must_use]
    pub fn take(&self, source: &str) -> Option<Batch> {
        let queue = {
            let queues = self.queues.read().expect("queues lock poisoned");
            Arc::clone(queues.get(source)?)
        };
        let batch = queue.pop()?;
        self.occupancy.fetch_sub(1, Ordering::SeqCst);
        gauge!("weightedqueue_queue_length", "source" => source.to_string())
            .set(queue.len() as f64);
        Some(batch)
    }

    /// Look up or lazily create the queue for a source. Creation registers
    /// the source in the weight table and sizes the new queue at the
    /// post-registration fair share.
    fn queue_for(&self, source: &str) -> Arc<SourceQueue> {
        {
            let queues = self.queues.read().expect("queues lock poisoned");
            if let Some(queue) = queues.get(source) {
                return Arc::clone(queue);
            }
        }

        let mut queues = self.queues.write().expect("queues lock poisoned");
        // A racing admitter may have created the queue between our two
        // acquisitions.
        if let Some(queue) = queues.get(source) {
            return Arc::clone(queue);
        }

        let registered = self.control.first_sighting(source);
        let cap = self.max_total_capacity / self.control.num_sources().max(1);
        let queue = Arc::new(SourceQueue::new(cap));
        queues.insert(source.to_string(), Arc::clone(&queue));
        if registered {
            info!(
                source,
                total = self.control.num_sources(),
                "new source registered, weights rebalanced"
            );
        }
        queue
    }

    /// One reconcile pass: drop queues whose source left the weight table,
    /// then apply the equal per-queue capacity to every survivor.
    ///
    /// # Panics
    ///
    /// Panics if a queue lock is poisoned.
    pub fn reconcile_once(&self) {
        let removed: Vec<(String, Arc<SourceQueue>)> = {
            let mut queues = self.queues.write().expect("queues lock poisoned");
            let mut removed = Vec::new();
            queues.retain(|source, queue| {
                if self.control.contains_source(source) {
                    true
                } else {
                    removed.push((source.clone(), Arc::clone(queue)));
                    false
                }
            });
            removed
        };
        for (source, queue) in removed {
            let drained = queue.close();
            self.occupancy.fetch_sub(drained, Ordering::SeqCst);
            gauge!("weightedqueue_queue_length", "source" => source.clone()).set(0.0);
            info!(%source, drained, "removed queue for deleted source");
        }

        let num_sources = self.control.num_sources();
        if num_sources == 0 {
            return;
        }
        let per_queue_cap = self.max_total_capacity / num_sources;

        let queues: Vec<(String, Arc<SourceQueue>)> = {
            let queues = self.queues.read().expect("queues lock poisoned");
            queues
                .iter()
                .map(|(source, queue)| (source.clone(), Arc::clone(queue)))
                .collect()
        };
        for (source, queue) in queues {
            let dropped = queue.set_cap(per_queue_cap);
            if dropped > 0 {
                self.occupancy.fetch_sub(dropped, Ordering::SeqCst);
                counter!(
                    "weightedqueue_dropped_batches_total",
                    "source" => source.clone()
                )
                .increment(dropped as u64);
                warn!(
                    %source,
                    dropped,
                    new_cap = per_queue_cap,
                    "queue shrunk past its length, tail-dropped"
                );
            }
            gauge!("weightedqueue_queue_length", "source" => source).set(queue.len() as f64);
        }
        debug!(per_queue = per_queue_cap, "updated per-queue capacities");
    }

    /// Drop every queue and its contents, returning how many batches were
    /// released. Called once at shutdown.
    ///
    /// # Panics
    ///
    /// Panics if a queue lock is poisoned.
    pub fn close_all(&self) -> usize {
        let mut queues = self.queues.write().expect("queues lock poisoned");
        let mut drained = 0;
        for (source, queue) in queues.drain() {
            let count = queue.close();
            drained += count;
            gauge!("weightedqueue_queue_length", "source" => source).set(0.0);
        }
        self.occupancy.fetch_sub(drained, Ordering::SeqCst);
        drained
    }

    /// Run the reconcile task until a shutdown signal is received, closing
    /// all queues on the way out.
    pub async fn spin(self: Arc<Self>, shutdown: sluice_signal::Watcher) {
        let mut reconcile = time::interval(RECONCILE_INTERVAL);
        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                _ = reconcile.tick() => {
                    self.reconcile_once();
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    let drained = self.close_all();
                    info!(drained, "closed all queues");
                    return;
                }
            }
        }
    }
}
