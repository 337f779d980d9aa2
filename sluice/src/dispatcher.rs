//! The weighted dispatcher.
//!
//! ## Metrics
//!
//! `weightedqueue_forwarded_batches_total{source}`: Batches forwarded downstream
//!
//! A single periodic task: each tick snapshots the weight table, samples one
//! source in proportion to its weight, and forwards at most one batch from
//! that source's queue to the downstream sink. A tick that lands on an empty
//! queue is a no-op rather than a re-probe; re-probing would bias selection
//! toward active sources and break the long-run proportional share the
//! weights promise. Operators tune the tick period to the desired throughput
//! ceiling.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use metrics::counter;
use rand::{Rng, rngs::StdRng};
use tokio::time;
use tracing::{error, info};

use crate::{batch::Batch, control::Control, queue::QueueManager};

/// The downstream consumer of forwarded batches.
///
/// `consume` may block indefinitely; the dispatcher holds no lock while
/// calling it. A consume error is authoritative: the batch is discarded, not
/// re-enqueued, since re-enqueuing would invert per-source delivery order.
#[async_trait]
pub trait Sink {
    /// Errors produced by this sink.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Deliver one batch downstream.
    async fn consume(&self, batch: Batch) -> Result<(), Self::Error>;
}

/// The weighted dispatcher. See the module docs for the selection contract.
#[derive(Debug)]
pub struct Dispatcher<S> {
    queues: Arc<QueueManager>,
    control: Arc<Control>,
    sink: S,
    poll_interval: Duration,
    rng: StdRng,
    shutdown: sluice_signal::Watcher,
}

impl<S> Dispatcher<S>
where
    S: Sink + Send + Sync,
{
    /// Create a new [`Dispatcher`].
    #[must_use]
    pub fn new(
        queues: Arc<QueueManager>,
        control: Arc<Control>,
        sink: S,
        poll_interval: Duration,
        rng: StdRng,
        shutdown: sluice_signal::Watcher,
    ) -> Self {
        Self {
            queues,
            control,
            sink,
            poll_interval,
            rng,
            shutdown,
        }
    }

    /// Run the dispatch loop until a shutdown signal is received.
    pub async fn spin(self) {
        let Self {
            queues,
            control,
            sink,
            poll_interval,
            mut rng,
            shutdown,
        } = self;

        let mut tick = time::interval(poll_interval);
        let shutdown_wait = shutdown.recv();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let snapshot = control.weights_snapshot();
                    let Some(source) = pick_source(&mut rng, &snapshot) else {
                        continue;
                    };
                    // An empty queue yields its turn; over many ticks the
                    // weighted distribution is respected regardless.
                    let Some(batch) = queues.take(source) else {
                        continue;
                    };
                    match sink.consume(batch).await {
                        Ok(()) => {
                            counter!(
                                "weightedqueue_forwarded_batches_total",
                                "source" => source.to_string()
                            )
                            .increment(1);
                        }
                        Err(err) => {
                            error!(source, error = %err, "failed to forward batch downstream");
                        }
                    }
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    return;
                }
            }
        }
    }
}

/// Sample one source in proportion to its weight.
///
/// Draws `r` uniformly from `[0, T)` where `T` is the summed weight, then
/// walks the snapshot accumulating until the running sum exceeds `r`. Returns
/// `None` when the snapshot is empty or carries no positive weight.
fn pick_source<'a, R>(rng: &mut R, weights: &'a [(String, f64)]) -> Option<&'a str>
where
    R: Rng,
{
    if weights.is_empty() {
        return None;
    }
    let total: f64 = weights.iter().map(|(_, weight)| weight).sum();
    if total <= 0.0 {
        return None;
    }

    let r = rng.random_range(0.0..total);
    let mut acc = 0.0;
    for (source, weight) in weights {
        acc += weight;
        if r < acc {
            return Some(source);
        }
    }
    // Floating-point accumulation can leave r at the boundary; the draw
    // belongs to the final entry.
    weights.last().map(|(source, _)| source.as_str())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rand::SeedableRng;
    use rustc_hash::FxHashMap;

    use super::*;
    use crate::batch::{AttrValue, AttributeMap, ResourceGroup};

    #[derive(Debug, Clone, Default)]
    struct CollectingSink {
        batches: Arc<Mutex<Vec<Batch>>>,
    }

    #[derive(thiserror::Error, Debug)]
    #[error("sink closed")]
    struct SinkClosed;

    #[async_trait]
    impl Sink for CollectingSink {
        type Error = SinkClosed;

        async fn consume(&self, batch: Batch) -> Result<(), SinkClosed> {
            self.batches.lock().expect("sink lock poisoned").push(batch);
            Ok(())
        }
    }

    fn batch_from(source: &str, seq: i64) -> Batch {
        let mut attributes = AttributeMap::default();
        attributes.insert(
            "source.id".to_string(),
            AttrValue::Str(source.to_string()),
        );
        attributes.insert("seq".to_string(), AttrValue::Int(seq));
        Batch::single(ResourceGroup {
            attributes,
            scopes: vec![],
        })
    }

    #[test]
    fn pick_respects_weight_ratio() {
        let mut rng = StdRng::from_seed([41; 32]);
        let weights = vec![("a".to_string(), 0.8), ("b".to_string(), 0.2)];

        let mut counts: FxHashMap<&str, u64> = FxHashMap::default();
        for _ in 0..10_000 {
            let source = pick_source(&mut rng, &weights).expect("positive total weight");
            *counts.entry(source).or_default() += 1;
        }

        let ratio = counts["a"] as f64 / counts["b"] as f64;
        assert!(
            (3.2..=4.8).contains(&ratio),
            "ratio {ratio} outside expected band"
        );
    }

    #[test]
    fn pick_skips_zero_weight_sources() {
        let mut rng = StdRng::from_seed([7; 32]);
        let weights = vec![
            ("silent".to_string(), 0.0),
            ("busy".to_string(), 1.0),
            ("quiet".to_string(), 0.0),
        ];

        for _ in 0..1_000 {
            assert_eq!(pick_source(&mut rng, &weights), Some("busy"));
        }
    }

    #[test]
    fn pick_declines_degenerate_tables() {
        let mut rng = StdRng::from_seed([0; 32]);
        assert_eq!(pick_source(&mut rng, &[]), None);

        let all_zero = vec![("a".to_string(), 0.0), ("b".to_string(), 0.0)];
        assert_eq!(pick_source(&mut rng, &all_zero), None);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_preserves_per_source_fifo() {
        let control = Arc::new(Control::default());
        let queues = Arc::new(QueueManager::new(
            "source.id".to_string(),
            100,
            Arc::clone(&control),
        ));
        let sink = CollectingSink::default();
        let collected = Arc::clone(&sink.batches);
        let (watcher, broadcaster) = sluice_signal::signal();

        for seq in 0..20 {
            queues
                .admit(&batch_from("a", seq))
                .expect("within capacity");
        }

        let dispatcher = Dispatcher::new(
            Arc::clone(&queues),
            control,
            sink,
            Duration::from_millis(10),
            StdRng::from_seed([3; 32]),
            watcher,
        );
        let handle = tokio::spawn(dispatcher.spin());

        // Paused-clock ticks fire as fast as the loop can drain.
        time::sleep(Duration::from_secs(1)).await;
        broadcaster.signal();
        handle.await.expect("dispatcher panicked");

        let collected = collected.lock().expect("sink lock poisoned");
        assert_eq!(collected.len(), 20);
        for (expected, batch) in collected.iter().enumerate() {
            assert_eq!(
                batch.groups[0].attributes.get("seq"),
                Some(&AttrValue::Int(expected as i64))
            );
        }
        assert_eq!(queues.occupancy(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_with_no_sources_idles_until_shutdown() {
        let control = Arc::new(Control::default());
        let queues = Arc::new(QueueManager::new(
            "source.id".to_string(),
            100,
            Arc::clone(&control),
        ));
        let sink = CollectingSink::default();
        let collected = Arc::clone(&sink.batches);
        let (watcher, broadcaster) = sluice_signal::signal();

        let dispatcher = Dispatcher::new(
            queues,
            control,
            sink,
            Duration::from_millis(10),
            StdRng::from_seed([9; 32]),
            watcher,
        );
        let handle = tokio::spawn(dispatcher.spin());

        time::sleep(Duration::from_secs(1)).await;
        broadcaster.signal();
        handle.await.expect("dispatcher panicked");

        assert!(collected.lock().expect("sink lock poisoned").is_empty());
    }
}
