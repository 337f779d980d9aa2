//! Per-source end-to-end freshness accounting.
//!
//! ## Metrics
//!
//! `freshness_total_batches_total{source}`: Batches measured
//! `freshness_good_batches_total{source}`: Batches within the SLO threshold
//!
//! Each ingress batch is measured against the per-source threshold from the
//! shared control state. The meter never mutates the batch and never blocks
//! on the dispatcher; it reads the SLO table and emits two counters.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use metrics::counter;
use tracing::debug;

use crate::{batch::Batch, control::Control};

/// Measures batch age against runtime-adjustable SLO thresholds.
#[derive(Debug)]
pub struct FreshnessMeter {
    control: Arc<Control>,
    source_attribute: String,
}

impl FreshnessMeter {
    /// Create a new [`FreshnessMeter`].
    #[must_use]
    pub fn new(control: Arc<Control>, source_attribute: String) -> Self {
        Self {
            control,
            source_attribute,
        }
    }

    /// Measure every resource group of a batch against the current wall
    /// clock.
    ///
    /// # Panics
    ///
    /// Panics if the system clock reads before the Unix epoch.
    pub fn observe(&self, batch: &Batch) {
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_nanos();
        let now_ns = i64::try_from(now_ns).expect("system clock beyond i64 nanoseconds");
        self.observe_at(batch, now_ns);
    }

    /// Measure every resource group of a batch against the given instant.
    ///
    /// A group without a usable source attribute is skipped. A group whose
    /// datapoints carry no integer `initial_timestamp` is skipped with a
    /// debug log. A negative age -- clock skew or replay -- counts toward the
    /// total but is never good.
    pub fn observe_at(&self, batch: &Batch, now_ns: i64) {
        for group in &batch.groups {
            let Some(source) = group.source(&self.source_attribute) else {
                continue;
            };

            let Some(initial_ts) = group.initial_timestamp() else {
                debug!(source, "skipping group: no initial_timestamp found");
                continue;
            };

            let age_ns = now_ns - initial_ts;
            let threshold_ns = self.control.slo(source);

            counter!(
                "freshness_total_batches_total",
                "source" => source.to_string()
            )
            .increment(1);

            if age_ns >= 0 && age_ns <= threshold_ns {
                counter!(
                    "freshness_good_batches_total",
                    "source" => source.to_string()
                )
                .increment(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    use super::*;
    use crate::batch::{
        AttrValue, AttributeMap, INITIAL_TIMESTAMP_KEY, Metric, MetricData, NumberDataPoint,
        NumberValue, ResourceGroup, Scope,
    };

    fn stamped_batch(source: &str, initial_ts: i64) -> Batch {
        let mut resource = AttributeMap::default();
        resource.insert(
            "source.id".to_string(),
            AttrValue::Str(source.to_string()),
        );
        let mut dp_attributes = AttributeMap::default();
        dp_attributes.insert(
            INITIAL_TIMESTAMP_KEY.to_string(),
            AttrValue::Int(initial_ts),
        );
        Batch::single(ResourceGroup {
            attributes: resource,
            scopes: vec![Scope {
                metrics: vec![Metric {
                    name: "requests".to_string(),
                    data: MetricData::Gauge(vec![NumberDataPoint {
                        attributes: dp_attributes,
                        value: NumberValue::Int(1),
                    }]),
                }],
            }],
        })
    }

    /// Run `f` under a debugging recorder and return (total, good) counts
    /// for the given source.
    fn counts_for(source: &str, f: impl FnOnce()) -> (u64, u64) {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        metrics::with_local_recorder(&recorder, f);

        let mut total = 0;
        let mut good = 0;
        for (composite, _, _, value) in snapshotter.snapshot().into_vec() {
            let DebugValue::Counter(count) = value else {
                continue;
            };
            let key = composite.key();
            let matches_source = key
                .labels()
                .any(|label| label.key() == "source" && label.value() == source);
            if !matches_source {
                continue;
            }
            match key.name() {
                "freshness_total_batches_total" => total = count,
                "freshness_good_batches_total" => good = count,
                _ => {}
            }
        }
        (total, good)
    }

    fn meter_with_slo(tenant: &str, value: i64, unit: &str) -> FreshnessMeter {
        let control = Arc::new(Control::default());
        control.set_slo(tenant, value, unit).expect("valid slo");
        FreshnessMeter::new(control, "source.id".to_string())
    }

    #[test]
    fn age_within_threshold_is_good() {
        let meter = meter_with_slo("x", 3, "s");
        let now_ns = 10_000_000_000;
        let batch = stamped_batch("x", now_ns - 2_999_000_000);

        let (total, good) = counts_for("x", || meter.observe_at(&batch, now_ns));
        assert_eq!((total, good), (1, 1));
    }

    #[test]
    fn age_past_threshold_is_total_only() {
        let meter = meter_with_slo("x", 3, "s");
        let now_ns = 10_000_000_000;
        let batch = stamped_batch("x", now_ns - 3_000_000_001);

        let (total, good) = counts_for("x", || meter.observe_at(&batch, now_ns));
        assert_eq!((total, good), (1, 0));
    }

    #[test]
    fn age_at_exact_threshold_is_good() {
        let meter = meter_with_slo("x", 3, "s");
        let now_ns = 10_000_000_000;
        let batch = stamped_batch("x", now_ns - 3_000_000_000);

        let (total, good) = counts_for("x", || meter.observe_at(&batch, now_ns));
        assert_eq!((total, good), (1, 1));
    }

    #[test]
    fn future_timestamp_is_never_good() {
        let meter = meter_with_slo("x", 3, "s");
        let now_ns = 10_000_000_000;
        let batch = stamped_batch("x", now_ns + 1_000_000);

        let (total, good) = counts_for("x", || meter.observe_at(&batch, now_ns));
        assert_eq!((total, good), (1, 0));
    }

    #[test]
    fn unstamped_group_is_skipped() {
        let meter = meter_with_slo("x", 3, "s");
        let mut batch = stamped_batch("x", 0);
        batch.groups[0].scopes.clear();

        let (total, good) = counts_for("x", || meter.observe_at(&batch, 10));
        assert_eq!((total, good), (0, 0));
    }

    #[test]
    fn unknown_tenant_uses_default_threshold() {
        let control = Arc::new(Control::default());
        let meter = FreshnessMeter::new(control, "source.id".to_string());
        let now_ns = 100_000_000_000;

        // 4.9s old: within the 5s default.
        let fresh = stamped_batch("y", now_ns - 4_900_000_000);
        let (total, good) = counts_for("y", || meter.observe_at(&fresh, now_ns));
        assert_eq!((total, good), (1, 1));

        // 5.1s old: past the 5s default.
        let stale = stamped_batch("z", now_ns - 5_100_000_000);
        let (total, good) = counts_for("z", || meter.observe_at(&stale, now_ns));
        assert_eq!((total, good), (1, 0));
    }
}
