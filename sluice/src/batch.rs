//! The telemetry batch model.
//!
//! A [`Batch`] is a grouping of metric datapoints delivered as a unit. Each
//! batch carries one or more resource groups; a group's resource attributes
//! identify the producing source and its datapoints may carry an
//! `initial_timestamp` attribute recording upstream ingestion time. The core
//! of sluice does not otherwise interpret payload contents.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Datapoint attribute that records upstream ingestion time, integer
/// nanoseconds of wall clock.
pub const INITIAL_TIMESTAMP_KEY: &str = "initial_timestamp";

/// Attribute map used for resource and datapoint attributes.
pub type AttributeMap = FxHashMap<String, AttrValue>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
/// An attribute value.
pub enum AttrValue {
    /// A UTF-8 string.
    Str(String),
    /// A signed integer, 64 bits wide.
    Int(i64),
    /// A floating point, 64 bits wide.
    Double(f64),
    /// A boolean.
    Bool(bool),
}

impl AttrValue {
    /// View this value as a string, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// View this value as an integer, if it is one.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
/// The recorded value of a number datapoint.
pub enum NumberValue {
    /// A signed integer, 64 bits wide.
    Int(i64),
    /// A floating point, 64 bits wide.
    Float(f64),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
/// A single numeric datapoint.
pub struct NumberDataPoint {
    /// Attributes attached to this datapoint.
    #[serde(default)]
    pub attributes: AttributeMap,
    /// The recorded value.
    pub value: NumberValue,
}

impl NumberDataPoint {
    /// The `initial_timestamp` attribute of this datapoint, when present and
    /// integer-typed.
    #[must_use]
    pub fn initial_timestamp(&self) -> Option<i64> {
        self.attributes
            .get(INITIAL_TIMESTAMP_KEY)
            .and_then(AttrValue::as_int)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
/// The datapoints of a metric, discriminated by metric kind.
pub enum MetricData {
    /// A monotonic sum.
    Sum(Vec<NumberDataPoint>),
    /// A point-in-time gauge.
    Gauge(Vec<NumberDataPoint>),
}

impl MetricData {
    fn data_points(&self) -> &[NumberDataPoint] {
        match self {
            MetricData::Sum(dps) | MetricData::Gauge(dps) => dps,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// A named metric and its datapoints.
pub struct Metric {
    /// The metric name.
    pub name: String,
    /// The metric's datapoints.
    #[serde(flatten)]
    pub data: MetricData,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
/// Metrics grouped under one instrumentation scope.
pub struct Scope {
    /// The metrics of this scope.
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
/// Metrics grouped under one producing resource.
pub struct ResourceGroup {
    /// Resource attributes, including the source attribute.
    #[serde(default)]
    pub attributes: AttributeMap,
    /// The scopes of this resource.
    #[serde(default)]
    pub scopes: Vec<Scope>,
}

impl ResourceGroup {
    /// The source identifier carried in the resource attribute named by
    /// `attribute`. Absent or empty values are reported as `None`.
    #[must_use]
    pub fn source(&self, attribute: &str) -> Option<&str> {
        self.attributes
            .get(attribute)
            .and_then(AttrValue::as_str)
            .filter(|s| !s.is_empty())
    }

    /// The `initial_timestamp` of the first numeric datapoint carrying one,
    /// scanning sums and gauges in order.
    #[must_use]
    pub fn initial_timestamp(&self) -> Option<i64> {
        self.scopes
            .iter()
            .flat_map(|scope| scope.metrics.iter())
            .flat_map(|metric| metric.data.data_points())
            .find_map(NumberDataPoint::initial_timestamp)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
/// A grouping of metric datapoints delivered as a unit.
pub struct Batch {
    /// The resource groups of this batch. Each group is admitted
    /// independently.
    pub groups: Vec<ResourceGroup>,
}

impl Batch {
    /// A batch holding a single resource group. Admission buffers each group
    /// on its own, so this is the shape queued batches always take.
    #[must_use]
    pub fn single(group: ResourceGroup) -> Self {
        Self {
            groups: vec![group],
        }
    }
}
