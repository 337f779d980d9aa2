//! Shared control state: the weight table and the SLO threshold table.
//!
//! Both tables sit on hot paths. The dispatcher snapshots weights on every
//! tick and the freshness meter reads a threshold per batch, while mutation
//! arrives rarely, from the HTTP control plane or from new-source discovery.
//! Each table is guarded by its own reader-writer lock; a caller needing both
//! acquires them independently and must not assume cross-table atomicity.

use std::sync::RwLock;

use rustc_hash::FxHashMap;
use tracing::debug;

/// Threshold applied to tenants with no explicit SLO, 5 seconds in
/// nanoseconds.
pub const DEFAULT_SLO_THRESHOLD_NS: i64 = 5_000_000_000;

/// Permitted deviation of a replacement weight table's sum from 1.0.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.01;

/// Errors produced by [`Control`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A replacement weight table did not sum to approximately 1.
    #[error("weights must sum to approximately 1, got {sum}")]
    InvalidWeights {
        /// The offending sum.
        sum: f64,
    },
    /// The named source has no weight table entry.
    #[error("source not found: {0}")]
    UnknownSource(String),
    /// An SLO operation named no tenant.
    #[error("tenant is required")]
    EmptyTenant,
    /// An SLO threshold was zero or negative.
    #[error("slo threshold must be positive, got {0}")]
    NonPositiveSlo(i64),
    /// An SLO unit was not one of ns, ms, or s.
    #[error("invalid unit {0:?}: must be ns, ms, or s")]
    InvalidUnit(String),
}

#[derive(Debug, Default)]
/// Process-wide control tables, owned by the composition root and handed to
/// every component as an `Arc`.
pub struct Control {
    /// source → relative dispatch share. Non-negative, summing to
    /// approximately 1 by external convention.
    weights: RwLock<FxHashMap<String, f64>>,
    /// tenant → freshness threshold in nanoseconds.
    slos: RwLock<FxHashMap<String, i64>>,
}

impl Control {
    /// The number of sources currently in the weight table.
    ///
    /// # Panics
    ///
    /// Panics if the weight lock is poisoned.
    #[must_use]
    pub fn num_sources(&self) -> usize {
        self.weights.read().expect("weights lock poisoned").len()
    }

    /// Whether the named source has a weight table entry.
    ///
    /// # Panics
    ///
    /// Panics if the weight lock is poisoned.
    #[must_use]
    pub fn contains_source(&self, source: &str) -> bool {
        self.weights
            .read()
            .expect("weights lock poisoned")
            .contains_key(source)
    }

    /// A stable copy of the weight table for the caller to walk. O(n) in the
    /// source count.
    ///
    /// # Panics
    ///
    /// Panics if the weight lock is poisoned.
    #[must_use]
    pub fn weights_snapshot(&self) -> Vec<(String, f64)> {
        self.weights
            .read()
            .expect("weights lock poisoned")
            .iter()
            .map(|(source, weight)| (source.clone(), *weight))
            .collect()
    }

    /// Atomically replace the entire weight table.
    ///
    /// # Errors
    ///
    /// Returns `InvalidWeights` when the new table's sum deviates from 1.0 by
    /// more than [`WEIGHT_SUM_TOLERANCE`]. The table is untouched on error.
    ///
    /// # Panics
    ///
    /// Panics if the weight lock is poisoned.
    pub fn replace_weights(&self, weights: FxHashMap<String, f64>) -> Result<(), Error> {
        let sum: f64 = weights.values().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(Error::InvalidWeights { sum });
        }

        let mut table = self.weights.write().expect("weights lock poisoned");
        *table = weights;
        Ok(())
    }

    /// Remove a source from the weight table, resetting every survivor to the
    /// equal share `1/n`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSource` when the source has no entry.
    ///
    /// # Panics
    ///
    /// Panics if the weight lock is poisoned.
    pub fn delete_source(&self, source: &str) -> Result<(), Error> {
        let mut table = self.weights.write().expect("weights lock poisoned");
        if table.remove(source).is_none() {
            return Err(Error::UnknownSource(source.to_string()));
        }
        let survivors = table.len();
        if survivors > 0 {
            let equal = 1.0 / survivors as f64;
            for weight in table.values_mut() {
                *weight = equal;
            }
        }
        Ok(())
    }

    /// Register a source on first sighting, returning whether an insertion
    /// happened.
    ///
    /// A source already present is left alone. Otherwise, an empty table
    /// gains the source at weight 1.0 and a populated table is reset so that
    /// every entry, the newcomer included, holds `1/(n+1)`. Equality is the
    /// maximum-entropy prior for a source we know nothing about; operators
    /// override over HTTP when they know better.
    ///
    /// # Panics
    ///
    /// Panics if the weight lock is poisoned.
    pub fn first_sighting(&self, source: &str) -> bool {
        {
            let table = self.weights.read().expect("weights lock poisoned");
            if table.contains_key(source) {
                return false;
            }
        }

        let mut table = self.weights.write().expect("weights lock poisoned");
        // The check repeats under the write lock: another sighting of the
        // same source may have won the race between our two acquisitions.
        if table.contains_key(source) {
            return false;
        }
        if table.is_empty() {
            table.insert(source.to_string(), 1.0);
        } else {
            let equal = 1.0 / (table.len() + 1) as f64;
            for weight in table.values_mut() {
                *weight = equal;
            }
            table.insert(source.to_string(), equal);
        }
        true
    }

    /// Set a tenant's SLO threshold from a value and unit.
    ///
    /// `unit` is one of `ns`, `ms`, or `s`, long forms included; an empty
    /// unit means seconds.
    ///
    /// # Errors
    ///
    /// Rejects empty tenants, non-positive values, and unknown units.
    ///
    /// # Panics
    ///
    /// Panics if the SLO lock is poisoned.
    pub fn set_slo(&self, tenant: &str, value: i64, unit: &str) -> Result<(), Error> {
        if tenant.is_empty() {
            return Err(Error::EmptyTenant);
        }
        if value <= 0 {
            return Err(Error::NonPositiveSlo(value));
        }

        let multiplier: i64 = match unit.trim().to_ascii_lowercase().as_str() {
            "ns" | "nanoseconds" => 1,
            "ms" | "milliseconds" => 1_000_000,
            "" | "s" | "sec" | "seconds" => 1_000_000_000,
            other => return Err(Error::InvalidUnit(other.to_string())),
        };

        let threshold_ns = value * multiplier;
        self.slos
            .write()
            .expect("slos lock poisoned")
            .insert(tenant.to_string(), threshold_ns);
        debug!(tenant, threshold_ns, "slo threshold updated");
        Ok(())
    }

    /// A tenant's SLO threshold in nanoseconds, falling back to
    /// [`DEFAULT_SLO_THRESHOLD_NS`] for unknown or empty tenants.
    ///
    /// # Panics
    ///
    /// Panics if the SLO lock is poisoned.
    #[must_use]
    pub fn slo(&self, tenant: &str) -> i64 {
        if tenant.is_empty() {
            return DEFAULT_SLO_THRESHOLD_NS;
        }
        self.slos
            .read()
            .expect("slos lock poisoned")
            .get(tenant)
            .copied()
            .unwrap_or(DEFAULT_SLO_THRESHOLD_NS)
    }

    /// Insert the default threshold for a tenant that has none. Idempotent;
    /// empty tenants are ignored.
    ///
    /// # Panics
    ///
    /// Panics if the SLO lock is poisoned.
    pub fn register_tenant(&self, tenant: &str) {
        if tenant.is_empty() {
            return;
        }
        self.slos
            .write()
            .expect("slos lock poisoned")
            .entry(tenant.to_string())
            .or_insert(DEFAULT_SLO_THRESHOLD_NS);
    }
}
