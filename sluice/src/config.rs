//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Failures here are
//! startup-fatal, intentionally.

use std::{fs, net::SocketAddr, path::Path};

use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::control::WEIGHT_SUM_TOLERANCE;

/// Errors produced by [`Config`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error reading the config file.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Error deserializing yaml.
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// A duration string did not parse.
    #[error("Invalid duration {input:?}: expected a positive integer with an ns, ms, or s suffix")]
    InvalidDuration {
        /// The offending input.
        input: String,
    },
    /// The dispatcher tick period was zero.
    #[error("poll_interval_ms must be positive")]
    ZeroPollInterval,
    /// The global buffer limit was zero.
    #[error("max_total_capacity must be positive")]
    ZeroCapacity,
    /// An initial SLO named no tenant.
    #[error("initial_slos tenant key cannot be empty")]
    EmptySloTenant,
    /// The initial weight table did not sum to approximately 1.
    #[error("initial_weights must sum to approximately 1, got {sum}")]
    InvalidInitialWeights {
        /// The offending sum.
        sum: f64,
    },
}

fn default_source_attribute() -> String {
    "source.id".to_string()
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_total_capacity() -> usize {
    1_000
}

fn default_port() -> u16 {
    4_500
}

fn default_ingest_addr() -> SocketAddr {
    "0.0.0.0:4600".parse().expect("static address parses")
}

fn default_concurrent_requests_max() -> usize {
    100
}

/// The method by which to express telemetry.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum Telemetry {
    /// Expose a prometheus scrape endpoint.
    Prometheus {
        /// Address and port to bind the scrape endpoint to.
        addr: SocketAddr,
    },
}

/// Main configuration struct for this program.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Resource attribute key used to extract the source id.
    #[serde(default = "default_source_attribute")]
    pub source_attribute: String,
    /// SLO thresholds applied at startup, tenant → duration string. A
    /// duration string is a positive integer with an `ns`, `ms`, or `s`
    /// suffix, e.g. `"3s"` or `"500ms"`.
    #[serde(default)]
    pub initial_slos: FxHashMap<String, String>,
    /// Weight table applied at startup when non-empty; must sum to
    /// approximately 1.
    #[serde(default)]
    pub initial_weights: FxHashMap<String, f64>,
    /// Dispatcher tick period in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Ceiling on the summed length of all source queues.
    #[serde(default = "default_max_total_capacity")]
    pub max_total_capacity: usize,
    /// Port of the HTTP control plane.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address and port of the ingest listener.
    #[serde(default = "default_ingest_addr")]
    pub ingest_addr: SocketAddr,
    /// URI batches are forwarded to.
    pub downstream_uri: String,
    /// Number of concurrent connections each HTTP listener allows.
    #[serde(default = "default_concurrent_requests_max")]
    pub concurrent_requests_max: usize,
    /// The method by which to express telemetry.
    #[serde(default)]
    pub telemetry: Option<Telemetry>,
}

impl Config {
    /// Read, parse, and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read, does not parse, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that deserialization cannot express.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), Error> {
        if self.poll_interval_ms == 0 {
            return Err(Error::ZeroPollInterval);
        }
        if self.max_total_capacity == 0 {
            return Err(Error::ZeroCapacity);
        }
        for (tenant, duration) in &self.initial_slos {
            if tenant.is_empty() {
                return Err(Error::EmptySloTenant);
            }
            parse_duration_ns(duration)?;
        }
        if !self.initial_weights.is_empty() {
            let sum: f64 = self.initial_weights.values().sum();
            if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
                return Err(Error::InvalidInitialWeights { sum });
            }
        }
        Ok(())
    }
}

/// Parse a duration string into nanoseconds.
///
/// Accepts a positive integer with an `ns`, `ms`, or `s` suffix.
///
/// # Errors
///
/// Returns `InvalidDuration` for anything else, zero and negative values
/// included.
pub fn parse_duration_ns(input: &str) -> Result<i64, Error> {
    let invalid = || Error::InvalidDuration {
        input: input.to_string(),
    };

    let trimmed = input.trim();
    let suffix_at = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(invalid)?;
    let (digits, unit) = trimmed.split_at(suffix_at);

    let value: i64 = digits.parse().map_err(|_| invalid())?;
    if value == 0 {
        return Err(invalid());
    }
    let multiplier: i64 = match unit {
        "ns" => 1,
        "ms" => 1_000_000,
        "s" => 1_000_000_000,
        _ => return Err(invalid()),
    };

    value.checked_mul(multiplier).ok_or_else(invalid)
}
