//! The sluice telemetry admission and pacing daemon.
//!
//! Sluice sits between metric producers and a downstream consumer. Batches
//! arrive tagged with a source identifier and land in per-source bounded
//! queues; a weighted dispatcher forwards them downstream at a controlled
//! rate while a freshness meter scores every arrival against per-source SLO
//! thresholds. A small HTTP control plane reweights sources and adjusts
//! thresholds without restart.
//!
//! This library supports the sluice binary found elsewhere in this project.
//! The bits and pieces here are not intended to be used outside of supporting
//! sluice, although if they are helpful in other domains that's a nice
//! surprise.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(clippy::unnecessary_to_owned)]
#![deny(clippy::float_cmp)]
#![deny(clippy::large_futures)]
#![deny(clippy::redundant_allocation)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod batch;
pub mod config;
pub mod control;
pub mod control_plane;
pub mod dispatcher;
pub mod forward;
pub mod freshness;
pub mod ingest;
pub mod queue;

#[inline]
pub(crate) fn full<T: Into<bytes::Bytes>>(
    chunk: T,
) -> http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error> {
    use http_body_util::BodyExt;

    http_body_util::Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
