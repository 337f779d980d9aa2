//! The ingress listener.
//!
//! ## Metrics
//!
//! `ingest_requests_received{outcome}`: Requests received, by admission outcome
//!
//! Accepts metric batches as JSON over HTTP on `POST /v1/metrics`. Every
//! batch feeds the freshness meter first and admission second; the meter
//! must see batches that admission later sheds. A batch refused for global
//! capacity maps to `429 Too Many Requests`, the retryable backpressure
//! signal for producers.

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt, combinators::BoxBody};
use hyper::{Request, Response, StatusCode};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use metrics::counter;
use tokio::{
    net::TcpListener,
    sync::{Semaphore, TryAcquireError},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::{batch::Batch, freshness::FreshnessMeter, queue::QueueManager};

/// Errors produced by [`Ingest`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error binding the ingest listener.
    #[error("Failed to bind ingest listener to {addr}: {source}")]
    Bind {
        /// Binding address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

fn plain(status: StatusCode, body: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(crate::full(body.to_string()));
    *response.status_mut() = status;
    response
}

/// Admit one request body.
fn handle(
    queues: &QueueManager,
    meter: &FreshnessMeter,
    method: &hyper::Method,
    path: &str,
    body: &[u8],
) -> Response<BoxBody<Bytes, hyper::Error>> {
    if path != "/v1/metrics" {
        return plain(StatusCode::NOT_FOUND, "not found");
    }
    if *method != hyper::Method::POST {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    let batch: Batch = match serde_json::from_slice(body) {
        Ok(batch) => batch,
        Err(err) => {
            debug!("rejecting malformed batch: {err}");
            counter!("ingest_requests_received", "outcome" => "malformed").increment(1);
            return plain(StatusCode::BAD_REQUEST, "invalid json");
        }
    };

    // Freshness is measured at ingress, before any shedding: an SLO is a
    // statement about what arrived, not about what survived admission.
    meter.observe(&batch);

    match queues.admit(&batch) {
        Ok(()) => {
            counter!("ingest_requests_received", "outcome" => "accepted").increment(1);
            plain(StatusCode::OK, "accepted")
        }
        Err(err) => {
            counter!("ingest_requests_received", "outcome" => "backpressure").increment(1);
            plain(StatusCode::TOO_MANY_REQUESTS, &err.to_string())
        }
    }
}

async fn srv(
    queues: Arc<QueueManager>,
    meter: Arc<FreshnessMeter>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.boxed().collect().await?.to_bytes();
    Ok(handle(
        &queues,
        &meter,
        &parts.method,
        parts.uri.path(),
        &body,
    ))
}

#[derive(Debug)]
/// The ingress HTTP server.
pub struct Ingest {
    addr: SocketAddr,
    concurrency_limit: usize,
    queues: Arc<QueueManager>,
    meter: Arc<FreshnessMeter>,
    shutdown: sluice_signal::Watcher,
}

impl Ingest {
    /// Create a new [`Ingest`] instance.
    #[must_use]
    pub fn new(
        addr: SocketAddr,
        concurrency_limit: usize,
        queues: Arc<QueueManager>,
        meter: Arc<FreshnessMeter>,
        shutdown: sluice_signal::Watcher,
    ) -> Self {
        Self {
            addr,
            concurrency_limit,
            queues,
            meter,
            shutdown,
        }
    }

    /// Run the ingest listener until a shutdown signal is received. In-flight
    /// requests complete before the listener closes.
    ///
    /// # Errors
    ///
    /// Returns an error when the listener cannot be bound.
    pub async fn run(self) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| Error::Bind {
                addr: self.addr,
                source,
            })?;
        let sem = Arc::new(Semaphore::new(self.concurrency_limit));
        let mut join_set = JoinSet::new();
        info!(addr = %self.addr, "ingest listening");

        let shutdown_fut = self.shutdown.recv();
        tokio::pin!(shutdown_fut);
        loop {
            tokio::select! {
                () = &mut shutdown_fut => {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                }

                incoming = listener.accept() => {
                    let (stream, peer) = match incoming {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            error!("error accepting connection: {err}");
                            continue;
                        }
                    };
                    debug!("accepted connection from {peer}");

                    let sem = Arc::clone(&sem);
                    let queues = Arc::clone(&self.queues);
                    let meter = Arc::clone(&self.meter);
                    join_set.spawn(async move {
                        let permit = match sem.try_acquire() {
                            Ok(permit) => permit,
                            Err(TryAcquireError::Closed) => {
                                error!("semaphore closed");
                                return;
                            }
                            Err(TryAcquireError::NoPermits) => {
                                warn!("ingest over connection capacity, load shedding");
                                drop(stream);
                                return;
                            }
                        };

                        let builder = auto::Builder::new(TokioExecutor::new());
                        let service = hyper::service::service_fn(move |req| {
                            srv(Arc::clone(&queues), Arc::clone(&meter), req)
                        });
                        if let Err(err) = builder
                            .serve_connection(TokioIo::new(stream), service)
                            .await
                        {
                            error!("error serving {peer}: {err}");
                        }
                        drop(permit);
                    });
                }
            }
        }

        drop(listener);
        while join_set.join_next().await.is_some() {}
        Ok(())
    }
}
