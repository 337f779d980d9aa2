//! The HTTP control plane.
//!
//! ## Metrics
//!
//! `control_requests_received{endpoint}`: Requests received per endpoint
//!
//! A single listener exposing the runtime-adjustment surface: replace the
//! weight table wholesale, read it back, delete a source, or set an SLO
//! threshold. Replace-the-table semantics keep the weight vector coherent;
//! incremental edits would need a transactional delta that operators rarely
//! want and that complicates sum-to-one enforcement.
//!
//! Errors are plain-text bodies with a 4xx status; successful reads are
//! `application/json`.

use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use http_body_util::{BodyExt, combinators::BoxBody};
use hyper::{Request, Response, StatusCode, header};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{Semaphore, TryAcquireError},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::control::{self, Control};

/// Errors produced by [`ControlPlane`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error binding the control plane listener.
    #[error("Failed to bind control plane to {addr}: {source}")]
    Bind {
        /// Binding address.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Deserialize)]
struct UpdateWeightsRequest {
    weights: FxHashMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct DeleteSourceRequest {
    #[serde(default)]
    source: String,
}

#[derive(Debug, Deserialize)]
struct SetSloRequest {
    #[serde(default)]
    tenant: String,
    value: i64,
    #[serde(default)]
    unit: String,
}

#[derive(Debug, Serialize)]
struct WeightsResponse {
    weights: FxHashMap<String, f64>,
    num_sources: usize,
}

fn plain(status: StatusCode, body: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(crate::full(body.to_string()));
    *response.status_mut() = status;
    response
}

fn control_error(err: &control::Error) -> Response<BoxBody<Bytes, hyper::Error>> {
    let status = match err {
        control::Error::UnknownSource(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_REQUEST,
    };
    plain(status, &err.to_string())
}

/// Dispatch one request against the shared control state.
fn route(
    control: &Control,
    method: &hyper::Method,
    path: &str,
    body: &[u8],
) -> Response<BoxBody<Bytes, hyper::Error>> {
    counter!("control_requests_received", "endpoint" => path.to_string()).increment(1);

    match (method.as_str(), path) {
        ("POST", "/update_weights") => {
            let request: UpdateWeightsRequest = match serde_json::from_slice(body) {
                Ok(request) => request,
                Err(_) => return plain(StatusCode::BAD_REQUEST, "invalid json"),
            };
            match control.replace_weights(request.weights) {
                Ok(()) => {
                    info!(num_sources = control.num_sources(), "weights replaced");
                    plain(StatusCode::OK, "weights updated")
                }
                Err(err) => control_error(&err),
            }
        }
        ("GET", "/weights") => {
            let weights: FxHashMap<String, f64> = control.weights_snapshot().into_iter().collect();
            let response = WeightsResponse {
                num_sources: weights.len(),
                weights,
            };
            let body = serde_json::to_vec(&response)
                .expect("weights response is always serializable");
            let mut response = Response::new(crate::full(body));
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_static("application/json"),
            );
            response
        }
        ("POST", "/delete_source") => {
            let request: DeleteSourceRequest = match serde_json::from_slice(body) {
                Ok(request) => request,
                Err(_) => return plain(StatusCode::BAD_REQUEST, "invalid json"),
            };
            if request.source.is_empty() {
                return plain(StatusCode::BAD_REQUEST, "missing source");
            }
            match control.delete_source(&request.source) {
                Ok(()) => {
                    info!(source = %request.source, "source deleted, weights rebalanced");
                    plain(StatusCode::OK, "source deleted and weights rebalanced")
                }
                Err(err) => control_error(&err),
            }
        }
        ("POST", "/set_slo") => {
            let request: SetSloRequest = match serde_json::from_slice(body) {
                Ok(request) => request,
                Err(_) => return plain(StatusCode::BAD_REQUEST, "invalid json"),
            };
            match control.set_slo(&request.tenant, request.value, &request.unit) {
                Ok(()) => {
                    info!(tenant = %request.tenant, "slo threshold updated");
                    plain(StatusCode::OK, "slo updated")
                }
                Err(err) => control_error(&err),
            }
        }
        (_, "/update_weights" | "/weights" | "/delete_source" | "/set_slo") => {
            plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => plain(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn srv(
    control: Arc<Control>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body = body.boxed().collect().await?.to_bytes();
    Ok(route(&control, &parts.method, parts.uri.path(), &body))
}

#[derive(Debug)]
/// The HTTP control plane server.
pub struct ControlPlane {
    addr: SocketAddr,
    concurrency_limit: usize,
    control: Arc<Control>,
    shutdown: sluice_signal::Watcher,
}

impl ControlPlane {
    /// Create a new [`ControlPlane`] instance.
    #[must_use]
    pub fn new(
        addr: SocketAddr,
        concurrency_limit: usize,
        control: Arc<Control>,
        shutdown: sluice_signal::Watcher,
    ) -> Self {
        Self {
            addr,
            concurrency_limit,
            control,
            shutdown,
        }
    }

    /// Run the control plane until a shutdown signal is received. In-flight
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
        info!(addr = %self.addr, "control plane listening");

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
                    let control = Arc::clone(&self.control);
                    join_set.spawn(async move {
                        let permit = match sem.try_acquire() {
                            Ok(permit) => permit,
                            Err(TryAcquireError::Closed) => {
                                error!("semaphore closed");
                                return;
                            }
                            Err(TryAcquireError::NoPermits) => {
                                warn!("control plane over connection capacity, load shedding");
                                drop(stream);
                                return;
                            }
                        };

                        let builder = auto::Builder::new(TokioExecutor::new());
                        let service = hyper::service::service_fn(move |req| {
                            srv(Arc::clone(&control), req)
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

#[cfg(test)]
mod tests {
    use hyper::Method;

    use super::*;

    async fn body_of(response: Response<BoxBody<Bytes, hyper::Error>>) -> String {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body collects")
            .to_bytes();
        String::from_utf8(bytes.to_vec()).expect("body is utf-8")
    }

    #[tokio::test]
    async fn update_weights_replaces_table() {
        let control = Control::default();
        let body = br#"{"weights":{"a":0.8,"b":0.2}}"#;

        let response = route(&control, &Method::POST, "/update_weights", body);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(control.num_sources(), 2);
    }

    #[tokio::test]
    async fn update_weights_rejects_bad_sum() {
        let control = Control::default();
        control
            .replace_weights([("keep".to_string(), 1.0)].into_iter().collect())
            .expect("valid weights");

        let body = br#"{"weights":{"a":0.5,"b":0.4}}"#;
        let response = route(&control, &Method::POST, "/update_weights", body);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // Table untouched on rejection.
        assert_eq!(
            control.weights_snapshot(),
            vec![("keep".to_string(), 1.0)]
        );
    }

    #[tokio::test]
    async fn update_weights_rejects_malformed_json() {
        let control = Control::default();
        let response = route(&control, &Method::POST, "/update_weights", b"{nope");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_of(response).await, "invalid json");
    }

    #[tokio::test]
    async fn get_weights_round_trips() {
        let control = Control::default();
        let body = br#"{"weights":{"a":0.8,"b":0.2}}"#;
        let response = route(&control, &Method::POST, "/update_weights", body);
        assert_eq!(response.status(), StatusCode::OK);

        let response = route(&control, &Method::GET, "/weights", b"");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("application/json")
        );

        let body = body_of(response).await;
        let parsed: serde_json::Value = serde_json::from_str(&body).expect("valid json");
        assert_eq!(parsed["num_sources"], 2);
        let weights = parsed["weights"].as_object().expect("weights is a map");
        assert!((weights["a"].as_f64().expect("a is a number") - 0.8).abs() < f64::EPSILON);
        assert!((weights["b"].as_f64().expect("b is a number") - 0.2).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn delete_source_rebalances() {
        let control = Control::default();
        let body = br#"{"weights":{"a":0.7,"b":0.3}}"#;
        route(&control, &Method::POST, "/update_weights", body);

        let response = route(
            &control,
            &Method::POST,
            "/delete_source",
            br#"{"source":"a"}"#,
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(control.weights_snapshot(), vec![("b".to_string(), 1.0)]);
    }

    #[tokio::test]
    async fn delete_source_missing_field_is_bad_request() {
        let control = Control::default();
        let response = route(&control, &Method::POST, "/delete_source", b"{}");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_of(response).await, "missing source");
    }

    #[tokio::test]
    async fn delete_unknown_source_is_not_found() {
        let control = Control::default();
        let response = route(
            &control,
            &Method::POST,
            "/delete_source",
            br#"{"source":"ghost"}"#,
        );
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn set_slo_stores_nanoseconds() {
        let control = Control::default();
        let response = route(
            &control,
            &Method::POST,
            "/set_slo",
            br#"{"tenant":"x","value":3,"unit":"s"}"#,
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(control.slo("x"), 3_000_000_000);
    }

    #[tokio::test]
    async fn set_slo_rejects_unknown_unit() {
        let control = Control::default();
        let response = route(
            &control,
            &Method::POST,
            "/set_slo",
            br#"{"tenant":"x","value":3,"unit":"days"}"#,
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn wrong_method_is_rejected() {
        let control = Control::default();
        let response = route(&control, &Method::GET, "/update_weights", b"");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = route(&control, &Method::POST, "/weights", b"");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let control = Control::default();
        let response = route(&control, &Method::GET, "/nope", b"");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
