//! The downstream HTTP sink.
//!
//! Forwarded batches leave the daemon as JSON over HTTP, posted to the
//! configured downstream URI from a pooled client. The dispatcher treats any
//! error here as authoritative and discards the batch.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    Request, StatusCode, Uri,
    header::{CONTENT_LENGTH, CONTENT_TYPE},
};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};

use crate::{batch::Batch, dispatcher::Sink};

/// Errors produced by [`HttpSink`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configured downstream URI was not valid.
    #[error("invalid downstream uri: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    /// A batch failed to serialize.
    #[error("failed to serialize batch: {0}")]
    Json(#[from] serde_json::Error),
    /// A request failed to build.
    #[error("http error: {0}")]
    Http(#[from] hyper::http::Error),
    /// A request failed in flight.
    #[error("request to {uri} failed: {source}")]
    RequestFailed {
        /// Target URI.
        uri: String,
        /// Underlying client error.
        #[source]
        source: Box<hyper_util::client::legacy::Error>,
    },
    /// The downstream answered with a non-success status.
    #[error("downstream returned status {status}")]
    Status {
        /// The response status.
        status: StatusCode,
    },
}

/// A [`Sink`] that POSTs each batch to a downstream HTTP endpoint.
pub struct HttpSink {
    client: Client<HttpConnector, Full<Bytes>>,
    uri: Uri,
}

impl std::fmt::Debug for HttpSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSink").field("uri", &self.uri).finish()
    }
}

impl HttpSink {
    /// Create a new [`HttpSink`] targeting `uri`.
    ///
    /// # Errors
    ///
    /// Returns an error when the URI does not parse.
    pub fn new(uri: &str) -> Result<Self, Error> {
        let uri: Uri = uri.parse()?;
        let client = Client::builder(TokioExecutor::new())
            .retry_canceled_requests(false)
            .build_http();
        Ok(Self { client, uri })
    }
}

#[async_trait]
impl Sink for HttpSink {
    type Error = Error;

    async fn consume(&self, batch: Batch) -> Result<(), Error> {
        let body = serde_json::to_vec(&batch)?;
        let request = Request::builder()
            .method(hyper::Method::POST)
            .uri(&self.uri)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_LENGTH, body.len())
            .body(Full::new(Bytes::from(body)))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|source| Error::RequestFailed {
                uri: self.uri.to_string(),
                source: Box::new(source),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status { status });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use http_body_util::{BodyExt, combinators::BoxBody};
    use hyper::{Response, service::service_fn};
    use hyper_util::{rt::TokioIo, server::conn::auto};
    use tokio::net::TcpListener;

    use super::*;
    use crate::batch::{AttrValue, AttributeMap, ResourceGroup};

    /// Serve exactly one connection, answering every request with `status`,
    /// and return the bound address.
    async fn one_shot_server(status: StatusCode) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("ephemeral bind");
        let addr = listener.local_addr().expect("bound address");

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("one connection");
            let service = service_fn(move |req: Request<hyper::body::Incoming>| async move {
                let _ = req.into_body().collect().await;
                let mut response: Response<BoxBody<Bytes, hyper::Error>> =
                    Response::new(crate::full(""));
                *response.status_mut() = status;
                Ok::<_, hyper::Error>(response)
            });
            let _ = auto::Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });

        addr
    }

    fn sample_batch() -> Batch {
        let mut attributes = AttributeMap::default();
        attributes.insert(
            "source.id".to_string(),
            AttrValue::Str("tenant-a".to_string()),
        );
        Batch::single(ResourceGroup {
            attributes,
            scopes: vec![],
        })
    }

    #[tokio::test]
    async fn consume_succeeds_on_2xx() {
        let addr = one_shot_server(StatusCode::OK).await;
        let sink = HttpSink::new(&format!("http://{addr}/v1/metrics")).expect("valid uri");

        sink.consume(sample_batch()).await.expect("downstream accepts");
    }

    #[tokio::test]
    async fn consume_surfaces_non_2xx() {
        let addr = one_shot_server(StatusCode::SERVICE_UNAVAILABLE).await;
        let sink = HttpSink::new(&format!("http://{addr}/v1/metrics")).expect("valid uri");

        let err = sink
            .consume(sample_batch())
            .await
            .expect_err("downstream refuses");
        match err {
            Error::Status { status } => assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_invalid_uri() {
        assert!(matches!(
            HttpSink::new("not a uri"),
            Err(Error::InvalidUri(_))
        ));
    }
}
