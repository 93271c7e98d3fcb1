//! HTTP service
//!
//! [`RelayService`] exposes a [`Relay`] as a hyper and tower service that
//! answers every request with a JSON document.
//!
//! # Using with Hyper
//!
//! ```no_run
//! use mpipe::relay::RelayBuilder;
//! use mpipe::service::RelayService;
//! use mpipe::sink::{StorageSink, UploadRequest};
//! use mpipe::StdError;
//! use hyper_util::rt::{TokioExecutor, TokioIo};
//! use hyper_util::server::conn::auto::Builder as ConnBuilder;
//! use tokio::net::TcpListener;
//!
//! struct Discard;
//!
//! #[async_trait::async_trait]
//! impl StorageSink for Discard {
//!     async fn upload(&self, mut req: UploadRequest) -> Result<(), StdError> {
//!         use futures::StreamExt;
//!         while let Some(chunk) = req.stream.next().await {
//!             chunk?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let service = RelayService::new(RelayBuilder::new(Discard).build());
//! let listener = TcpListener::bind("127.0.0.1:8014").await?;
//!
//! loop {
//!     let (stream, _) = listener.accept().await?;
//!     let io = TokioIo::new(stream);
//!     let service = service.clone();
//!
//!     tokio::spawn(async move {
//!         let _ = ConnBuilder::new(TokioExecutor::new())
//!             .serve_connection(io, service)
//!             .await;
//!     });
//! }
//! # }
//! ```

use crate::error::{RelayError, StdError};
use crate::relay::{Relay, RelayOutput};

use std::convert::Infallible;
use std::fmt;

use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::error;

pub type HttpResponse = Response<Full<Bytes>>;

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

/// Relays multipart uploads and answers with JSON.
///
/// + `200` with `{"fields": {...}, "files": {...}}` on success
/// + the classified status with `{"code": "...", "message": "..."}` on failure
#[derive(Clone)]
pub struct RelayService {
    relay: Relay,
}

impl RelayService {
    #[must_use]
    pub fn new(relay: Relay) -> Self {
        Self { relay }
    }

    #[must_use]
    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Relays `req` and converts the verdict into a response
    pub async fn call<B>(&self, req: http::Request<B>) -> HttpResponse
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<StdError>,
    {
        match self.relay.call(req).await {
            Ok(output) => success_response(&output),
            Err(err) => error_response(&err),
        }
    }

    async fn call_owned<B>(self, req: http::Request<B>) -> Result<HttpResponse, Infallible>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<StdError>,
    {
        Ok(self.call(req).await)
    }
}

impl fmt::Debug for RelayService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayService").finish_non_exhaustive()
    }
}

fn json_response(status: StatusCode, body: Vec<u8>) -> HttpResponse {
    let mut resp = Response::new(Full::new(Bytes::from(body)));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn success_response(output: &RelayOutput) -> HttpResponse {
    match serde_json::to_vec(output) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(err) => {
            error!(%err, "failed to serialize relay output");
            error_response(&RelayError::Internal("failed to serialize relay output"))
        }
    }
}

fn error_response(err: &RelayError) -> HttpResponse {
    let kind = err.kind();
    let body = ErrorBody {
        code: kind.as_str(),
        message: err.to_string(),
    };
    // serializing two strings cannot fail
    let body = serde_json::to_vec(&body).unwrap_or_default();
    json_response(kind.status_code(), body)
}

impl hyper::service::Service<http::Request<hyper::body::Incoming>> for RelayService {
    type Response = HttpResponse;

    type Error = Infallible;

    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn call(&self, req: http::Request<hyper::body::Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(service.call_owned(req))
    }
}

impl<B> tower::Service<http::Request<B>> for RelayService
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<StdError>,
{
    type Response = HttpResponse;

    type Error = Infallible;

    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let service = self.clone();
        Box::pin(service.call_owned(req))
    }
}
