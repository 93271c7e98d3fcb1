use crate::error::StdError;
use crate::sink::{StorageSink, UploadRequest};

use hyper::HeaderMap;
use hyper::StatusCode;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderName, HeaderValue};
use tracing::debug;
use url::Url;

/// A non-2xx response to an upload
#[derive(Debug, thiserror::Error)]
#[error("UploadStatusError: PUT {key:?} returned {status}")]
pub struct UploadStatusError {
    pub key: String,
    pub status: StatusCode,
}

/// Streams every part with an HTTP `PUT` to `{endpoint}/{key}`.
///
/// This suits S3-style object stores behind presigned or open endpoints.
#[derive(Debug, Clone)]
pub struct HttpPutSink {
    client: reqwest::Client,
    endpoint: Url,
    headers: HeaderMap,
}

impl HttpPutSink {
    /// Creates a sink for `endpoint` sending `x-amz-acl: public-read` with every upload
    #[must_use]
    pub fn new(endpoint: Url) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static("x-amz-acl"), HeaderValue::from_static("public-read"));
        Self {
            client: reqwest::Client::new(),
            endpoint,
            headers,
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Replaces the extra headers sent with every upload
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    fn object_url(&self, key: &str) -> Result<Url, StdError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|()| format!("endpoint {} cannot be a base URL", self.endpoint))?
            .pop_if_empty()
            .extend(key.split('/'));
        Ok(url)
    }
}

#[async_trait::async_trait]
impl StorageSink for HttpPutSink {
    #[tracing::instrument(level = "debug", skip(self, req), fields(key = %req.key))]
    async fn upload(&self, req: UploadRequest) -> Result<(), StdError> {
        let url = self.object_url(&req.key)?;

        let mut headers = self.headers.clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(&req.content_type)?);
        if let Some(len) = req.content_length {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
        }

        let resp = self
            .client
            .put(url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(req.stream))
            .send()
            .await?;

        let status = resp.status();
        debug!(%status, "upload finished");
        if !status.is_success() {
            return Err(Box::new(UploadStatusError { key: req.key, status }));
        }
        Ok(())
    }
}
