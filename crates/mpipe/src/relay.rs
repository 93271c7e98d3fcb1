//! Relay and Builder
//!
//! [`Relay`] drives one request at a time: it reads form events from a
//! [`FormDecoder`], admits file parts through the [`AdmissionPolicy`], hands each
//! admitted part to the [`StorageSink`] as a live stream, and reports the
//! aggregate result exactly once.
//!
//! # Example
//!
//! ```
//! use mpipe::admission::AdmissionPolicy;
//! use mpipe::relay::RelayBuilder;
//! use mpipe::sink::{StorageSink, UploadRequest};
//! use mpipe::StdError;
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
//! let mut builder = RelayBuilder::new(Discard);
//! builder.set_policy(AdmissionPolicy::default().with_allowed("image/*".parse().unwrap()));
//! let relay = builder.build();
//! ```

use crate::admission::{AdmissionPolicy, Decision};
use crate::config::{RelayConfig, RelayConfigProvider, StaticConfigProvider};
use crate::error::{RelayError, StdError};
use crate::http::{DecoderLimits, FormDecoder, FormEvent, MultipartDecoder, MultipartError, Part};
use crate::keygen::KeyContext;
use crate::sink::{StorageSink, UploadRequest};
use crate::tracker::CompletionTracker;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt, TryStreamExt};
use http_body_util::BodyExt;
use hyper::{HeaderMap, StatusCode, Uri};
use serde::Serialize;
use tracing::{debug, error, warn};

/// An upload did not settle within the configured deadline
#[derive(Debug, thiserror::Error)]
#[error("UploadTimeout: upload did not settle within {0:?}")]
pub struct UploadTimeout(pub Duration);

/// Request details passed to key generation
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub uri: Uri,
    pub headers: HeaderMap,
}

/// Fields and stored files of a successful request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayOutput {
    /// Form field values, last write wins
    pub fields: BTreeMap<String, String>,
    /// Original file name to destination key, first upload wins
    pub files: BTreeMap<String, String>,
}

/// The verdict handed to the completion callback.
///
/// On failure `files` still lists the parts that were stored before the
/// verdict, so the caller can clean them up.
#[derive(Debug)]
pub struct RelayOutcome {
    pub fields: BTreeMap<String, String>,
    pub files: BTreeMap<String, String>,
    pub error: Option<RelayError>,
}

impl RelayOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.error.as_ref().map_or(StatusCode::OK, RelayError::status_code)
    }

    /// # Errors
    /// Returns the terminal error of a failed request
    pub fn into_result(self) -> Result<RelayOutput, RelayError> {
        match self.error {
            None => Ok(RelayOutput {
                fields: self.fields,
                files: self.files,
            }),
            Some(err) => Err(err),
        }
    }
}

/// Builder for [`Relay`].
pub struct RelayBuilder {
    sink: Arc<dyn StorageSink>,
    policy: AdmissionPolicy,
    config: Option<Arc<dyn RelayConfigProvider>>,
}

impl RelayBuilder {
    /// Creates a builder with the default [`AdmissionPolicy`]
    #[must_use]
    pub fn new(sink: impl StorageSink) -> Self {
        Self {
            sink: Arc::new(sink),
            policy: AdmissionPolicy::default(),
            config: None,
        }
    }

    pub fn set_policy(&mut self, policy: AdmissionPolicy) {
        self.policy = policy;
    }

    /// Sets the configuration provider.
    ///
    /// If not set, defaults to [`StaticConfigProvider::default()`].
    pub fn set_config(&mut self, config: Arc<dyn RelayConfigProvider>) {
        self.config = Some(config);
    }

    #[must_use]
    pub fn build(self) -> Relay {
        let config = self.config.unwrap_or_else(|| Arc::new(StaticConfigProvider::default()));
        Relay {
            inner: Arc::new(Inner {
                policy: self.policy,
                sink: self.sink,
                config,
            }),
        }
    }
}

/// A multipart relay bound to one sink and one admission policy.
///
/// Cheap to clone (uses `Arc` internally).
#[derive(Clone)]
pub struct Relay {
    inner: Arc<Inner>,
}

struct Inner {
    policy: AdmissionPolicy,
    sink: Arc<dyn StorageSink>,
    config: Arc<dyn RelayConfigProvider>,
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}

type UploadResult = (String, String, Result<(), StdError>);

/// Polls the decoder, or never resolves once it is gone
async fn next_event<D: FormDecoder>(source: &mut Option<D>) -> Option<Result<FormEvent, MultipartError>> {
    match source {
        Some(decoder) => decoder.next().await,
        None => std::future::pending().await,
    }
}

impl Relay {
    #[must_use]
    pub fn policy(&self) -> &AdmissionPolicy {
        &self.inner.policy
    }

    /// Relays one request to full settlement.
    ///
    /// `on_complete` fires exactly once, as soon as the verdict is known. The
    /// returned future keeps running until every dispatched upload has settled.
    pub async fn relay<D, F>(&self, decoder: D, cx: RequestContext, on_complete: F)
    where
        D: FormDecoder,
        F: FnOnce(RelayOutcome) + Send + 'static,
    {
        let config = self.inner.config.snapshot();
        self.drive(decoder, cx, &config, on_complete).await;
    }

    /// Relays an HTTP request, resolving as soon as the verdict is known.
    ///
    /// Uploads still in flight at that point keep running in a background task.
    ///
    /// # Errors
    /// Returns the first error observed while relaying the request
    #[tracing::instrument(
        level = "debug",
        skip(self, req),
        fields(method = %req.method(), uri = %req.uri())
    )]
    pub async fn call<B>(&self, req: http::Request<B>) -> Result<RelayOutput, RelayError>
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<StdError>,
    {
        let t0 = Instant::now();

        let config = self.inner.config.snapshot();
        let limits = DecoderLimits::from_config(&config, self.inner.policy.max_total_bytes());

        let (parts, body) = req.into_parts();
        let body = body.into_data_stream().map_err(|e| -> StdError { e.into() });
        let decoder = MultipartDecoder::from_headers(&parts.headers, body, limits)?;
        let cx = RequestContext {
            uri: parts.uri,
            headers: parts.headers,
        };

        let (tx, rx) = oneshot::channel();
        let relay = self.clone();
        tokio::spawn(async move {
            let on_complete = move |outcome: RelayOutcome| {
                let _ = tx.send(outcome);
            };
            relay.drive(decoder, cx, &config, on_complete).await;
        });

        let result = match rx.await {
            Ok(outcome) => outcome.into_result(),
            Err(_) => Err(RelayError::Internal("relay task stopped without a verdict")),
        };

        let duration = t0.elapsed();
        match result {
            Ok(ref output) => debug!(?duration, files = output.files.len(), "request relayed"),
            Err(ref err) => error!(?duration, %err, "request failed"),
        }

        result
    }

    #[tracing::instrument(level = "debug", skip_all, fields(uri = %cx.uri))]
    async fn drive<D, F>(&self, decoder: D, cx: RequestContext, config: &RelayConfig, on_complete: F)
    where
        D: FormDecoder,
        F: FnOnce(RelayOutcome) + Send + 'static,
    {
        let policy = &self.inner.policy;
        let timeout = config.upload_timeout();

        let mut tracker = CompletionTracker::new(RelayOutput::default(), move |output: RelayOutput, error: Option<RelayError>| {
            on_complete(RelayOutcome {
                fields: output.fields,
                files: output.files,
                error,
            });
        });

        let mut source = Some(decoder);
        let mut keys: HashMap<String, String> = HashMap::new();
        let mut uploads: FuturesUnordered<BoxFuture<'static, UploadResult>> = FuturesUnordered::new();

        loop {
            tokio::select! {
                // decoder first, so a decoder-side failure is classified before
                // the upload failure it causes
                biased;

                event = next_event(&mut source), if source.is_some() => match event {
                    Some(Ok(FormEvent::Field { name, value })) => {
                        debug!(%name, "field");
                        if let Some(output) = tracker.data_mut() {
                            output.fields.insert(name, value);
                        }
                    }
                    Some(Ok(FormEvent::Part(part))) => {
                        if !tracker.is_pending() {
                            debug!(file_name = %part.file_name, "request settled, dropping part");
                            continue;
                        }
                        if let Decision::Reject(reason) = policy.decide(&part) {
                            warn!(
                                field_name = %part.field_name,
                                file_name = %part.file_name,
                                content_type = %part.content_type,
                                %reason,
                                "part rejected"
                            );
                            continue;
                        }

                        let (received, expected) = source
                            .as_ref()
                            .map_or((0, None), |d| (d.bytes_received(), d.bytes_expected()));
                        if let Err(err) = policy.check_size(received, expected) {
                            warn!(%err, "aborting request");
                            // dropping the decoder stops reading the request body
                            source = None;
                            tracker.cancel(err);
                            continue;
                        }

                        let key = keys
                            .entry(part.file_name.clone())
                            .or_insert_with(|| {
                                let kcx = KeyContext {
                                    field_name: &part.field_name,
                                    uri: &cx.uri,
                                    headers: &cx.headers,
                                };
                                policy.key_generator().generate(&part.file_name, &part.content_type, &kcx)
                            })
                            .clone();

                        if tracker.register().is_err() {
                            continue;
                        }
                        debug!(file_name = %part.file_name, %key, "part admitted");
                        uploads.push(self.upload(part, key, timeout));
                    }
                    Some(Err(err)) => {
                        source = None;
                        let err = RelayError::from(err);
                        warn!(%err, "decoding failed");
                        tracker.cancel(err);
                    }
                    None => {
                        source = None;
                        debug!(in_flight = tracker.in_flight(), "source closed");
                        tracker.mark_source_closed();
                    }
                },

                Some((name, key, result)) = uploads.next(), if !uploads.is_empty() => match result {
                    Ok(()) => {
                        debug!(file_name = %name, %key, "upload finished");
                        if let Some(output) = tracker.data_mut() {
                            output.files.entry(name).or_insert(key);
                        }
                        tracker.resolve();
                    }
                    Err(err) => {
                        warn!(file_name = %name, %key, %err, "upload failed");
                        tracker.cancel(RelayError::upload_failed(name, key, err));
                        // the upload has settled either way
                        tracker.resolve();
                    }
                },

                else => break,
            }
        }

        if tracker.is_pending() {
            tracker.cancel(RelayError::Internal("relay loop ended without a verdict"));
        }
    }

    fn upload(&self, part: Part, key: String, timeout: Option<Duration>) -> BoxFuture<'static, UploadResult> {
        let sink = Arc::clone(&self.inner.sink);
        let name = part.file_name.clone();
        let req = UploadRequest {
            key: key.clone(),
            content_type: part.content_type,
            content_length: part.content_length,
            original_name: part.file_name,
            stream: part.stream,
        };
        Box::pin(async move {
            let fut = sink.upload(req);
            let result = match timeout {
                None => fut.await,
                Some(t) => match tokio::time::timeout(t, fut).await {
                    Ok(ans) => ans,
                    Err(_) => Err(Box::new(UploadTimeout(t)) as StdError),
                },
            };
            (name, key, result)
        })
    }
}
