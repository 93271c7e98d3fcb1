//! Multipart Upload Relay
//!
//! `mpipe` relays the file parts of a `multipart/form-data` request to remote
//! storage while the request is still arriving. Nothing is buffered to disk:
//! every admitted part is handed to a [`StorageSink`](sink::StorageSink) as a
//! live byte stream, and many parts may be in flight at once.
//!
//! # Architecture
//!
//! A request passes through four stages:
//!
//! 1. A [`FormDecoder`](http::FormDecoder) splits the body into fields and parts
//! 2. The [`AdmissionPolicy`](admission::AdmissionPolicy) accepts or rejects each part
//! 3. A [`KeyGenerator`](keygen::KeyGenerator) picks the destination key
//! 4. The [`StorageSink`](sink::StorageSink) stores the part
//!
//! A [`CompletionTracker`](tracker::CompletionTracker) decides the verdict. It
//! fires exactly once: with success after the last part has been stored, or
//! with the first error observed.
//!
//! # Example
//!
//! ```rust,no_run
//! use mpipe::admission::AdmissionPolicy;
//! use mpipe::keygen::RandomKey;
//! use mpipe::relay::RelayBuilder;
//! use mpipe::service::RelayService;
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
//! let policy = AdmissionPolicy::default()
//!     .with_allowed("image/*".parse().unwrap())
//!     .with_key_generator(RandomKey);
//!
//! let mut builder = RelayBuilder::new(Discard);
//! builder.set_policy(policy);
//! let service = RelayService::new(builder.build());
//! ```
//!
//! # Modules
//!
//! - [`relay`]: The relay loop and its builder
//! - [`service`]: hyper and tower integration
//! - [`tracker`]: Exactly-once completion tracking
//! - [`admission`]: Content type filter and size ceiling
//! - [`keygen`]: Destination key generators
//! - [`sink`]: Storage sink trait and the HTTP `PUT` sink
//! - [`http`]: Streaming `multipart/form-data` decoder
//! - [`config`]: Decoder limits with hot-reload support
//!
//! # Security
//!
//! File names, content types and field values come from the client and are
//! not trusted. Use [`RandomKey`](keygen::RandomKey) or a custom generator
//! when keys must not be chosen by the client.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(
    clippy::bool_assert_comparison,  // I don't like `assert!(!expression)`. It's very misleading.
    clippy::multiple_crate_versions, // Sometimes not fixable
    clippy::module_name_repetitions,
    clippy::single_match_else,
    clippy::wildcard_imports,
    clippy::let_underscore_untyped,
    clippy::needless_continue,
)]

mod error;

pub mod admission;
pub mod config;
pub mod http;
pub mod keygen;
pub mod relay;
pub mod service;
pub mod sink;
pub mod tracker;

pub use self::error::{ErrorKind, RelayError, SharedError, SizeOrigin, StdError};
