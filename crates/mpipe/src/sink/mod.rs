//! Storage sinks
//!
//! A [`StorageSink`] receives one [`UploadRequest`] per admitted part and
//! reports exactly one result for it.

use crate::error::StdError;
use crate::http::PartStream;

#[cfg(feature = "http-put")]
mod http_put;
#[cfg(feature = "http-put")]
pub use self::http_put::{HttpPutSink, UploadStatusError};

/// Everything a sink needs to store one part.
///
/// Built fresh for every upload. Sinks never share or mutate it.
#[derive(Debug)]
pub struct UploadRequest {
    /// Destination key
    pub key: String,
    pub content_type: String,
    /// Declared part length, if the client sent one
    pub content_length: Option<u64>,
    /// File name as declared by the client
    pub original_name: String,
    pub stream: PartStream,
}

#[async_trait::async_trait]
pub trait StorageSink: Send + Sync + 'static {
    /// Stores one part.
    ///
    /// The sink must drain `req.stream` to its end or fail. A stream error must
    /// surface as an error result, never as a partial success.
    async fn upload(&self, req: UploadRequest) -> Result<(), StdError>;
}

#[async_trait::async_trait]
impl<T: StorageSink> StorageSink for std::sync::Arc<T> {
    async fn upload(&self, req: UploadRequest) -> Result<(), StdError> {
        (**self).upload(req).await
    }
}
