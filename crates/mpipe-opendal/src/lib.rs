#![cfg_attr(docsrs, feature(doc_cfg))]

use mpipe::StdError;
use mpipe::sink::{StorageSink, UploadRequest};

use futures::StreamExt;
use opendal::Operator;
use tracing::{debug, warn};

/// A storage sink backed by an `OpenDAL` [`Operator`].
///
/// Every part is written with a streaming writer. A part that fails midway
/// is aborted, so no partial object is left behind on services that support
/// aborting.
#[derive(Clone)]
pub struct OpendalSink {
    operator: Operator,
    prefix: Option<String>,
}

impl OpendalSink {
    #[must_use]
    pub fn new(operator: Operator) -> Self {
        Self { operator, prefix: None }
    }

    /// Stores every object under `prefix`
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    #[must_use]
    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    #[must_use]
    pub fn into_operator(self) -> Operator {
        self.operator
    }

    fn path(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}{key}"),
            None => key.to_owned(),
        }
    }
}

#[async_trait::async_trait]
impl StorageSink for OpendalSink {
    async fn upload(&self, mut req: UploadRequest) -> Result<(), StdError> {
        let path = self.path(&req.key);
        let mut writer = self.operator.writer_with(&path).content_type(&req.content_type).await?;

        let mut written: u64 = 0;
        while let Some(chunk) = req.stream.next().await {
            let result = match chunk {
                Ok(bytes) => {
                    written += bytes.len() as u64;
                    writer.write(bytes).await.map_err(StdError::from)
                }
                Err(err) => Err(StdError::from(err)),
            };
            if let Err(err) = result {
                warn!(%path, %err, "aborting write");
                if let Err(abort_err) = writer.abort().await {
                    debug!(%path, %abort_err, "abort failed");
                }
                return Err(err);
            }
        }

        writer.close().await?;
        debug!(%path, written, "object written");
        Ok(())
    }
}
