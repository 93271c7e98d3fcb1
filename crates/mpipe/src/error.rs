use crate::http::MultipartError;

use std::fmt;
use std::sync::Arc;

use hyper::StatusCode;

/// Boxed error from a foreign source (body transport, storage client)
pub type StdError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Shareable error, used where one failure must be both stored and delivered
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Classification of a failed relay.
///
/// The classification decides the status code at the HTTP boundary. It is not
/// part of the completion contract itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request exceeded the configured byte ceiling
    TooLarge,
    /// The storage sink failed to accept a part
    Upstream,
    /// The request body could not be decoded
    Malformed,
    /// The relay driver stopped without reaching a verdict
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub fn status_code(self) -> StatusCode {
        match self {
            Self::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Upstream | Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Malformed => StatusCode::BAD_REQUEST,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TooLarge => "LimitExceeded",
            Self::Upstream => "UploadFailed",
            Self::Malformed => "DecodeFailed",
            Self::Internal => "InternalError",
        }
    }
}

/// Which figure went over the byte ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeOrigin {
    /// Bytes actually read from the request body
    Received,
    /// The request's `Content-Length`
    Declared,
}

impl fmt::Display for SizeOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Received => f.write_str("received"),
            Self::Declared => f.write_str("declared"),
        }
    }
}

/// The terminal error of a relayed request.
///
/// Cheap to clone: the completion tracker keeps the first error it observed and
/// hands a copy to the terminal callback.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    /// Running or declared request size is above the ceiling
    #[error("RelayError: LimitExceeded: {origin} size of {size} bytes exceeds limit of {limit} bytes")]
    LimitExceeded { size: u64, limit: u64, origin: SizeOrigin },

    /// A storage sink reported failure (or timed out) for one part
    #[error("RelayError: UploadFailed: part {name:?} (key {key:?}): {source}")]
    UploadFailed {
        name: String,
        key: String,
        #[source]
        source: SharedError,
    },

    /// Malformed multipart framing, bad content type, or transport error
    #[error("RelayError: DecodeFailed: {0}")]
    DecodeFailed(#[source] Arc<MultipartError>),

    #[error("RelayError: Internal: {0}")]
    Internal(&'static str),
}

impl RelayError {
    #[must_use]
    pub fn upload_failed(name: impl Into<String>, key: impl Into<String>, source: StdError) -> Self {
        Self::UploadFailed {
            name: name.into(),
            key: key.into(),
            source: Arc::from(source),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LimitExceeded { .. } => ErrorKind::TooLarge,
            Self::UploadFailed { .. } => ErrorKind::Upstream,
            Self::DecodeFailed(_) => ErrorKind::Malformed,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.kind().status_code()
    }
}

impl From<MultipartError> for RelayError {
    fn from(err: MultipartError) -> Self {
        match err {
            MultipartError::LimitExceeded(received, limit) => Self::LimitExceeded {
                size: received,
                limit,
                origin: SizeOrigin::Received,
            },
            other => Self::DecodeFailed(Arc::new(other)),
        }
    }
}
