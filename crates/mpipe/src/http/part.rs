//! Decoded form events and part streams

use crate::http::MultipartError;

use std::fmt::{self, Debug};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures::channel::mpsc;
use futures::stream::{Stream, StreamExt};

/// Part stream error
#[derive(Debug, Clone, thiserror::Error)]
pub enum PartStreamError {
    /// The decoder stopped before the closing delimiter of the part
    #[error("PartStreamError: Incomplete")]
    Incomplete,
    /// The request failed while the part was being read
    #[error("PartStreamError: Interrupted: {0}")]
    Interrupted(String),
}

/// Message sent from the decoder to a part consumer
#[derive(Debug)]
pub(crate) enum Frame {
    Data(Bytes),
    Eof,
    Error(PartStreamError),
}

/// Single-pass byte stream of one file part.
///
/// The stream only ends cleanly when the decoder has seen the part's closing
/// delimiter. Anything else ends it with an error.
pub struct PartStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, PartStreamError>> + Send + Sync + 'static>>,
}

impl Debug for PartStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartStream {{...}}")
    }
}

impl PartStream {
    #[must_use]
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, PartStreamError>> + Send + Sync + 'static,
    {
        Self { inner: Box::pin(stream) }
    }

    pub(crate) fn from_channel(rx: mpsc::Receiver<Frame>) -> Self {
        Self::from_stream(ChannelStream { rx: Some(rx) })
    }
}

/// Adapts decoder frames into part stream items
struct ChannelStream {
    rx: Option<mpsc::Receiver<Frame>>,
}

impl Stream for ChannelStream {
    type Item = Result<Bytes, PartStreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(rx) = self.rx.as_mut() else {
            return Poll::Ready(None);
        };
        let item = match ready!(rx.poll_next_unpin(cx)) {
            Some(Frame::Data(bytes)) => return Poll::Ready(Some(Ok(bytes))),
            Some(Frame::Eof) => None,
            Some(Frame::Error(err)) => Some(Err(err)),
            None => Some(Err(PartStreamError::Incomplete)),
        };
        self.rx = None;
        Poll::Ready(item)
    }
}

impl Stream for PartStream {
    type Item = Result<Bytes, PartStreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// One file-bearing segment of a multipart body
#[derive(Debug)]
pub struct Part {
    /// Form field name
    pub field_name: String,
    /// File name as declared by the client, untrusted
    pub file_name: String,
    /// Declared content type, `application/octet-stream` when absent
    pub content_type: String,
    /// Value of a part-level `Content-Length` header
    pub content_length: Option<u64>,
    pub stream: PartStream,
}

#[derive(Debug)]
pub enum FormEvent {
    Field { name: String, value: String },
    Part(Part),
}

/// A stream of form events that also reports its byte counters.
///
/// The stream ends once the closing delimiter has been read, or yields a
/// single error and then ends.
pub trait FormDecoder: Stream<Item = Result<FormEvent, MultipartError>> + Send + Unpin {
    /// Bytes read from the request body so far
    fn bytes_received(&self) -> u64;

    /// Declared length of the request body, if any
    fn bytes_expected(&self) -> Option<u64>;
}
