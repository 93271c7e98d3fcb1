//! Streaming multipart/form-data decoder
//!
//! See <https://www.rfc-editor.org/rfc/rfc7578>
//!
//! Fields are buffered (they are small and bounded by limits). File parts are
//! forwarded chunk by chunk through a bounded channel, so the request body is
//! read no faster than the slowest consumer drains it.
//!

use crate::config::RelayConfig;
use crate::error::StdError;
use crate::http::content_type::{ContentTypeError, extract_boundary};
use crate::http::part::{FormDecoder, FormEvent, Frame, Part, PartStream, PartStreamError};

use std::fmt::{self, Debug};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::SinkExt;
use futures::stream::{Stream, StreamExt};
use hyper::HeaderMap;
use hyper::header::CONTENT_LENGTH;
use memchr::memmem;
use transform_stream::{AsyncTryStream, Yielder};

/// Content type of a file part without a `Content-Type` header
const DEFAULT_PART_CONTENT_TYPE: &str = "application/octet-stream";

/// Header slots per part
const MAX_PART_HEADERS: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum MultipartError {
    #[error("MultipartError: Underlying: {0}")]
    Underlying(StdError),
    #[error("MultipartError: InvalidFormat")]
    InvalidFormat,
    #[error("MultipartError: Incomplete: body ended before the closing delimiter")]
    Incomplete,
    #[error("MultipartError: ContentType: {0}")]
    ContentType(#[from] ContentTypeError),
    #[error("MultipartError: FieldTooLarge: field size {0} bytes exceeds limit of {1} bytes")]
    FieldTooLarge(usize, usize),
    #[error("MultipartError: TotalSizeTooLarge: total form fields size {0} bytes exceeds limit of {1} bytes")]
    TotalSizeTooLarge(usize, usize),
    #[error("MultipartError: TooManyParts: part count {0} exceeds limit of {1}")]
    TooManyParts(usize, usize),
    #[error("MultipartError: HeaderTooLarge: part header size {0} bytes exceeds limit of {1} bytes")]
    HeaderTooLarge(usize, usize),
    #[error("MultipartError: LimitExceeded: body size {0} bytes exceeds limit of {1} bytes")]
    LimitExceeded(u64, u64),
}

/// Bounds applied while decoding one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderLimits {
    pub max_form_field_size: usize,
    pub max_form_fields_size: usize,
    pub max_form_parts: usize,
    pub max_header_size: usize,
    /// Ceiling on the whole request body, `None` for unbounded
    pub max_total_bytes: Option<u64>,
    pub part_channel_capacity: usize,
}

impl DecoderLimits {
    #[must_use]
    pub fn from_config(config: &RelayConfig, max_total_bytes: Option<u64>) -> Self {
        Self {
            max_form_field_size: config.max_form_field_size,
            max_form_fields_size: config.max_form_fields_size,
            max_form_parts: config.max_form_parts,
            max_header_size: config.max_header_size,
            max_total_bytes,
            part_channel_capacity: config.part_channel_capacity,
        }
    }
}

impl Default for DecoderLimits {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default(), None)
    }
}

/// The built-in [`FormDecoder`]
pub struct MultipartDecoder {
    inner: AsyncTryStream<FormEvent, MultipartError, BoxFuture<'static, Result<(), MultipartError>>>,
    bytes_received: Arc<AtomicU64>,
    bytes_expected: Option<u64>,
}

impl Debug for MultipartDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartDecoder")
            .field("bytes_received", &self.bytes_received())
            .field("bytes_expected", &self.bytes_expected)
            .finish_non_exhaustive()
    }
}

impl MultipartDecoder {
    /// Constructs a decoder over `body` delimited by `boundary`
    #[must_use]
    pub fn new<S>(body: S, boundary: &[u8], bytes_expected: Option<u64>, limits: DecoderLimits) -> Self
    where
        S: Stream<Item = Result<Bytes, StdError>> + Send + 'static,
    {
        let bytes_received = Arc::new(AtomicU64::new(0));
        let reader = Reader {
            body: Box::pin(body),
            buf: BytesMut::new(),
            received: Arc::clone(&bytes_received),
            limit: limits.max_total_bytes,
        };

        // `--{boundary}`
        let dash_boundary: Box<[u8]> = {
            let mut v = Vec::with_capacity(boundary.len().saturating_add(2));
            v.extend_from_slice(b"--");
            v.extend_from_slice(boundary);
            v.into()
        };

        Self {
            inner: AsyncTryStream::new(|y| -> BoxFuture<'static, Result<(), MultipartError>> {
                Box::pin(generate(y, reader, dash_boundary, limits))
            }),
            bytes_received,
            bytes_expected,
        }
    }

    /// Constructs a decoder from request headers.
    ///
    /// The boundary comes from `Content-Type` and the expected length from
    /// `Content-Length`.
    ///
    /// # Errors
    /// Returns an error if the request is not `multipart/form-data` with a valid boundary
    pub fn from_headers<S>(headers: &HeaderMap, body: S, limits: DecoderLimits) -> Result<Self, MultipartError>
    where
        S: Stream<Item = Result<Bytes, StdError>> + Send + 'static,
    {
        let boundary = extract_boundary(headers)?;
        let bytes_expected = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| atoi::atoi::<u64>(v.as_bytes()));
        Ok(Self::new(body, boundary.as_bytes(), bytes_expected, limits))
    }
}

impl Stream for MultipartDecoder {
    type Item = Result<FormEvent, MultipartError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl FormDecoder for MultipartDecoder {
    fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    fn bytes_expected(&self) -> Option<u64> {
        self.bytes_expected
    }
}

/// Buffered, counted view of the request body
struct Reader<S> {
    body: Pin<Box<S>>,
    buf: BytesMut,
    received: Arc<AtomicU64>,
    limit: Option<u64>,
}

impl<S> Reader<S>
where
    S: Stream<Item = Result<Bytes, StdError>> + Send,
{
    /// Appends the next body chunk to the buffer. Returns `false` at end of body.
    async fn fill(&mut self) -> Result<bool, MultipartError> {
        loop {
            match self.body.as_mut().next().await {
                None => return Ok(false),
                Some(Err(e)) => return Err(MultipartError::Underlying(e)),
                Some(Ok(bytes)) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    let len = bytes.len() as u64;
                    let total = self.received.fetch_add(len, Ordering::Relaxed).saturating_add(len);
                    if let Some(limit) = self.limit
                        && total > limit
                    {
                        return Err(MultipartError::LimitExceeded(total, limit));
                    }
                    self.buf.extend_from_slice(&bytes);
                    return Ok(true);
                }
            }
        }
    }

    async fn fill_to(&mut self, len: usize) -> Result<(), MultipartError> {
        while self.buf.len() < len {
            if !self.fill().await? {
                return Err(MultipartError::Incomplete);
            }
        }
        Ok(())
    }

    /// Discards everything up to and including the first `--{boundary}`
    async fn skip_preamble(&mut self, dash_boundary: &[u8]) -> Result<(), MultipartError> {
        while self.buf.len() < dash_boundary.len() {
            if !self.fill().await? {
                return Err(MultipartError::InvalidFormat);
            }
        }
        if self.buf.starts_with(dash_boundary) {
            self.buf.advance(dash_boundary.len());
            return Ok(());
        }

        let finder = memmem::Finder::new(dash_boundary);
        loop {
            let found = finder
                .find_iter(&self.buf)
                .find(|&idx| idx >= 2 && self.buf[idx - 2..idx] == *b"\r\n");
            if let Some(idx) = found {
                self.buf.advance(idx + dash_boundary.len());
                return Ok(());
            }
            let keep = dash_boundary.len().saturating_add(1);
            if self.buf.len() > keep {
                self.buf.advance(self.buf.len() - keep);
            }
            if !self.fill().await? {
                return Err(MultipartError::InvalidFormat);
            }
        }
    }

    async fn read_headers(&mut self, max_header_size: usize) -> Result<PartHeaders, MultipartError> {
        loop {
            let mut headers = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
            match httparse::parse_headers(&self.buf, &mut headers) {
                Ok(httparse::Status::Complete((idx, parsed))) => {
                    if idx > max_header_size {
                        return Err(MultipartError::HeaderTooLarge(idx, max_header_size));
                    }
                    let ans = PartHeaders::parse(parsed)?;
                    self.buf.advance(idx);
                    return Ok(ans);
                }
                Ok(httparse::Status::Partial) => {
                    if self.buf.len() > max_header_size {
                        return Err(MultipartError::HeaderTooLarge(self.buf.len(), max_header_size));
                    }
                    if !self.fill().await? {
                        return Err(MultipartError::Incomplete);
                    }
                }
                Err(_) => return Err(MultipartError::InvalidFormat),
            }
        }
    }

    /// Reads a field value terminated by `delimiter`, consuming the delimiter
    async fn read_field(&mut self, delimiter: &[u8], max_size: usize) -> Result<Bytes, MultipartError> {
        let finder = memmem::Finder::new(delimiter);
        let mut searched: usize = 0;
        loop {
            if let Some(idx) = finder.find(&self.buf[searched..]) {
                let len = searched + idx;
                if len > max_size {
                    return Err(MultipartError::FieldTooLarge(len, max_size));
                }
                let value = self.buf.split_to(len).freeze();
                self.buf.advance(delimiter.len());
                return Ok(value);
            }

            searched = self.buf.len().saturating_sub(delimiter.len() - 1);
            if searched > max_size {
                return Err(MultipartError::FieldTooLarge(searched, max_size));
            }
            if !self.fill().await? {
                return Err(MultipartError::Incomplete);
            }
        }
    }

    /// Forwards file bytes up to `delimiter`, consuming the delimiter.
    ///
    /// The last `delimiter.len() - 1` buffered bytes are held back because they
    /// may be the start of the delimiter.
    async fn pump(&mut self, delimiter: &[u8], tx: &mut Option<mpsc::Sender<Frame>>) -> Result<(), MultipartError> {
        let finder = memmem::Finder::new(delimiter);
        let keep = delimiter.len() - 1;
        loop {
            if let Some(idx) = finder.find(&self.buf) {
                let data = self.buf.split_to(idx).freeze();
                self.buf.advance(delimiter.len());
                if !data.is_empty() {
                    forward(tx, Frame::Data(data)).await;
                }
                forward(tx, Frame::Eof).await;
                return Ok(());
            }

            if self.buf.len() > keep {
                let data = self.buf.split_to(self.buf.len() - keep).freeze();
                forward(tx, Frame::Data(data)).await;
            }

            match self.fill().await {
                Ok(true) => {}
                Ok(false) => {
                    forward(tx, Frame::Error(PartStreamError::Incomplete)).await;
                    return Err(MultipartError::Incomplete);
                }
                Err(e) => {
                    forward(tx, Frame::Error(PartStreamError::Interrupted(e.to_string()))).await;
                    return Err(e);
                }
            }
        }
    }
}

/// Sends a frame to the part consumer. Once the consumer is gone the
/// remaining frames of the part are discarded.
async fn forward(tx: &mut Option<mpsc::Sender<Frame>>, frame: Frame) {
    if let Some(sender) = tx
        && sender.send(frame).await.is_err()
    {
        *tx = None;
    }
}

/// internal async generator
async fn generate<S>(
    mut y: Yielder<Result<FormEvent, MultipartError>>,
    mut reader: Reader<S>,
    dash_boundary: Box<[u8]>,
    limits: DecoderLimits,
) -> Result<(), MultipartError>
where
    S: Stream<Item = Result<Bytes, StdError>> + Send,
{
    // `\r\n--{boundary}`
    let delimiter: Box<[u8]> = {
        let mut v = Vec::with_capacity(dash_boundary.len().saturating_add(2));
        v.extend_from_slice(b"\r\n");
        v.extend_from_slice(&dash_boundary);
        v.into()
    };

    reader.skip_preamble(&dash_boundary).await?;

    let mut parts_count: usize = 0;
    let mut total_fields_size: usize = 0;

    loop {
        // the buffer starts right after a boundary
        reader.fill_to(2).await?;
        if reader.buf.starts_with(b"--") {
            // close delimiter, the epilogue is ignored
            return Ok(());
        }
        if !reader.buf.starts_with(b"\r\n") {
            return Err(MultipartError::InvalidFormat);
        }
        reader.buf.advance(2);

        parts_count += 1;
        if parts_count > limits.max_form_parts {
            return Err(MultipartError::TooManyParts(parts_count, limits.max_form_parts));
        }

        let headers = reader.read_headers(limits.max_header_size).await?;

        match headers.filename {
            None => {
                let value = reader.read_field(&delimiter, limits.max_form_field_size).await?;

                total_fields_size = total_fields_size.saturating_add(value.len());
                if total_fields_size > limits.max_form_fields_size {
                    return Err(MultipartError::TotalSizeTooLarge(
                        total_fields_size,
                        limits.max_form_fields_size,
                    ));
                }

                let Ok(value) = String::from_utf8(value.to_vec()) else {
                    return Err(MultipartError::InvalidFormat);
                };
                y.yield_ok(FormEvent::Field { name: headers.name, value }).await;
            }
            Some(file_name) => {
                let (tx, rx) = mpsc::channel(limits.part_channel_capacity);
                let part = Part {
                    field_name: headers.name,
                    file_name,
                    content_type: headers
                        .content_type
                        .unwrap_or_else(|| DEFAULT_PART_CONTENT_TYPE.to_owned()),
                    content_length: headers.content_length,
                    stream: PartStream::from_channel(rx),
                };
                y.yield_ok(FormEvent::Part(part)).await;

                let mut tx = Some(tx);
                reader.pump(&delimiter, &mut tx).await?;
            }
        }
    }
}

/// Owned header values of one part
#[derive(Debug)]
struct PartHeaders {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    content_length: Option<u64>,
}

impl PartHeaders {
    fn parse(headers: &[httparse::Header<'_>]) -> Result<Self, MultipartError> {
        let mut content_disposition_bytes = None;
        let mut content_type_bytes = None;
        let mut content_length = None;
        for header in headers {
            if header.name.eq_ignore_ascii_case("Content-Disposition") {
                content_disposition_bytes = Some(header.value);
            } else if header.name.eq_ignore_ascii_case("Content-Type") {
                content_type_bytes = Some(header.value);
            } else if header.name.eq_ignore_ascii_case("Content-Length") {
                content_length = atoi::atoi::<u64>(header.value);
            }
        }

        let content_disposition = match content_disposition_bytes.map(parse_content_disposition) {
            None | Some(Err(_)) => return Err(MultipartError::InvalidFormat),
            Some(Ok((_, c))) => c,
        };
        let content_type = match content_type_bytes.map(std::str::from_utf8) {
            None => None,
            Some(Err(_)) => return Err(MultipartError::InvalidFormat),
            Some(Ok(s)) => Some(s.to_owned()),
        };

        Ok(Self {
            name: content_disposition.name.to_owned(),
            filename: content_disposition.filename.map(str::to_owned),
            content_type,
            content_length,
        })
    }
}

/// Content-Disposition
#[derive(Debug)]
struct ContentDisposition<'a> {
    /// name
    name: &'a str,
    /// filename, possibly empty
    filename: Option<&'a str>,
}

/// parse content disposition value
fn parse_content_disposition(input: &[u8]) -> nom::IResult<&[u8], ContentDisposition<'_>> {
    use nom::Parser;
    use nom::bytes::complete::{tag, take, take_till, take_till1};
    use nom::character::complete::space0;
    use nom::combinator::{all_consuming, map_res, opt};
    use nom::sequence::{delimited, preceded};

    // TODO: RFC 5987 `filename*=` parameters

    let parse_name = delimited(
        tag(&b"name=\""[..]),
        map_res(take_till1(|c| c == b'"'), std::str::from_utf8),
        take(1_usize),
    );

    let parse_filename = delimited(
        tag(&b"filename=\""[..]),
        map_res(take_till(|c| c == b'"'), std::str::from_utf8),
        take(1_usize),
    );

    let mut parse = all_consuming((
        preceded((tag(&b"form-data;"[..]), space0), parse_name),
        opt(preceded((tag(&b";"[..]), space0), parse_filename)),
    ));

    let (remaining, (name, filename)) = parse.parse(input)?;

    Ok((remaining, ContentDisposition { name, filename }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::slice;

    #[derive(Debug)]
    enum Collected {
        Field(String, String),
        File {
            field_name: String,
            file_name: String,
            content_type: String,
            content: Result<Vec<u8>, PartStreamError>,
        },
    }

    async fn aggregate(mut stream: PartStream) -> Result<Vec<u8>, PartStreamError> {
        let mut buf = Vec::new();
        while let Some(bytes) = stream.next().await {
            buf.extend_from_slice(&bytes?);
        }
        Ok(buf)
    }

    /// Drives the decoder while draining every part concurrently
    async fn decode(mut decoder: MultipartDecoder) -> (Vec<Collected>, Option<MultipartError>) {
        let mut pending = Vec::new();
        let mut error = None;
        while let Some(event) = decoder.next().await {
            match event {
                Ok(FormEvent::Field { name, value }) => pending.push(Err(Collected::Field(name, value))),
                Ok(FormEvent::Part(part)) => {
                    let handle = tokio::spawn(aggregate(part.stream));
                    pending.push(Ok((part.field_name, part.file_name, part.content_type, handle)));
                }
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }
        let mut ans = Vec::new();
        for item in pending {
            match item {
                Err(field) => ans.push(field),
                Ok((field_name, file_name, content_type, handle)) => ans.push(Collected::File {
                    field_name,
                    file_name,
                    content_type,
                    content: handle.await.unwrap(),
                }),
            }
        }
        (ans, error)
    }

    fn body_from_strings(ss: Vec<String>) -> impl Stream<Item = Result<Bytes, StdError>> + Send + 'static {
        futures::stream::iter(ss.into_iter().map(|s| Ok::<_, StdError>(Bytes::from(s))))
    }

    fn body_bytewise(s: &str) -> impl Stream<Item = Result<Bytes, StdError>> + Send + 'static {
        let chunks = s
            .as_bytes()
            .iter()
            .map(|b| Ok(Bytes::copy_from_slice(slice::from_ref(b))))
            .collect::<Vec<Result<Bytes, StdError>>>();
        futures::stream::iter(chunks)
    }

    fn sample_body(boundary: &str) -> String {
        format!(
            concat!(
                "--{b}\r\n",
                "Content-Disposition: form-data; name=\"album\"\r\n",
                "\r\n",
                "summer\r\n",
                "--{b}\r\n",
                "Content-Disposition: form-data; name=\"photo\"; filename=\"a.png\"\r\n",
                "Content-Type: image/png\r\n",
                "\r\n",
                "\r\n--not-the-boundary\r\n{b}\r\n",
                "--{b}\r\n",
                "Content-Disposition: form-data; name=\"notes\"; filename=\"b.txt\"\r\n",
                "\r\n",
                "plain text\r\n",
                "--{b}--\r\n",
            ),
            b = boundary
        )
    }

    fn assert_sample(events: &[Collected]) {
        assert_eq!(events.len(), 3);
        match &events[0] {
            Collected::Field(name, value) => {
                assert_eq!(name, "album");
                assert_eq!(value, "summer");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match &events[1] {
            Collected::File {
                field_name,
                file_name,
                content_type,
                content,
            } => {
                assert_eq!(field_name, "photo");
                assert_eq!(file_name, "a.png");
                assert_eq!(content_type, "image/png");
                assert_eq!(content.as_ref().unwrap(), b"\r\n--not-the-boundary\r\n9431149156168");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match &events[2] {
            Collected::File {
                file_name,
                content_type,
                content,
                ..
            } => {
                assert_eq!(file_name, "b.txt");
                assert_eq!(content_type, DEFAULT_PART_CONTENT_TYPE);
                assert_eq!(content.as_ref().unwrap(), b"plain text");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn content_disposition() {
        {
            let text = b"form-data; name=\"Signature\"";
            let (_, ans) = parse_content_disposition(text).unwrap();
            assert_eq!(ans.name, "Signature");
            assert_eq!(ans.filename, None);
        }
        {
            let text = b"form-data; name=\"file\"; filename=\"MyFilename.jpg\"";
            let (_, ans) = parse_content_disposition(text).unwrap();
            assert_eq!(ans.name, "file");
            assert_eq!(ans.filename, Some("MyFilename.jpg"));
        }
        {
            let text = b"form-data;name=\"file\";filename=\"\"";
            let (_, ans) = parse_content_disposition(text).unwrap();
            assert_eq!(ans.name, "file");
            assert_eq!(ans.filename, Some(""));
        }
        {
            let text = b"attachment; name=\"file\"";
            assert!(parse_content_disposition(text).is_err());
        }
    }

    #[tokio::test]
    async fn multipart() {
        let boundary = "9431149156168";
        let body = body_from_strings(vec![sample_body(boundary)]);
        let decoder = MultipartDecoder::new(body, boundary.as_bytes(), None, DecoderLimits::default());

        let (events, error) = decode(decoder).await;
        assert!(error.is_none(), "{error:?}");
        assert_sample(&events);
    }

    #[tokio::test]
    async fn multipart_bytewise() {
        let boundary = "9431149156168";
        let body = body_bytewise(&sample_body(boundary));
        let limits = DecoderLimits {
            part_channel_capacity: 1,
            ..DecoderLimits::default()
        };
        let decoder = MultipartDecoder::new(body, boundary.as_bytes(), None, limits);

        let (events, error) = decode(decoder).await;
        assert!(error.is_none(), "{error:?}");
        assert_sample(&events);
    }

    #[tokio::test]
    async fn preamble_and_epilogue() {
        let boundary = "xyz";
        let body = concat!(
            "this is a preamble --xyz that must be skipped\r\n",
            "--xyz\r\n",
            "Content-Disposition: form-data; name=\"k\"\r\n",
            "\r\n",
            "v\r\n",
            "--xyz--\r\n",
            "epilogue --xyz\r\n garbage",
        )
        .to_owned();
        let decoder = MultipartDecoder::new(
            body_from_strings(vec![body]),
            boundary.as_bytes(),
            None,
            DecoderLimits::default(),
        );
        let (events, error) = decode(decoder).await;
        assert!(error.is_none(), "{error:?}");
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Collected::Field(k, v) if k == "k" && v == "v"));
    }

    #[tokio::test]
    async fn empty_form() {
        let decoder = MultipartDecoder::new(
            body_from_strings(vec!["--b--\r\n".to_owned()]),
            b"b",
            None,
            DecoderLimits::default(),
        );
        let (events, error) = decode(decoder).await;
        assert!(error.is_none(), "{error:?}");
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn from_headers() {
        let boundary = "9431149156168";
        let body = sample_body(boundary);

        let mut headers = HeaderMap::new();
        headers.insert(
            hyper::header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}").parse().unwrap(),
        );
        headers.insert(CONTENT_LENGTH, body.len().to_string().parse().unwrap());

        let len = body.len() as u64;
        let decoder = MultipartDecoder::from_headers(&headers, body_from_strings(vec![body]), DecoderLimits::default()).unwrap();
        assert_eq!(decoder.bytes_expected(), Some(len));
        assert_eq!(decoder.bytes_received(), 0);

        let (events, error) = decode(decoder).await;
        assert!(error.is_none(), "{error:?}");
        assert_sample(&events);
    }

    #[tokio::test]
    async fn from_headers_rejects_non_multipart() {
        let mut headers = HeaderMap::new();
        headers.insert(hyper::header::CONTENT_TYPE, "application/json".parse().unwrap());
        let result = MultipartDecoder::from_headers(&headers, body_from_strings(vec![]), DecoderLimits::default());
        assert!(matches!(result, Err(MultipartError::ContentType(_))));
    }

    #[tokio::test]
    async fn post_object() {
        let bytes: &[&[u8]] = &[
            b"--------------------------c634190ccaebbc34\r\nContent-Disposition: form-data; name=\"x-amz-sig",
            b"nature\"\r\n\r\na71d6dfaaa5aa018dc8e3945f2cec30ea1939ff7ed2f2dd65a6d49320c8fa1e6\r\n----------",
            b"----------------c634190ccaebbc34\r\nContent-Disposition: form-data; name=\"key\"\r\n\r\nmc-te",
            b"st-object-7658\r\n--------------------------c634190ccaebbc34\r\nContent-Disposition: form-data; na",
            b"me=\"file\"; filename=\"datafile-1-MB\"\r\nContent-Type: app",
            b"lication/octet-stream\r\n\r\nNxjFYaL4HJsJsSy/d3V7F+s1DfU+AdMw9Ze0GbhIXYn9OCvtkz4/mRdf0/V2gdgc4vuXzWUlVHag",
            b"\npSI7q6mw4aXom0gunpMMUS0cEJgSoqB/yt4roLl2icdCnUPHhiO0SBh1VkBxSz5CwWlN/mmLfu5l\r\n---------------------",
            b"-----c634190ccaebbc34--\r\n",
        ];

        let body_bytes: Vec<Result<Bytes, StdError>> = bytes.iter().copied().map(Bytes::copy_from_slice).map(Ok).collect();
        let body_stream = futures::stream::iter(body_bytes);
        let boundary = "------------------------c634190ccaebbc34";

        let decoder = MultipartDecoder::new(body_stream, boundary.as_bytes(), None, DecoderLimits::default());
        let (events, error) = decode(decoder).await;
        assert!(error.is_none(), "{error:?}");
        assert_eq!(events.len(), 3);

        assert!(matches!(&events[1], Collected::Field(k, v) if k == "key" && v == "mc-test-object-7658"));

        let file_content = concat!(
            "NxjFYaL4HJsJsSy/d3V7F+s1DfU+AdMw9Ze0GbhIXYn9OCvtkz4/mRdf0/V2gdgc4vuXzWUlVHag",
            "\npSI7q6mw4aXom0gunpMMUS0cEJgSoqB/yt4roLl2icdCnUPHhiO0SBh1VkBxSz5CwWlN/mmLfu5l",
        );
        match &events[2] {
            Collected::File {
                file_name,
                content_type,
                content,
                ..
            } => {
                assert_eq!(file_name, "datafile-1-MB");
                assert_eq!(content_type, "application/octet-stream");
                assert_eq!(content.as_ref().unwrap(), file_content.as_bytes());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_part_is_an_error() {
        let body = concat!(
            "--b\r\n",
            "Content-Disposition: form-data; name=\"f\"; filename=\"a.bin\"\r\n",
            "\r\n",
            "half of the file",
        );
        let decoder = MultipartDecoder::new(body_bytewise(body), b"b", None, DecoderLimits::default());
        let (events, error) = decode(decoder).await;

        assert!(matches!(error, Some(MultipartError::Incomplete)), "{error:?}");
        match &events[0] {
            Collected::File { content, .. } => {
                assert!(matches!(content, Err(PartStreamError::Incomplete)), "{content:?}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_decoder_fails_part_stream() {
        let body = concat!(
            "--b\r\n",
            "Content-Disposition: form-data; name=\"f\"; filename=\"a.bin\"\r\n",
            "\r\n",
            "some bytes that never reach their delimiter",
        );
        let mut decoder = MultipartDecoder::new(
            body_from_strings(vec![body.to_owned()]),
            b"b",
            None,
            DecoderLimits::default(),
        );
        let Some(Ok(FormEvent::Part(part))) = decoder.next().await else {
            panic!("expected a part");
        };
        drop(decoder);
        assert!(matches!(aggregate(part.stream).await, Err(PartStreamError::Incomplete)));
    }

    #[tokio::test]
    async fn dropped_part_stream_does_not_stall() {
        let boundary = "b";
        let mut ss = vec![
            format!("--{boundary}\r\n"),
            "Content-Disposition: form-data; name=\"f\"; filename=\"big.bin\"\r\n\r\n".to_owned(),
        ];
        for _ in 0..64 {
            ss.push("x".repeat(1024));
        }
        ss.push(format!("\r\n--{boundary}\r\n"));
        ss.push("Content-Disposition: form-data; name=\"after\"\r\n\r\nstill here".to_owned());
        ss.push(format!("\r\n--{boundary}--\r\n"));

        let limits = DecoderLimits {
            part_channel_capacity: 1,
            ..DecoderLimits::default()
        };
        let mut decoder = MultipartDecoder::new(body_from_strings(ss), boundary.as_bytes(), None, limits);

        let Some(Ok(FormEvent::Part(part))) = decoder.next().await else {
            panic!("expected a part");
        };
        drop(part);

        match decoder.next().await {
            Some(Ok(FormEvent::Field { name, value })) => {
                assert_eq!(name, "after");
                assert_eq!(value, "still here");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(decoder.next().await.is_none());
    }

    #[tokio::test]
    async fn test_total_bytes_limit_mid_part() {
        let boundary = "b";
        let mut ss = vec![
            format!("--{boundary}\r\n"),
            "Content-Disposition: form-data; name=\"f\"; filename=\"big.bin\"\r\n\r\n".to_owned(),
        ];
        for _ in 0..8 {
            ss.push("y".repeat(1024));
        }
        ss.push(format!("\r\n--{boundary}--\r\n"));

        let limits = DecoderLimits {
            max_total_bytes: Some(4096),
            ..DecoderLimits::default()
        };
        let decoder = MultipartDecoder::new(body_from_strings(ss), boundary.as_bytes(), None, limits);
        let (events, error) = decode(decoder).await;

        match error {
            Some(MultipartError::LimitExceeded(received, limit)) => {
                assert_eq!(limit, 4096);
                assert!(received > limit);
            }
            other => panic!("Expected LimitExceeded error, got {other:?}"),
        }
        match &events[0] {
            Collected::File { content, .. } => {
                assert!(matches!(content, Err(PartStreamError::Interrupted(_))), "{content:?}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_field_too_large() {
        let boundary = "boundary123";
        let limits = DecoderLimits::default();
        let large_value = "x".repeat(limits.max_form_field_size + 1000);

        let ss = vec![
            format!("--{boundary}\r\n"),
            "Content-Disposition: form-data; name=\"large_field\"\r\n\r\n".to_owned(),
            large_value,
            format!("\r\n--{boundary}--\r\n"),
        ];

        let decoder = MultipartDecoder::new(body_from_strings(ss), boundary.as_bytes(), None, limits);
        let (_, error) = decode(decoder).await;
        assert!(matches!(error, Some(MultipartError::FieldTooLarge(..))), "{error:?}");
    }

    #[tokio::test]
    async fn test_total_size_too_large() {
        let boundary = "boundary123";
        let limits = DecoderLimits {
            max_form_field_size: 100,
            max_form_fields_size: 250,
            ..DecoderLimits::default()
        };

        let mut ss = Vec::new();
        for i in 0..3 {
            ss.push(format!("--{boundary}\r\n"));
            ss.push(format!("Content-Disposition: form-data; name=\"field{i}\"\r\n\r\n"));
            ss.push("x".repeat(100));
            ss.push("\r\n".to_owned());
        }
        ss.push(format!("--{boundary}--\r\n"));

        let decoder = MultipartDecoder::new(body_from_strings(ss), boundary.as_bytes(), None, limits);
        let (events, error) = decode(decoder).await;
        assert_eq!(events.len(), 2);
        match error {
            Some(MultipartError::TotalSizeTooLarge(size, limit)) => {
                assert_eq!(limit, 250);
                assert_eq!(size, 300);
            }
            other => panic!("Expected TotalSizeTooLarge error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_too_many_parts() {
        let boundary = "boundary123";
        let limits = DecoderLimits {
            max_form_parts: 5,
            ..DecoderLimits::default()
        };

        let mut ss = Vec::new();
        for i in 0..6 {
            ss.push(format!("--{boundary}\r\n"));
            ss.push(format!("Content-Disposition: form-data; name=\"field{i}\"\r\n\r\n"));
            ss.push("value".to_owned());
            ss.push("\r\n".to_owned());
        }
        ss.push(format!("--{boundary}--\r\n"));

        let decoder = MultipartDecoder::new(body_from_strings(ss), boundary.as_bytes(), None, limits);
        let (events, error) = decode(decoder).await;
        assert_eq!(events.len(), 5);
        match error {
            Some(MultipartError::TooManyParts(count, limit)) => {
                assert_eq!(limit, 5);
                assert_eq!(count, 6);
            }
            other => panic!("Expected TooManyParts error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_header_too_large() {
        let boundary = "boundary123";
        let limits = DecoderLimits {
            max_header_size: 128,
            ..DecoderLimits::default()
        };

        let ss = vec![
            format!("--{boundary}\r\n"),
            "Content-Disposition: form-data; name=\"f\"\r\n".to_owned(),
            format!("X-Padding: {}\r\n\r\n", "p".repeat(512)),
            "value".to_owned(),
            format!("\r\n--{boundary}--\r\n"),
        ];

        let decoder = MultipartDecoder::new(body_from_strings(ss), boundary.as_bytes(), None, limits);
        let (_, error) = decode(decoder).await;
        assert!(matches!(error, Some(MultipartError::HeaderTooLarge(_, 128))), "{error:?}");
    }

    #[tokio::test]
    async fn test_missing_content_disposition() {
        let ss = vec!["--b\r\nContent-Type: text/plain\r\n\r\nvalue\r\n--b--\r\n".to_owned()];
        let decoder = MultipartDecoder::new(body_from_strings(ss), b"b", None, DecoderLimits::default());
        let (_, error) = decode(decoder).await;
        assert!(matches!(error, Some(MultipartError::InvalidFormat)), "{error:?}");
    }

    #[tokio::test]
    async fn test_underlying_error() {
        let chunks: Vec<Result<Bytes, StdError>> = vec![
            Ok(Bytes::from_static(b"--b\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a\"\r\n\r\nabc")),
            Err("connection reset".into()),
        ];
        let decoder = MultipartDecoder::new(futures::stream::iter(chunks), b"b", None, DecoderLimits::default());
        let (events, error) = decode(decoder).await;
        assert!(matches!(error, Some(MultipartError::Underlying(_))), "{error:?}");
        match &events[0] {
            Collected::File { content, .. } => {
                assert!(matches!(content, Err(PartStreamError::Interrupted(_))), "{content:?}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_part_content_length() {
        let body = concat!(
            "--b\r\n",
            "Content-Disposition: form-data; name=\"f\"; filename=\"a.txt\"\r\n",
            "Content-Type: text/plain\r\n",
            "Content-Length: 3\r\n",
            "\r\n",
            "abc\r\n",
            "--b--",
        );
        let ss = vec![body.to_owned()];
        let mut decoder = MultipartDecoder::new(body_from_strings(ss), b"b", None, DecoderLimits::default());
        let Some(Ok(FormEvent::Part(part))) = decoder.next().await else {
            panic!("expected a part");
        };
        assert_eq!(part.content_length, Some(3));
        let handle = tokio::spawn(aggregate(part.stream));
        assert!(decoder.next().await.is_none());
        assert_eq!(handle.await.unwrap().unwrap(), b"abc");
        assert_eq!(decoder.bytes_received(), body.len() as u64);
    }
}
