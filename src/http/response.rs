//! HTTP/1.1 response construction and delivery.
//!
//! A [`Response`] is built by a handler and consumed exactly once by
//! [`Response::write`], which negotiates the body against the declared
//! [`ContentType`] and serializes everything onto a [`ResponseWriter`].
//! Serialization problems are detected before the first byte is written, so
//! the caller can still answer with a [`ResponseError`] instead.

use std::fmt;
use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ContentType, Headers, ResponseError, StatusCode};

/// Read buffer size used when draining a streamed body.
const STREAM_CHUNK_SIZE: usize = 8 * 1024;

/// Headers owned by the framework. Caller-supplied values for these are dropped.
const MANAGED_HEADERS: [&str; 4] = [
    "content-type",
    "content-length",
    "transfer-encoding",
    "connection",
];

/// A structured value that is JSON-encoded when the response is written.
///
/// Implemented for every `Serialize + Send` type; there is no need to
/// implement it by hand.
pub trait JsonBody: Send {
    fn encode(&self) -> serde_json::Result<Vec<u8>>;
}

impl<T> JsonBody for T
where
    T: Serialize + Send,
{
    fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// The single body representation carried by a [`Response`].
pub enum Body {
    /// No body. Status and headers are still written.
    Empty,
    /// A fixed byte buffer, sent verbatim.
    Bytes(Bytes),
    /// A value encoded with `serde_json` at write time.
    Json(Box<dyn JsonBody>),
    /// A source drained to completion with chunked transfer encoding.
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Json(_) => f.write_str("Json(..)"),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Failure to deliver a [`Response`].
#[derive(Debug, Error)]
pub enum WriteError {
    /// The response could not be serialized. Nothing was written, so the
    /// carried error can still be sent in its place.
    #[error("response rejected before writing: {0}")]
    Rejected(ResponseError),

    /// The sink or the body source failed after the status line went out.
    #[error("response {status} aborted after {bytes_written} bytes: {source}")]
    Aborted {
        status: StatusCode,
        bytes_written: u64,
        #[source]
        source: io::Error,
    },

    /// A status line was already written through this writer.
    #[error("response already committed with status {0}")]
    AlreadyCommitted(StatusCode),
}

/// The outbound half of one request: wraps the connection's sink and makes
/// sure at most one status line is written to it.
pub struct ResponseWriter<'a> {
    io: &'a mut (dyn AsyncWrite + Send + Unpin),
    keep_alive: bool,
    head_only: bool,
    committed: Option<StatusCode>,
    bytes_written: u64,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(io: &'a mut (dyn AsyncWrite + Send + Unpin)) -> Self {
        Self {
            io,
            keep_alive: true,
            head_only: false,
            committed: None,
            bytes_written: 0,
        }
    }

    /// Controls whether `Connection: keep-alive` or `Connection: close` is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Answers a `HEAD` request: framing headers are computed as usual but no
    /// body bytes are sent.
    #[must_use]
    pub fn head_only(mut self, head_only: bool) -> Self {
        self.head_only = head_only;
        self
    }

    /// The status already sent through this writer, if any.
    pub fn committed(&self) -> Option<StatusCode> {
        self.committed
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    async fn send(&mut self, buf: &[u8]) -> io::Result<()> {
        self.io.write_all(buf).await?;
        self.bytes_written += buf.len() as u64;
        Ok(())
    }

    // Head and body leave in one write.
    async fn write_fixed(&mut self, mut head: BytesMut, body: Bytes) -> io::Result<()> {
        head.put_slice(&body);
        self.send(&head).await?;
        self.io.flush().await
    }

    async fn write_stream(
        &mut self,
        head: BytesMut,
        mut source: Box<dyn AsyncRead + Send + Unpin>,
    ) -> io::Result<()> {
        self.send(&head).await?;

        let mut chunk = vec![0u8; STREAM_CHUNK_SIZE];
        loop {
            let n = source.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            let mut frame = BytesMut::with_capacity(n + 12);
            frame.put(format!("{n:X}\r\n").as_bytes());
            frame.put_slice(&chunk[..n]);
            frame.put_slice(b"\r\n");
            self.send(&frame).await?;
        }

        self.send(b"0\r\n\r\n").await?;
        self.io.flush().await
    }
}

enum Framing {
    Length(usize),
    Chunked,
    None,
}

/// An HTTP/1.1 response: status, extra headers, content type and one body.
///
/// # Examples
///
/// ```
/// use courier::http::{ContentType, Response, StatusCode};
///
/// let response = Response::json(serde_json::json!({ "id": 1 }))
///     .with_status(StatusCode::CREATED)
///     .header("Location", "/items/1")
///     .with_detailed_message("item created");
///
/// assert_eq!(response.status(), StatusCode::CREATED);
/// assert_eq!(response.content_type(), ContentType::Json);
/// assert_eq!(response.detailed_message(), Some("item created"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    content_type: ContentType,
    body: Body,
    detailed_message: Option<String>,
}

impl Response {
    /// Creates a new response with the given status, `text/plain` and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            content_type: ContentType::Text,
            body: Body::Empty,
            detailed_message: None,
        }
    }

    /// A `200 OK` whose body is `value` encoded as JSON when written.
    pub fn json<T>(value: T) -> Self
    where
        T: Serialize + Send + 'static,
    {
        Self::new(StatusCode::OK)
            .with_content_type(ContentType::Json)
            .with_body(Body::Json(Box::new(value)))
    }

    /// A `200 OK` `text/plain` response.
    pub fn text(body: impl Into<String>) -> Self {
        Self::bytes(ContentType::Text, body.into())
    }

    /// A `200 OK` `text/html` response.
    pub fn html(body: impl Into<String>) -> Self {
        Self::bytes(ContentType::Html, body.into())
    }

    /// A `200 OK` `text/csv` response.
    pub fn csv(body: impl Into<String>) -> Self {
        Self::bytes(ContentType::Csv, body.into())
    }

    /// A `200 OK` response carrying a fixed buffer of the given type.
    pub fn bytes(content_type: ContentType, body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK)
            .with_content_type(content_type)
            .with_body(Body::Bytes(body.into()))
    }

    /// A `200 OK` response whose body is read from `source` while writing.
    pub fn stream<R>(content_type: ContentType, source: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::new(StatusCode::OK)
            .with_content_type(content_type)
            .with_body(Body::Stream(Box::new(source)))
    }

    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    ///
    /// `Content-Type`, `Content-Length`, `Transfer-Encoding` and `Connection`
    /// are managed by the writer and ignored here.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    /// Replaces the body.
    #[must_use]
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Sets a human-readable summary used in the request log line. Never sent.
    #[must_use]
    pub fn with_detailed_message(mut self, message: impl Into<String>) -> Self {
        self.detailed_message = Some(message.into());
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn detailed_message(&self) -> Option<&str> {
        self.detailed_message.as_deref()
    }

    /// Serializes the response onto `w`, consuming it.
    ///
    /// The body is negotiated first: JSON values are encoded, textual types
    /// are checked for UTF-8, and body/type mismatches are refused. Only then
    /// is the status line written, so a [`WriteError::Rejected`] guarantees the
    /// sink is untouched.
    ///
    /// # Errors
    ///
    /// - [`WriteError::Rejected`]: the body cannot be sent as the declared type.
    /// - [`WriteError::Aborted`]: the sink or stream source failed mid-write.
    /// - [`WriteError::AlreadyCommitted`]: `w` was used before.
    pub async fn write(self, w: &mut ResponseWriter<'_>) -> Result<(), WriteError> {
        if let Some(status) = w.committed() {
            return Err(WriteError::AlreadyCommitted(status));
        }

        let Self {
            status,
            headers,
            content_type,
            body,
            ..
        } = self;

        let payload = negotiate(content_type, body).map_err(WriteError::Rejected)?;
        let framing = match &payload {
            _ if status.forbids_body() => Framing::None,
            Payload::Fixed(bytes) => Framing::Length(bytes.len()),
            Payload::Stream(_) => Framing::Chunked,
        };
        let send_body = !w.head_only && !matches!(framing, Framing::None);

        let body_len = match &payload {
            Payload::Fixed(bytes) if send_body => bytes.len(),
            _ => 0,
        };
        let head = encode_head(status, &headers, content_type, framing, w.keep_alive, body_len);
        w.committed = Some(status);

        let result = match payload {
            Payload::Fixed(bytes) if send_body => w.write_fixed(head, bytes).await,
            Payload::Stream(source) if send_body => w.write_stream(head, source).await,
            _ => w.write_fixed(head, Bytes::new()).await,
        };

        result.map_err(|source| WriteError::Aborted {
            status,
            bytes_written: w.bytes_written(),
            source,
        })
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

enum Payload {
    Fixed(Bytes),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

// Pick the wire representation for `body` under `content_type`.
fn negotiate(content_type: ContentType, body: Body) -> Result<Payload, ResponseError> {
    match body {
        Body::Empty => Ok(Payload::Fixed(Bytes::new())),
        Body::Bytes(bytes) => {
            if content_type.is_textual() && std::str::from_utf8(&bytes).is_err() {
                return Err(ResponseError::internal_server_error(format!(
                    "response body declared as {content_type} is not valid UTF-8"
                )));
            }
            Ok(Payload::Fixed(bytes))
        }
        Body::Json(value) if content_type == ContentType::Json => value
            .encode()
            .map(|encoded| Payload::Fixed(Bytes::from(encoded)))
            .map_err(|e| {
                ResponseError::internal_server_error(format!("can't json encode response: {e}"))
            }),
        Body::Json(_) => Err(ResponseError::internal_server_error(format!(
            "structured response body cannot be sent as {content_type}"
        ))),
        Body::Stream(source) => Ok(Payload::Stream(source)),
    }
}

/// Serializes the status line and headers, reserving room for `body_len` bytes.
fn encode_head(
    status: StatusCode,
    headers: &Headers,
    content_type: ContentType,
    framing: Framing,
    keep_alive: bool,
    body_len: usize,
) -> BytesMut {
    let estimated_size = 128 + headers.len() * 64 + body_len;
    let mut buf = BytesMut::with_capacity(estimated_size);

    // Status line
    buf.put(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason()
        )
        .as_bytes(),
    );

    // Caller headers
    for (name, value) in headers.iter() {
        if MANAGED_HEADERS
            .iter()
            .any(|managed| name.eq_ignore_ascii_case(managed))
        {
            continue;
        }
        buf.put(format!("{name}: ").as_bytes());
        buf.put_slice(&sanitize_header_value(value));
        buf.put_slice(b"\r\n");
    }

    buf.put(format!("Content-Type: {}\r\n", content_type.mime()).as_bytes());

    let connection = if keep_alive { "keep-alive" } else { "close" };
    buf.put(format!("Connection: {connection}\r\n").as_bytes());

    match framing {
        Framing::Length(len) => buf.put(format!("Content-Length: {len}\r\n").as_bytes()),
        Framing::Chunked => buf.put_slice(b"Transfer-Encoding: chunked\r\n"),
        Framing::None => {}
    }

    // Header/body separator
    buf.put_slice(b"\r\n");

    buf
}

// CR, LF and NUL would let a header value start a new header line.
fn sanitize_header_value(value: &str) -> Vec<u8> {
    value
        .bytes()
        .filter(|&b| b != b'\r' && b != b'\n' && b != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use serde::ser::{Error as _, Serializer};

    use super::*;

    // Splits raw wire bytes into the head text and the body bytes.
    fn split(raw: &[u8]) -> (String, Vec<u8>) {
        let pos = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("head terminator");
        (
            String::from_utf8(raw[..pos + 2].to_vec()).unwrap(),
            raw[pos + 4..].to_vec(),
        )
    }

    fn decode_chunked(mut body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let line_end = body.windows(2).position(|w| w == b"\r\n").unwrap();
            let size =
                usize::from_str_radix(std::str::from_utf8(&body[..line_end]).unwrap(), 16).unwrap();
            body = &body[line_end + 2..];
            if size == 0 {
                assert_eq!(body, b"\r\n");
                return out;
            }
            out.extend_from_slice(&body[..size]);
            assert_eq!(&body[size..size + 2], b"\r\n");
            body = &body[size + 2..];
        }
    }

    async fn write_to_vec(response: Response) -> (Result<(), WriteError>, Vec<u8>) {
        let mut sink: Vec<u8> = Vec::new();
        let mut w = ResponseWriter::new(&mut sink);
        let result = response.write(&mut w).await;
        (result, sink)
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("value refuses to serialize"))
        }
    }

    struct BrokenSink;

    impl AsyncWrite for BrokenSink {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn simple_text_response() {
        let (result, raw) = write_to_vec(Response::text("Hello")).await;
        result.unwrap();
        let (head, body) = split(&raw);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/plain\r\n"));
        assert!(head.contains("Content-Length: 5\r\n"));
        assert_eq!(body, b"Hello");
    }

    #[tokio::test]
    async fn json_body_decodes_back() {
        let (result, raw) = write_to_vec(Response::json(serde_json::json!({ "id": 1 }))).await;
        result.unwrap();
        let (head, body) = split(&raw);
        assert!(head.contains("Content-Type: application/json\r\n"));
        let decoded: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, serde_json::json!({ "id": 1 }));
    }

    #[tokio::test]
    async fn json_encode_failure_is_rejected_before_writing() {
        let (result, raw) = write_to_vec(Response::json(Unserializable)).await;
        match result {
            Err(WriteError::Rejected(err)) => {
                assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
                assert!(err.detailed_cause().contains("refuses to serialize"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(raw.is_empty());
    }

    #[tokio::test]
    async fn non_utf8_text_is_rejected() {
        let response = Response::bytes(ContentType::Html, vec![0xff, 0xfe]);
        let (result, raw) = write_to_vec(response).await;
        assert!(matches!(result, Err(WriteError::Rejected(_))));
        assert!(raw.is_empty());
    }

    #[tokio::test]
    async fn structured_body_under_binary_type_is_rejected() {
        let response = Response::json(vec![1, 2, 3]).with_content_type(ContentType::Png);
        let (result, _) = write_to_vec(response).await;
        let Err(WriteError::Rejected(err)) = result else {
            panic!("expected rejection");
        };
        assert!(err.detailed_cause().contains("image/png"));
    }

    #[tokio::test]
    async fn binary_bytes_are_copied_verbatim() {
        let png = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0x00];
        let (result, raw) = write_to_vec(Response::bytes(ContentType::Png, png.clone())).await;
        result.unwrap();
        let (head, body) = split(&raw);
        assert!(head.contains("Content-Type: image/png\r\n"));
        assert_eq!(body, png);
    }

    #[tokio::test]
    async fn stream_is_drained_with_chunked_framing() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let response = Response::stream(ContentType::Pdf, Cursor::new(data.clone()));
        let (result, raw) = write_to_vec(response).await;
        result.unwrap();
        let (head, body) = split(&raw);
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!head.contains("Content-Length"));
        assert_eq!(decode_chunked(&body), data);
    }

    #[tokio::test]
    async fn empty_body_still_sends_type_and_length() {
        let (result, raw) = write_to_vec(Response::new(StatusCode::ACCEPTED)).await;
        result.unwrap();
        let (head, body) = split(&raw);
        assert!(head.starts_with("HTTP/1.1 202 Accepted\r\n"));
        assert!(head.contains("Content-Type: text/plain\r\n"));
        assert!(head.contains("Content-Length: 0\r\n"));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn no_content_has_no_framing_or_body() {
        let response = Response::text("ignored").with_status(StatusCode::NO_CONTENT);
        let (result, raw) = write_to_vec(response).await;
        result.unwrap();
        let (head, body) = split(&raw);
        assert!(head.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!head.contains("Content-Length"));
        assert!(!head.contains("Transfer-Encoding"));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn not_modified_stream_is_not_drained() {
        let response = Response::stream(ContentType::Pdf, Cursor::new(vec![1u8; 64]))
            .with_status(StatusCode::NOT_MODIFIED);
        let (result, raw) = write_to_vec(response).await;
        result.unwrap();
        let (head, body) = split(&raw);
        assert!(!head.contains("Transfer-Encoding"));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn head_request_gets_length_without_body() {
        let mut sink: Vec<u8> = Vec::new();
        let mut w = ResponseWriter::new(&mut sink).head_only(true);
        Response::text("Hello").write(&mut w).await.unwrap();
        let (head, body) = split(&sink);
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn unregistered_status_is_written() {
        let status = StatusCode::from_u16(207).unwrap();
        let (result, raw) = write_to_vec(Response::text("partial").with_status(status)).await;
        result.unwrap();
        let (head, body) = split(&raw);
        assert!(head.starts_with("HTTP/1.1 207 Multi-Status\r\n"));
        assert_eq!(body, b"partial");

        let odd = StatusCode::from_u16(299).unwrap();
        let (result, raw) = write_to_vec(Response::new(odd)).await;
        result.unwrap();
        assert!(raw.starts_with(b"HTTP/1.1 299 \r\n"));
    }

    #[tokio::test]
    async fn caller_headers_are_merged_but_managed_ones_ignored() {
        let response = Response::csv("a,b\n1,2\n")
            .header("X-Request-Id", "abc-123")
            .header("Content-Length", "9999")
            .header("Content-Type", "text/evil")
            .header("X-Split", "one\r\nInjected: yes");
        let (result, raw) = write_to_vec(response).await;
        result.unwrap();
        let (head, _) = split(&raw);
        assert!(head.contains("X-Request-Id: abc-123\r\n"));
        assert!(head.contains("Content-Length: 8\r\n"));
        assert!(!head.contains("9999"));
        assert!(!head.contains("text/evil"));
        assert!(head.contains("X-Split: oneInjected: yes\r\n"));
    }

    #[tokio::test]
    async fn connection_close() {
        let mut sink: Vec<u8> = Vec::new();
        let mut w = ResponseWriter::new(&mut sink).keep_alive(false);
        Response::text("bye").write(&mut w).await.unwrap();
        let (head, _) = split(&sink);
        assert!(head.contains("Connection: close\r\n"));
    }

    #[tokio::test]
    async fn second_write_is_refused() {
        let mut sink: Vec<u8> = Vec::new();
        let mut w = ResponseWriter::new(&mut sink);
        Response::text("first").write(&mut w).await.unwrap();
        let second = Response::text("second").write(&mut w).await;
        assert!(matches!(
            second,
            Err(WriteError::AlreadyCommitted(StatusCode::OK))
        ));
        assert!(!String::from_utf8_lossy(&sink).contains("second"));
    }

    #[tokio::test]
    async fn broken_sink_aborts_with_committed_status() {
        let mut sink = BrokenSink;
        let mut w = ResponseWriter::new(&mut sink);
        let result = Response::text("lost").with_status(StatusCode::ACCEPTED).write(&mut w).await;
        match result {
            Err(WriteError::Aborted { status, source, .. }) => {
                assert_eq!(status, StatusCode::ACCEPTED);
                assert_eq!(source.kind(), io::ErrorKind::BrokenPipe);
            }
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(w.committed(), Some(StatusCode::ACCEPTED));
    }
}
