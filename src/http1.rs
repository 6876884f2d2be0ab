//! HTTP/1.1 wire plumbing
//!
//! The proxy speaks HTTP/1.1 directly over tokio streams: head parsing on
//! top of `httparse`, body framing (content-length, chunked, read-to-EOF),
//! and a prebuffering reader that accumulates head bytes and hands the
//! leftovers to the body. Bodies yield decoded payload bytes and are
//! re-framed on the way out, so streamed responses keep their advertised
//! framing without ever being buffered whole.

use crate::error::{Error, Result};
use bytes::BytesMut;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode, Version};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Maximum size of a request or response head
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Maximum length of a single chunk-size line
const MAX_CHUNK_LINE: usize = 8 * 1024;

const INITIAL_CAPACITY: usize = 8 * 1024;

/// A full-duplex byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed reader type used for connection read halves
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// The buffered reader every body in this crate reads from
pub type SharedReader = Buffered<BoxedRead>;

/// A prebuffering wrapper around a stream.
///
/// Head parsing accumulates bytes here; whatever the parser does not
/// consume stays buffered and is served to subsequent reads, so body
/// bytes that arrived together with the head are never lost. Writes (when
/// the inner stream supports them) go straight through.
pub struct Buffered<R> {
  inner: R,
  buf: BytesMut,
}

impl<R> Buffered<R> {
  /// Wrap a stream
  pub fn new(inner: R) -> Self {
    Self {
      inner,
      buf: BytesMut::with_capacity(INITIAL_CAPACITY),
    }
  }

  /// The unconsumed buffered bytes
  pub fn buffer(&self) -> &[u8] {
    &self.buf[..]
  }

  /// Discard `n` bytes from the front of the buffer
  pub fn discard(&mut self, n: usize) {
    let _ = self.buf.split_to(n);
  }
}

impl<R: AsyncRead + Unpin> Buffered<R> {
  /// Read more bytes from the inner stream into the buffer.
  ///
  /// Returns the number of bytes read; 0 means EOF.
  pub async fn fill(&mut self) -> io::Result<usize> {
    self.inner.read_buf(&mut self.buf).await
  }
}

impl<R: AsyncRead + Unpin> AsyncRead for Buffered<R> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    out: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    if !self.buf.is_empty() {
      let n = self.buf.len().min(out.remaining());
      let chunk = self.buf.split_to(n);
      out.put_slice(&chunk);
      Poll::Ready(Ok(()))
    } else {
      Pin::new(&mut self.inner).poll_read(cx, out)
    }
  }
}

impl<R: AsyncWrite + Unpin> AsyncWrite for Buffered<R> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    data: &[u8],
  ) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, data)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

/// Parsed request line and headers
#[derive(Debug)]
pub struct RequestHead {
  /// HTTP method
  pub method: Method,
  /// Raw request target as it appeared on the request line
  pub target: String,
  /// HTTP version
  pub version: Version,
  /// Header map as received
  pub headers: HeaderMap,
}

/// Parsed status line and headers
#[derive(Debug)]
pub struct ResponseHead {
  /// Status code
  pub status: StatusCode,
  /// HTTP version
  pub version: Version,
  /// Header map as received
  pub headers: HeaderMap,
}

fn headers_to_map(raw: &[httparse::Header<'_>]) -> HeaderMap {
  let mut headers = HeaderMap::with_capacity(raw.len());
  for h in raw {
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(h.name.as_bytes()),
      HeaderValue::from_bytes(h.value),
    ) {
      headers.append(name, value);
    }
  }
  headers
}

fn version_from_minor(minor: Option<u8>) -> Version {
  match minor {
    Some(0) => Version::HTTP_10,
    _ => Version::HTTP_11,
  }
}

/// Read and parse a request head.
///
/// Returns `Ok(None)` on a clean EOF before any byte of a new request,
/// which is how keep-alive connections end.
pub async fn read_request_head<R: AsyncRead + Unpin>(
  reader: &mut Buffered<R>,
) -> Result<Option<RequestHead>> {
  loop {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Request::new(&mut headers);
    match parsed.parse(reader.buffer()) {
      Ok(httparse::Status::Complete(head_len)) => {
        let head = RequestHead {
          method: parsed
            .method
            .ok_or_else(|| Error::InvalidRequest("missing method".into()))?
            .parse()
            .map_err(|_| Error::InvalidRequest("invalid method".into()))?,
          target: parsed
            .path
            .ok_or_else(|| Error::InvalidRequest("missing request target".into()))?
            .to_string(),
          version: version_from_minor(parsed.version),
          headers: headers_to_map(parsed.headers),
        };
        reader.discard(head_len);
        return Ok(Some(head));
      }
      Ok(httparse::Status::Partial) => {}
      Err(e) => return Err(Error::InvalidRequest(format!("malformed request: {}", e))),
    }

    if reader.buffer().len() > MAX_HEAD_SIZE {
      return Err(Error::InvalidRequest(
        "request head exceeds maximum allowed size".into(),
      ));
    }
    if reader.fill().await? == 0 {
      if reader.buffer().is_empty() {
        return Ok(None);
      }
      return Err(Error::InvalidRequest("truncated request head".into()));
    }
  }
}

/// Read and parse a response head
pub async fn read_response_head<R: AsyncRead + Unpin>(
  reader: &mut Buffered<R>,
) -> Result<ResponseHead> {
  loop {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut headers);
    match parsed.parse(reader.buffer()) {
      Ok(httparse::Status::Complete(head_len)) => {
        let code = parsed
          .code
          .ok_or_else(|| Error::Connection("missing response status".into()))?;
        let head = ResponseHead {
          status: StatusCode::from_u16(code)
            .map_err(|_| Error::Connection(format!("invalid response status {}", code)))?,
          version: version_from_minor(parsed.version),
          headers: headers_to_map(parsed.headers),
        };
        reader.discard(head_len);
        return Ok(head);
      }
      Ok(httparse::Status::Partial) => {}
      Err(e) => return Err(Error::Connection(format!("malformed response: {}", e))),
    }

    if reader.buffer().len() > MAX_HEAD_SIZE {
      return Err(Error::Connection(
        "response head exceeds maximum allowed size".into(),
      ));
    }
    if reader.fill().await? == 0 {
      return Err(Error::Connection("truncated response head".into()));
    }
  }
}

/// How a message body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
  /// Exactly this many bytes
  Length(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// The body runs until the peer closes the connection
  UntilEof,
  /// No body at all
  None,
}

fn is_chunked(headers: &HeaderMap) -> bool {
  headers
    .get(header::TRANSFER_ENCODING)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false)
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
  match headers.get(header::CONTENT_LENGTH) {
    None => Ok(None),
    Some(value) => value
      .to_str()
      .ok()
      .and_then(|v| v.trim().parse::<u64>().ok())
      .map(Some)
      .ok_or_else(|| Error::InvalidRequest("invalid content-length".into())),
  }
}

/// Framing of a request body; requests without explicit framing have none
pub fn request_framing(headers: &HeaderMap) -> Result<Framing> {
  if is_chunked(headers) {
    return Ok(Framing::Chunked);
  }
  match content_length(headers)? {
    Some(0) | None => Ok(Framing::None),
    Some(n) => Ok(Framing::Length(n)),
  }
}

/// Framing of a response body, which also depends on the request method
/// and the status code
pub fn response_framing(method: &Method, status: StatusCode, headers: &HeaderMap) -> Framing {
  if method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    return Framing::None;
  }
  if is_chunked(headers) {
    return Framing::Chunked;
  }
  match content_length(headers) {
    Ok(Some(0)) => Framing::None,
    Ok(Some(n)) => Framing::Length(n),
    _ => Framing::UntilEof,
  }
}

enum BodyReader<'a> {
  Borrowed(&'a mut SharedReader),
  Owned(Box<SharedReader>),
  Empty,
}

enum BodyState {
  Fixed { remaining: u64 },
  ChunkSize,
  ChunkData { remaining: u64 },
  UntilEof,
  Done,
}

/// A streaming message body yielding decoded payload bytes.
///
/// The body either borrows the connection it arrived on (requests) or owns
/// it outright (responses); dropping an owned body closes its connection,
/// which is what releases a hijacked response on every exit path.
pub struct Body<'a> {
  reader: BodyReader<'a>,
  state: BodyState,
}

impl<'a> Body<'a> {
  /// A body read from a borrowed connection
  pub fn borrowed(framing: Framing, reader: &'a mut SharedReader) -> Self {
    Self {
      reader: BodyReader::Borrowed(reader),
      state: BodyState::from(framing),
    }
  }

  /// A body owning its connection
  pub fn owned(framing: Framing, reader: SharedReader) -> Body<'static> {
    Body {
      reader: BodyReader::Owned(Box::new(reader)),
      state: BodyState::from(framing),
    }
  }

  /// A body with no bytes at all
  pub fn empty() -> Body<'static> {
    Body {
      reader: BodyReader::Empty,
      state: BodyState::Done,
    }
  }

  /// True once the body has been fully consumed
  pub fn is_done(&self) -> bool {
    matches!(self.state, BodyState::Done)
  }

  /// Read the next slice of payload bytes into `out`.
  ///
  /// Returns 0 once the body is finished.
  pub async fn chunk(&mut self, out: &mut [u8]) -> Result<usize> {
    if out.is_empty() {
      return Ok(0);
    }
    loop {
      match &mut self.state {
        BodyState::Done => return Ok(0),
        BodyState::Fixed { remaining } => {
          if *remaining == 0 {
            self.state = BodyState::Done;
            return Ok(0);
          }
          let want = (*remaining).min(out.len() as u64) as usize;
          let reader = self.reader.get()?;
          let n = reader.read(&mut out[..want]).await?;
          if n == 0 {
            self.state = BodyState::Done;
            return Err(Error::Connection("body truncated mid-stream".into()));
          }
          *remaining -= n as u64;
          if *remaining == 0 {
            self.state = BodyState::Done;
          }
          return Ok(n);
        }
        BodyState::UntilEof => {
          let reader = self.reader.get()?;
          let n = reader.read(out).await?;
          if n == 0 {
            self.state = BodyState::Done;
          }
          return Ok(n);
        }
        BodyState::ChunkSize => {
          let reader = self.reader.get()?;
          let line = read_line(reader).await?;
          let size_token = line
            .split(|&b| b == b';')
            .next()
            .unwrap_or(&[]);
          let size_str = std::str::from_utf8(size_token)
            .map_err(|_| Error::Connection("invalid chunk size".into()))?
            .trim();
          let size = u64::from_str_radix(size_str, 16)
            .map_err(|_| Error::Connection(format!("invalid chunk size {:?}", size_str)))?;
          if size == 0 {
            // trailer section ends with an empty line
            loop {
              let trailer = read_line(reader).await?;
              if trailer.is_empty() {
                break;
              }
            }
            self.state = BodyState::Done;
            return Ok(0);
          }
          self.state = BodyState::ChunkData { remaining: size };
        }
        BodyState::ChunkData { remaining } => {
          if *remaining == 0 {
            let reader = self.reader.get()?;
            let mut crlf = [0u8; 2];
            reader.read_exact(&mut crlf).await?;
            self.state = BodyState::ChunkSize;
            continue;
          }
          let want = (*remaining).min(out.len() as u64) as usize;
          let reader = self.reader.get()?;
          let n = reader.read(&mut out[..want]).await?;
          if n == 0 {
            self.state = BodyState::Done;
            return Err(Error::Connection("chunked body truncated".into()));
          }
          *remaining -= n as u64;
          return Ok(n);
        }
      }
    }
  }

  /// Consume and discard the rest of the body, returning how many payload
  /// bytes were thrown away. Required before reading the next request off a
  /// keep-alive connection.
  pub async fn drain(&mut self) -> Result<u64> {
    let mut total = 0u64;
    let mut scratch = [0u8; 8 * 1024];
    loop {
      let n = self.chunk(&mut scratch).await?;
      if n == 0 {
        return Ok(total);
      }
      total += n as u64;
    }
  }
}

impl From<Framing> for BodyState {
  fn from(framing: Framing) -> Self {
    match framing {
      Framing::Length(0) | Framing::None => BodyState::Done,
      Framing::Length(n) => BodyState::Fixed { remaining: n },
      Framing::Chunked => BodyState::ChunkSize,
      Framing::UntilEof => BodyState::UntilEof,
    }
  }
}

impl BodyReader<'_> {
  fn get(&mut self) -> Result<&mut SharedReader> {
    match self {
      BodyReader::Borrowed(r) => Ok(r),
      BodyReader::Owned(r) => Ok(r),
      BodyReader::Empty => Err(Error::Connection("body has no reader".into())),
    }
  }
}

/// Read a CRLF-terminated line, excluding the terminator
async fn read_line(reader: &mut SharedReader) -> Result<Vec<u8>> {
  loop {
    if let Some(pos) = reader.buffer().iter().position(|&b| b == b'\n') {
      let mut line = reader.buffer()[..pos].to_vec();
      reader.discard(pos + 1);
      if line.last() == Some(&b'\r') {
        line.pop();
      }
      return Ok(line);
    }
    if reader.buffer().len() > MAX_CHUNK_LINE {
      return Err(Error::Connection("chunk line too long".into()));
    }
    if reader.fill().await? == 0 {
      return Err(Error::Connection("connection closed mid-line".into()));
    }
  }
}

/// Serialize a header map as `name: value` lines
pub async fn write_headers<W: AsyncWrite + Unpin>(out: &mut W, headers: &HeaderMap) -> Result<()> {
  for (name, value) in headers {
    out.write_all(name.as_str().as_bytes()).await?;
    out.write_all(b": ").await?;
    out.write_all(value.as_bytes()).await?;
    out.write_all(b"\r\n").await?;
  }
  Ok(())
}

/// Copy a body to `out`, re-encoding the chunked framing when `chunked` is
/// set. Returns the number of payload bytes copied.
pub async fn write_framed_body<W: AsyncWrite + Unpin>(
  out: &mut W,
  chunked: bool,
  body: &mut Body<'_>,
) -> Result<u64> {
  let mut total = 0u64;
  let mut buf = vec![0u8; 16 * 1024];
  loop {
    let n = body.chunk(&mut buf).await?;
    if n == 0 {
      break;
    }
    if chunked {
      out.write_all(format!("{:x}\r\n", n).as_bytes()).await?;
      out.write_all(&buf[..n]).await?;
      out.write_all(b"\r\n").await?;
    } else {
      out.write_all(&buf[..n]).await?;
    }
    out.flush().await?;
    total += n as u64;
  }
  if chunked {
    out.write_all(b"0\r\n\r\n").await?;
    out.flush().await?;
  }
  Ok(total)
}

const HOP_BY_HOP: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "proxy-connection",
  "te",
  "trailer",
  "upgrade",
];

/// Remove hop-by-hop headers, including any named by `Connection`.
/// Framing headers (`content-length`, `transfer-encoding`) stay; the body
/// machinery owns those.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
  let mut named: Vec<HeaderName> = Vec::new();
  for value in headers.get_all(header::CONNECTION) {
    if let Ok(value) = value.to_str() {
      for token in value.split(',') {
        if let Ok(name) = token.trim().parse::<HeaderName>() {
          named.push(name);
        }
      }
    }
  }
  for name in named {
    if name != header::TRANSFER_ENCODING && name != header::CONTENT_LENGTH {
      headers.remove(name);
    }
  }
  for name in HOP_BY_HOP {
    headers.remove(*name);
  }
}

/// Whether the peer asked for this connection to close after the response
pub fn wants_close(version: Version, headers: &HeaderMap) -> bool {
  let connection = headers
    .get(header::CONNECTION)
    .and_then(|v| v.to_str().ok())
    .map(|v| v.to_ascii_lowercase());
  match connection {
    Some(v) if v.contains("close") => true,
    Some(v) if v.contains("keep-alive") => false,
    _ => version == Version::HTTP_10,
  }
}

/// Snapshot headers into a plain single-valued map: first value per key,
/// case preserved by the `http` crate's canonical names.
pub fn snapshot_headers(headers: &HeaderMap) -> HeaderMap {
  let mut snapshot = HeaderMap::with_capacity(headers.keys_len());
  for name in headers.keys() {
    if let Some(value) = headers.get(name) {
      snapshot.insert(name.clone(), value.clone());
    }
  }
  snapshot
}
