//! Streamed response type

use crate::http1::{response_framing, Body, ResponseHead, SharedReader};
use http::header::HeaderMap;
use http::{Method, StatusCode, Version};

/// A response whose body streams from the connection it arrived on.
///
/// The body owns that connection: dropping the response (on any exit path,
/// including errors and client disconnects) closes the socket, so a
/// response is released exactly once without explicit bookkeeping.
pub struct Response {
  status: StatusCode,
  version: Version,
  headers: HeaderMap,
  body: Body<'static>,
}

impl Response {
  /// Build a response from a parsed head and the connection it came from.
  ///
  /// `method` is the request method, which participates in framing (HEAD
  /// responses carry no body regardless of their headers).
  pub fn new(head: ResponseHead, method: &Method, reader: SharedReader) -> Self {
    let framing = response_framing(method, head.status, &head.headers);
    Self {
      status: head.status,
      version: head.version,
      headers: head.headers,
      body: Body::owned(framing, reader),
    }
  }

  /// A response with no body, for tests and synthetic replies
  pub fn empty(status: StatusCode) -> Self {
    Self {
      status,
      version: Version::HTTP_11,
      headers: HeaderMap::new(),
      body: Body::empty(),
    }
  }

  /// Status code
  pub fn status(&self) -> StatusCode {
    self.status
  }

  /// HTTP version
  pub fn version(&self) -> Version {
    self.version
  }

  /// Response headers
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// The streaming body
  pub fn body_mut(&mut self) -> &mut Body<'static> {
    &mut self.body
  }

  /// Split into headers and body for streaming
  pub fn into_parts(self) -> (StatusCode, HeaderMap, Body<'static>) {
    (self.status, self.headers, self.body)
  }

  /// Read the whole body into memory, capped at `limit` bytes.
  ///
  /// Only for small administrative payloads (token responses, tests);
  /// proxied bodies are never collected.
  pub async fn collect_body(&mut self, limit: usize) -> crate::error::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 8 * 1024];
    loop {
      let n = self.body.chunk(&mut buf).await?;
      if n == 0 {
        return Ok(out);
      }
      if out.len() + n > limit {
        return Err(crate::error::Error::Connection(format!(
          "response body exceeds {} bytes",
          limit
        )));
      }
      out.extend_from_slice(&buf[..n]);
    }
  }
}

impl std::fmt::Debug for Response {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Response")
      .field("status", &self.status)
      .field("headers", &self.headers)
      .finish()
  }
}
