//! Per-request pipeline
//!
//! Wraps every intercepted request: asks the hijacker what to do, streams
//! either the hijacker's response or the upstream's back to the client
//! through a byte-counting writer, and reports telemetry on the way out.
//! Exactly one of the hijacked/proxied counters fires per request; the
//! pace timing fires at most once, only after the body is done, and only
//! when at least a kilobyte went out.

use crate::error::Result;
use crate::hijacker::{Hijack, Hijacker};
use crate::http1::strip_hop_by_hop;
use crate::metrics::{Metric, MetricsReporter};
use crate::request::InterceptedRequest;
use crate::response::Response;
use http::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::StatusCode;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Fewer bytes than this and the pace metric is not worth reporting
const PACE_FLOOR_BYTES: u64 = 1000;

/// Client-facing response writer that counts what goes through it.
///
/// Headers are staged until the head is written; body writes honor the
/// staged framing (re-encoding chunked transfer coding when the headers
/// advertise it) and count payload bytes only.
pub struct ResponseWriter<'a> {
  stream: &'a mut (dyn AsyncWrite + Send + Unpin),
  headers: HeaderMap,
  status: Option<StatusCode>,
  head_written: bool,
  chunked: bool,
  bytes_written: u64,
  touched: bool,
  must_close: bool,
}

impl<'a> ResponseWriter<'a> {
  /// Wrap the client stream
  pub fn new(stream: &'a mut (dyn AsyncWrite + Send + Unpin)) -> Self {
    Self {
      stream,
      headers: HeaderMap::new(),
      status: None,
      head_written: false,
      chunked: false,
      bytes_written: 0,
      touched: false,
      must_close: false,
    }
  }

  /// Headers to send with the head; ignored once the head is out
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }

  /// Write the status line and the staged headers
  pub async fn write_head(&mut self, status: StatusCode) -> Result<()> {
    if self.head_written {
      return Ok(());
    }
    self.touched = true;
    self.head_written = true;
    self.status = Some(status);

    self.chunked = self
      .headers
      .get(TRANSFER_ENCODING)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.to_ascii_lowercase().contains("chunked"))
      .unwrap_or(false);
    // a response without explicit framing is delimited by connection close
    if !self.chunked && !self.headers.contains_key(CONTENT_LENGTH) {
      self.must_close = true;
    }

    self
      .stream
      .write_all(
        format!(
          "HTTP/1.1 {} {}\r\n",
          status.as_u16(),
          status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
      )
      .await?;
    crate::http1::write_headers(&mut self.stream, &self.headers).await?;
    self.stream.write_all(b"\r\n").await?;
    self.stream.flush().await?;
    Ok(())
  }

  /// Write body bytes, implicitly sending a `200 OK` head first if none
  /// was written yet
  pub async fn write_body(&mut self, data: &[u8]) -> Result<()> {
    if !self.head_written {
      self.write_head(StatusCode::OK).await?;
    }
    self.touched = true;
    if data.is_empty() {
      return Ok(());
    }
    if self.chunked {
      self
        .stream
        .write_all(format!("{:x}\r\n", data.len()).as_bytes())
        .await?;
      self.stream.write_all(data).await?;
      self.stream.write_all(b"\r\n").await?;
    } else {
      self.stream.write_all(data).await?;
    }
    self.stream.flush().await?;
    self.bytes_written += data.len() as u64;
    Ok(())
  }

  /// Terminate the body (the final chunk, when re-encoding chunked)
  pub async fn finish(&mut self) -> Result<()> {
    if self.head_written && self.chunked {
      self.stream.write_all(b"0\r\n\r\n").await?;
      self.stream.flush().await?;
    }
    Ok(())
  }

  /// Reply in one shot with a content-length framed body
  pub async fn respond(&mut self, status: StatusCode, body: &[u8]) -> Result<()> {
    self
      .headers
      .insert(CONTENT_LENGTH, HeaderValue::from_str(&body.len().to_string())?);
    self.write_head(status).await?;
    self.write_body(body).await
  }

  /// Payload bytes written so far
  pub fn bytes_written(&self) -> u64 {
    self.bytes_written
  }

  /// The status written, if any
  pub fn status(&self) -> Option<StatusCode> {
    self.status
  }

  /// Whether anything was written at all
  pub fn touched(&self) -> bool {
    self.touched
  }

  /// Whether the head went out
  pub fn head_written(&self) -> bool {
    self.head_written
  }

  /// Whether the connection must close after this response
  pub fn must_close(&self) -> bool {
    self.must_close
  }

  /// Force the connection closed after this response
  pub fn mark_close(&mut self) {
    self.must_close = true;
  }
}

/// The procedure that forwards a request to its real destination
#[async_trait::async_trait]
pub trait Upstream: Send + Sync {
  /// Dial the destination and stream the exchange verbatim
  async fn serve(
    &self,
    writer: &mut ResponseWriter<'_>,
    request: &mut InterceptedRequest<'_>,
  ) -> Result<()>;
}

/// Copy a ready response into the client writer: headers, status, then the
/// body with its framing preserved. Consumes the response; its connection
/// closes when the body drops, error or not.
pub async fn stream_response(writer: &mut ResponseWriter<'_>, response: Response) -> Result<()> {
  let (status, mut headers, mut body) = response.into_parts();
  strip_hop_by_hop(&mut headers);
  for (name, value) in headers.iter() {
    writer.headers_mut().append(name.clone(), value.clone());
  }
  writer.write_head(status).await?;

  let mut buf = vec![0u8; 16 * 1024];
  loop {
    let n = body.chunk(&mut buf).await?;
    if n == 0 {
      break;
    }
    writer.write_body(&buf[..n]).await?;
  }
  writer.finish().await
}

/// Wraps intercepted requests with hijack dispatch and telemetry
pub struct Pipeline {
  hijacker: Arc<dyn Hijacker>,
  metrics: MetricsReporter,
}

impl Pipeline {
  /// Build a pipeline around a hijacker and a metrics reporter
  pub fn new(hijacker: Arc<dyn Hijacker>, metrics: MetricsReporter) -> Self {
    Self { hijacker, metrics }
  }

  /// The hijacker this pipeline dispatches to
  pub fn hijacker(&self) -> Arc<dyn Hijacker> {
    self.hijacker.clone()
  }

  /// Handle one intercepted request end to end.
  ///
  /// All errors are dealt with internally; connection disposition is left
  /// on the writer (`must_close`).
  pub async fn handle(
    &self,
    upstream: &dyn Upstream,
    writer: &mut ResponseWriter<'_>,
    request: &mut InterceptedRequest<'_>,
  ) {
    let started_at = Instant::now();
    let info = request.info();
    tracing::trace!("request headers for {}: {:?}", request, request.headers());

    let mut hijacked = false;
    match self.hijacker.request_handler(writer, request).await {
      Ok(Hijack::Replied) => {
        hijacked = true;
        tracing::debug!(
          "handling {} {}: hijacker replied (status {:?})",
          info.method,
          info.path,
          writer.status()
        );
      }
      Ok(Hijack::Response(response)) => {
        hijacked = true;
        tracing::debug!(
          "handling {} {}: hijacked to a {} response",
          info.method,
          info.path,
          response.status()
        );
        if let Err(e) = stream_response(writer, response).await {
          tracing::error!(
            "unable to write hijacked response body back to client for {} {}: {}",
            info.method,
            info.path,
            e
          );
          writer.mark_close();
        }
      }
      Ok(Hijack::Pass) => {
        tracing::debug!("handling {} {}: forwarding upstream", info.method, info.path);
        self.forward(upstream, writer, request).await;
      }
      Err(e) => {
        tracing::warn!(
          "hijacker failed on {} {}: {}; forwarding upstream",
          info.method,
          info.path,
          e
        );
        self
          .metrics
          .incr(Metric::HijackingErrors, self.hijacker.as_ref(), &info);
        self.forward(upstream, writer, request).await;
      }
    }

    let elapsed = started_at.elapsed();
    let written = writer.bytes_written();
    tracing::trace!(
      "replied to {} {}, transmitted {} bytes in {:?}",
      info.method,
      info.path,
      written,
      elapsed
    );

    let counter = if hijacked {
      Metric::Hijacked
    } else {
      Metric::Proxied
    };
    self.metrics.incr(counter, self.hijacker.as_ref(), &info);

    if written >= PACE_FLOOR_BYTES {
      let kilobytes = (written / 1000).min(u32::MAX as u64) as u32;
      let pace = elapsed / kilobytes;
      let metric = if hijacked {
        Metric::HijackedPace
      } else {
        Metric::ProxiedPace
      };
      self.metrics.timing(metric, self.hijacker.as_ref(), &info, pace);
    }
  }

  async fn forward(
    &self,
    upstream: &dyn Upstream,
    writer: &mut ResponseWriter<'_>,
    request: &mut InterceptedRequest<'_>,
  ) {
    if let Err(e) = upstream.serve(writer, request).await {
      tracing::warn!(
        "unable to forward {} upstream: {}",
        request.uri(),
        e
      );
      writer.mark_close();
    }
  }
}
