//! Hijack decision interface
//!
//! The pipeline is polymorphic over a pair of capabilities: deciding what
//! to do with an intercepted request, and transforming metric names. The
//! passthrough variant forwards everything; the Docker-registry variant
//! lives in [`crate::registry`].

use crate::error::Result;
use crate::metrics::Metric;
use crate::pipeline::ResponseWriter;
use crate::request::{InterceptedRequest, RequestInfo};
use crate::response::Response;

/// What the hijacker decided to do with a request
pub enum Hijack {
  /// Not interested; forward to the default upstream untouched
  Pass,
  /// The hijacker already wrote a response through the writer
  Replied,
  /// Stream this response back to the client
  Response(Response),
}

/// Tells the proxy how to handle intercepted requests
#[async_trait::async_trait]
pub trait Hijacker: Send + Sync {
  /// Decide how to handle a request.
  ///
  /// An `Err` means the hijacker wanted the request but could not serve
  /// it; the pipeline counts the failure and falls back to the default
  /// upstream.
  async fn request_handler(
    &self,
    writer: &mut ResponseWriter<'_>,
    request: &mut InterceptedRequest<'_>,
  ) -> Result<Hijack> {
    let _ = (writer, request);
    Ok(Hijack::Pass)
  }

  /// Map a metric to the concrete statsd name to emit.
  ///
  /// Returning an empty string suppresses the emission.
  fn transform_metric_name(&self, metric: Metric, _request: &RequestInfo) -> String {
    metric.name().to_string()
  }
}

/// Hijacker that forwards everything unmodified
pub struct PassthroughHijacker;

#[async_trait::async_trait]
impl Hijacker for PassthroughHijacker {}
