//! Statsd metrics emission
//!
//! A thin façade over a statsd sink: the pipeline names a [`Metric`], the
//! hijacker gets a chance to transform the concrete metric name, and the
//! result is pushed as a counter or a timing. Emission failures are logged
//! at warn level and swallowed; with no sink configured nothing is emitted.

use crate::hijacker::Hijacker;
use crate::request::RequestInfo;
use cadence::prelude::*;
use cadence::{BufferedUdpMetricSink, MetricSink, StatsdClient};
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use crate::config::StatsdConfig;
use crate::error::{Error, Result};

/// The metrics the proxy pushes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
  /// Counter: a request was produced via the hijacker
  Hijacked,
  /// Counter: a request was forwarded to the default upstream
  Proxied,
  /// Counter: the hijacker returned an error
  HijackingErrors,
  /// Timing: time to transmit 1 kB of a hijacked response
  HijackedPace,
  /// Timing: time to transmit 1 kB of a proxied response
  ProxiedPace,
}

impl Metric {
  /// The statsd name of this metric
  pub fn name(&self) -> &'static str {
    match self {
      Metric::Hijacked => "mitm.hijacked",
      Metric::Proxied => "mitm.proxied",
      Metric::HijackingErrors => "mitm.hijacked.errors",
      Metric::HijackedPace => "mitm.hijacked.pace",
      Metric::ProxiedPace => "mitm.proxied.pace",
    }
  }

  /// Whether this is a pace (timing) metric
  pub fn is_pace(&self) -> bool {
    matches!(self, Metric::HijackedPace | Metric::ProxiedPace)
  }
}

/// A stats emitter with counter and timing methods.
///
/// The statsd-backed implementation lives behind this trait so tests can
/// record emissions in memory instead.
pub trait StatSink: Send + Sync {
  /// Increment a counter by one
  fn incr(&self, name: &str) -> std::result::Result<(), String>;
  /// Record a timing value
  fn timing(&self, name: &str, duration: Duration) -> std::result::Result<(), String>;
}

/// Statsd sink over buffered UDP
pub struct StatsdSink {
  client: StatsdClient,
}

impl StatsdSink {
  /// Build a sink from the configuration.
  ///
  /// Must be called within a tokio runtime: a background task flushes the
  /// UDP buffer every `flush_interval`.
  pub fn from_config(config: &StatsdConfig) -> Result<Self> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_nonblocking(true)?;

    let sink = BufferedUdpMetricSink::with_capacity(
      config.address.as_str(),
      socket,
      config.flush_bytes,
    )
    .map_err(|e| Error::Config(format!("unable to create statsd sink: {}", e)))?;
    let sink = SharedSink(Arc::new(sink));

    let flusher = sink.clone();
    let flush_interval = config.flush_interval();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(flush_interval);
      loop {
        ticker.tick().await;
        if let Err(e) = flusher.flush() {
          tracing::debug!("statsd flush failed: {}", e);
        }
      }
    });

    Ok(Self {
      client: StatsdClient::from_sink(&config.prefix, sink),
    })
  }
}

impl StatSink for StatsdSink {
  fn incr(&self, name: &str) -> std::result::Result<(), String> {
    self
      .client
      .count(name, 1_i64)
      .map(|_| ())
      .map_err(|e| e.to_string())
  }

  fn timing(&self, name: &str, duration: Duration) -> std::result::Result<(), String> {
    self
      .client
      .time(name, duration)
      .map(|_| ())
      .map_err(|e| e.to_string())
  }
}

#[derive(Clone)]
struct SharedSink(Arc<BufferedUdpMetricSink>);

impl MetricSink for SharedSink {
  fn emit(&self, metric: &str) -> std::io::Result<usize> {
    self.0.emit(metric)
  }

  fn flush(&self) -> std::io::Result<()> {
    self.0.flush()
  }
}

/// Resolves metric names through the hijacker and pushes them to the sink
#[derive(Clone)]
pub struct MetricsReporter {
  sink: Option<Arc<dyn StatSink>>,
}

impl MetricsReporter {
  /// A reporter pushing to the given sink; `None` disables all emission
  pub fn new(sink: Option<Arc<dyn StatSink>>) -> Self {
    Self { sink }
  }

  /// A reporter that never emits anything
  pub fn disabled() -> Self {
    Self { sink: None }
  }

  /// Emit a counter increment
  pub fn incr(&self, metric: Metric, hijacker: &dyn Hijacker, request: &RequestInfo) {
    let Some(sink) = &self.sink else { return };
    let Some(name) = resolve_name(metric, hijacker, request) else {
      return;
    };
    if let Err(e) = sink.incr(&name) {
      tracing::warn!("unable to emit counter {}: {}", name, e);
    }
  }

  /// Emit a timing value
  pub fn timing(
    &self,
    metric: Metric,
    hijacker: &dyn Hijacker,
    request: &RequestInfo,
    duration: Duration,
  ) {
    let Some(sink) = &self.sink else { return };
    let Some(name) = resolve_name(metric, hijacker, request) else {
      return;
    };
    if let Err(e) = sink.timing(&name, duration) {
      tracing::warn!("unable to emit timing {}: {}", name, e);
    }
  }
}

fn resolve_name(metric: Metric, hijacker: &dyn Hijacker, request: &RequestInfo) -> Option<String> {
  let name = hijacker.transform_metric_name(metric, request);
  let name = name.trim();
  if name.is_empty() {
    None
  } else {
    Some(name.to_string())
  }
}
