//! MITM proxy listener
//!
//! Accepts TCP connections, answers `CONNECT` tunnels by terminating TLS
//! with a leaf freshly minted for the target host, and feeds every
//! plaintext request on the tunnel through the [`Pipeline`]. Plain
//! absolute-form proxy requests go through the same pipeline without the
//! TLS step. One tokio task per connection; a slow request on one
//! connection never delays another.

use crate::ca::CaSigner;
use crate::client::HttpClient;
use crate::error::{Error, Result};
use crate::hijacker::{Hijacker, PassthroughHijacker};
use crate::http1::{
  read_request_head, request_framing, strip_hop_by_hop, wants_close, AsyncStream, Body, BoxedRead,
  Buffered, RequestHead, SharedReader,
};
use crate::metrics::{MetricsReporter, StatSink};
use crate::pipeline::{stream_response, Pipeline, ResponseWriter, Upstream};
use crate::request::InterceptedRequest;
use http::Method;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// The MITM proxy server
pub struct MitmProxy {
  listen_address: String,
  shared: Arc<Shared>,
  tracker: TaskTracker,
  listener: Mutex<Option<TcpListener>>,
}

struct Shared {
  signer: Arc<CaSigner>,
  pipeline: Pipeline,
  upstream: DefaultUpstream,
  cancel: CancellationToken,
}

/// Builder for [`MitmProxy`]
pub struct MitmProxyBuilder {
  listen_address: String,
  signer: Option<Arc<CaSigner>>,
  hijacker: Arc<dyn Hijacker>,
  sink: Option<Arc<dyn StatSink>>,
  upstream_tls: Option<ClientConfig>,
}

impl MitmProxyBuilder {
  /// Set the address the proxy binds
  pub fn listen_address(mut self, address: impl Into<String>) -> Self {
    self.listen_address = address.into();
    self
  }

  /// Set the CA signer used to forge leaves
  pub fn signer(mut self, signer: Arc<CaSigner>) -> Self {
    self.signer = Some(signer);
    self
  }

  /// Set the hijacker; defaults to the passthrough variant
  pub fn hijacker(mut self, hijacker: Arc<dyn Hijacker>) -> Self {
    self.hijacker = hijacker;
    self
  }

  /// Set the metrics sink; absent means metrics disabled
  pub fn sink(mut self, sink: Option<Arc<dyn StatSink>>) -> Self {
    self.sink = sink;
    self
  }

  /// Override the TLS configuration used to dial upstreams.
  ///
  /// Tests point this at their throwaway CA.
  pub fn upstream_tls(mut self, config: ClientConfig) -> Self {
    self.upstream_tls = Some(config);
    self
  }

  /// Build the proxy
  pub fn build(self) -> Result<MitmProxy> {
    let signer = self
      .signer
      .ok_or_else(|| Error::Config("a CA signer is required".into()))?;

    let upstream_client = match self.upstream_tls {
      Some(config) => HttpClient::builder().tls_config(config).build()?,
      None => HttpClient::new()?,
    };

    Ok(MitmProxy {
      listen_address: self.listen_address,
      shared: Arc::new(Shared {
        signer,
        pipeline: Pipeline::new(self.hijacker, MetricsReporter::new(self.sink)),
        upstream: DefaultUpstream {
          client: upstream_client,
        },
        cancel: CancellationToken::new(),
      }),
      tracker: TaskTracker::new(),
      listener: Mutex::new(None),
    })
  }
}

impl MitmProxy {
  /// Create a builder
  pub fn builder() -> MitmProxyBuilder {
    MitmProxyBuilder {
      listen_address: String::new(),
      signer: None,
      hijacker: Arc::new(PassthroughHijacker),
      sink: None,
      upstream_tls: None,
    }
  }

  /// Bind the listening socket ahead of [`run`](Self::run) and return the
  /// bound address. Binding failures are fatal.
  pub async fn bind(&self) -> Result<SocketAddr> {
    let listener = TcpListener::bind(&self.listen_address)
      .await
      .map_err(|e| Error::Config(format!("unable to bind {}: {}", self.listen_address, e)))?;
    let addr = listener.local_addr()?;
    *self.listener.lock().expect("listener lock poisoned") = Some(listener);
    Ok(addr)
  }

  /// Accept and serve connections until [`shutdown`](Self::shutdown).
  ///
  /// Blocks; new connections stop being accepted on shutdown and in-flight
  /// ones are drained before this returns.
  pub async fn run(&self) -> Result<()> {
    let listener = match self.listener.lock().expect("listener lock poisoned").take() {
      Some(listener) => listener,
      None => return Err(Error::Config("proxy is not bound; call bind() first".into())),
    };
    tracing::info!("proxy listening on {}", listener.local_addr()?);

    loop {
      tokio::select! {
        _ = self.shared.cancel.cancelled() => break,
        accepted = listener.accept() => {
          match accepted {
            Ok((stream, peer_addr)) => {
              let shared = self.shared.clone();
              self.tracker.spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, shared).await {
                  tracing::warn!("error handling connection from {}: {}", peer_addr, e);
                }
              });
            }
            Err(e) => {
              tracing::warn!("unable to accept connection: {}", e);
            }
          }
        }
      }
    }

    drop(listener);
    self.tracker.close();
    self.tracker.wait().await;
    tracing::info!("proxy closed");
    Ok(())
  }

  /// Convenience: bind then run
  pub async fn start(&self) -> Result<()> {
    self.bind().await?;
    self.run().await
  }

  /// Stop accepting new connections and let in-flight ones drain
  pub fn shutdown(&self) {
    self.shared.cancel.cancel();
  }
}

async fn handle_connection(
  stream: TcpStream,
  peer_addr: SocketAddr,
  shared: Arc<Shared>,
) -> Result<()> {
  let mut conn = Buffered::new(Box::new(stream) as Box<dyn AsyncStream>);

  let head = match read_request_head(&mut conn).await? {
    Some(head) => head,
    None => return Ok(()),
  };

  if head.method == Method::CONNECT {
    let target = head.target.clone();
    let host = match connect_host(&target) {
      Some(host) => host,
      None => {
        conn
          .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
          .await?;
        return Err(Error::InvalidRequest(format!(
          "malformed CONNECT target {:?} from {}",
          target, peer_addr
        )));
      }
    };

    conn
      .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .await?;
    conn.flush().await?;

    let (chain, key) = shared.signer.sign_leaf(&host).await?;
    let tls_config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(chain, key)
      .map_err(|e| Error::tls(format!("unable to build server config: {}", e)))?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let tls_stream = acceptor
      .accept(conn)
      .await
      .map_err(|e| Error::Tls(format!("TLS handshake with {} failed: {}", peer_addr, e)))?;

    let (read, write) = tokio::io::split(tls_stream);
    serve_requests(
      Buffered::new(Box::new(read) as BoxedRead),
      Box::new(write),
      "https",
      Some(target),
      None,
      shared,
    )
    .await
  } else {
    // plain HTTP through the proxy, absolute-form targets
    let (read, write) = tokio::io::split(conn);
    serve_requests(
      Buffered::new(Box::new(read) as BoxedRead),
      Box::new(write),
      "http",
      None,
      Some(head),
      shared,
    )
    .await
  }
}

/// Keep-alive loop over one plaintext stream: parse a request, run it
/// through the pipeline, finish its body, repeat.
async fn serve_requests(
  mut reader: SharedReader,
  mut write: Box<dyn AsyncWrite + Send + Unpin>,
  scheme: &str,
  tunnel_authority: Option<String>,
  mut pending: Option<RequestHead>,
  shared: Arc<Shared>,
) -> Result<()> {
  loop {
    let head = match pending.take() {
      Some(head) => head,
      None => {
        tokio::select! {
          _ = shared.cancel.cancelled() => break,
          head = read_request_head(&mut reader) => match head? {
            Some(head) => head,
            None => break,
          },
        }
      }
    };

    let close_requested = wants_close(head.version, &head.headers);
    let framing = request_framing(&head.headers)?;
    let body = Body::borrowed(framing, &mut reader);
    let mut request = InterceptedRequest::new(head, scheme, tunnel_authority.as_deref(), body)?;

    let mut writer = ResponseWriter::new(&mut *write);
    shared
      .pipeline
      .handle(&shared.upstream, &mut writer, &mut request)
      .await;
    let must_close = writer.must_close() || !writer.head_written();

    request.body_mut().drain().await?;
    drop(request);

    if close_requested || must_close {
      break;
    }
  }
  Ok(())
}

/// Extract the host from a `CONNECT` target, which must be host:port
fn connect_host(target: &str) -> Option<String> {
  let (host, port) = target.rsplit_once(':')?;
  if host.is_empty() || port.parse::<u16>().is_err() {
    return None;
  }
  Some(host.trim_matches(['[', ']']).to_string())
}

/// Forwards a request to its real destination and streams the response
/// back verbatim
struct DefaultUpstream {
  client: HttpClient,
}

#[async_trait::async_trait]
impl Upstream for DefaultUpstream {
  async fn serve(
    &self,
    writer: &mut ResponseWriter<'_>,
    request: &mut InterceptedRequest<'_>,
  ) -> Result<()> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let mut headers = request.headers().clone();
    strip_hop_by_hop(&mut headers);

    let body = if request.body_mut().is_done() {
      None
    } else {
      Some(request.body_mut())
    };

    let response = self.client.send(method, &uri, headers, body, None).await?;
    stream_response(writer, response).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn it_parses_connect_targets() {
    assert_eq!(connect_host("example.com:443").as_deref(), Some("example.com"));
    assert_eq!(connect_host("127.0.0.1:8443").as_deref(), Some("127.0.0.1"));
    assert_eq!(connect_host("[::1]:443").as_deref(), Some("::1"));
    assert!(connect_host("example.com").is_none());
    assert!(connect_host(":443").is_none());
    assert!(connect_host("example.com:http").is_none());
  }
}
