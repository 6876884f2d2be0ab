//! Shared test doubles: throwaway CAs, dummy registries, a dummy TLS
//! upstream, a recording stat sink, recording authenticators, and a tiny
//! client that speaks to the proxy through CONNECT tunnels.

#![allow(dead_code)]

use http::header::{HeaderMap, HeaderValue};
use http::{Method, StatusCode, Uri, Version};
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose,
};
use sidetrack::auth::{Authenticator, AuthenticatorFactory};
use sidetrack::http1::{
  read_request_head, read_response_head, response_framing, AsyncStream, Body, BoxedRead, Buffered,
  RequestHead, SharedReader,
};
use sidetrack::{
  CaSigner, InterceptedRequest, SecurityConfig, StatSink,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub const GENERIC_TIMEOUT: Duration = Duration::from_secs(5);

/// A throwaway CA for one test
pub struct TestCa {
  pub cert_pem: String,
  pub key_pem: String,
}

impl TestCa {
  pub fn generate() -> Self {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "sidetrack test CA");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

    let key_pair = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key_pair).unwrap();
    Self {
      cert_pem: cert.pem(),
      key_pem: key_pair.serialize_pem(),
    }
  }

  pub fn signer(&self) -> CaSigner {
    CaSigner::from_pem(&self.cert_pem, &self.key_pem).unwrap()
  }

  /// A rustls client config that trusts this CA and nothing else
  pub fn client_config(&self) -> ClientConfig {
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut self.cert_pem.as_bytes()) {
      roots.add(cert.unwrap()).unwrap();
    }
    ClientConfig::builder()
      .with_root_certificates(roots)
      .with_no_client_auth()
  }
}

/// In-memory stat sink recording every emission
pub struct RecordingSink {
  calls: Mutex<Vec<StatCall>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatCall {
  Incr(String),
  Timing(String, Duration),
}

impl RecordingSink {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      calls: Mutex::new(Vec::new()),
    })
  }

  pub fn calls(&self) -> Vec<StatCall> {
    self.calls.lock().unwrap().clone()
  }

  pub fn reset(&self) -> Vec<StatCall> {
    std::mem::take(&mut *self.calls.lock().unwrap())
  }

  /// Wait until at least `n` calls were recorded; emission happens right
  /// after the last body byte is written, which can race the client's
  /// final read.
  pub async fn wait_for(&self, n: usize) {
    let deadline = Instant::now() + GENERIC_TIMEOUT;
    while self.calls.lock().unwrap().len() < n {
      if Instant::now() > deadline {
        panic!("timed out waiting for {} stat calls", n);
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
  }
}

impl StatSink for RecordingSink {
  fn incr(&self, name: &str) -> Result<(), String> {
    self
      .calls
      .lock()
      .unwrap()
      .push(StatCall::Incr(name.to_string()));
    Ok(())
  }

  fn timing(&self, name: &str, duration: Duration) -> Result<(), String> {
    self
      .calls
      .lock()
      .unwrap()
      .push(StatCall::Timing(name.to_string(), duration));
    Ok(())
  }
}

/// One recorded authentication request
#[derive(Debug, Clone, PartialEq)]
pub struct AuthRequest {
  pub address: String,
  pub repo: String,
}

/// Factory producing authenticators that record what they are asked for
pub struct RecordingAuthFactory {
  requests: Arc<Mutex<Vec<AuthRequest>>>,
}

impl RecordingAuthFactory {
  pub fn new() -> Self {
    Self {
      requests: Arc::new(Mutex::new(Vec::new())),
    }
  }

  pub fn requests(&self) -> Vec<AuthRequest> {
    self.requests.lock().unwrap().clone()
  }
}

impl AuthenticatorFactory for RecordingAuthFactory {
  fn build(
    &self,
    address: &str,
    _security: &SecurityConfig,
  ) -> sidetrack::Result<Arc<dyn Authenticator>> {
    Ok(Arc::new(RecordingAuthenticator {
      address: address.to_string(),
      requests: self.requests.clone(),
    }))
  }
}

struct RecordingAuthenticator {
  address: String,
  requests: Arc<Mutex<Vec<AuthRequest>>>,
}

#[async_trait::async_trait]
impl Authenticator for RecordingAuthenticator {
  async fn authenticate(&self, repository: &str) -> sidetrack::Result<HeaderMap> {
    self.requests.lock().unwrap().push(AuthRequest {
      address: self.address.clone(),
      repo: repository.to_string(),
    });
    Ok(HeaderMap::new())
  }
}

/// A plain-HTTP registry answering manifests and blob queries for the
/// images it knows about
pub struct DummyRegistry {
  pub address: String,
  handle: JoinHandle<()>,
}

impl DummyRegistry {
  pub async fn start(id: usize, images: &[&str]) -> Self {
    let images: Arc<HashSet<String>> =
      Arc::new(images.iter().map(|s| s.to_string()).collect());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("localhost:{}", listener.local_addr().unwrap().port());

    let handle = tokio::spawn(async move {
      loop {
        let Ok((stream, _)) = listener.accept().await else {
          break;
        };
        let images = images.clone();
        tokio::spawn(async move {
          let _ = serve_registry_conn(stream, id, images).await;
        });
      }
    });

    Self { address, handle }
  }
}

impl Drop for DummyRegistry {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

async fn serve_registry_conn(
  stream: TcpStream,
  id: usize,
  images: Arc<HashSet<String>>,
) -> sidetrack::Result<()> {
  let (read, mut write) = stream.into_split();
  let mut reader = Buffered::new(Box::new(read) as BoxedRead);

  while let Some(head) = read_request_head(&mut reader).await? {
    let response = match parse_registry_target(&head.target) {
      Some((repo, query_type, tag)) => {
        let image = format!("{}:{}", repo, tag);
        if images.contains(&image) {
          let mut extra = String::new();
          if let Some(value) = head.headers.get("double-me").and_then(|v| v.to_str().ok()) {
            let doubled = value.parse::<i64>().unwrap() * 2;
            extra = format!("doubled-ya: {}\r\n", doubled);
          }
          let body = format!("from registry {}: {} for {}", id, query_type, image);
          format!(
            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n{}\r\n{}",
            body.len(),
            extra,
            body
          )
        } else {
          "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n".to_string()
        }
      }
      None => "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n".to_string(),
    };
    write.write_all(response.as_bytes()).await?;
    write.flush().await?;
  }
  Ok(())
}

fn parse_registry_target(target: &str) -> Option<(String, String, String)> {
  let rest = target.strip_prefix("/v2/")?;
  let mut parts: Vec<&str> = rest.split('/').collect();
  if parts.len() < 3 {
    return None;
  }
  let tag = parts.pop()?.to_string();
  let query_type = parts.pop()?.to_string();
  if query_type != "manifests" && query_type != "blobs" {
    return None;
  }
  Some((parts.join("/"), query_type, tag))
}

/// The streamed line: big enough that nothing in the path can buffer it
/// whole without the test noticing
pub fn stream_data() -> Vec<u8> {
  let mut data = "data".repeat(100_000).into_bytes();
  data.push(b'\n');
  data
}

pub const STREAM_CHUNKS: usize = 7;
pub const STREAM_INTERVAL: Duration = Duration::from_millis(500);

/// A TLS upstream server with a handful of canned routes
pub struct DummyUpstream {
  pub authority: String,
  visited: Arc<Mutex<Vec<String>>>,
  handle: JoinHandle<()>,
}

impl DummyUpstream {
  pub async fn start(ca: &TestCa) -> Self {
    let signer = ca.signer();
    let (chain, key) = signer.sign_leaf("localhost").await.unwrap();
    let server_config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(chain, key)
      .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let authority = format!("localhost:{}", listener.local_addr().unwrap().port());
    let visited: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let task_visited = visited.clone();
    let handle = tokio::spawn(async move {
      loop {
        let Ok((stream, _)) = listener.accept().await else {
          break;
        };
        let acceptor = acceptor.clone();
        let visited = task_visited.clone();
        tokio::spawn(async move {
          if let Ok(tls) = acceptor.accept(stream).await {
            let _ = serve_upstream_conn(tls, visited).await;
          }
        });
      }
    });

    Self {
      authority,
      visited,
      handle,
    }
  }

  pub fn base_url(&self) -> String {
    format!("https://{}", self.authority)
  }

  pub fn reset(&self) -> Vec<String> {
    std::mem::take(&mut *self.visited.lock().unwrap())
  }
}

impl Drop for DummyUpstream {
  fn drop(&mut self) {
    self.handle.abort();
  }
}

async fn serve_upstream_conn<S: AsyncStream + 'static>(
  stream: S,
  visited: Arc<Mutex<Vec<String>>>,
) -> sidetrack::Result<()> {
  let (read, mut write) = tokio::io::split(stream);
  let mut reader = Buffered::new(Box::new(read) as BoxedRead);

  while let Some(head) = read_request_head(&mut reader).await? {
    visited.lock().unwrap().push(head.target.clone());
    match head.target.as_str() {
      "/ok" => {
        respond_fixed(&mut write, StatusCode::OK, &[], b"ok\n").await?;
      }
      "/hello_world" => {
        respond_fixed(
          &mut write,
          StatusCode::OK,
          &[("brave", "new_world")],
          b"hello brave new world!\n",
        )
        .await?;
      }
      "/stream" => {
        // 200 right away, then a large flushed chunk every half second
        write
          .write_all(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n")
          .await?;
        write.flush().await?;
        let data = stream_data();
        for _ in 0..STREAM_CHUNKS {
          write
            .write_all(format!("{:x}\r\n", data.len()).as_bytes())
            .await?;
          write.write_all(&data).await?;
          write.write_all(b"\r\n").await?;
          write.flush().await?;
          tokio::time::sleep(STREAM_INTERVAL).await;
        }
        write.write_all(b"0\r\n\r\n").await?;
        write.flush().await?;
      }
      _ => {
        respond_fixed(&mut write, StatusCode::NOT_FOUND, &[], b"").await?;
      }
    }
  }
  Ok(())
}

async fn respond_fixed<W: AsyncWrite + Unpin>(
  write: &mut W,
  status: StatusCode,
  headers: &[(&str, &str)],
  body: &[u8],
) -> sidetrack::Result<()> {
  let mut head = format!(
    "HTTP/1.1 {} {}\r\ncontent-length: {}\r\n",
    status.as_u16(),
    status.canonical_reason().unwrap_or(""),
    body.len()
  );
  for (name, value) in headers {
    head.push_str(&format!("{}: {}\r\n", name, value));
  }
  head.push_str("\r\n");
  write.write_all(head.as_bytes()).await?;
  write.write_all(body).await?;
  write.flush().await?;
  Ok(())
}

/// Build an intercepted GET request from an absolute URL, the way the
/// listener would after terminating the tunnel
pub fn get_request(url: &str, extra_headers: &[(&str, &str)]) -> InterceptedRequest<'static> {
  let uri: Uri = url.parse().unwrap();
  let authority = uri.authority().unwrap().as_str().to_string();

  let mut headers = HeaderMap::new();
  headers.insert("host", HeaderValue::from_str(&authority).unwrap());
  for (name, value) in extra_headers {
    headers.insert(
      http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
      HeaderValue::from_str(value).unwrap(),
    );
  }

  let head = RequestHead {
    method: Method::GET,
    target: uri
      .path_and_query()
      .map(|pq| pq.as_str().to_string())
      .unwrap_or_else(|| "/".to_string()),
    version: Version::HTTP_11,
    headers,
  };

  InterceptedRequest::new(
    head,
    uri.scheme_str().unwrap_or("https"),
    Some(authority.as_str()),
    Body::empty(),
  )
  .unwrap()
}

/// A writer collecting everything written through it
pub struct TestWriter {
  pub buf: Vec<u8>,
}

impl TestWriter {
  pub fn new() -> Self {
    Self { buf: Vec::new() }
  }

  pub fn as_str(&self) -> String {
    String::from_utf8_lossy(&self.buf).to_string()
  }
}

impl AsyncWrite for TestWriter {
  fn poll_write(
    mut self: std::pin::Pin<&mut Self>,
    _cx: &mut std::task::Context<'_>,
    data: &[u8],
  ) -> std::task::Poll<std::io::Result<usize>> {
    self.buf.extend_from_slice(data);
    std::task::Poll::Ready(Ok(data.len()))
  }

  fn poll_flush(
    self: std::pin::Pin<&mut Self>,
    _cx: &mut std::task::Context<'_>,
  ) -> std::task::Poll<std::io::Result<()>> {
    std::task::Poll::Ready(Ok(()))
  }

  fn poll_shutdown(
    self: std::pin::Pin<&mut Self>,
    _cx: &mut std::task::Context<'_>,
  ) -> std::task::Poll<std::io::Result<()>> {
    std::task::Poll::Ready(Ok(()))
  }
}

type TlsClientStream = tokio_rustls::client::TlsStream<Buffered<TcpStream>>;

/// A client-side CONNECT tunnel through the proxy, TLS-terminated against
/// the proxy's forged leaf
pub struct ProxyTunnel {
  reader: SharedReader,
  write: WriteHalf<TlsClientStream>,
}

/// One response read back through the tunnel
pub struct TunnelResponse {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Vec<u8>,
  /// Instants at which each read of body bytes arrived, paired with the
  /// cumulative byte count after that read
  pub arrivals: Vec<(Instant, u64)>,
  pub first_byte_at: Option<Instant>,
}

impl ProxyTunnel {
  /// CONNECT to `authority` through the proxy, then run a TLS handshake
  /// trusting `tls_config`
  pub async fn open(
    proxy_addr: std::net::SocketAddr,
    authority: &str,
    tls_config: ClientConfig,
  ) -> Self {
    let stream = TcpStream::connect(proxy_addr).await.unwrap();
    let mut conn = Buffered::new(stream);

    conn
      .write_all(
        format!(
          "CONNECT {authority} HTTP/1.1\r\nhost: {authority}\r\n\r\n",
          authority = authority
        )
        .as_bytes(),
      )
      .await
      .unwrap();
    conn.flush().await.unwrap();

    let head = read_response_head(&mut conn).await.unwrap();
    assert_eq!(head.status, StatusCode::OK);

    let host = authority.rsplit_once(':').map(|(h, _)| h).unwrap_or(authority);
    let server_name = ServerName::try_from(host.to_string()).unwrap();
    let connector = TlsConnector::from(Arc::new(tls_config));
    let tls = connector.connect(server_name, conn).await.unwrap();

    let (read, write) = tokio::io::split(tls);
    Self {
      reader: Buffered::new(Box::new(read) as BoxedRead),
      write,
    }
  }

  /// Issue a GET on the tunnel and read the whole response
  pub async fn get(&mut self, path: &str, extra_headers: &[(&str, &str)]) -> TunnelResponse {
    let mut request = format!("GET {} HTTP/1.1\r\n", path);
    for (name, value) in extra_headers {
      request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    self.write.write_all(request.as_bytes()).await.unwrap();
    self.write.flush().await.unwrap();

    let head = read_response_head(&mut self.reader).await.unwrap();
    let first_byte_at = Some(Instant::now());
    let framing = response_framing(&Method::GET, head.status, &head.headers);
    let mut body_reader = Body::borrowed(framing, &mut self.reader);

    let mut body = Vec::new();
    let mut arrivals = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
      let n = body_reader.chunk(&mut buf).await.unwrap();
      if n == 0 {
        break;
      }
      body.extend_from_slice(&buf[..n]);
      arrivals.push((Instant::now(), body.len() as u64));
    }

    TunnelResponse {
      status: head.status,
      headers: head.headers,
      body,
      arrivals,
      first_byte_at,
    }
  }
}
