//! Minimal outbound HTTP/1.1 client
//!
//! Dials the target directly (TCP, or TLS for https), writes the request,
//! and hands back a [`Response`] whose body streams straight off the
//! connection. One connection per request; the response body owns it.

use crate::error::{Error, Result};
use crate::http1::{
  read_response_head, write_framed_body, write_headers, AsyncStream, Body, BoxedRead, Buffered,
};
use crate::response::Response;
use http::header::{HeaderMap, HeaderValue, CONNECTION, HOST, TRANSFER_ENCODING};
use http::{Method, Uri};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

/// HTTP client for redirect attempts, token requests and upstream dials
#[derive(Clone)]
pub struct HttpClient {
  connector: TlsConnector,
}

/// Builder for [`HttpClient`]
#[derive(Default)]
pub struct HttpClientBuilder {
  extra_roots: Vec<CertificateDer<'static>>,
  accept_invalid_certs: bool,
  tls_config: Option<ClientConfig>,
}

impl HttpClientBuilder {
  /// Trust an additional root certificate (DER)
  pub fn add_root_certificate(mut self, cert: CertificateDer<'static>) -> Self {
    self.extra_roots.push(cert);
    self
  }

  /// Skip server certificate verification entirely.
  ///
  /// Test-environment escape hatch; never enabled by configuration.
  pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
    self.accept_invalid_certs = accept;
    self
  }

  /// Use a fully custom TLS client configuration
  pub fn tls_config(mut self, config: ClientConfig) -> Self {
    self.tls_config = Some(config);
    self
  }

  /// Build the client
  pub fn build(self) -> Result<HttpClient> {
    let config = match self.tls_config {
      Some(config) => config,
      None if self.accept_invalid_certs => ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth(),
      None => {
        let mut roots =
          RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        for cert in self.extra_roots {
          roots
            .add(cert)
            .map_err(|e| Error::tls(format!("unable to add root certificate: {}", e)))?;
        }
        ClientConfig::builder()
          .with_root_certificates(roots)
          .with_no_client_auth()
      }
    };

    Ok(HttpClient {
      connector: TlsConnector::from(Arc::new(config)),
    })
  }
}

impl HttpClient {
  /// Create a builder
  pub fn builder() -> HttpClientBuilder {
    HttpClientBuilder::default()
  }

  /// Build a client with the default trust anchors
  pub fn new() -> Result<Self> {
    Self::builder().build()
  }

  /// Issue a `GET` with the given headers
  pub async fn get(
    &self,
    url: &Uri,
    headers: HeaderMap,
    timeout: Option<Duration>,
  ) -> Result<Response> {
    self.send(Method::GET, url, headers, None, timeout).await
  }

  /// Send a request, optionally pumping a body, and return the streaming
  /// response.
  ///
  /// The timeout bounds everything up to and including the response head;
  /// body streaming is left unbounded so large blobs are not cut off
  /// mid-transfer.
  pub async fn send(
    &self,
    method: Method,
    url: &Uri,
    headers: HeaderMap,
    body: Option<&mut Body<'_>>,
    timeout: Option<Duration>,
  ) -> Result<Response> {
    match timeout {
      Some(d) => tokio::time::timeout(d, self.send_inner(method, url, headers, body))
        .await
        .map_err(|_| Error::Timeout(format!("request to {} timed out after {:?}", url, d)))?,
      None => self.send_inner(method, url, headers, body).await,
    }
  }

  async fn send_inner(
    &self,
    method: Method,
    url: &Uri,
    mut headers: HeaderMap,
    body: Option<&mut Body<'_>>,
  ) -> Result<Response> {
    let scheme = url.scheme_str().unwrap_or("http");
    let host = url
      .host()
      .ok_or_else(|| Error::Connection(format!("URL {} has no host", url)))?;
    let port = url
      .port_u16()
      .unwrap_or(if scheme == "https" { 443 } else { 80 });
    let addr = format!("{}:{}", host, port);

    let tcp = TcpStream::connect(&addr)
      .await
      .map_err(|e| Error::Connection(format!("unable to connect to {}: {}", addr, e)))?;

    let mut stream: Box<dyn AsyncStream> = if scheme == "https" {
      let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| Error::Tls(format!("invalid server name {}", host)))?;
      let tls = self
        .connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| Error::Tls(format!("TLS handshake with {} failed: {}", addr, e)))?;
      Box::new(tls)
    } else {
      Box::new(tcp)
    };

    if !headers.contains_key(HOST) {
      let authority = url
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_else(|| addr.clone());
      headers.insert(HOST, HeaderValue::from_str(&authority)?);
    }
    headers.insert(CONNECTION, HeaderValue::from_static("close"));

    let path = url
      .path_and_query()
      .map(|pq| pq.as_str())
      .unwrap_or("/");
    stream
      .write_all(format!("{} {} HTTP/1.1\r\n", method, path).as_bytes())
      .await?;
    write_headers(&mut stream, &headers).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await?;

    if let Some(body) = body {
      let chunked = headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
      write_framed_body(&mut stream, chunked, body).await?;
    }

    let mut reader = Buffered::new(Box::new(stream) as BoxedRead);
    let head = read_response_head(&mut reader).await?;
    Ok(Response::new(head, &method, reader))
  }
}

#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    vec![
      SignatureScheme::RSA_PKCS1_SHA256,
      SignatureScheme::ECDSA_NISTP256_SHA256,
      SignatureScheme::RSA_PKCS1_SHA384,
      SignatureScheme::ECDSA_NISTP384_SHA384,
      SignatureScheme::RSA_PKCS1_SHA512,
      SignatureScheme::ECDSA_NISTP521_SHA512,
      SignatureScheme::RSA_PSS_SHA256,
      SignatureScheme::RSA_PSS_SHA384,
      SignatureScheme::RSA_PSS_SHA512,
      SignatureScheme::ED25519,
    ]
  }
}
