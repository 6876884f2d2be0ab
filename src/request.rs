//! Intercepted request type

use crate::error::{Error, Result};
use crate::http1::{Body, RequestHead};
use http::header::{HeaderMap, HOST};
use http::{Method, Uri, Version};

/// A request read off an intercepted connection.
///
/// For tunnelled requests the URI is synthesized from the `CONNECT` target
/// so that downstream code sees the absolute destination, the same way it
/// would for a plain absolute-form proxy request.
pub struct InterceptedRequest<'a> {
  method: Method,
  uri: Uri,
  version: Version,
  headers: HeaderMap,
  host: String,
  body: Body<'a>,
}

/// The request fields that outlive the request itself: metric-name
/// transformation and logging run after the body is gone.
#[derive(Debug, Clone)]
pub struct RequestInfo {
  /// Host the request was addressed to
  pub host: String,
  /// URL path
  pub path: String,
  /// HTTP method
  pub method: Method,
}

impl<'a> InterceptedRequest<'a> {
  /// Build a request from a parsed head.
  ///
  /// `tunnel_authority` is the `CONNECT` target when the request arrived
  /// through a TLS tunnel; origin-form targets are resolved against it
  /// using `scheme`.
  pub fn new(
    head: RequestHead,
    scheme: &str,
    tunnel_authority: Option<&str>,
    body: Body<'a>,
  ) -> Result<Self> {
    let uri: Uri = if head.target.starts_with('/') {
      let authority = tunnel_authority
        .map(str::to_string)
        .or_else(|| {
          head
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        })
        .ok_or_else(|| Error::InvalidRequest("request has no destination host".into()))?;
      format!("{}://{}{}", scheme, authority, head.target).parse()?
    } else {
      head.target.parse()?
    };

    let host = head
      .headers
      .get(HOST)
      .and_then(|v| v.to_str().ok())
      .map(str::to_string)
      .or_else(|| uri.host().map(str::to_string))
      .ok_or_else(|| Error::InvalidRequest("request has no destination host".into()))?;

    Ok(Self {
      method: head.method,
      uri,
      version: head.version,
      headers: head.headers,
      host,
      body,
    })
  }

  /// HTTP method
  pub fn method(&self) -> &Method {
    &self.method
  }

  /// Absolute request URI
  pub fn uri(&self) -> &Uri {
    &self.uri
  }

  /// HTTP version
  pub fn version(&self) -> Version {
    self.version
  }

  /// Request headers
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// Host the request was addressed to, as the client named it
  pub fn host(&self) -> &str {
    &self.host
  }

  /// The request body
  pub fn body_mut(&mut self) -> &mut Body<'a> {
    &mut self.body
  }

  /// Snapshot of the fields needed after the request is consumed
  pub fn info(&self) -> RequestInfo {
    RequestInfo {
      host: self.host.clone(),
      path: self.uri.path().to_string(),
      method: self.method.clone(),
    }
  }
}

impl std::fmt::Display for InterceptedRequest<'_> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} {}", self.method, self.uri)
  }
}
