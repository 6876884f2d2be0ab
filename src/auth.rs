//! Registry authentication
//!
//! Each registry endpoint (origin or redirect) gets one authenticator,
//! built at startup from its `security` descriptor and reused for the
//! process lifetime. Given a repository name, an authenticator produces
//! the request headers that authenticate a pull:
//!
//! - anonymous: nothing
//! - basic: a precomputed `Authorization: Basic …`
//! - token: the Docker token flow (ask the configured token server for a
//!   pull-scoped bearer token, cache it per repository until it expires)

use crate::client::HttpClient;
use crate::config::SecurityConfig;
use crate::error::{Error, Result};
use base64::Engine;
use http::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use http::Uri;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Fallback token validity when the token server does not say
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(300);

/// Token responses are small; anything bigger is not a token server
const MAX_TOKEN_RESPONSE: usize = 64 * 1024;

/// Produces per-request authentication options for a registry endpoint
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
  /// Headers to attach when pulling from `repository`
  async fn authenticate(&self, repository: &str) -> Result<HeaderMap>;
}

/// Builds authenticators from security descriptors.
///
/// The Docker-registry hijacker takes one of these at construction so
/// tests can substitute recording doubles.
pub trait AuthenticatorFactory: Send + Sync {
  /// Build the authenticator for an endpoint
  fn build(&self, address: &str, security: &SecurityConfig) -> Result<Arc<dyn Authenticator>>;
}

/// The factory used outside of tests
pub struct DefaultAuthenticatorFactory;

impl AuthenticatorFactory for DefaultAuthenticatorFactory {
  fn build(&self, address: &str, security: &SecurityConfig) -> Result<Arc<dyn Authenticator>> {
    if let Some(token) = &security.token {
      let basic = security
        .basic
        .as_ref()
        .map(|b| basic_header(&b.username, &b.password))
        .transpose()?;
      return Ok(Arc::new(TokenAuthenticator::new(
        &token.realm,
        &token.service,
        basic,
      )?));
    }
    if let Some(basic) = &security.basic {
      return Ok(Arc::new(BasicAuthenticator::new(
        &basic.username,
        &basic.password,
      )?));
    }
    tracing::debug!("registry {} configured without authentication", address);
    Ok(Arc::new(AnonymousAuthenticator))
  }
}

/// No authentication at all
pub struct AnonymousAuthenticator;

#[async_trait::async_trait]
impl Authenticator for AnonymousAuthenticator {
  async fn authenticate(&self, _repository: &str) -> Result<HeaderMap> {
    Ok(HeaderMap::new())
  }
}

/// Static basic credentials
pub struct BasicAuthenticator {
  header: HeaderValue,
}

impl BasicAuthenticator {
  /// Precompute the authorization header
  pub fn new(username: &str, password: &str) -> Result<Self> {
    Ok(Self {
      header: basic_header(username, password)?,
    })
  }
}

#[async_trait::async_trait]
impl Authenticator for BasicAuthenticator {
  async fn authenticate(&self, _repository: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, self.header.clone());
    Ok(headers)
  }
}

fn basic_header(username: &str, password: &str) -> Result<HeaderValue> {
  let encoded =
    base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", username, password));
  let mut header = HeaderValue::from_str(&format!("Basic {}", encoded))?;
  header.set_sensitive(true);
  Ok(header)
}

struct CachedToken {
  header: HeaderValue,
  expires_at: Instant,
}

/// Docker token-flow authenticator
pub struct TokenAuthenticator {
  realm: Uri,
  service: String,
  basic: Option<HeaderValue>,
  client: HttpClient,
  tokens: Mutex<HashMap<String, CachedToken>>,
}

#[derive(Deserialize)]
struct TokenResponse {
  token: Option<String>,
  access_token: Option<String>,
  expires_in: Option<u64>,
}

impl TokenAuthenticator {
  /// Build an authenticator against the given token server
  pub fn new(realm: &str, service: &str, basic: Option<HeaderValue>) -> Result<Self> {
    Ok(Self {
      realm: realm
        .parse()
        .map_err(|_| Error::auth(format!("invalid token realm {:?}", realm)))?,
      service: service.to_string(),
      basic,
      client: HttpClient::new()?,
      tokens: Mutex::new(HashMap::new()),
    })
  }

  async fn request_token(&self, repository: &str) -> Result<(String, Duration)> {
    let mut query = format!("scope=repository:{}:pull", repository);
    if !self.service.is_empty() {
      query = format!("service={}&{}", self.service, query);
    }
    let separator = if self.realm.query().is_some() { '&' } else { '?' };
    let url: Uri = format!("{}{}{}", self.realm, separator, query)
      .parse()
      .map_err(|_| Error::auth(format!("invalid token URL for {:?}", repository)))?;

    let mut headers = HeaderMap::new();
    if let Some(basic) = &self.basic {
      headers.insert(AUTHORIZATION, basic.clone());
    }

    let mut response = self.client.get(&url, headers, None).await?;
    if !response.status().is_success() {
      return Err(Error::auth(format!(
        "token server {} answered {}",
        self.realm,
        response.status()
      )));
    }

    let body = response.collect_body(MAX_TOKEN_RESPONSE).await?;
    let parsed: TokenResponse = serde_json::from_slice(&body)
      .map_err(|e| Error::auth(format!("unparseable token response: {}", e)))?;

    let token = parsed
      .token
      .or(parsed.access_token)
      .ok_or_else(|| Error::auth("token server response carried no token"))?;
    let ttl = parsed
      .expires_in
      .map(Duration::from_secs)
      .unwrap_or(DEFAULT_TOKEN_TTL);
    Ok((token, ttl))
  }
}

#[async_trait::async_trait]
impl Authenticator for TokenAuthenticator {
  async fn authenticate(&self, repository: &str) -> Result<HeaderMap> {
    {
      let tokens = self.tokens.lock().expect("token cache poisoned");
      if let Some(cached) = tokens.get(repository) {
        if cached.expires_at > Instant::now() {
          let mut headers = HeaderMap::new();
          headers.insert(AUTHORIZATION, cached.header.clone());
          return Ok(headers);
        }
      }
    }

    let (token, ttl) = self.request_token(repository).await?;
    let mut header = HeaderValue::from_str(&format!("Bearer {}", token))
      .map_err(|_| Error::auth("token is not a valid header value"))?;
    header.set_sensitive(true);

    let mut tokens = self.tokens.lock().expect("token cache poisoned");
    tokens.insert(
      repository.to_string(),
      CachedToken {
        header: header.clone(),
        expires_at: Instant::now() + ttl,
      },
    );

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, header);
    Ok(headers)
  }
}
