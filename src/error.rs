//! Error types shared across the proxy

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while intercepting and redirecting traffic
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(#[from] io::Error),

  /// Configuration error
  #[error("Configuration error: {0}")]
  Config(String),

  /// Certificate loading or signing error
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// TLS error
  #[error("TLS error: {0}")]
  Tls(String),

  /// HTTP error
  #[error("HTTP error: {0}")]
  Http(#[from] http::Error),

  /// Invalid incoming request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Connection error
  #[error("Connection error: {0}")]
  Connection(String),

  /// Registry authentication error
  #[error("Authentication error: {0}")]
  Auth(String),

  /// A hijack candidate answered, but not with a usable response
  #[error("Upstream error: {0}")]
  Upstream(String),

  /// A request attempt ran out of time
  #[error("Timed out: {0}")]
  Timeout(String),
}

impl Error {
  /// Create a configuration error and log it
  pub fn config(msg: impl Into<String>) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a certificate error and log it
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a TLS error and log it
  pub fn tls(msg: impl Into<String>) -> Self {
    let error = Error::Tls(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a connection error; the call site decides how loudly to log
  pub fn connection(msg: impl Into<String>) -> Self {
    Error::Connection(msg.into())
  }

  /// Create an authentication error; the call site decides how loudly to log
  pub fn auth(msg: impl Into<String>) -> Self {
    Error::Auth(msg.into())
  }

  /// Create an upstream error; the call site decides how loudly to log
  pub fn upstream(msg: impl Into<String>) -> Self {
    Error::Upstream(msg.into())
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}
