//! Configuration file loading and validation
//!
//! The configuration is read once at startup from a YAML file, validated,
//! and never mutated afterwards. Unknown keys are ignored; a missing
//! `registries` section yields a proxy that forwards everything unmodified.

use crate::error::{Error, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;
const DEFAULT_FLUSH_BYTES: usize = 512;

/// Top-level proxy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// host:port the proxy binds
  pub listen_address: String,
  /// Paths to the PEM certificate and private key used as the signing CA
  pub ca: TlsInfo,
  /// Textual log severity; the `--log-level` flag takes precedence
  #[serde(default)]
  pub log_level: Option<String>,
  /// Optional statsd sink descriptor; absent means metrics disabled
  #[serde(default)]
  pub statsd: Option<StatsdConfig>,
  /// Ordered registry hijacking rules
  #[serde(default)]
  pub registries: Vec<RegistryRule>,
}

/// Paths to a PEM certificate and its private key
#[derive(Debug, Clone, Deserialize)]
pub struct TlsInfo {
  /// PEM certificate path
  pub cert_path: PathBuf,
  /// PEM private key path
  pub key_path: PathBuf,
}

/// Statsd sink descriptor
#[derive(Debug, Clone, Deserialize)]
pub struct StatsdConfig {
  /// host:port of the statsd daemon
  pub address: String,
  /// Prefix prepended to every metric name
  #[serde(default)]
  pub prefix: String,
  /// Buffer flush interval, in milliseconds
  #[serde(default = "default_flush_interval")]
  pub flush_interval: u64,
  /// Buffer flush threshold, in bytes
  #[serde(default = "default_flush_bytes")]
  pub flush_bytes: usize,
}

impl StatsdConfig {
  /// Buffer flush interval as a [`Duration`]
  pub fn flush_interval(&self) -> Duration {
    Duration::from_millis(self.flush_interval)
  }
}

/// A registry whose pulls should be hijacked
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryRule {
  /// Canonical host (and optional port) of the origin registry
  pub address: String,
  /// Host regex; if present, supersedes equality-matching against `address`
  #[serde(default)]
  pub matching_regex: Option<String>,
  /// Per-attempt request timeout, in seconds
  #[serde(default = "default_timeout")]
  pub timeout: u64,
  /// Authentication descriptor for the origin registry
  #[serde(default)]
  pub security: SecurityConfig,
  /// Ordered redirect targets to try before the origin; must be non-empty
  #[serde(default)]
  pub redirects: Vec<RedirectRule>,
}

impl RegistryRule {
  /// Per-attempt timeout as a [`Duration`]
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout)
  }
}

/// A redirect target for a hijacked registry
#[derive(Debug, Clone, Deserialize)]
pub struct RedirectRule {
  /// host:port of the redirect target
  pub address: String,
  /// Per-attempt request timeout, in seconds
  #[serde(default = "default_timeout")]
  pub timeout: u64,
  /// Authentication descriptor for the redirect target
  #[serde(default)]
  pub security: SecurityConfig,
  /// Repository rewrite template; `%r` is the original repository and
  /// `%t` the original tag. Absent means no rewrite.
  #[serde(default)]
  pub rewrite_repositories: Option<String>,
}

impl RedirectRule {
  /// Per-attempt timeout as a [`Duration`]
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout)
  }
}

/// Authentication descriptor for a registry endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
  /// Basic credentials
  #[serde(default)]
  pub basic: Option<BasicCredentials>,
  /// Token-server authentication
  #[serde(default)]
  pub token: Option<TokenAuthConfig>,
}

/// Username/password pair for basic authentication
#[derive(Debug, Clone, Deserialize)]
pub struct BasicCredentials {
  /// Username
  pub username: String,
  /// Password
  pub password: String,
}

/// Docker token-server authentication parameters
#[derive(Debug, Clone, Deserialize)]
pub struct TokenAuthConfig {
  /// Token server URL, e.g. `https://auth.docker.io/token`
  pub realm: String,
  /// Service name passed to the token server
  #[serde(default)]
  pub service: String,
}

fn default_timeout() -> u64 {
  DEFAULT_TIMEOUT_SECS
}

fn default_flush_interval() -> u64 {
  DEFAULT_FLUSH_INTERVAL_MS
}

fn default_flush_bytes() -> usize {
  DEFAULT_FLUSH_BYTES
}

impl Config {
  /// Load and validate a configuration file
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
      .map_err(|e| Error::config(format!("unable to read {}: {}", path.display(), e)))?;
    Self::from_yaml(&contents).map_err(|e| match e {
      Error::Config(msg) => Error::config(format!("in {}: {}", path.display(), msg)),
      other => other,
    })
  }

  /// Parse and validate a YAML configuration document
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)
      .map_err(|e| Error::Config(format!("not a valid YAML config: {}", e)))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.listen_address.is_empty() {
      return Err(Error::Config("listen_address must not be empty".into()));
    }

    for registry in &self.registries {
      if registry.address.is_empty() {
        return Err(Error::Config("registry address must not be empty".into()));
      }
      if registry.redirects.is_empty() {
        return Err(Error::Config(format!(
          "registry {:?} does not configure any redirects",
          registry.address
        )));
      }
      if let Some(pattern) = &registry.matching_regex {
        Regex::new(pattern).map_err(|e| {
          Error::Config(format!("unable to compile regex {:?}: {}", pattern, e))
        })?;
      }
      for redirect in &registry.redirects {
        if redirect.address.is_empty() {
          return Err(Error::Config(format!(
            "registry {:?} configures a redirect with an empty address",
            registry.address
          )));
        }
      }
    }

    Ok(())
  }
}
