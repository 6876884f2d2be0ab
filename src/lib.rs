//! # sidetrack
//!
//! A man-in-the-middle HTTPS proxy that transparently intercepts
//! Docker-registry pulls and redirects them to alternate registry
//! endpoints (a local peer-to-peer distribution cache, say), falling back
//! to the original upstream when the candidates fail.
//!
//! Clients configure it as an HTTP proxy. The proxy terminates TLS with
//! a leaf certificate forged on the fly for the `CONNECT` target host,
//! signed by an operator-provided CA that the clients trust, inspects the
//! plaintext requests, and for each one either serves it itself, fetches
//! it from a redirect target, or forwards it untouched. The response is
//! streamed back either way, with per-request throughput telemetry pushed
//! to statsd.
//!
//! # Example
//!
//! ```no_run
//! use sidetrack::{CaSigner, Config, DockerRegistryHijacker, MitmProxy};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   let config = Config::from_file("config.yml")?;
//!   let signer = Arc::new(CaSigner::from_files(
//!     &config.ca.cert_path,
//!     &config.ca.key_path,
//!   )?);
//!   let hijacker = Arc::new(DockerRegistryHijacker::new(&config)?);
//!
//!   let proxy = MitmProxy::builder()
//!     .listen_address(&config.listen_address)
//!     .signer(signer)
//!     .hijacker(hijacker)
//!     .build()?;
//!   proxy.start().await?;
//!   Ok(())
//! }
//! ```

pub mod auth;
mod ca;
mod client;
mod config;
mod error;
pub mod http1;
mod hijacker;
mod metrics;
mod pipeline;
mod proxy;
mod registry;
mod request;
mod response;

pub use ca::CaSigner;
pub use client::{HttpClient, HttpClientBuilder};
pub use config::{
  BasicCredentials, Config, RedirectRule, RegistryRule, SecurityConfig, StatsdConfig, TlsInfo,
  TokenAuthConfig,
};
pub use error::{Error, Result};
pub use hijacker::{Hijack, Hijacker, PassthroughHijacker};
pub use metrics::{Metric, MetricsReporter, StatSink, StatsdSink};
pub use pipeline::{Pipeline, ResponseWriter, Upstream};
pub use proxy::{MitmProxy, MitmProxyBuilder};
pub use registry::{DockerRegistryHijacker, QueryType};
pub use request::{InterceptedRequest, RequestInfo};
pub use response::Response;
