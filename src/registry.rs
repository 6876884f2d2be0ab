//! Docker-registry hijacking
//!
//! Implements [`Hijacker`] for Docker Registry v2 pulls: requests to
//! configured registries are redirected to their redirect targets in
//! order, then to the origin registry itself, and only if every candidate
//! fails does the request fall back to the proxy's default upstream.

use crate::auth::{Authenticator, AuthenticatorFactory, DefaultAuthenticatorFactory};
use crate::client::HttpClient;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hijacker::{Hijack, Hijacker};
use crate::http1::{snapshot_headers, strip_hop_by_hop};
use crate::metrics::Metric;
use crate::pipeline::ResponseWriter;
use crate::request::{InterceptedRequest, RequestInfo};
use crate::response::Response;
use http::header::{HeaderMap, HOST};
use http::{Method, StatusCode, Uri};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

/// Kind of registry query, as it appears in the URL path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
  /// `/v2/<repo>/manifests/<tag>`
  Manifests,
  /// `/v2/<repo>/blobs/<digest>`
  Blobs,
}

impl QueryType {
  fn as_str(&self) -> &'static str {
    match self {
      QueryType::Manifests => "manifests",
      QueryType::Blobs => "blobs",
    }
  }
}

struct CompiledRedirect {
  address: String,
  authenticator: Arc<dyn Authenticator>,
  timeout: Duration,
  rewrite_repositories: Option<String>,
}

struct CompiledRule {
  address: String,
  matching_regex: Option<Regex>,
  authenticator: Arc<dyn Authenticator>,
  timeout: Duration,
  redirects: Vec<CompiledRedirect>,
}

/// Hijacks pulls to configured registries and redirects them
pub struct DockerRegistryHijacker {
  registries: Vec<CompiledRule>,
  route_regex: Regex,
  client: HttpClient,
}

impl DockerRegistryHijacker {
  /// Build a hijacker from the configuration, using the default
  /// authenticator factory
  pub fn new(config: &Config) -> Result<Self> {
    Self::with_factory(config, &DefaultAuthenticatorFactory)
  }

  /// Build a hijacker with a custom authenticator factory
  pub fn with_factory(config: &Config, factory: &dyn AuthenticatorFactory) -> Result<Self> {
    let mut registries = Vec::with_capacity(config.registries.len());

    for registry in &config.registries {
      if registry.redirects.is_empty() {
        return Err(Error::Config(format!(
          "registry {:?} does not configure any redirects",
          registry.address
        )));
      }

      let mut redirects = Vec::with_capacity(registry.redirects.len());
      for redirect in &registry.redirects {
        redirects.push(CompiledRedirect {
          address: redirect.address.clone(),
          authenticator: factory.build(&redirect.address, &redirect.security)?,
          timeout: redirect.timeout(),
          rewrite_repositories: redirect.rewrite_repositories.clone(),
        });
      }

      let matching_regex = registry
        .matching_regex
        .as_deref()
        .map(|pattern| {
          Regex::new(pattern).map_err(|e| {
            Error::Config(format!("unable to compile regex {:?}: {}", pattern, e))
          })
        })
        .transpose()?;

      registries.push(CompiledRule {
        address: registry.address.clone(),
        matching_regex,
        authenticator: factory.build(&registry.address, &registry.security)?,
        timeout: registry.timeout(),
        redirects,
      });
    }

    Ok(Self {
      registries,
      // $1 is the repository, $2 the query type, $3 the tag
      route_regex: Regex::new(r"^/v2/(.+)/(manifests|blobs)/(.+)$")
        .expect("route regex is well-formed"),
      client: HttpClient::new()?,
    })
  }

  fn matching_registry(&self, host: &str) -> Option<&CompiledRule> {
    for registry in &self.registries {
      if registry.address == host
        || registry
          .matching_regex
          .as_ref()
          .is_some_and(|regex| regex.is_match(host))
      {
        tracing::debug!("found matching registry {} for host {:?}", registry.address, host);
        return Some(registry);
      }
    }
    tracing::trace!("no matching registry for host {:?}", host);
    None
  }

  fn parse_registry_path(&self, path: &str) -> Option<(String, QueryType, String)> {
    let captures = self.route_regex.captures(path)?;
    let query_type = match &captures[2] {
      "manifests" => QueryType::Manifests,
      _ => QueryType::Blobs,
    };
    Some((captures[1].to_string(), query_type, captures[3].to_string()))
  }

  /// One attempt against one candidate: authenticate, then fetch.
  /// Anything but a 2xx response counts as a failure, so the cascade can
  /// move on to the next candidate.
  async fn try_registry(
    &self,
    address: &str,
    authenticator: &dyn Authenticator,
    timeout: Duration,
    rewrite_rule: Option<&str>,
    repository: &str,
    query_type: QueryType,
    tag: &str,
    request_headers: &HeaderMap,
  ) -> Result<Response> {
    let repository = rewrite_repository(rewrite_rule, repository, tag);

    let auth_headers = authenticator.authenticate(&repository).await.map_err(|e| {
      tracing::error!("unable to authenticate to registry {:?}: {}", address, e);
      e
    })?;

    let url: Uri = format!(
      "http://{}/v2/{}/{}/{}",
      address,
      repository,
      query_type.as_str(),
      tag
    )
    .parse()
    .map_err(|_| Error::upstream(format!("registry {:?} yields an invalid URL", address)))?;

    let mut headers = request_headers.clone();
    headers.extend(auth_headers);

    let response = self.client.get(&url, headers, Some(timeout)).await?;
    if !response.status().is_success() {
      return Err(Error::upstream(format!(
        "{} answered {}",
        url,
        response.status()
      )));
    }
    Ok(response)
  }
}

#[async_trait::async_trait]
impl Hijacker for DockerRegistryHijacker {
  async fn request_handler(
    &self,
    writer: &mut ResponseWriter<'_>,
    request: &mut InterceptedRequest<'_>,
  ) -> Result<Hijack> {
    if request.method() != Method::GET {
      // we only ever redirect pulls, let everything else through
      return Ok(Hijack::Pass);
    }

    let path = request.uri().path().trim_end_matches('/').to_string();
    if path != "/v2" && !path.starts_with("/v2/") {
      return Ok(Hijack::Pass);
    }

    let Some(registry) = self.matching_registry(request.host()) else {
      return Ok(Hijack::Pass);
    };

    if path == "/v2" {
      // initial handshake; authentication to the candidates is ours to
      // deal with, so the client does not need to talk to the origin
      writer.respond(StatusCode::OK, b"{}").await?;
      return Ok(Hijack::Replied);
    }

    let Some((repository, query_type, tag)) = self.parse_registry_path(&path) else {
      tracing::warn!("unexpected non-registry request to {}", request.uri());
      return Ok(Hijack::Pass);
    };

    let mut request_headers = snapshot_headers(request.headers());
    strip_hop_by_hop(&mut request_headers);
    request_headers.remove(HOST);

    for redirect in &registry.redirects {
      match self
        .try_registry(
          &redirect.address,
          redirect.authenticator.as_ref(),
          redirect.timeout,
          redirect.rewrite_repositories.as_deref(),
          &repository,
          query_type,
          &tag,
          &request_headers,
        )
        .await
      {
        Ok(response) => return Ok(Hijack::Response(response)),
        Err(e) => {
          tracing::warn!(
            "failed {} request to redirect {:?}: {}",
            query_type.as_str(),
            redirect.address,
            e
          );
        }
      }
    }

    // none of the redirects worked out, last resort is the origin itself
    match self
      .try_registry(
        &registry.address,
        registry.authenticator.as_ref(),
        registry.timeout,
        None,
        &repository,
        query_type,
        &tag,
        &request_headers,
      )
      .await
    {
      Ok(response) => Ok(Hijack::Response(response)),
      Err(e) => {
        tracing::warn!(
          "failed {} request to origin {:?}: {}",
          query_type.as_str(),
          registry.address,
          e
        );
        Err(e)
      }
    }
  }

  /// Pace metrics get suffixed with the registry host (dots replaced by
  /// underscores) and, for registry queries, the query type. Counters
  /// keep their base names.
  fn transform_metric_name(&self, metric: Metric, request: &RequestInfo) -> String {
    if !metric.is_pace() {
      return metric.name().to_string();
    }

    let mut name = format!("{}.{}", metric.name(), request.host.replace('.', "_"));
    if let Some((_, query_type, _)) = self.parse_registry_path(request.path.trim_end_matches('/'))
    {
      name.push('.');
      name.push_str(query_type.as_str());
    }
    name
  }
}

/// Apply a rewrite template: `%r` is the original repository, `%t` the
/// original tag. An empty rule leaves the repository untouched.
fn rewrite_repository(rewrite_rule: Option<&str>, repository: &str, tag: &str) -> String {
  match rewrite_rule {
    None | Some("") => repository.to_string(),
    Some(rule) => rule.replace("%r", repository).replace("%t", tag),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn it_rewrites_repositories() {
    assert_eq!(rewrite_repository(None, "ubuntu", "18"), "ubuntu");
    assert_eq!(rewrite_repository(Some(""), "ubuntu", "18"), "ubuntu");
    assert_eq!(
      rewrite_repository(Some("%r:%t"), "ubuntu", "18"),
      "ubuntu:18"
    );
    assert_eq!(
      rewrite_repository(Some("rewritten_%r$%t!"), "ubuntu", "18"),
      "rewritten_ubuntu$18!"
    );
    assert_eq!(
      rewrite_repository(Some("mirror/%r"), "library/nginx", "latest"),
      "mirror/library/nginx"
    );
  }

  fn hijacker() -> DockerRegistryHijacker {
    let config = Config::from_yaml(
      r#"
listen_address: ":0"
ca:
  cert_path: c
  key_path: k
registries:
  - address: index.docker.io
    redirects:
      - address: "localhost:8765"
"#,
    )
    .unwrap();
    DockerRegistryHijacker::new(&config).unwrap()
  }

  #[test]
  fn it_parses_registry_paths() {
    let hijacker = hijacker();

    let (repo, query_type, tag) = hijacker
      .parse_registry_path("/v2/ubuntu/manifests/latest")
      .unwrap();
    assert_eq!(repo, "ubuntu");
    assert_eq!(query_type, QueryType::Manifests);
    assert_eq!(tag, "latest");

    let (repo, query_type, tag) = hijacker
      .parse_registry_path("/v2/library/nginx/blobs/sha256:abc123")
      .unwrap();
    assert_eq!(repo, "library/nginx");
    assert_eq!(query_type, QueryType::Blobs);
    assert_eq!(tag, "sha256:abc123");

    assert!(hijacker.parse_registry_path("/v2").is_none());
    assert!(hijacker.parse_registry_path("/v2/ubuntu/tags/list").is_none());
    assert!(hijacker.parse_registry_path("/coucou").is_none());
  }

  #[test]
  fn it_matches_hosts_by_address_and_regex() {
    let config = Config::from_yaml(
      r#"
listen_address: ":0"
ca:
  cert_path: c
  key_path: k
registries:
  - address: index.docker.io
    matching_regex: 'docker\.io$'
    redirects:
      - address: "localhost:8765"
  - address: "quay.io"
    redirects:
      - address: "localhost:8766"
"#,
    )
    .unwrap();
    let hijacker = DockerRegistryHijacker::new(&config).unwrap();

    assert_eq!(
      hijacker.matching_registry("index.docker.io").unwrap().address,
      "index.docker.io"
    );
    assert_eq!(
      hijacker
        .matching_registry("whatever.docker.io")
        .unwrap()
        .address,
      "index.docker.io"
    );
    assert_eq!(
      hijacker.matching_registry("quay.io").unwrap().address,
      "quay.io"
    );
    assert!(hijacker.matching_registry("gcr.io").is_none());
  }

  #[test]
  fn it_transforms_pace_metric_names_only() {
    let hijacker = hijacker();

    let registry_query = RequestInfo {
      host: "index.docker.io".into(),
      path: "/v2/ubuntu/blobs/18".into(),
      method: Method::GET,
    };
    assert_eq!(
      hijacker.transform_metric_name(Metric::HijackedPace, &registry_query),
      "mitm.hijacked.pace.index_docker_io.blobs"
    );
    assert_eq!(
      hijacker.transform_metric_name(Metric::Hijacked, &registry_query),
      "mitm.hijacked"
    );

    let handshake = RequestInfo {
      host: "index.docker.io".into(),
      path: "/v2/".into(),
      method: Method::GET,
    };
    assert_eq!(
      hijacker.transform_metric_name(Metric::ProxiedPace, &handshake),
      "mitm.proxied.pace.index_docker_io"
    );
  }
}
