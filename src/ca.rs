//! Leaf-certificate signing for intercepted hosts
//!
//! The signer holds the operator-provided CA (loaded from PEM files at
//! startup) and mints a short-lived leaf certificate for every destination
//! host the proxy terminates TLS for. Minted leaves are kept in a bounded
//! TTL cache; the signer is the sole mutator of that cache.

use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{CertificateParams, DistinguishedName, DnType, Issuer, KeyPair, SanType};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Leaf validity window in seconds (48 hours)
const LEAF_TTL_SECS: i64 = 48 * 60 * 60;
/// Cache time-to-live in seconds (half the leaf validity)
const CACHE_TTL_SECS: u64 = (LEAF_TTL_SECS / 2) as u64;
/// Maximum number of cached leaves
const CACHE_CAPACITY: u64 = 1024;
/// Offset for not_before to absorb clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;

type LeafEntry = Arc<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>;

/// Signs leaf certificates for intercepted destination hosts
pub struct CaSigner {
  issuer: Issuer<'static, KeyPair>,
  ca_cert_der: CertificateDer<'static>,
  leaf_cache: Cache<String, LeafEntry>,
}

impl CaSigner {
  /// Load the signing CA from PEM files.
  ///
  /// Failures here are fatal at startup: a proxy without its CA cannot
  /// terminate anything.
  pub fn from_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
      Error::certificate(format!("unable to read CA cert {}: {}", cert_path.display(), e))
    })?;
    let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
      Error::certificate(format!("unable to read CA key {}: {}", key_path.display(), e))
    })?;

    Self::from_pem(&cert_pem, &key_pem)
  }

  /// Build a signer from in-memory PEM contents
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate(format!("unable to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("unable to load CA cert: {}", e)))?;

    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate found in CA PEM"))?
      .map_err(|e| Error::certificate(format!("unable to parse CA PEM: {}", e)))?;

    let leaf_cache = Cache::builder()
      .max_capacity(CACHE_CAPACITY)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL_SECS))
      .build();

    Ok(Self {
      issuer,
      ca_cert_der,
      leaf_cache,
    })
  }

  /// Mint (or fetch from cache) a leaf certificate for `host`.
  ///
  /// Returns the certificate chain (leaf first, CA appended) and the leaf
  /// private key, ready for a rustls server config.
  pub async fn sign_leaf(
    &self,
    host: &str,
  ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    // IP literals always get a fresh leaf so a stale cached entry can
    // never lack the iPAddress SAN some clients insist on.
    if host.parse::<IpAddr>().is_ok() {
      let (chain, key) = self.mint(host)?;
      let entry = Arc::new((chain.clone(), key.clone_key()));
      self.leaf_cache.insert(host.to_string(), entry).await;
      return Ok((chain, key));
    }

    if let Some(cached) = self.leaf_cache.get(host).await {
      let (chain, key) = cached.as_ref();
      return Ok((chain.clone(), key.clone_key()));
    }

    let (chain, key) = self.mint(host)?;
    let entry = Arc::new((chain.clone(), key.clone_key()));
    self.leaf_cache.insert(host.to_string(), entry).await;
    Ok((chain, key))
  }

  fn mint(&self, host: &str) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut params = CertificateParams::default();

    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;

    // IP targets get both an iPAddress and a dNSName SAN; hostname-only
    // clients and strict IP-checking clients each find what they expect.
    params.subject_alt_names = if let Ok(ip) = host.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = host.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(host.try_into().map_err(|_| {
        Error::certificate(format!("invalid hostname: {}", host))
      })?)]
    };

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::seconds(LEAF_TTL_SECS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("unable to generate leaf key: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("unable to sign leaf for {}: {}", host, e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("unable to serialize leaf key"))?;

    Ok((vec![cert_der, self.ca_cert_der.clone()], key_der))
  }
}
