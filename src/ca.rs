//! Certificate Authority (CA) for the intercepting proxy
//!
//! Generates the root trust anchor and signs per-hostname leaf certificates
//! on demand so HTTPS traffic can be terminated without the client noticing,
//! provided the root is installed in the client's trust store.

use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Certificate validity period in days (10 years, root and leaf alike)
const VALIDITY_DAYS: i64 = 3650;
/// Leaf cache time-to-live in seconds (half the validity window)
const CACHE_TTL: u64 = (VALIDITY_DAYS as u64) * 24 * 60 * 60 / 2;
/// Offset for not_before timestamps to absorb clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Length of the root's random subject key identifier
const KEY_ID_LEN: usize = 20;

/// A leaf certificate minted for one hostname, with both the PEM form for
/// export and the DER form ready for a rustls `ServerConfig`.
pub struct LeafCertificate {
  hostname: String,
  cert_pem: String,
  key_pem: String,
  cert_chain: Vec<CertificateDer<'static>>,
  key_der: PrivateKeyDer<'static>,
}

impl LeafCertificate {
  /// Hostname the certificate was issued for
  pub fn hostname(&self) -> &str {
    &self.hostname
  }

  /// Certificate in PEM form
  pub fn cert_pem(&self) -> &str {
    &self.cert_pem
  }

  /// Private key in PEM form
  pub fn key_pem(&self) -> &str {
    &self.key_pem
  }

  /// Presented chain: `[leaf, root]`
  pub fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
    self.cert_chain.clone()
  }

  /// Leaf private key
  pub fn key(&self) -> PrivateKeyDer<'static> {
    self.key_der.clone_key()
  }
}

/// Certificate Authority holding the root key material
#[derive(Debug)]
pub struct CertificateAuthority {
  /// Root CA issuer used to sign leaves
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  /// Root CA certificate in PEM format
  ca_cert_pem: String,
  /// Root CA private key in PEM format
  ca_key_pem: String,
}

impl CertificateAuthority {
  /// Generate a fresh self-signed root certificate and key pair
  pub fn generate() -> Result<Self> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Interpose Root CA");
    dn.push(DnType::OrganizationName, "Interpose");
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyCertSign,
    ];
    params.extended_key_usages = vec![
      ExtendedKeyUsagePurpose::ClientAuth,
      ExtendedKeyUsagePurpose::ServerAuth,
    ];

    // Random 20-byte subject key identifier; leaves point back at it
    // through their authority key identifier.
    let mut key_id = [0u8; KEY_ID_LEN];
    rand::thread_rng().fill(&mut key_id[..]);
    params.key_identifier_method = KeyIdMethod::PreSpecified(key_id.to_vec());
    params.use_authority_key_identifier_extension = true;

    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(VALIDITY_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("Failed to generate root key pair: {}", e)))?;

    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate(format!("Failed to self-sign root certificate: {}", e)))?;

    let cert_pem = cert.pem();
    let key_pem = key_pair.serialize_pem();
    let cert_der = CertificateDer::from(cert.der().to_vec());

    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("Failed to create issuer: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der: cert_der,
      ca_cert_pem: cert_pem,
      ca_key_pem: key_pem,
    })
  }

  /// Reconstruct the authority from persisted PEM materials
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::invalid_trust_anchor(format!("Failed to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair).map_err(|e| {
      Error::invalid_trust_anchor(format!("Failed to create issuer from CA cert: {}", e))
    })?;

    let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::invalid_trust_anchor("No certificate found in PEM"))?
      .map_err(|e| Error::invalid_trust_anchor(format!("Failed to parse PEM: {}", e)))?;

    Ok(Self {
      issuer,
      ca_cert_der: cert_der,
      ca_cert_pem: cert_pem.to_string(),
      ca_key_pem: key_pem.to_string(),
    })
  }

  /// Load the CA from `storage_path`, generating and persisting a new one if
  /// no materials exist there yet.
  pub async fn load_or_generate(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref();
    if !storage_path.exists() {
      fs::create_dir_all(storage_path).await?;
    }

    let cert_path = storage_path.join("ca_cert.pem");
    let key_path = storage_path.join("ca_key.pem");

    if cert_path.exists() && key_path.exists() {
      let cert_pem = fs::read_to_string(&cert_path).await?;
      let key_pem = fs::read_to_string(&key_path).await?;
      return Self::from_pem(&cert_pem, &key_pem);
    }

    let ca = Self::generate()?;

    let mut cert_file = fs::File::create(&cert_path).await?;
    cert_file.write_all(ca.ca_cert_pem.as_bytes()).await?;
    let mut key_file = fs::File::create(&key_path).await?;
    key_file.write_all(ca.ca_key_pem.as_bytes()).await?;

    Ok(ca)
  }

  /// Root certificate in PEM form, for installation in client trust stores
  pub fn root_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Root private key in PEM form
  pub fn root_key_pem(&self) -> &str {
    &self.ca_key_pem
  }

  /// Root certificate in DER form
  pub fn root_cert_der(&self) -> CertificateDer<'static> {
    self.ca_cert_der.clone()
  }

  /// Sign a fresh leaf certificate for `hostname`
  ///
  /// Failures abort the handshake that requested the leaf; they never
  /// propagate past the owning connection.
  pub fn issue_leaf(&self, hostname: &str) -> Result<LeafCertificate> {
    let mut params = CertificateParams::default();

    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    // IP literals get both an iPAddress and a dNSName SAN; some clients
    // check one, some the other.
    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = hostname.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::certificate(format!("Invalid hostname: {}", hostname))
      })?)]
    };

    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![
      ExtendedKeyUsagePurpose::ClientAuth,
      ExtendedKeyUsagePurpose::ServerAuth,
    ];
    params.use_authority_key_identifier_extension = true;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(VALIDITY_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("Failed to generate leaf key pair: {}", e)))?;

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("Failed to sign leaf certificate: {}", e)))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("Failed to serialize leaf key"))?;

    Ok(LeafCertificate {
      hostname: hostname.to_string(),
      cert_pem: cert.pem(),
      key_pem: key_pair.serialize_pem(),
      cert_chain: vec![cert_der, self.ca_cert_der.clone()],
      key_der,
    })
  }
}

/// Caching front for the CA: one leaf per hostname, shared across all
/// connection tasks.
pub struct CertificateManager {
  ca: CertificateAuthority,
  /// hostname → leaf; concurrent get-or-insert, hits never re-sign
  cert_cache: Cache<String, Arc<LeafCertificate>>,
}

impl CertificateManager {
  /// Wrap an existing authority with a leaf cache
  pub fn new(ca: CertificateAuthority) -> Self {
    let cert_cache = Cache::builder()
      .max_capacity(1000)
      .time_to_live(std::time::Duration::from_secs(CACHE_TTL))
      .build();
    Self { ca, cert_cache }
  }

  /// Load or generate the CA under `storage_path` and wrap it
  pub async fn load_or_generate(storage_path: impl AsRef<Path>) -> Result<Self> {
    Ok(Self::new(CertificateAuthority::load_or_generate(storage_path).await?))
  }

  /// Look up the leaf for `hostname`, signing one on a miss. Concurrent
  /// misses for the same hostname may sign redundantly; the cache itself is
  /// never corrupted.
  pub async fn get_or_issue(&self, hostname: &str) -> Result<Arc<LeafCertificate>> {
    if let Some(cached) = self.cert_cache.get(hostname).await {
      return Ok(cached);
    }

    let leaf = Arc::new(self.ca.issue_leaf(hostname)?);
    self
      .cert_cache
      .insert(hostname.to_string(), leaf.clone())
      .await;
    Ok(leaf)
  }

  /// Root certificate in PEM form
  pub fn root_cert_pem(&self) -> &str {
    self.ca.root_cert_pem()
  }

  /// The wrapped authority
  pub fn authority(&self) -> &CertificateAuthority {
    &self.ca
  }
}

/// Default on-disk location for persisted CA materials
pub fn default_storage_path() -> PathBuf {
  PathBuf::from(".interpose")
}
