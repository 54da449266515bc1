//! Proxy configuration and top-level facade

use crate::ca::{self, CertificateAuthority, CertificateManager};
use crate::error::Result;
use crate::interceptor::InterceptorHandler;
use crate::server::ProxyServer;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Configuration for the intercepting proxy
#[derive(Clone)]
pub struct ProxyConfig {
  /// Path to store CA materials
  pub ca_storage_path: PathBuf,
  /// Terminate TLS on CONNECT and inspect the plaintext; when disabled,
  /// CONNECT becomes an opaque tunnel
  pub intercept_https: bool,
  /// Optional deadline applied to upstream dials; `None` means no deadline
  pub dial_timeout: Option<Duration>,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      ca_storage_path: ca::default_storage_path(),
      intercept_https: true,
      dial_timeout: None,
    }
  }
}

/// MITM proxy: certificate authority, hook registry and server in one place
pub struct MitmProxy {
  config: ProxyConfig,
  cert_manager: Arc<CertificateManager>,
  interceptors: Arc<RwLock<InterceptorHandler>>,
}

impl MitmProxy {
  /// Create a proxy, loading or generating the CA under the configured
  /// storage path
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    let cert_manager =
      Arc::new(CertificateManager::load_or_generate(&config.ca_storage_path).await?);
    Ok(Self {
      config,
      cert_manager,
      interceptors: Arc::new(RwLock::new(InterceptorHandler::new())),
    })
  }

  /// Create a proxy around an existing authority, for callers that manage
  /// their own PEM materials
  pub fn with_authority(config: ProxyConfig, ca: CertificateAuthority) -> Self {
    Self {
      config,
      cert_manager: Arc::new(CertificateManager::new(ca)),
      interceptors: Arc::new(RwLock::new(InterceptorHandler::new())),
    }
  }

  /// Root certificate in PEM form, for installation in the client's trust
  /// store
  pub fn root_cert_pem(&self) -> &str {
    self.cert_manager.root_cert_pem()
  }

  /// The certificate manager shared with connection handlers
  pub fn cert_manager(&self) -> Arc<CertificateManager> {
    self.cert_manager.clone()
  }

  /// The hook registry; add interceptors through its write lock
  pub fn interceptor_handler(&self) -> Arc<RwLock<InterceptorHandler>> {
    self.interceptors.clone()
  }

  /// Build the server for this proxy without starting the accept loop, for
  /// embedders that accept connections themselves
  pub fn server(&self) -> Result<Arc<ProxyServer>> {
    Ok(Arc::new(ProxyServer::new(
      self.config.clone(),
      self.cert_manager.clone(),
      self.interceptors.clone(),
    )?))
  }

  /// Start the proxy on `addr`
  pub async fn start(&self, addr: &str) -> Result<()> {
    self.server()?.run(addr).await
  }
}
