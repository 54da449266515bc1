//! Proxy server: accept loop and per-connection state machine
//!
//! Each accepted connection takes exactly one of three paths: plain HTTP
//! forwarding, opaque CONNECT tunneling, or TLS-terminating interception.
//! Connections speaking SOCKS5 on the same listener are detected by their
//! first byte and handed to the SOCKS5 handler.

use crate::ca::CertificateManager;
use crate::error::{Error, Result};
use crate::http1;
use crate::interceptor::{InterceptorHandler, RequestAction};
use crate::proxy::ProxyConfig;
use crate::relay;
use crate::socks5::{Socks5Server, SOCKS5_VERSION};
use bytes::Bytes;
use http::{Method, Request};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::server::Acceptor;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
/// Upper bound on the header block of a CONNECT preamble
const MAX_CONNECT_HEADERS: usize = 16 * 1024;

/// Proxy server: one spawned handler task per accepted connection
pub struct ProxyServer {
  config: ProxyConfig,
  cert_manager: Arc<CertificateManager>,
  interceptors: Arc<RwLock<InterceptorHandler>>,
  upstream_tls: Arc<ClientConfig>,
}

impl ProxyServer {
  /// Create a new proxy server
  pub fn new(
    config: ProxyConfig,
    cert_manager: Arc<CertificateManager>,
    interceptors: Arc<RwLock<InterceptorHandler>>,
  ) -> Result<Self> {
    let upstream_tls = Arc::new(Self::upstream_tls_config()?);
    Ok(Self {
      config,
      cert_manager,
      interceptors,
      upstream_tls,
    })
  }

  /// rustls client config trusting the platform's certificate store, used
  /// for the origin-facing side of interception
  fn upstream_tls_config() -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs().certs;
    for cert in certs {
      roots
        .add(cert)
        .map_err(|e| Error::tls(format!("Failed to load native root: {}", e)))?;
    }
    Ok(
      ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth(),
    )
  }

  /// Run the accept loop on `addr`
  pub async fn run(self: Arc<Self>, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::connection(format!("Failed to bind to {}: {}", addr, e)))?;
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let server = self.clone();
          tokio::spawn(async move {
            if let Err(e) = server.handle_connection(stream, peer_addr).await {
              tracing::debug!("[proxy] connection from {} closed: {}", peer_addr, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("[proxy] failed to accept connection: {}", e);
        }
      }
    }
  }

  /// Handle one already-accepted connection
  ///
  /// Both sockets of the session are torn down by scope exit on every path,
  /// early errors included.
  pub async fn handle_connection<S>(&self, mut stream: S, peer_addr: SocketAddr) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    // First byte picks the protocol: 0x05 is a SOCKS5 greeting, HTTP
    // methods start with ASCII letters.
    let mut first_byte = [0u8; 1];
    stream.read_exact(&mut first_byte).await?;

    if first_byte[0] == SOCKS5_VERSION {
      let socks = Socks5Server {
        dial_timeout: self.config.dial_timeout,
      };
      return socks.handle_after_version(stream).await;
    }

    let mut request_line = vec![first_byte[0]];
    let mut buffer = [0u8; 1];
    loop {
      stream.read_exact(&mut buffer).await?;
      request_line.push(buffer[0]);
      if buffer[0] == b'\n' {
        break;
      }
      if request_line.len() > http1::MAX_LINE_SIZE {
        return Err(Error::invalid_request("Request line too long"));
      }
    }

    let request_line = String::from_utf8_lossy(&request_line).into_owned();
    let line = http1::parse_request_line(&request_line)?;

    if line.method == Method::CONNECT {
      let (host, port) = http1::host_port(&line.target, 443)?;
      let mut reader = BufReader::new(stream);
      let mut headers_acc = 0usize;
      loop {
        let mut header_line = String::new();
        let n = reader.read_line(&mut header_line).await?;
        if n == 0 {
          break;
        }
        headers_acc += n;
        if headers_acc > MAX_CONNECT_HEADERS {
          return Err(Error::invalid_request(
            "CONNECT headers size exceeds maximum allowed",
          ));
        }
        if header_line == "\r\n" || header_line == "\n" {
          break;
        }
      }
      let stream = reader.into_inner();

      if self.config.intercept_https {
        self.handle_connect_intercept(stream, &host, port, peer_addr).await
      } else {
        self.handle_connect_tunnel(stream, &host, port).await
      }
    } else {
      let mut reader = BufReader::new(stream);
      let request = http1::read_request_after_line(&mut reader, line, None).await?;
      self.handle_plain_forward(reader.get_mut(), request).await
    }
  }

  /// Opaque CONNECT tunnel: dial, confirm, relay. Dial failure closes the
  /// connection without a response.
  async fn handle_connect_tunnel<S>(&self, mut stream: S, host: &str, port: u16) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let upstream = self.dial(host, port).await?;
    stream.write_all(CONNECTION_ESTABLISHED).await?;
    stream.flush().await?;
    relay::relay(stream, upstream).await;
    Ok(())
  }

  /// TLS-terminating interception: confirm the tunnel, handshake with a
  /// leaf minted for the negotiated SNI, then proxy one decrypted
  /// request/response cycle through the hooks.
  async fn handle_connect_intercept<S>(
    &self,
    mut stream: S,
    connect_host: &str,
    port: u16,
    peer_addr: SocketAddr,
  ) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    stream.write_all(CONNECTION_ESTABLISHED).await?;
    stream.flush().await?;

    // The lazy acceptor parses the ClientHello first, so leaf selection can
    // key off the negotiated SNI. Clients that omit SNI get a leaf for the
    // CONNECT target instead.
    let acceptor = LazyConfigAcceptor::new(Acceptor::default(), stream);
    let start = acceptor
      .await
      .map_err(|e| Error::tls(format!("TLS client hello failed: {}", e)))?;
    let sni = start
      .client_hello()
      .server_name()
      .map(str::to_string)
      .unwrap_or_else(|| connect_host.to_string());

    let leaf = self.cert_manager.get_or_issue(&sni).await?;
    let tls_config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(leaf.cert_chain(), leaf.key())
      .map_err(|e| Error::tls(format!("Failed to create TLS config: {}", e)))?;
    let mut tls_stream = start
      .into_stream(Arc::new(tls_config))
      .await
      .map_err(|e| Error::tls(format!("TLS handshake failed: {}", e)))?;

    tracing::debug!("[proxy] intercepting {} for {}", sni, peer_addr);

    let authority = format!("{}:{}", sni, port);
    let mut reader = BufReader::new(&mut tls_stream);
    let request = http1::read_request(&mut reader, Some(&authority)).await?;

    let handler = self.interceptors.read().await;
    let request = match handler.process_request(request).await? {
      RequestAction::Forward(request) => request,
      RequestAction::Respond(response) => {
        http1::write_response(&mut tls_stream, &response).await?;
        let _ = tls_stream.shutdown().await;
        return Ok(());
      }
    };

    let (origin_host, origin_port) = http1::request_host_port(&request, 443)?;
    let tcp = self.dial(&origin_host, origin_port).await?;
    let server_name = ServerName::try_from(origin_host.clone())
      .map_err(|e| Error::tls(format!("Invalid origin name {}: {}", origin_host, e)))?;
    let connector = TlsConnector::from(self.upstream_tls.clone());
    let mut origin = connector
      .connect(server_name, tcp)
      .await
      .map_err(|e| Error::tls(format!("Origin TLS handshake with {} failed: {}", origin_host, e)))?;

    http1::write_request(&mut origin, &request).await?;
    let mut origin_reader = BufReader::new(&mut origin);
    let response = http1::read_response(&mut origin_reader).await?;

    let response = handler.process_response(response).await?;
    http1::write_response(&mut tls_stream, &response).await?;
    let _ = tls_stream.shutdown().await;
    Ok(())
  }

  /// Plain HTTP forwarding: one request out, one response back
  async fn handle_plain_forward<S>(&self, stream: &mut S, request: Request<Bytes>) -> Result<()>
  where
    S: AsyncWrite + Unpin,
  {
    let handler = self.interceptors.read().await;
    let request = match handler.process_request(request).await? {
      RequestAction::Forward(request) => request,
      RequestAction::Respond(response) => {
        // substitute response: written straight back, nothing dialed
        http1::write_response(stream, &response).await?;
        return Ok(());
      }
    };

    let (host, port) = http1::request_host_port(&request, 80)?;
    let mut upstream = self.dial(&host, port).await?;

    http1::write_request(&mut upstream, &request).await?;
    let mut upstream_reader = BufReader::new(&mut upstream);
    let response = http1::read_response(&mut upstream_reader).await?;

    let response = handler.process_response(response).await?;
    http1::write_response(stream, &response).await?;
    Ok(())
  }

  /// Dial `host:port`, honoring the configured timeout
  async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
    let addr = if host.contains(':') {
      format!("[{}]:{}", host, port)
    } else {
      format!("{}:{}", host, port)
    };
    let connect = TcpStream::connect(&addr);
    let dialed = match self.config.dial_timeout {
      Some(timeout) => tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| Error::connection(format!("dial {} timed out", addr)))?,
      None => connect.await,
    };
    dialed.map_err(|e| Error::connection(format!("Failed to connect to {}: {}", addr, e)))
  }
}
