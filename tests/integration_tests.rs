//! Integration tests for interpose

use interpose::{
  CertificateAuthority, CertificateManager, MitmProxy, ProxyConfig, ProxyServer, RequestAction,
  RequestInterceptor, Socks5Client, Socks5Server, TargetAddr,
};
use bytes::Bytes;
use http::StatusCode;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;

/// Request hook that answers everything with a 403 and never forwards
struct Forbid;

#[async_trait::async_trait]
impl RequestInterceptor for Forbid {
  async fn intercept_request(
    &self,
    _request: http::Request<Bytes>,
  ) -> interpose::Result<RequestAction> {
    Ok(RequestAction::Respond(interpose::simple_response(
      StatusCode::FORBIDDEN,
      "blocked",
    )))
  }
}

/// Echo server on an ephemeral loopback port
async fn spawn_echo() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((mut stream, _)) = listener.accept().await else {
        break;
      };
      tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
          match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
              if stream.write_all(&buf[..n]).await.is_err() {
                break;
              }
            }
          }
        }
      });
    }
  });
  addr
}

/// Accept loop feeding connections into a `ProxyServer`
async fn spawn_proxy(server: Arc<ProxyServer>) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((stream, peer_addr)) = listener.accept().await else {
        break;
      };
      let server = server.clone();
      tokio::spawn(async move {
        let _ = server.handle_connection(stream, peer_addr).await;
      });
    }
  });
  addr
}

/// Accept loop feeding connections into a `Socks5Server`
async fn spawn_socks5() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((stream, _)) = listener.accept().await else {
        break;
      };
      tokio::spawn(async move {
        let _ = Socks5Server::new().handle(stream).await;
      });
    }
  });
  addr
}

#[tokio::test]
async fn ca_generation_and_persistence() {
  let temp_dir = std::env::temp_dir().join("interpose-test-ca");
  if temp_dir.exists() {
    std::fs::remove_dir_all(&temp_dir).ok();
  }

  let ca = CertificateAuthority::load_or_generate(&temp_dir).await.unwrap();
  let pem = ca.root_cert_pem().to_string();
  assert!(pem.contains("BEGIN CERTIFICATE"), "Invalid PEM format");
  assert!(pem.contains("END CERTIFICATE"), "Invalid PEM format");
  assert!(temp_dir.join("ca_cert.pem").exists(), "CA cert not persisted");
  assert!(temp_dir.join("ca_key.pem").exists(), "CA key not persisted");

  // A second load must reuse the persisted root, not mint a new one
  let reloaded = CertificateAuthority::load_or_generate(&temp_dir).await.unwrap();
  assert_eq!(reloaded.root_cert_pem(), pem);

  std::fs::remove_dir_all(&temp_dir).ok();
}

#[tokio::test]
async fn invalid_trust_anchor_is_reported() {
  let err = CertificateAuthority::from_pem("not a certificate", "not a key").unwrap_err();
  assert!(matches!(err, interpose::Error::InvalidTrustAnchor(_)));
}

#[tokio::test]
async fn leaf_chain_links_back_to_root() {
  use x509_parser::prelude::*;

  let ca = CertificateAuthority::generate().unwrap();
  let leaf = ca.issue_leaf("a.example.com").unwrap();
  let chain = leaf.cert_chain();
  assert_eq!(chain.len(), 2, "expected [leaf, root] chain");

  let root_der = ca.root_cert_der();
  let (_, root) = X509Certificate::from_der(root_der.as_ref()).unwrap();
  let root_ski = root
    .extensions()
    .iter()
    .find_map(|ext| match ext.parsed_extension() {
      ParsedExtension::SubjectKeyIdentifier(ki) => Some(ki.0.to_vec()),
      _ => None,
    })
    .expect("root has no subject key identifier");
  assert_eq!(root_ski.len(), 20);

  let (_, parsed_leaf) = X509Certificate::from_der(chain[0].as_ref()).unwrap();
  let leaf_aki = parsed_leaf
    .extensions()
    .iter()
    .find_map(|ext| match ext.parsed_extension() {
      ParsedExtension::AuthorityKeyIdentifier(aki) => {
        aki.key_identifier.as_ref().map(|ki| ki.0.to_vec())
      }
      _ => None,
    })
    .expect("leaf has no authority key identifier");
  assert_eq!(leaf_aki, root_ski, "leaf AKI must equal root SKI");
  assert!(!parsed_leaf.is_ca());

  // The leaf must validate against a trust store holding only the root
  let mut roots = rustls::RootCertStore::empty();
  roots.add(root_der).unwrap();
  let parsed = rustls::server::ParsedCertificate::try_from(&chain[0]).unwrap();
  let provider = rustls::crypto::ring::default_provider();
  rustls::client::verify_server_cert_signed_by_trust_anchor(
    &parsed,
    &roots,
    &[],
    rustls::pki_types::UnixTime::now(),
    provider.signature_verification_algorithms.all,
  )
  .expect("leaf does not chain to the root trust anchor");
}

#[tokio::test]
async fn leaf_cache_returns_identical_bytes() {
  let manager = CertificateManager::new(CertificateAuthority::generate().unwrap());

  let first = manager.get_or_issue("a.example.com").await.unwrap();
  let second = manager.get_or_issue("a.example.com").await.unwrap();
  assert_eq!(
    first.cert_chain()[0].as_ref(),
    second.cert_chain()[0].as_ref(),
    "cache hit must not re-sign"
  );
  assert_eq!(first.cert_pem(), second.cert_pem());

  let other = manager.get_or_issue("b.example.com").await.unwrap();
  assert_ne!(
    first.cert_chain()[0].as_ref(),
    other.cert_chain()[0].as_ref(),
    "different hostnames must get different certificates"
  );
}

#[tokio::test]
async fn concurrent_misses_settle_into_one_cached_leaf() {
  let manager = Arc::new(CertificateManager::new(
    CertificateAuthority::generate().unwrap(),
  ));

  // racing misses may sign redundantly; the cache must stay consistent and
  // keep serving a single leaf afterwards
  let tasks = (0..8).map(|_| {
    let manager = manager.clone();
    tokio::spawn(async move {
      manager
        .get_or_issue("race.example.com")
        .await
        .unwrap()
        .hostname()
        .to_string()
    })
  });
  for hostname in futures::future::join_all(tasks).await {
    assert_eq!(hostname.unwrap(), "race.example.com");
  }

  let first = manager.get_or_issue("race.example.com").await.unwrap();
  let second = manager.get_or_issue("race.example.com").await.unwrap();
  assert_eq!(first.cert_pem(), second.cert_pem());
}

#[tokio::test]
async fn socks5_connect_wire_format_and_relay() {
  let echo_addr = spawn_echo().await;
  let socks_addr = spawn_socks5().await;

  let mut client = TcpStream::connect(socks_addr).await.unwrap();

  client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
  let mut selection = [0u8; 2];
  client.read_exact(&mut selection).await.unwrap();
  assert_eq!(selection, [0x05, 0x00]);

  // domain-form CONNECT; "127.0.0.1" is 9 bytes
  let mut request = vec![0x05, 0x01, 0x00, 0x03, 0x09];
  request.extend_from_slice(b"127.0.0.1");
  request.extend_from_slice(&echo_addr.port().to_be_bytes());
  client.write_all(&request).await.unwrap();

  let mut reply_head = [0u8; 3];
  client.read_exact(&mut reply_head).await.unwrap();
  assert_eq!(reply_head, [0x05, 0x00, 0x00]);
  let bound = TargetAddr::read_from(&mut client).await.unwrap();
  assert!(matches!(bound, TargetAddr::Ipv4(ip, port) if ip == Ipv4Addr::LOCALHOST && port != 0));

  client.write_all(b"hello").await.unwrap();
  let mut echoed = [0u8; 5];
  client.read_exact(&mut echoed).await.unwrap();
  assert_eq!(&echoed, b"hello");
}

#[tokio::test]
async fn socks5_client_interoperates_with_server() {
  let echo_addr = spawn_echo().await;
  let socks_addr = spawn_socks5().await;

  let mut stream = TcpStream::connect(socks_addr).await.unwrap();
  let target = TargetAddr::Ipv4(Ipv4Addr::LOCALHOST, echo_addr.port());
  Socks5Client::connect(&mut stream, &target).await.unwrap();

  stream.write_all(b"ping pong").await.unwrap();
  let mut echoed = [0u8; 9];
  stream.read_exact(&mut echoed).await.unwrap();
  assert_eq!(&echoed, b"ping pong");
}

fn tunnel_only_server() -> Arc<ProxyServer> {
  let ca = CertificateAuthority::generate().unwrap();
  let config = ProxyConfig {
    intercept_https: false,
    ..Default::default()
  };
  MitmProxy::with_authority(config, ca).server().unwrap()
}

#[tokio::test]
async fn connect_tunnel_relays_verbatim() {
  let echo_addr = spawn_echo().await;
  let proxy_addr = spawn_proxy(tunnel_only_server()).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let connect = format!(
    "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
    port = echo_addr.port()
  );
  client.write_all(connect.as_bytes()).await.unwrap();

  let established = b"HTTP/1.1 200 Connection Established\r\n\r\n";
  let mut response = vec![0u8; established.len()];
  client.read_exact(&mut response).await.unwrap();
  assert_eq!(response, established);

  // bytes after the 200 travel verbatim, in order, both ways
  client.write_all(b"raw tunnel payload").await.unwrap();
  let mut echoed = [0u8; 18];
  client.read_exact(&mut echoed).await.unwrap();
  assert_eq!(&echoed, b"raw tunnel payload");

  // closing the client side winds the tunnel down
  drop(client);
}

#[tokio::test]
async fn plain_forward_round_trip() {
  let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream_addr = upstream.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut stream, _) = upstream.accept().await.unwrap();
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
      stream.read_exact(&mut byte).await.unwrap();
      head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    // the proxy must speak origin-form toward the destination
    assert!(head.starts_with("GET /hello HTTP/1.1\r\n"), "got: {head}");
    assert!(head.contains("Connection: close\r\n"));
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
      .await
      .unwrap();
  });

  let proxy_addr = spawn_proxy(tunnel_only_server()).await;
  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let request = format!(
    "GET http://127.0.0.1:{port}/hello HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
    port = upstream_addr.port()
  );
  client.write_all(request.as_bytes()).await.unwrap();

  let mut response = Vec::new();
  client.read_to_end(&mut response).await.unwrap();
  let response = String::from_utf8(response).unwrap();
  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "got: {response}");
  assert!(response.ends_with("ok"));
}

#[tokio::test]
async fn request_hook_short_circuits_without_dialing() {
  let ca = CertificateAuthority::generate().unwrap();
  let proxy = MitmProxy::with_authority(ProxyConfig::default(), ca);
  proxy
    .interceptor_handler()
    .write()
    .await
    .add_request_interceptor(Arc::new(Forbid));
  let proxy_addr = spawn_proxy(proxy.server().unwrap()).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  // port 9 would refuse the dial; a 403 proves no dial was attempted
  client
    .write_all(b"GET http://127.0.0.1:9/ HTTP/1.1\r\nHost: 127.0.0.1:9\r\n\r\n")
    .await
    .unwrap();

  let mut response = Vec::new();
  client.read_to_end(&mut response).await.unwrap();
  let response = String::from_utf8(response).unwrap();
  assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "got: {response}");
  assert!(response.ends_with("blocked"));
}

#[tokio::test]
async fn interception_mints_leaf_for_sni_and_runs_hooks() {
  let ca = CertificateAuthority::generate().unwrap();
  let root_der = ca.root_cert_der();
  let proxy = MitmProxy::with_authority(ProxyConfig::default(), ca);
  proxy
    .interceptor_handler()
    .write()
    .await
    .add_request_interceptor(Arc::new(Forbid));
  let proxy_addr = spawn_proxy(proxy.server().unwrap()).await;

  let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
  stream
    .write_all(b"CONNECT secure.test:443 HTTP/1.1\r\nHost: secure.test:443\r\n\r\n")
    .await
    .unwrap();
  let established = b"HTTP/1.1 200 Connection Established\r\n\r\n";
  let mut response = vec![0u8; established.len()];
  stream.read_exact(&mut response).await.unwrap();
  assert_eq!(response, established);

  // a client trusting only the proxy's root must accept the minted leaf
  let mut roots = rustls::RootCertStore::empty();
  roots.add(root_der).unwrap();
  let tls_config = rustls::ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
  let server_name = ServerName::try_from("secure.test").unwrap();
  let mut tls = connector.connect(server_name, stream).await.unwrap();

  tls
    .write_all(b"GET / HTTP/1.1\r\nHost: secure.test\r\n\r\n")
    .await
    .unwrap();
  let mut body = Vec::new();
  tls.read_to_end(&mut body).await.unwrap();
  let body = String::from_utf8(body).unwrap();
  assert!(body.starts_with("HTTP/1.1 403 Forbidden\r\n"), "got: {body}");
  assert!(body.ends_with("blocked"));
}
