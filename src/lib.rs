//! Man-in-the-middle capable forward proxy with an independent SOCKS5 proxy
//!
//! `interpose` sits between a client and arbitrary origin servers. Plain
//! HTTP requests are forwarded one cycle at a time, CONNECT requests are
//! either tunneled opaquely or terminated: the proxy mints a per-hostname
//! leaf certificate signed by its own root, handshakes with the client as
//! the origin, and exposes the decrypted request/response pair to a pair of
//! interception hooks. A SOCKS5 server (and the matching client handshake)
//! shares the listener through first-byte protocol detection.
//!
//! # Example
//!
//! ```no_run
//! use interpose::{MitmProxy, ProxyConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = MitmProxy::new(ProxyConfig::default()).await?;
//!     println!("install this CA: {}", proxy.root_cert_pem());
//!     proxy.start("127.0.0.1:8080").await?;
//!     Ok(())
//! }
//! ```

mod ca;
mod error;
mod http1;
mod interceptor;
mod proxy;
mod relay;
mod server;
mod socks5;

pub use ca::{CertificateAuthority, CertificateManager, LeafCertificate};
pub use error::{Error, Result};
pub use http1::simple_response;
pub use interceptor::{
  InterceptorHandler, LoggingInterceptor, RequestAction, RequestInterceptor, ResponseInterceptor,
};
pub use proxy::{MitmProxy, ProxyConfig};
pub use relay::relay;
pub use server::ProxyServer;
pub use socks5::{Command, ReplyCode, Socks5Client, Socks5Server, TargetAddr};
