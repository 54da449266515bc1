//! Error types for the proxy

use std::io;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy and certificate operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// Certificate generation or signing failure
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// Root CA material could not be parsed
  #[error("Invalid trust anchor: {0}")]
  InvalidTrustAnchor(String),

  /// TLS handshake or configuration error
  #[error("TLS error: {0}")]
  Tls(String),

  /// HTTP construction error
  #[error("HTTP error: {0}")]
  Http(http::Error),

  /// Malformed HTTP request or response framing
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// Upstream dial failure
  #[error("Connection error: {0}")]
  Connection(String),

  /// Generic wire-protocol violation
  #[error("Protocol error: {0}")]
  Protocol(String),

  /// SOCKS version byte other than 0x05
  #[error("unsupported SOCKS version: {0:#04x}")]
  UnsupportedVersion(u8),

  /// Command byte outside the SOCKS5 command range
  #[error("unexpected SOCKS5 command: {0:#04x}")]
  UnsupportedCommand(u8),

  /// Address-type byte outside {1, 3, 4}
  #[error("unsupported SOCKS5 address type: {0:#04x}")]
  UnsupportedAddressType(u8),

  /// Client offered no authentication method we accept
  #[error("no acceptable SOCKS5 authentication method")]
  NoAcceptableAuth,

  /// Server selected an authentication method the client does not speak
  #[error("unsupported SOCKS5 method selected by server: {0:#04x}")]
  UnsupportedMethod(u8),

  /// Server reply code other than Succeeded
  #[error("unexpected SOCKS5 reply: {0:#04x}")]
  UnexpectedReply(u8),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a trust-anchor error and log it
  pub fn invalid_trust_anchor(msg: impl Into<String>) -> Self {
    let error = Error::InvalidTrustAnchor(msg.into());
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

  /// Create a connection error and log it
  pub fn connection(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a protocol error and log it
  pub fn protocol(msg: impl Into<String>) -> Self {
    let error = Error::Protocol(msg.into());
    tracing::error!("{}", error);
    error
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    let error = Error::Io(value);
    tracing::debug!("IO error: {}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    let error = Error::Http(value);
    tracing::error!("HTTP error: {}", error);
    error
  }
}
