//! SOCKS5 protocol engine: address codec, server handler and client handshake
//!
//! Implements the RFC 1928 wire format for the CONNECT command only. BIND and
//! UDP ASSOCIATE are rejected on the wire with `CommandNotSupported`.

use crate::error::{Error, Result};
use crate::relay;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub(crate) const SOCKS5_VERSION: u8 = 0x05;
const NO_AUTHENTICATION: u8 = 0x00;
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 request command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
  /// Establish a TCP connection to the target
  Connect = 0x01,
  /// Reverse TCP binding, rejected
  Bind = 0x02,
  /// UDP relay association, rejected
  UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
  type Error = Error;

  fn try_from(value: u8) -> Result<Self> {
    match value {
      0x01 => Ok(Command::Connect),
      0x02 => Ok(Command::Bind),
      0x03 => Ok(Command::UdpAssociate),
      other => Err(Error::UnsupportedCommand(other)),
    }
  }
}

/// SOCKS5 reply code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
  Succeeded = 0x00,
  GeneralFailure = 0x01,
  NotAllowed = 0x02,
  NetworkUnreachable = 0x03,
  HostUnreachable = 0x04,
  ConnectionRefused = 0x05,
  TtlExpired = 0x06,
  CommandNotSupported = 0x07,
  AddressTypeNotSupported = 0x08,
}

impl TryFrom<u8> for ReplyCode {
  type Error = Error;

  fn try_from(value: u8) -> Result<Self> {
    match value {
      0x00 => Ok(ReplyCode::Succeeded),
      0x01 => Ok(ReplyCode::GeneralFailure),
      0x02 => Ok(ReplyCode::NotAllowed),
      0x03 => Ok(ReplyCode::NetworkUnreachable),
      0x04 => Ok(ReplyCode::HostUnreachable),
      0x05 => Ok(ReplyCode::ConnectionRefused),
      0x06 => Ok(ReplyCode::TtlExpired),
      0x07 => Ok(ReplyCode::CommandNotSupported),
      0x08 => Ok(ReplyCode::AddressTypeNotSupported),
      other => Err(Error::UnexpectedReply(other)),
    }
  }
}

/// SOCKS5 target address in one of the three RFC 1928 families
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
  /// IPv4 address with port
  Ipv4(Ipv4Addr, u16),
  /// Domain name with port
  Domain(String, u16),
  /// IPv6 address with port
  Ipv6(Ipv6Addr, u16),
}

impl TargetAddr {
  /// Decode an address from a reader: tag byte first, then the
  /// tag-determined payload, then the 2-byte big-endian port.
  pub async fn read_from<R>(reader: &mut R) -> Result<Self>
  where
    R: AsyncRead + Unpin,
  {
    let atyp = reader.read_u8().await?;
    match atyp {
      ATYP_IPV4 => {
        let mut addr = [0u8; 4];
        reader.read_exact(&mut addr).await?;
        let port = reader.read_u16().await?;
        Ok(TargetAddr::Ipv4(Ipv4Addr::from(addr), port))
      }
      ATYP_DOMAIN => {
        let len = reader.read_u8().await? as usize;
        let mut name = vec![0u8; len];
        reader.read_exact(&mut name).await?;
        let port = reader.read_u16().await?;
        let name = String::from_utf8(name)
          .map_err(|_| Error::protocol("domain name is not valid UTF-8"))?;
        Ok(TargetAddr::Domain(name, port))
      }
      ATYP_IPV6 => {
        let mut addr = [0u8; 16];
        reader.read_exact(&mut addr).await?;
        let port = reader.read_u16().await?;
        Ok(TargetAddr::Ipv6(Ipv6Addr::from(addr), port))
      }
      other => Err(Error::UnsupportedAddressType(other)),
    }
  }

  /// Encode as tag byte + payload + 2-byte big-endian port
  pub fn encode(&self) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match self {
      TargetAddr::Ipv4(ip, port) => {
        buf.push(ATYP_IPV4);
        buf.extend_from_slice(&ip.octets());
        buf.extend_from_slice(&port.to_be_bytes());
      }
      TargetAddr::Domain(name, port) => {
        if name.len() > 255 {
          return Err(Error::protocol(format!("domain name too long: {}", name.len())));
        }
        buf.push(ATYP_DOMAIN);
        buf.push(name.len() as u8);
        buf.extend_from_slice(name.as_bytes());
        buf.extend_from_slice(&port.to_be_bytes());
      }
      TargetAddr::Ipv6(ip, port) => {
        buf.push(ATYP_IPV6);
        buf.extend_from_slice(&ip.octets());
        buf.extend_from_slice(&port.to_be_bytes());
      }
    }
    Ok(buf)
  }

  /// Host and port as a dialable string
  pub fn to_host_port(&self) -> String {
    match self {
      TargetAddr::Ipv4(ip, port) => format!("{}:{}", ip, port),
      TargetAddr::Domain(name, port) => format!("{}:{}", name, port),
      TargetAddr::Ipv6(ip, port) => format!("[{}]:{}", ip, port),
    }
  }

  /// Host without the port
  pub fn host(&self) -> String {
    match self {
      TargetAddr::Ipv4(ip, _) => ip.to_string(),
      TargetAddr::Domain(name, _) => name.clone(),
      TargetAddr::Ipv6(ip, _) => ip.to_string(),
    }
  }

  /// Port
  pub fn port(&self) -> u16 {
    match self {
      TargetAddr::Ipv4(_, port) | TargetAddr::Domain(_, port) | TargetAddr::Ipv6(_, port) => *port,
    }
  }
}

impl From<SocketAddr> for TargetAddr {
  fn from(addr: SocketAddr) -> Self {
    match addr.ip() {
      IpAddr::V4(ip) => TargetAddr::Ipv4(ip, addr.port()),
      IpAddr::V6(ip) => TargetAddr::Ipv6(ip, addr.port()),
    }
  }
}

/// SOCKS5 server handler
///
/// Negotiates no-auth, parses a CONNECT request, dials the target and relays
/// bytes until either side closes. One request per connection.
#[derive(Debug, Clone, Default)]
pub struct Socks5Server {
  /// Optional deadline applied to the upstream dial
  pub dial_timeout: Option<Duration>,
}

impl Socks5Server {
  pub fn new() -> Self {
    Self::default()
  }

  /// Accept loop: one spawned task per connection
  pub async fn run(self, addr: &str) -> Result<()> {
    let listener = TcpListener::bind(addr)
      .await
      .map_err(|e| Error::connection(format!("Failed to bind to {}: {}", addr, e)))?;
    loop {
      match listener.accept().await {
        Ok((stream, peer_addr)) => {
          let server = self.clone();
          tokio::spawn(async move {
            if let Err(e) = server.handle(stream).await {
              tracing::debug!("[socks5] connection from {} closed: {}", peer_addr, e);
            }
          });
        }
        Err(e) => {
          tracing::error!("[socks5] failed to accept connection: {}", e);
        }
      }
    }
  }

  /// Handle one accepted connection from the start of the version byte
  pub async fn handle<S>(&self, mut stream: S) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let version = stream.read_u8().await?;
    if version != SOCKS5_VERSION {
      // dropped with no reply, the peer is not speaking SOCKS5
      return Err(Error::UnsupportedVersion(version));
    }
    self.handle_after_version(stream).await
  }

  /// Handle a connection whose leading 0x05 version byte was already
  /// consumed by protocol detection
  pub async fn handle_after_version<S>(&self, mut stream: S) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    Self::negotiate(&mut stream).await?;
    let target = Self::read_request(&mut stream).await?;

    let upstream = match self.dial(&target).await {
      Ok(upstream) => upstream,
      Err((code, e)) => {
        Self::write_reply(&mut stream, code, &unspecified_bind_addr()).await?;
        return Err(e);
      }
    };

    // Echo the locally bound address of the upstream socket in the reply.
    let bound = upstream
      .local_addr()
      .map(TargetAddr::from)
      .unwrap_or_else(|_| unspecified_bind_addr());
    Self::write_reply(&mut stream, ReplyCode::Succeeded, &bound).await?;

    relay::relay(stream, upstream).await;
    Ok(())
  }

  /// Method negotiation: only no-authentication (0x00) is acceptable
  async fn negotiate<S>(stream: &mut S) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let nmethods = stream.read_u8().await?;
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&NO_AUTHENTICATION) {
      stream
        .write_all(&[SOCKS5_VERSION, NO_ACCEPTABLE_METHODS])
        .await?;
      return Err(Error::NoAcceptableAuth);
    }

    stream.write_all(&[SOCKS5_VERSION, NO_AUTHENTICATION]).await?;
    Ok(())
  }

  /// Parse the request frame and dispatch on the command byte
  async fn read_request<S>(stream: &mut S) -> Result<TargetAddr>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    let version = stream.read_u8().await?;
    if version != SOCKS5_VERSION {
      return Err(Error::UnsupportedVersion(version));
    }
    let cmd = stream.read_u8().await?;
    let _reserved = stream.read_u8().await?;

    // Unknown command bytes abort without a reply; known-but-unsupported
    // commands are answered with CommandNotSupported before dropping.
    match Command::try_from(cmd)? {
      Command::Connect => {}
      Command::Bind | Command::UdpAssociate => {
        Self::write_reply(stream, ReplyCode::CommandNotSupported, &unspecified_bind_addr())
          .await?;
        return Err(Error::protocol(format!("command not supported: {:#04x}", cmd)));
      }
    }

    match TargetAddr::read_from(stream).await {
      Ok(target) => Ok(target),
      Err(e @ Error::UnsupportedAddressType(_)) => {
        Self::write_reply(stream, ReplyCode::AddressTypeNotSupported, &unspecified_bind_addr())
          .await?;
        Err(e)
      }
      Err(e) => Err(e),
    }
  }

  /// Dial the decoded target, mapping failures to wire reply codes
  async fn dial(&self, target: &TargetAddr) -> std::result::Result<TcpStream, (ReplyCode, Error)> {
    let addr = target.to_host_port();
    let connect = TcpStream::connect(&addr);
    let dialed = match self.dial_timeout {
      Some(timeout) => match tokio::time::timeout(timeout, connect).await {
        Ok(dialed) => dialed,
        Err(_) => {
          return Err((
            ReplyCode::TtlExpired,
            Error::connection(format!("dial {} timed out", addr)),
          ))
        }
      },
      None => connect.await,
    };
    dialed.map_err(|e| {
      let code = match e.kind() {
        std::io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
        std::io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
        std::io::ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
        std::io::ErrorKind::TimedOut => ReplyCode::TtlExpired,
        // name resolution failures and the rest
        _ => ReplyCode::HostUnreachable,
      };
      (code, Error::connection(format!("failed to connect to {}: {}", addr, e)))
    })
  }

  /// Reply frame: [VER, REP, RSV, ATYP, BND.ADDR, BND.PORT]
  async fn write_reply<W>(writer: &mut W, code: ReplyCode, bound: &TargetAddr) -> Result<()>
  where
    W: AsyncWrite + Unpin,
  {
    let mut reply = vec![SOCKS5_VERSION, code as u8, 0x00];
    reply.extend_from_slice(&bound.encode()?);
    writer.write_all(&reply).await?;
    Ok(())
  }
}

fn unspecified_bind_addr() -> TargetAddr {
  TargetAddr::Ipv4(Ipv4Addr::UNSPECIFIED, 0)
}

/// Client side of the SOCKS5 handshake, for dialing through an upstream
/// SOCKS5 server
pub struct Socks5Client;

impl Socks5Client {
  /// Negotiate no-auth and issue a CONNECT for `target` over an
  /// already-established stream. On success the stream is a transparent
  /// pipe to the target.
  pub async fn connect<S>(stream: &mut S, target: &TargetAddr) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Unpin,
  {
    stream
      .write_all(&[SOCKS5_VERSION, 0x01, NO_AUTHENTICATION])
      .await?;

    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await?;
    if selection[0] != SOCKS5_VERSION {
      return Err(Error::UnsupportedVersion(selection[0]));
    }
    if selection[1] != NO_AUTHENTICATION {
      return Err(Error::UnsupportedMethod(selection[1]));
    }

    let mut request = vec![SOCKS5_VERSION, Command::Connect as u8, 0x00];
    request.extend_from_slice(&target.encode()?);
    stream.write_all(&request).await?;

    let version = stream.read_u8().await?;
    if version != SOCKS5_VERSION {
      return Err(Error::UnsupportedVersion(version));
    }
    let code = stream.read_u8().await?;
    let _reserved = stream.read_u8().await?;
    let _bound = TargetAddr::read_from(stream).await?;

    match ReplyCode::try_from(code)? {
      ReplyCode::Succeeded => Ok(()),
      _ => Err(Error::UnexpectedReply(code)),
    }
  }
}
