//! Minimal HTTP/1.1 framing over async streams
//!
//! The proxy reads exactly one request and one response per connection and
//! never keeps a connection alive, so this stays deliberately small: request
//! and response heads, Content-Length and chunked bodies, close-delimited
//! response bodies, and the matching serializers.

use crate::error::{Error, Result};
use bytes::Bytes;
use http::{HeaderValue, Method, Request, Response, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum size of a request/status line
pub(crate) const MAX_LINE_SIZE: usize = 8 * 1024;
/// Maximum accumulated size of a header block
const MAX_HEADERS_SIZE: usize = 64 * 1024;
/// Maximum body size read into memory
const MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Read one line (through `\n`), bounded by `max` bytes. `None` on EOF.
async fn read_line<R>(reader: &mut R, max: usize) -> Result<Option<String>>
where
  R: AsyncBufRead + Unpin,
{
  let mut buf = Vec::new();
  let n = (&mut *reader)
    .take((max + 1) as u64)
    .read_until(b'\n', &mut buf)
    .await?;
  if n == 0 {
    return Ok(None);
  }
  if buf.last() != Some(&b'\n') && n > max {
    return Err(Error::invalid_request("line exceeds maximum allowed length"));
  }
  Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

/// Read header lines until the blank separator; returns raw (name, value)
/// pairs in wire order.
async fn read_headers<R>(reader: &mut R) -> Result<Vec<(String, String)>>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = Vec::new();
  let mut total = 0usize;
  loop {
    let line = match read_line(reader, MAX_LINE_SIZE).await? {
      Some(line) => line,
      None => break,
    };
    if line == "\r\n" || line == "\n" {
      break;
    }
    total += line.len();
    if total > MAX_HEADERS_SIZE {
      return Err(Error::invalid_request("headers size exceeds maximum allowed"));
    }
    if let Some(idx) = line.find(':') {
      let (name, value) = line.split_at(idx);
      headers.push((name.trim().to_string(), value[1..].trim().to_string()));
    }
  }
  Ok(headers)
}

fn header_lookup<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(n, _)| n.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

fn is_chunked(headers: &[(String, String)]) -> bool {
  header_lookup(headers, "transfer-encoding")
    .map(|v| v.to_ascii_lowercase().contains("chunked"))
    .unwrap_or(false)
}

fn content_length(headers: &[(String, String)]) -> Result<Option<usize>> {
  match header_lookup(headers, "content-length") {
    Some(v) => {
      let len = v
        .trim()
        .parse::<usize>()
        .map_err(|_| Error::invalid_request(format!("invalid Content-Length: {}", v)))?;
      Ok(Some(len))
    }
    None => Ok(None),
  }
}

async fn read_exact_body<R>(reader: &mut R, len: usize) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  if len > MAX_BODY_SIZE {
    return Err(Error::invalid_request("body size exceeds maximum allowed"));
  }
  let mut body = vec![0u8; len];
  reader.read_exact(&mut body).await?;
  Ok(body)
}

/// Decode a chunked body into its flat byte form. Trailers are consumed and
/// dropped.
async fn read_chunked_body<R>(reader: &mut R) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  loop {
    let line = read_line(reader, MAX_LINE_SIZE)
      .await?
      .ok_or_else(|| Error::invalid_request("unexpected EOF in chunked body"))?;
    let size_field = line.trim().split(';').next().unwrap_or("").trim();
    let size = usize::from_str_radix(size_field, 16)
      .map_err(|_| Error::invalid_request(format!("invalid chunk size: {}", size_field)))?;
    if size == 0 {
      // trailer section ends with a blank line
      loop {
        match read_line(reader, MAX_LINE_SIZE).await? {
          Some(line) if line != "\r\n" && line != "\n" => continue,
          _ => break,
        }
      }
      return Ok(body);
    }
    if body.len() + size > MAX_BODY_SIZE {
      return Err(Error::invalid_request("body size exceeds maximum allowed"));
    }
    let mut chunk = vec![0u8; size];
    reader.read_exact(&mut chunk).await?;
    body.extend_from_slice(&chunk);
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
  }
}

async fn read_to_close<R>(reader: &mut R) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body = Vec::new();
  (&mut *reader)
    .take(MAX_BODY_SIZE as u64 + 1)
    .read_to_end(&mut body)
    .await?;
  if body.len() > MAX_BODY_SIZE {
    return Err(Error::invalid_request("body size exceeds maximum allowed"));
  }
  Ok(body)
}

fn parse_version(token: &str) -> Result<Version> {
  match token {
    "HTTP/1.1" => Ok(Version::HTTP_11),
    "HTTP/1.0" => Ok(Version::HTTP_10),
    other => Err(Error::invalid_request(format!("unsupported HTTP version: {}", other))),
  }
}

/// Parsed request line
pub struct RequestLine {
  pub method: Method,
  pub target: String,
  pub version: Version,
}

/// Parse `METHOD target HTTP/x.y`
pub fn parse_request_line(line: &str) -> Result<RequestLine> {
  let parts: Vec<&str> = line.split_whitespace().collect();
  if parts.len() < 3 {
    return Err(Error::invalid_request("invalid request line"));
  }
  let method = Method::from_bytes(parts[0].as_bytes())
    .map_err(|_| Error::invalid_request(format!("invalid method: {}", parts[0])))?;
  Ok(RequestLine {
    method,
    target: parts[1].to_string(),
    version: parse_version(parts[2])?,
  })
}

/// Read the remainder of a request whose request line has already been
/// consumed: headers, then body per Content-Length / chunked framing.
///
/// `https_authority` reconstructs an absolute `https://` URI for origin-form
/// targets read off a decrypted interception stream.
pub async fn read_request_after_line<R>(
  reader: &mut R,
  line: RequestLine,
  https_authority: Option<&str>,
) -> Result<Request<Bytes>>
where
  R: AsyncBufRead + Unpin,
{
  let headers = read_headers(reader).await?;

  let body = if let Some(len) = content_length(&headers)? {
    read_exact_body(reader, len).await?
  } else if is_chunked(&headers) {
    read_chunked_body(reader).await?
  } else {
    Vec::new()
  };

  let uri = if line.target.starts_with("http://") || line.target.starts_with("https://") {
    line.target
  } else if let Some(authority) = https_authority {
    format!("https://{}{}", authority, line.target)
  } else {
    line.target
  };

  let mut builder = Request::builder()
    .method(line.method)
    .uri(uri)
    .version(line.version);
  for (name, value) in &headers {
    // the decoded body is re-framed with Content-Length on the way out
    if name.eq_ignore_ascii_case("transfer-encoding") {
      continue;
    }
    builder = builder.header(name.as_str(), value.as_str());
  }
  Ok(builder.body(Bytes::from(body))?)
}

/// Read one full request: request line, headers, body
pub async fn read_request<R>(reader: &mut R, https_authority: Option<&str>) -> Result<Request<Bytes>>
where
  R: AsyncBufRead + Unpin,
{
  let line = read_line(reader, MAX_LINE_SIZE)
    .await?
    .ok_or_else(|| Error::invalid_request("connection closed before request line"))?;
  let line = parse_request_line(&line)?;
  read_request_after_line(reader, line, https_authority).await
}

/// Read exactly one response: status line, headers, body. Bodies without
/// explicit framing are delimited by connection close.
pub async fn read_response<R>(reader: &mut R) -> Result<Response<Bytes>>
where
  R: AsyncBufRead + Unpin,
{
  let status_line = read_line(reader, MAX_LINE_SIZE)
    .await?
    .ok_or_else(|| Error::invalid_request("connection closed before status line"))?;
  let mut parts = status_line.split_whitespace();
  let version = parse_version(parts.next().unwrap_or(""))?;
  let status = parts
    .next()
    .and_then(|code| code.parse::<u16>().ok())
    .and_then(|code| StatusCode::from_u16(code).ok())
    .ok_or_else(|| Error::invalid_request("invalid status line"))?;

  let headers = read_headers(reader).await?;

  let body = if status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    Vec::new()
  } else if let Some(len) = content_length(&headers)? {
    read_exact_body(reader, len).await?
  } else if is_chunked(&headers) {
    read_chunked_body(reader).await?
  } else {
    read_to_close(reader).await?
  };

  let mut builder = Response::builder().status(status).version(version);
  for (name, value) in &headers {
    if name.eq_ignore_ascii_case("transfer-encoding") {
      continue;
    }
    builder = builder.header(name.as_str(), value.as_str());
  }
  Ok(builder.body(Bytes::from(body))?)
}

/// Serialize a request in origin-form toward the destination server.
///
/// Hop-by-hop proxy headers are dropped and `Connection: close` is forced so
/// the upstream terminates the response even without explicit body framing.
pub async fn write_request<W>(writer: &mut W, request: &Request<Bytes>) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let path = request
    .uri()
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/");

  let mut buf = Vec::new();
  buf.extend_from_slice(
    format!("{} {} {:?}\r\n", request.method(), path, request.version()).as_bytes(),
  );

  let has_host = request.headers().contains_key(http::header::HOST);
  if !has_host {
    if let Some(authority) = request.uri().authority() {
      buf.extend_from_slice(format!("Host: {}\r\n", authority).as_bytes());
    }
  }

  for (name, value) in request.headers() {
    if name == http::header::PROXY_AUTHORIZATION
      || name == http::header::CONNECTION
      || name.as_str().eq_ignore_ascii_case("proxy-connection")
      || name == http::header::CONTENT_LENGTH
    {
      continue;
    }
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
  }

  if !request.body().is_empty() {
    buf.extend_from_slice(format!("Content-Length: {}\r\n", request.body().len()).as_bytes());
  }
  buf.extend_from_slice(b"Connection: close\r\n\r\n");
  buf.extend_from_slice(request.body());

  writer.write_all(&buf).await?;
  writer.flush().await?;
  Ok(())
}

/// Serialize a response back to the requesting client
pub async fn write_response<W>(writer: &mut W, response: &Response<Bytes>) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let status = response.status();
  let mut buf = Vec::new();
  buf.extend_from_slice(
    format!(
      "{:?} {} {}\r\n",
      response.version(),
      status.as_u16(),
      status.canonical_reason().unwrap_or("Unknown")
    )
    .as_bytes(),
  );

  for (name, value) in response.headers() {
    if name == http::header::CONTENT_LENGTH {
      continue;
    }
    buf.extend_from_slice(name.as_str().as_bytes());
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.extend_from_slice(b"\r\n");
  }
  buf.extend_from_slice(format!("Content-Length: {}\r\n\r\n", response.body().len()).as_bytes());
  buf.extend_from_slice(response.body());

  writer.write_all(&buf).await?;
  writer.flush().await?;
  Ok(())
}

/// Split `host[:port]` (with `[v6]:port` bracket support), applying
/// `default_port` when the port is absent.
pub fn host_port(target: &str, default_port: u16) -> Result<(String, u16)> {
  let parse_port = |p: &str| {
    p.parse::<u16>()
      .map_err(|_| Error::invalid_request(format!("invalid port: {}", p)))
  };

  if let Some(rest) = target.strip_prefix('[') {
    let (host, after) = rest
      .split_once(']')
      .ok_or_else(|| Error::invalid_request(format!("invalid address: {}", target)))?;
    let port = match after.strip_prefix(':') {
      Some(p) => parse_port(p)?,
      None if after.is_empty() => default_port,
      None => return Err(Error::invalid_request(format!("invalid address: {}", target))),
    };
    return Ok((host.to_string(), port));
  }

  match target.rsplit_once(':') {
    // more than one colon means a bare IPv6 literal
    Some((host, _)) if host.contains(':') => Ok((target.to_string(), default_port)),
    Some((host, port)) => Ok((host.to_string(), parse_port(port)?)),
    None => Ok((target.to_string(), default_port)),
  }
}

/// Destination of a request: URI authority first, `Host` header second
pub fn request_host_port(request: &Request<Bytes>, default_port: u16) -> Result<(String, u16)> {
  if let Some(host) = request.uri().host() {
    let port = request.uri().port_u16().unwrap_or(default_port);
    return Ok((host.to_string(), port));
  }
  let host = request
    .headers()
    .get(http::header::HOST)
    .and_then(|v| v.to_str().ok())
    .ok_or_else(|| Error::invalid_request("request has no destination host"))?;
  host_port(host, default_port)
}

/// A canned response for hook short-circuits and gateway errors
pub fn simple_response(status: StatusCode, body: &'static str) -> Response<Bytes> {
  let mut response = Response::new(Bytes::from_static(body.as_bytes()));
  *response.status_mut() = status;
  response.headers_mut().insert(
    http::header::CONTENT_TYPE,
    HeaderValue::from_static("text/plain; charset=utf-8"),
  );
  response
}
