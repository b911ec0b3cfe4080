//! Incoming HTTP request type and its parser.
//!
//! The parser reads one request head off a buffered stream with
//! [`httparse`], then the body by `Content-Length`. Bytes past the end of
//! the body stay in the connection buffer for the next request.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Version};
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ParseError;
use crate::mount::MountOptions;

const MAX_HEADERS: usize = 100;

/// An incoming HTTP request, parsed from the raw connection stream.
#[derive(Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) target: String,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) version: Version,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) local_addr: SocketAddr,
    pub(crate) host: String,
    pub(crate) port: Option<u16>,
    pub(crate) script_name: String,
    pub(crate) path_info: String,
    pub(crate) options: MountOptions,
}

impl Request {
    pub fn method(&self) -> &Method { &self.method }

    /// The request target exactly as it appeared on the request line.
    pub fn target(&self) -> &str { &self.target }

    /// Percent-decoded, dot-segment-normalized path. `*` for an
    /// asterisk-form target.
    pub fn path(&self) -> &str { &self.path }

    pub fn query(&self) -> Option<&str> { self.query.as_deref() }
    pub fn version(&self) -> Version { self.version }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }
    pub fn body(&self) -> &Bytes { &self.body }
    pub fn peer_addr(&self) -> SocketAddr { self.peer_addr }
    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    /// Host name from the `Host` header (lowercased, port stripped), or the
    /// server's configured name when the header is absent.
    pub fn host(&self) -> &str { &self.host }

    /// Port from the `Host` header, if it carried one.
    pub fn port(&self) -> Option<u16> { self.port }

    /// The mount prefix that claimed this request.
    pub fn script_name(&self) -> &str { &self.script_name }

    /// The part of the path below the mount prefix, possibly empty.
    pub fn path_info(&self) -> &str { &self.path_info }

    /// Case-insensitive header lookup. Values that are not visible ASCII
    /// read as `None`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Options registered alongside the mount that resolved this request.
    pub fn options<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.options.get::<T>()
    }

    /// Whether the client asked for the connection to persist.
    ///
    /// HTTP/1.1 persists unless `Connection: close`; HTTP/1.0 only with an
    /// explicit `Connection: keep-alive`.
    pub fn keep_alive(&self) -> bool {
        let tokens = self
            .headers
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim);

        match self.version {
            Version::HTTP_11 => !tokens.into_iter().any(|t| t.eq_ignore_ascii_case("close")),
            Version::HTTP_10 => tokens.into_iter().any(|t| t.eq_ignore_ascii_case("keep-alive")),
            _ => false,
        }
    }
}

/// Limits and defaults the parser applies.
pub(crate) struct ParseLimits<'a> {
    pub max_header_bytes: usize,
    pub max_body_bytes: usize,
    pub default_host: &'a str,
}

/// Owned copy of a parsed head, detached from the connection buffer.
struct Head {
    len: usize,
    method: Method,
    target: String,
    version: Version,
    headers: HeaderMap,
}

/// Reads one complete request from `reader`, buffering through `buf`.
///
/// `buf` may already hold bytes from a previous read (the first bytes the
/// idle wait observed, or a pipelined request).
pub(crate) async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    limits: &ParseLimits<'_>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
) -> Result<Request, ParseError> {
    let head = loop {
        if let Some(head) = parse_head(&buf[..])? {
            break head;
        }
        if buf.len() >= limits.max_header_bytes {
            return Err(ParseError::HeadersTooLarge { limit: limits.max_header_bytes });
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(ParseError::UnexpectedEof);
        }
    };
    if head.len > limits.max_header_bytes {
        return Err(ParseError::HeadersTooLarge { limit: limits.max_header_bytes });
    }

    if let Some(te) = head.headers.get(TRANSFER_ENCODING) {
        let te = String::from_utf8_lossy(te.as_bytes()).into_owned();
        if !te.trim().eq_ignore_ascii_case("identity") {
            return Err(ParseError::UnsupportedTransferEncoding(te));
        }
    }

    let length = content_length(&head.headers)?;
    if length > limits.max_body_bytes as u64 {
        return Err(ParseError::BodyTooLarge { length, limit: limits.max_body_bytes });
    }
    // The head stays buffered until the body is complete, so a stalled
    // request can still be identified by its request line.
    let length = length as usize;
    while buf.len() < head.len + length {
        if reader.read_buf(buf).await? == 0 {
            return Err(ParseError::UnexpectedEof);
        }
    }
    let _ = buf.split_to(head.len);
    let body = buf.split_to(length).freeze();

    let (path, query) = split_target(&head.target)?;
    let (host, port) = match head.headers.get(HOST).and_then(|v| v.to_str().ok()) {
        Some(value) => parse_host(value)?,
        None => (limits.default_host.to_ascii_lowercase(), None),
    };

    Ok(Request {
        method: head.method,
        target: head.target,
        path,
        query,
        version: head.version,
        headers: head.headers,
        body,
        peer_addr,
        local_addr,
        host,
        port,
        script_name: String::new(),
        path_info: String::new(),
        options: MountOptions::none(),
    })
}

/// The first line of a request that has not finished arriving.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct RequestLine {
    pub method: Method,
    pub target: String,
    pub version: Version,
}

/// Reads the request line at the front of `bytes`, if all of it is there.
pub(crate) fn request_line(bytes: &[u8]) -> Option<RequestLine> {
    let end = bytes.iter().position(|&b| b == b'\n')?;
    let line = std::str::from_utf8(&bytes[..end]).ok()?.trim_end_matches('\r');

    let mut parts = line.split(' ');
    let method = Method::from_bytes(parts.next()?.as_bytes()).ok()?;
    let target = parts.next().filter(|t| !t.is_empty())?.to_owned();
    let version = match parts.next()? {
        "HTTP/1.0" => Version::HTTP_10,
        "HTTP/1.1" => Version::HTTP_11,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(RequestLine { method, target, version })
}

fn parse_head(bytes: &[u8]) -> Result<Option<Head>, ParseError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut storage);

    let len = match parsed.parse(bytes) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => {
            return Err(ParseError::Malformed(format!("more than {MAX_HEADERS} header fields")));
        }
        Err(e) => return Err(ParseError::Malformed(e.to_string())),
    };

    let method = parsed
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| ParseError::Malformed("invalid method".to_owned()))?;
    let target = parsed
        .path
        .map(str::to_owned)
        .ok_or_else(|| ParseError::Malformed("missing request target".to_owned()))?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(ParseError::Malformed("unsupported protocol version".to_owned())),
    };

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| ParseError::Malformed(format!("invalid header name `{}`", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| ParseError::Malformed(format!("invalid value for header `{name}`")))?;
        headers.append(name, value);
    }

    Ok(Some(Head { len, method, target, version, headers }))
}

fn content_length(headers: &HeaderMap) -> Result<u64, ParseError> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| ParseError::Malformed("invalid content-length".to_owned()))?;
        match length {
            Some(previous) if previous != parsed => {
                return Err(ParseError::Malformed("conflicting content-length values".to_owned()));
            }
            _ => length = Some(parsed),
        }
    }
    Ok(length.unwrap_or(0))
}

/// Splits a request target into a normalized path and an optional raw query.
fn split_target(target: &str) -> Result<(String, Option<String>), ParseError> {
    if target == "*" {
        return Ok(("*".to_owned(), None));
    }

    // absolute-form: keep only the path and query.
    let origin = match target.split_once("://") {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") => {
            rest.find('/').map_or("/", |i| &rest[i..])
        }
        _ => target,
    };

    let (raw_path, query) = match origin.split_once('?') {
        Some((path, query)) => (path, Some(query.to_owned())),
        None => (origin, None),
    };

    let decoded = percent_decode_str(raw_path)
        .decode_utf8()
        .map_err(|_| ParseError::Malformed(format!("path `{raw_path}` is not valid UTF-8")))?;
    let path = normalize_path(&decoded)
        .ok_or_else(|| ParseError::Malformed(format!("abnormal path `{decoded}`")))?;

    Ok((path, query))
}

/// Collapses repeated slashes and resolves `.`/`..` segments.
///
/// Returns `None` for a path that does not start at the root or that climbs
/// above it.
pub(crate) fn normalize_path(path: &str) -> Option<String> {
    if !path.starts_with('/') {
        return None;
    }

    let mut segments: Vec<&str> = Vec::new();
    let mut trailing_slash = false;
    for segment in path.split('/').skip(1) {
        trailing_slash = matches!(segment, "" | "." | "..");
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            s => segments.push(s),
        }
    }

    let mut out = String::with_capacity(path.len());
    for segment in &segments {
        out.push('/');
        out.push_str(segment);
    }
    if trailing_slash || out.is_empty() {
        out.push('/');
    }
    Some(out)
}

/// Splits a `Host` header into a lowercase name and an optional port.
fn parse_host(value: &str) -> Result<(String, Option<u16>), ParseError> {
    let value = value.trim();
    let bad_port = || ParseError::Malformed(format!("invalid port in host `{value}`"));

    let (name, port) = if let Some(rest) = value.strip_prefix('[') {
        let (name, rest) = rest
            .split_once(']')
            .ok_or_else(|| ParseError::Malformed(format!("invalid host `{value}`")))?;
        let port = match rest.strip_prefix(':') {
            Some(port) => Some(port.parse().map_err(|_| bad_port())?),
            None => None,
        };
        (name, port)
    } else {
        match value.rsplit_once(':') {
            Some((name, port)) => (name, Some(port.parse().map_err(|_| bad_port())?)),
            None => (value, None),
        }
    };

    Ok((name.to_ascii_lowercase(), port))
}

#[cfg(test)]
pub(crate) async fn parse_for_test(raw: &[u8]) -> Result<Request, ParseError> {
    let limits = ParseLimits { max_header_bytes: 16 * 1024, max_body_bytes: 1024 * 1024, default_host: "localhost" };
    let mut reader = raw;
    let mut buf = BytesMut::new();
    read_request(
        &mut reader,
        &mut buf,
        &limits,
        "10.0.0.9:40000".parse().unwrap(),
        "127.0.0.1:8080".parse().unwrap(),
    )
    .await
}
