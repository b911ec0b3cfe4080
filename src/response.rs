//! Outgoing HTTP response type, cookies, and the [`IntoResponse`] conversion trait.
//!
//! Build a [`Response`] in your handler and return it. The connection loop
//! owns serialization: status line, framing headers, cookies, body.

use std::fmt;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HeaderName, HeaderValue, LOCATION, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode, Version};
use tokio::io::{AsyncWrite, AsyncWriteExt};

// ── Response ─────────────────────────────────────────────────────────────────

/// An outgoing HTTP response.
///
/// # Shortcuts (200 OK, no custom headers needed)
///
/// ```rust
/// use wicket::Response;
/// use http::StatusCode;
///
/// Response::json(br#"{"id":1}"#.to_vec());
/// Response::text("hello");
/// Response::status(StatusCode::NO_CONTENT);
/// ```
///
/// # Builder (custom status or headers)
///
/// ```rust
/// use wicket::Response;
/// use http::StatusCode;
///
/// Response::builder()
///     .status(StatusCode::CREATED)
///     .header("location", "/users/42")
///     .json(br#"{"id":42}"#.to_vec());
/// ```
#[derive(Debug)]
pub struct Response {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) cookies: Vec<Cookie>,
    pub(crate) body: Bytes,
    pub(crate) keep_alive: bool,
}

impl Response {
    /// `200 OK` with `application/json`.
    pub fn json(body: impl Into<Bytes>) -> Self {
        Self::with_type("application/json", body.into())
    }

    /// `200 OK` with `text/plain; charset=utf-8`.
    pub fn text(body: impl Into<String>) -> Self {
        Self::with_type("text/plain; charset=utf-8", Bytes::from(body.into()))
    }

    /// `200 OK` with `text/html; charset=utf-8`.
    pub fn html(body: impl Into<String>) -> Self {
        Self::with_type("text/html; charset=utf-8", Bytes::from(body.into()))
    }

    /// Response with no body.
    pub fn status(code: StatusCode) -> Self {
        Self {
            status: code,
            headers: HeaderMap::new(),
            cookies: Vec::new(),
            body: Bytes::new(),
            keep_alive: true,
        }
    }

    /// Builder for responses that need a custom status or extra headers.
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder { status: StatusCode::OK, headers: HeaderMap::new(), cookies: Vec::new() }
    }

    fn with_type(content_type: &'static str, body: Bytes) -> Self {
        let mut res = Self::status(StatusCode::OK);
        res.headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        res.body = body;
        res
    }

    /// A synthesized HTML error page.
    ///
    /// `message` is escaped before it lands in the markup. `address` is the
    /// footer line, conventionally `<software> at <host>:<port>`. Error pages
    /// for 4xx/5xx statuses never keep the connection alive.
    pub fn error_page(status: StatusCode, message: Option<&str>, address: &str) -> Self {
        let reason = status.canonical_reason().unwrap_or("Unknown");
        let mut page = format!(
            "<!DOCTYPE HTML PUBLIC \"-//W3C//DTD HTML 4.0//EN\">\n\
             <HTML>\n  <HEAD><TITLE>{reason}</TITLE></HEAD>\n  <BODY>\n    <H1>{reason}</H1>\n"
        );
        if let Some(message) = message {
            page.push_str("    ");
            page.push_str(&escape_html(message));
            page.push('\n');
        }
        page.push_str(&format!(
            "    <HR>\n    <ADDRESS>\n     {}\n    </ADDRESS>\n  </BODY>\n</HTML>\n",
            escape_html(address)
        ));

        let mut res = Self::html(page);
        res.status = status;
        res.keep_alive = !(status.is_client_error() || status.is_server_error());
        res
    }

    pub fn status_code(&self) -> StatusCode { self.status }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }
    pub fn cookies(&self) -> &[Cookie] { &self.cookies }
    pub fn body(&self) -> &Bytes { &self.body }

    /// Whether this response is willing to let the connection persist.
    pub fn keep_alive(&self) -> bool { self.keep_alive }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    pub fn add_cookie(&mut self, cookie: Cookie) {
        self.cookies.push(cookie);
    }

    /// Forces the connection closed after this response.
    pub fn close_connection(&mut self) {
        self.keep_alive = false;
    }

    /// Serializes the response onto `writer`.
    ///
    /// Returns the number of body bytes written, for the access log.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        framing: &Framing<'_>,
    ) -> std::io::Result<usize> {
        let version = if framing.version == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" };
        let reason = self.status.canonical_reason().unwrap_or("");

        let mut head = format!("{version} {} {reason}\r\n", self.status.as_u16());
        head.push_str(&format!("server: {}\r\n", framing.server_software));
        head.push_str(if framing.keep_alive {
            "connection: keep-alive\r\n"
        } else {
            "connection: close\r\n"
        });

        let bodiless = self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED;
        if !bodiless {
            head.push_str(&format!("content-length: {}\r\n", self.body.len()));
        }

        let mut out = head.into_bytes();
        for (name, value) in &self.headers {
            if is_framing_header(name) {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        for cookie in &self.cookies {
            out.extend_from_slice(format!("set-cookie: {cookie}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        writer.write_all(&out).await?;

        let written = if bodiless || framing.head_only {
            0
        } else {
            writer.write_all(&self.body).await?;
            self.body.len()
        };
        writer.flush().await?;
        Ok(written)
    }
}

/// Headers the serializer writes itself. Copies set by a handler are dropped.
fn is_framing_header(name: &HeaderName) -> bool {
    *name == CONNECTION || *name == CONTENT_LENGTH || *name == TRANSFER_ENCODING || name.as_str() == "keep-alive"
}

/// Connection-level facts the serializer needs but a handler never sets.
pub(crate) struct Framing<'a> {
    pub version: Version,
    pub keep_alive: bool,
    pub head_only: bool,
    pub server_software: &'a str,
}

// ── ResponseBuilder ───────────────────────────────────────────────────────────

/// Fluent builder for [`Response`].
///
/// Obtain via [`Response::builder()`]. Defaults to `200 OK`. Headers with an
/// invalid name or value are skipped with a warning rather than panicking.
pub struct ResponseBuilder {
    status: StatusCode,
    headers: HeaderMap,
    cookies: Vec<Cookie>,
}

impl ResponseBuilder {
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => tracing::warn!(header = name, "dropping invalid response header"),
        }
        self
    }

    pub fn cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    /// Shorthand for a redirect: sets `location` and the given status.
    pub fn redirect(self, status: StatusCode, location: &str) -> Self {
        self.status(status).header(LOCATION.as_str(), location)
    }

    /// Terminate with a JSON body (`application/json`).
    pub fn json(self, body: impl Into<Bytes>) -> Response {
        self.finish("application/json", body.into())
    }

    /// Terminate with a plain-text body (`text/plain; charset=utf-8`).
    pub fn text(self, body: impl Into<String>) -> Response {
        self.finish("text/plain; charset=utf-8", Bytes::from(body.into()))
    }

    /// Terminate with a body of an arbitrary content type.
    pub fn bytes(self, content_type: &'static str, body: impl Into<Bytes>) -> Response {
        self.finish(content_type, body.into())
    }

    /// Terminate with no body (e.g. `204 No Content`, `301 Moved Permanently`).
    pub fn no_body(self) -> Response {
        Response {
            status: self.status,
            headers: self.headers,
            cookies: self.cookies,
            body: Bytes::new(),
            keep_alive: true,
        }
    }

    fn finish(self, content_type: &'static str, body: Bytes) -> Response {
        let mut res = self.no_body();
        res.headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        res.body = body;
        res
    }
}

// ── Cookie ────────────────────────────────────────────────────────────────────

/// A cookie to be sent with a `Set-Cookie` header line.
///
/// Attributes (`Path`, `Expires`, `HttpOnly`, …) are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    attributes: Vec<String>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into(), attributes: Vec::new() }
    }

    /// Parses the value of a `Set-Cookie` header.
    ///
    /// Returns `None` when the first pair has no `=` or an empty name.
    pub fn parse_set_cookie(raw: &str) -> Option<Self> {
        let mut parts = raw.split(';').map(str::trim);
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_owned(),
            value: value.trim().to_owned(),
            attributes: parts.filter(|a| !a.is_empty()).map(str::to_owned).collect(),
        })
    }

    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attributes.push(attribute.into());
        self
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn value(&self) -> &str { &self.value }
    pub fn attributes(&self) -> &[String] { &self.attributes }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        for attribute in &self.attributes {
            write!(f, "; {attribute}")?;
        }
        Ok(())
    }
}

// ── IntoResponse ──────────────────────────────────────────────────────────────

/// Conversion into an HTTP [`Response`].
///
/// Implement on your own types to return them directly from handlers.
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response { self }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> Response { Response::text(self) }
}

impl IntoResponse for String {
    fn into_response(self) -> Response { Response::text(self) }
}

/// Return a status directly from a handler: `return StatusCode::NO_CONTENT`
impl IntoResponse for StatusCode {
    fn into_response(self) -> Response { Response::status(self) }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
