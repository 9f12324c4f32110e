//! Request parsing.
//!
//! # Responsibilities
//! - Read the request line and header section from a buffered stream
//! - Enforce line length and header count limits while reading
//! - Validate method token, target, version, header syntax and framing
//! - Expose the body as a lazy reader bounded by `Content-Length`
//!
//! # Design Decisions
//! - Strict grammar: every line ends in CRLF, single spaces in the request
//!   line, no whitespace before a header colon, no line folding
//! - Nothing is repaired or guessed; the first violation fails the parse
//! - The body is never read here; a short body surfaces as `UnexpectedEof`
//!   from [`Body`] while the handler consumes it

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, ReadBuf, Take};

use crate::config::ParserConfig;

/// Why a request could not be parsed.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("connection closed before a request was sent")]
    Closed,

    #[error("connection closed in the middle of the request head")]
    Incomplete,

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("line not terminated by CRLF")]
    BareLineFeed,

    #[error("malformed request line")]
    RequestLine,

    #[error("invalid method token")]
    Method,

    #[error("invalid request target")]
    Target,

    #[error("unsupported protocol version {0:?}")]
    Version(String),

    #[error("malformed header line")]
    Header,

    #[error("more than {0} header lines")]
    TooManyHeaders(usize),

    #[error("missing Host header")]
    MissingHost,

    #[error("conflicting Host headers")]
    DuplicateHost,

    #[error("invalid Content-Length")]
    ContentLength,

    #[error("transfer coding {0:?} not supported")]
    TransferEncoding(String),

    #[error("read error: {0}")]
    Io(#[from] io::Error),
}

/// Limits applied while reading a request head.
#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_line_bytes: usize,
    pub max_headers: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self::from(&ParserConfig::default())
    }
}

impl From<&ParserConfig> for ParseLimits {
    fn from(config: &ParserConfig) -> Self {
        Self {
            max_line_bytes: config.max_line_bytes,
            max_headers: config.max_headers,
        }
    }
}

/// Request method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    /// Any other syntactically valid method token.
    Extension(String),
}

impl Method {
    fn from_token(token: &str) -> Self {
        match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "PATCH" => Method::Patch,
            other => Method::Extension(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
            Method::Extension(token) => token,
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol version from the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

/// Header fields in arrival order. Name lookups ignore ASCII case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parsed request target.
///
/// Origin-form (`/a/b?q`), absolute-form (`http://host/a`), authority-form
/// (`host:443`) and asterisk-form (`*`) are recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    raw: String,
    scheme: Option<String>,
    authority: Option<String>,
    path: String,
    query: Option<String>,
}

impl Target {
    fn parse(raw: &str) -> Result<Self, ParseError> {
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(ParseError::Target);
        }

        let mut target = Target {
            raw: raw.to_string(),
            scheme: None,
            authority: None,
            path: String::new(),
            query: None,
        };

        if raw == "*" {
            return Ok(target);
        }

        let rest = if raw.starts_with('/') {
            raw
        } else if let Some((scheme, after)) = raw.split_once("://") {
            if !is_scheme(scheme) {
                return Err(ParseError::Target);
            }
            let end = after.find(['/', '?']).unwrap_or(after.len());
            let authority = &after[..end];
            if authority.is_empty() {
                return Err(ParseError::Target);
            }
            target.scheme = Some(scheme.to_ascii_lowercase());
            target.authority = Some(authority.to_string());
            &after[end..]
        } else {
            target.authority = Some(raw.to_string());
            return Ok(target);
        };

        match rest.split_once('?') {
            Some((path, query)) => {
                target.path = path.to_string();
                target.query = Some(query.to_string());
            }
            None => target.path = rest.to_string(),
        }
        Ok(target)
    }

    /// The target exactly as it appeared on the request line.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Path component, without the query. Empty for authority/asterisk form.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Lower-cased scheme of an absolute-form target.
    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    /// Authority of an absolute-form or authority-form target.
    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    pub fn is_origin_form(&self) -> bool {
        self.raw.starts_with('/')
    }

    pub fn is_absolute_form(&self) -> bool {
        self.scheme.is_some()
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Everything before the body: request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    method: Method,
    target: Target,
    version: Version,
    headers: Headers,
    host: Option<String>,
    content_length: Option<u64>,
}

impl RequestHead {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Host from an absolute-form target, else from the `Host` header.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    /// Declared body length. `None` means no body.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }
}

/// A parsed request whose body still sits, unread, in the connection.
#[derive(Debug)]
pub struct Request<'r, R> {
    head: RequestHead,
    body: Option<Body<'r, R>>,
}

impl<'r, R> Request<'r, R> {
    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn into_parts(self) -> (RequestHead, Option<Body<'r, R>>) {
        (self.head, self.body)
    }
}

/// Lazy request body, bounded by `Content-Length`.
///
/// Reading past the declared length yields EOF. If the peer closes before
/// the declared length is reached the read fails with `UnexpectedEof`.
#[derive(Debug)]
pub struct Body<'r, R> {
    inner: Take<&'r mut R>,
}

impl<'r, R: AsyncRead + Unpin> Body<'r, R> {
    fn new(reader: &'r mut R, length: u64) -> Self {
        Self {
            inner: reader.take(length),
        }
    }

    /// Bytes not yet read.
    pub fn remaining(&self) -> u64 {
        self.inner.limit()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Body<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let wanted = buf.remaining() > 0 && this.inner.limit() > 0;

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if wanted && buf.filled().len() == before => {
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("request body truncated, {} bytes missing", this.inner.limit()),
                )))
            }
            other => other,
        }
    }
}

/// Read and validate one request head from `reader`.
///
/// On success the returned request borrows `reader` for its body.
pub async fn read_request<'r, R>(
    reader: &'r mut R,
    limits: &ParseLimits,
) -> Result<Request<'r, R>, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(256);

    if !read_line(reader, limits.max_line_bytes, &mut line).await? {
        return Err(ParseError::Closed);
    }
    let (method, target, version) = parse_request_line(&line)?;

    let mut headers = Headers::new();
    loop {
        if !read_line(reader, limits.max_line_bytes, &mut line).await? {
            return Err(ParseError::Incomplete);
        }
        if line.is_empty() {
            break;
        }
        if headers.len() == limits.max_headers {
            return Err(ParseError::TooManyHeaders(limits.max_headers));
        }
        let (name, value) = parse_header_line(&line)?;
        headers.append(name, value);
    }

    if let Some(coding) = headers.get("transfer-encoding") {
        return Err(ParseError::TransferEncoding(coding.to_string()));
    }
    let content_length = content_length(&headers)?;
    let host = request_host(&target, version, &headers)?;

    let head = RequestHead {
        method,
        target,
        version,
        headers,
        host,
        content_length,
    };

    let body = match content_length {
        Some(length) if length > 0 => Some(Body::new(reader, length)),
        _ => None,
    };

    Ok(Request { head, body })
}

/// Read one CRLF-terminated line into `line`, without the terminator.
///
/// Returns `false` on a clean EOF before any byte.
async fn read_line<R>(reader: &mut R, max: usize, line: &mut Vec<u8>) -> Result<bool, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let cap = max as u64 + 2;
    let n = (&mut *reader).take(cap).read_until(b'\n', line).await?;

    if n == 0 {
        return Ok(false);
    }
    if line.last() != Some(&b'\n') {
        return Err(if n as u64 >= cap {
            ParseError::LineTooLong(max)
        } else {
            ParseError::Incomplete
        });
    }
    if !line.ends_with(b"\r\n") {
        return Err(ParseError::BareLineFeed);
    }
    line.truncate(line.len() - 2);
    if line.len() > max {
        return Err(ParseError::LineTooLong(max));
    }
    Ok(true)
}

fn parse_request_line(line: &[u8]) -> Result<(Method, Target, Version), ParseError> {
    let text = std::str::from_utf8(line).map_err(|_| ParseError::RequestLine)?;
    let mut parts = text.split(' ');
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) => (m, t, v),
        _ => return Err(ParseError::RequestLine),
    };

    if !is_token(method) {
        return Err(ParseError::Method);
    }
    let target = Target::parse(target)?;
    let version = match version {
        "HTTP/1.1" => Version::Http11,
        "HTTP/1.0" => Version::Http10,
        other => return Err(ParseError::Version(other.to_string())),
    };

    Ok((Method::from_token(method), target, version))
}

fn parse_header_line(line: &[u8]) -> Result<(String, String), ParseError> {
    let colon = memchr::memchr(b':', line).ok_or(ParseError::Header)?;
    let (name, value) = (&line[..colon], &line[colon + 1..]);

    let name = std::str::from_utf8(name).map_err(|_| ParseError::Header)?;
    if !is_token(name) {
        return Err(ParseError::Header);
    }

    let value = trim_ows(value);
    if value
        .iter()
        .any(|&b| (b < 0x20 && b != b'\t') || b == 0x7f)
    {
        return Err(ParseError::Header);
    }

    Ok((name.to_string(), String::from_utf8_lossy(value).into_owned()))
}

fn content_length(headers: &Headers) -> Result<Option<u64>, ParseError> {
    let mut length = None;
    for value in headers.get_all("content-length") {
        for item in value.split(',') {
            let item = item.trim_matches([' ', '\t']);
            if item.is_empty() || !item.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::ContentLength);
            }
            let parsed: u64 = item.parse().map_err(|_| ParseError::ContentLength)?;
            match length {
                Some(existing) if existing != parsed => return Err(ParseError::ContentLength),
                _ => length = Some(parsed),
            }
        }
    }
    Ok(length)
}

fn request_host(
    target: &Target,
    version: Version,
    headers: &Headers,
) -> Result<Option<String>, ParseError> {
    let mut values = headers.get_all("host");
    let header = values.next();
    if values.next().is_some() {
        return Err(ParseError::DuplicateHost);
    }

    if target.is_absolute_form() {
        return Ok(target.authority().map(str::to_string));
    }
    match header {
        Some(host) if !host.is_empty() => Ok(Some(host.to_string())),
        Some(_) => Ok(None),
        None if version == Version::Http11 => Err(ParseError::MissingHost),
        None => Ok(None),
    }
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^'
                        | b'_' | b'`' | b'|' | b'~'
                )
        })
}

fn is_scheme(s: &str) -> bool {
    let mut bytes = s.bytes();
    matches!(bytes.next(), Some(b) if b.is_ascii_alphabetic())
        && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.'))
}
