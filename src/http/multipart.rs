//! Incremental `multipart/form-data` reader.
//!
//! # Responsibilities
//! - Extract the boundary from a `Content-Type` header
//! - Walk the stream part by part, parsing each part's header block
//! - Copy a part's body to any writer without holding the whole part
//!
//! # Design Decisions
//! - The buffer is seeded with CRLF so the first delimiter (which may sit at
//!   the very start of the body) matches the same `CRLF--boundary` pattern
//!   as every later one
//! - While copying, everything except the last `delimiter.len() - 1` bytes
//!   can be flushed: a delimiter cannot start earlier without having matched
//! - Memory use is bounded by the read chunk plus the delimiter length,
//!   regardless of part size

use std::io;

use bytes::{Buf, BytesMut};
use memchr::memmem;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::http::request::Headers;

const READ_CHUNK: usize = 16 * 1024;
const MAX_BOUNDARY_LEN: usize = 70;

/// Errors from reading a multipart body.
#[derive(Debug, Error)]
pub enum MultipartError {
    #[error("content type is not multipart/form-data")]
    NotMultipart,

    #[error("missing or invalid multipart boundary")]
    Boundary,

    #[error("malformed multipart stream: {0}")]
    Malformed(&'static str),

    #[error("part header block exceeds {0} bytes")]
    HeadersTooLarge(usize),

    #[error("multipart stream ended before the closing delimiter")]
    UnexpectedEnd,

    #[error("reading multipart body: {0}")]
    Read(#[source] io::Error),

    #[error("writing part data: {0}")]
    Write(#[source] io::Error),
}

impl MultipartError {
    fn from_read(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            MultipartError::UnexpectedEnd
        } else {
            MultipartError::Read(err)
        }
    }

    /// True when the client sent something that is not valid multipart, as
    /// opposed to an I/O failure on either side of the copy.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, MultipartError::Read(_) | MultipartError::Write(_))
    }
}

/// Extract the boundary from a `multipart/form-data` content type.
pub fn boundary(content_type: &str) -> Result<String, MultipartError> {
    let (essence, params) = parse_params(content_type);
    if essence != "multipart/form-data" {
        return Err(MultipartError::NotMultipart);
    }
    let boundary = params
        .into_iter()
        .find(|(name, _)| name == "boundary")
        .map(|(_, value)| value)
        .ok_or(MultipartError::Boundary)?;

    let valid = !boundary.is_empty()
        && boundary.len() <= MAX_BOUNDARY_LEN
        && boundary.bytes().all(|b| b.is_ascii_graphic() || b == b' ')
        && !boundary.ends_with(' ');
    if valid {
        Ok(boundary)
    } else {
        Err(MultipartError::Boundary)
    }
}

/// Split a header value into its lower-cased main value and its parameters.
///
/// Parameter names are lower-cased; quoted values are unescaped.
pub fn parse_params(value: &str) -> (String, Vec<(String, String)>) {
    let (essence, mut rest) = match value.split_once(';') {
        Some((essence, rest)) => (essence, rest),
        None => (value, ""),
    };
    let essence = essence.trim().to_ascii_lowercase();
    let mut params = Vec::new();

    loop {
        rest = rest.trim_start_matches([' ', '\t', ';']);
        if rest.is_empty() {
            break;
        }

        let name_end = rest.find(['=', ';']).unwrap_or(rest.len());
        let name = rest[..name_end].trim().to_ascii_lowercase();
        rest = &rest[name_end..];

        let mut param_value = String::new();
        if let Some(after_eq) = rest.strip_prefix('=') {
            let after_eq = after_eq.trim_start_matches([' ', '\t']);
            if let Some(quoted) = after_eq.strip_prefix('"') {
                let mut chars = quoted.char_indices();
                let mut consumed = quoted.len();
                while let Some((i, c)) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some((_, escaped)) = chars.next() {
                                param_value.push(escaped);
                            }
                        }
                        '"' => {
                            consumed = i + 1;
                            break;
                        }
                        c => param_value.push(c),
                    }
                }
                rest = &quoted[consumed..];
                rest = rest.find(';').map_or("", |i| &rest[i..]);
            } else {
                let end = after_eq.find(';').unwrap_or(after_eq.len());
                param_value = after_eq[..end].trim().to_string();
                rest = &after_eq[end..];
            }
        }

        if !name.is_empty() {
            params.push((name, param_value));
        }
    }

    (essence, params)
}

/// Headers of one part, with the `Content-Disposition` fields pulled out.
#[derive(Debug, Clone, Default)]
pub struct PartHeaders {
    headers: Headers,
    name: Option<String>,
    filename: Option<String>,
}

impl PartHeaders {
    fn from_headers(headers: Headers) -> Self {
        let mut part = PartHeaders {
            headers,
            ..Default::default()
        };
        if let Some(disposition) = part.headers.get("content-disposition") {
            let (kind, params) = parse_params(disposition);
            if kind == "form-data" {
                for (key, value) in params {
                    match key.as_str() {
                        "name" => part.name = Some(value),
                        "filename" => part.filename = Some(value),
                        _ => {}
                    }
                }
            }
        }
        part
    }

    /// Form field name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Declared filename, exactly as sent. `Some("")` for an empty filename.
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Preamble,
    AtDelimiter,
    InBody,
    Finished,
}

/// Streaming reader over a multipart body.
pub struct Multipart<R> {
    reader: R,
    finder: memmem::Finder<'static>,
    buf: BytesMut,
    state: State,
    max_header_bytes: usize,
}

impl<R: AsyncRead + Unpin> Multipart<R> {
    pub fn new(reader: R, boundary: &str, max_header_bytes: usize) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        buf.extend_from_slice(b"\r\n");

        Self {
            reader,
            finder: memmem::Finder::new(&delimiter).into_owned(),
            buf,
            state: State::Preamble,
            max_header_bytes,
        }
    }

    /// Advance to the next part and return its headers.
    ///
    /// An unread body of the current part is drained first. Returns `None`
    /// after the closing delimiter.
    pub async fn next_part(&mut self) -> Result<Option<PartHeaders>, MultipartError> {
        loop {
            match self.state {
                State::Finished => return Ok(None),
                State::Preamble => self.skip_preamble().await?,
                State::InBody => {
                    self.copy_part_to(&mut tokio::io::sink()).await?;
                }
                State::AtDelimiter => return self.read_part_headers().await,
            }
        }
    }

    /// Copy the current part's body into `writer`, returning the byte count.
    ///
    /// Returns `Ok(0)` when no part body is pending.
    pub async fn copy_part_to<W>(&mut self, writer: &mut W) -> Result<u64, MultipartError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        if self.state != State::InBody {
            return Ok(0);
        }

        let keep = self.finder.needle().len() - 1;
        let mut written = 0u64;
        loop {
            if let Some(end) = self.finder.find(&self.buf) {
                writer
                    .write_all(&self.buf[..end])
                    .await
                    .map_err(MultipartError::Write)?;
                written += end as u64;
                self.buf.advance(end);
                self.state = State::AtDelimiter;
                writer.flush().await.map_err(MultipartError::Write)?;
                return Ok(written);
            }

            if self.buf.len() > keep {
                let safe = self.buf.len() - keep;
                writer
                    .write_all(&self.buf[..safe])
                    .await
                    .map_err(MultipartError::Write)?;
                written += safe as u64;
                self.buf.advance(safe);
            }

            if self.fill().await? == 0 {
                return Err(MultipartError::UnexpectedEnd);
            }
        }
    }

    async fn fill(&mut self) -> Result<usize, MultipartError> {
        self.buf.reserve(READ_CHUNK);
        self.reader
            .read_buf(&mut self.buf)
            .await
            .map_err(MultipartError::from_read)
    }

    async fn ensure(&mut self, len: usize) -> Result<(), MultipartError> {
        while self.buf.len() < len {
            if self.fill().await? == 0 {
                return Err(MultipartError::UnexpectedEnd);
            }
        }
        Ok(())
    }

    async fn skip_preamble(&mut self) -> Result<(), MultipartError> {
        let keep = self.finder.needle().len() - 1;
        loop {
            if let Some(start) = self.finder.find(&self.buf) {
                self.buf.advance(start);
                self.state = State::AtDelimiter;
                return Ok(());
            }
            if self.buf.len() > keep {
                let discard = self.buf.len() - keep;
                self.buf.advance(discard);
            }
            if self.fill().await? == 0 {
                return Err(MultipartError::UnexpectedEnd);
            }
        }
    }

    async fn read_part_headers(&mut self) -> Result<Option<PartHeaders>, MultipartError> {
        let delimiter_len = self.finder.needle().len();
        self.ensure(delimiter_len + 2).await?;
        self.buf.advance(delimiter_len);

        if self.buf.starts_with(b"--") {
            self.state = State::Finished;
            return Ok(None);
        }

        loop {
            self.ensure(1).await?;
            match self.buf[0] {
                b' ' | b'\t' => self.buf.advance(1),
                _ => break,
            }
        }
        self.ensure(2).await?;
        if !self.buf.starts_with(b"\r\n") {
            return Err(MultipartError::Malformed("delimiter not followed by CRLF"));
        }
        self.buf.advance(2);

        self.ensure(2).await?;
        let block = if self.buf.starts_with(b"\r\n") {
            self.buf.advance(2);
            Vec::new()
        } else {
            loop {
                if let Some(end) = memmem::find(&self.buf, b"\r\n\r\n") {
                    if end > self.max_header_bytes {
                        return Err(MultipartError::HeadersTooLarge(self.max_header_bytes));
                    }
                    let block = self.buf[..end].to_vec();
                    self.buf.advance(end + 4);
                    break block;
                }
                if self.buf.len() > self.max_header_bytes + 3 {
                    return Err(MultipartError::HeadersTooLarge(self.max_header_bytes));
                }
                if self.fill().await? == 0 {
                    return Err(MultipartError::UnexpectedEnd);
                }
            }
        };

        let headers = parse_part_headers(&block)?;
        self.state = State::InBody;
        Ok(Some(PartHeaders::from_headers(headers)))
    }
}

fn parse_part_headers(block: &[u8]) -> Result<Headers, MultipartError> {
    let mut headers = Headers::new();
    if block.is_empty() {
        return Ok(headers);
    }
    let text = String::from_utf8_lossy(block);
    for line in text.split("\r\n") {
        let (name, value) = line
            .split_once(':')
            .ok_or(MultipartError::Malformed("part header without colon"))?;
        if name.is_empty() || name.contains([' ', '\t']) {
            return Err(MultipartError::Malformed("invalid part header name"));
        }
        headers.append(name, value.trim_matches([' ', '\t']));
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(boundary: &str, parts: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (disposition, data) in parts {
            body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            body.extend_from_slice(format!("Content-Disposition: {}\r\n", disposition).as_bytes());
            body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
        body
    }

    #[test]
    fn boundary_from_content_type() {
        assert_eq!(
            boundary("multipart/form-data; boundary=abc123").unwrap(),
            "abc123"
        );
        assert_eq!(
            boundary("Multipart/Form-Data; charset=utf-8; boundary=\"a b;c\"").unwrap(),
            "a b;c"
        );
        assert!(matches!(
            boundary("application/json"),
            Err(MultipartError::NotMultipart)
        ));
        assert!(matches!(
            boundary("multipart/form-data"),
            Err(MultipartError::Boundary)
        ));
        assert!(matches!(
            boundary(&format!("multipart/form-data; boundary={}", "x".repeat(71))),
            Err(MultipartError::Boundary)
        ));
    }

    #[test]
    fn params_unescape_quotes() {
        let (kind, params) = parse_params(r#"form-data; name="file"; filename="we\"ird;name.txt""#);
        assert_eq!(kind, "form-data");
        assert_eq!(params[0], ("name".to_string(), "file".to_string()));
        assert_eq!(params[1], ("filename".to_string(), "we\"ird;name.txt".to_string()));
    }

    #[tokio::test]
    async fn walks_every_part() {
        let body = form(
            "XyZ",
            &[
                ("form-data; name=\"comment\"", b"just text"),
                ("form-data; name=\"file\"; filename=\"test.txt\"", b"hello"),
            ],
        );
        let mut multipart = Multipart::new(&body[..], "XyZ", 1024);

        let first = multipart.next_part().await.unwrap().unwrap();
        assert_eq!(first.name(), Some("comment"));
        assert_eq!(first.filename(), None);

        let second = multipart.next_part().await.unwrap().unwrap();
        assert_eq!(second.filename(), Some("test.txt"));
        assert_eq!(second.content_type(), Some("application/octet-stream"));
        let mut out = Vec::new();
        assert_eq!(multipart.copy_part_to(&mut out).await.unwrap(), 5);
        assert_eq!(out, b"hello");

        assert!(multipart.next_part().await.unwrap().is_none());
        assert!(multipart.next_part().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn preamble_and_binary_data_survive() {
        let mut data = vec![0u8; 50_000];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        // Something that looks almost like a delimiter.
        data.extend_from_slice(b"\r\n--bound");

        let mut body = b"this is a preamble\r\n".to_vec();
        body.extend(form("boundary", &[("form-data; name=\"f\"; filename=\"a.gif\"", &data)]));

        let (mut tx, rx) = tokio::io::duplex(7);
        let feeder = tokio::spawn(async move {
            tx.write_all(&body).await.unwrap();
        });

        let mut multipart = Multipart::new(rx, "boundary", 1024);
        let part = multipart.next_part().await.unwrap().unwrap();
        assert_eq!(part.filename(), Some("a.gif"));

        let mut out = Vec::new();
        multipart.copy_part_to(&mut out).await.unwrap();
        assert_eq!(out, data);
        assert!(multipart.next_part().await.unwrap().is_none());
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn empty_part_headers_and_body() {
        let body = b"--b\r\n\r\n\r\n--b--".to_vec();
        let mut multipart = Multipart::new(&body[..], "b", 64);
        let part = multipart.next_part().await.unwrap().unwrap();
        assert!(part.headers().is_empty());
        let mut out = Vec::new();
        assert_eq!(multipart.copy_part_to(&mut out).await.unwrap(), 0);
        assert!(multipart.next_part().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_stream_is_unexpected_end() {
        let body = b"--b\r\nContent-Disposition: form-data; name=\"f\"; filename=\"x.txt\"\r\n\r\npartial".to_vec();
        let mut multipart = Multipart::new(&body[..], "b", 1024);
        multipart.next_part().await.unwrap().unwrap();
        let err = multipart.copy_part_to(&mut Vec::new()).await.unwrap_err();
        assert!(matches!(err, MultipartError::UnexpectedEnd));
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn missing_delimiter_is_unexpected_end() {
        let body = b"no multipart here at all".to_vec();
        let mut multipart = Multipart::new(&body[..], "b", 1024);
        assert!(matches!(
            multipart.next_part().await,
            Err(MultipartError::UnexpectedEnd)
        ));
    }

    #[tokio::test]
    async fn garbage_after_delimiter_is_malformed() {
        let body = b"--bXX\r\n\r\n--b--".to_vec();
        let mut multipart = Multipart::new(&body[..], "b", 1024);
        assert!(matches!(
            multipart.next_part().await,
            Err(MultipartError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn oversized_part_headers() {
        let mut body = b"--b\r\nX-Long: ".to_vec();
        body.extend(std::iter::repeat(b'a').take(200));
        body.extend_from_slice(b"\r\n\r\ndata\r\n--b--");
        let mut multipart = Multipart::new(&body[..], "b", 64);
        assert!(matches!(
            multipart.next_part().await,
            Err(MultipartError::HeadersTooLarge(64))
        ));
    }

    #[tokio::test]
    async fn write_failure_is_reported_as_write() {
        struct Broken;
        impl AsyncWrite for Broken {
            fn poll_write(
                self: std::pin::Pin<&mut Self>,
                _: &mut std::task::Context<'_>,
                _: &[u8],
            ) -> std::task::Poll<io::Result<usize>> {
                std::task::Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk full")))
            }
            fn poll_flush(
                self: std::pin::Pin<&mut Self>,
                _: &mut std::task::Context<'_>,
            ) -> std::task::Poll<io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
            fn poll_shutdown(
                self: std::pin::Pin<&mut Self>,
                _: &mut std::task::Context<'_>,
            ) -> std::task::Poll<io::Result<()>> {
                std::task::Poll::Ready(Ok(()))
            }
        }

        let body = form("b", &[("form-data; name=\"f\"; filename=\"x.txt\"", b"payload")]);
        let mut multipart = Multipart::new(&body[..], "b", 1024);
        multipart.next_part().await.unwrap().unwrap();
        let err = multipart.copy_part_to(&mut Broken).await.unwrap_err();
        assert!(matches!(err, MultipartError::Write(_)));
        assert!(!err.is_client_error());
    }
}
