//! Response formatting.
//!
//! # Responsibilities
//! - Map status codes to reason phrases
//! - Format status line, headers and body for synthesized responses
//! - Build the plain-text error bodies
//!
//! # Design Decisions
//! - `Content-Length` is always computed from the body, never supplied
//! - Every response announces `Connection: close`; the connection is closed
//!   after the body is written
//! - Relayed origin responses never pass through here

use std::borrow::Cow;
use std::io;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Status codes this server synthesizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    BadRequest,
    NotFound,
    Conflict,
    InternalServerError,
    NotImplemented,
    BadGateway,
}

impl Status {
    pub fn code(&self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::Conflict => 409,
            Status::InternalServerError => 500,
            Status::NotImplemented => 501,
            Status::BadGateway => 502,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::Conflict => "Conflict",
            Status::InternalServerError => "Internal Server Error",
            Status::NotImplemented => "Not Implemented",
            Status::BadGateway => "Bad Gateway",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// A complete response, written in one go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: Status,
    content_type: Cow<'static, str>,
    body: Bytes,
}

impl Response {
    pub fn new(status: Status, content_type: impl Into<Cow<'static, str>>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    /// `200 OK` with body `ok`, the upload acknowledgement.
    pub fn ok() -> Self {
        Self::new(Status::Ok, "text/plain", Bytes::from_static(b"ok"))
    }

    /// Plain-text error: `<code>: <reason>`, optionally naming a path.
    pub fn error(status: Status, detail: Option<&str>) -> Self {
        let body = match detail {
            Some(detail) => format!("{}: {}", status.code(), detail),
            None => format!("{}: {}", status.code(), status.reason()),
        };
        Self::new(status, "text/plain", body)
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Status line and header section, including the blank line.
    pub fn head(&self) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            self.content_type,
            self.body.len()
        )
    }

    /// Write the full response and flush.
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        writer.write_all(self.head().as_bytes()).await?;
        writer.write_all(&self.body).await?;
        writer.flush().await
    }
}
