//! Forward one GET to its origin and relay the reply verbatim.
//!
//! # Responsibilities
//! - Connect to the origin under a connect deadline
//! - Send a minimal `Connection: close` request
//! - Copy origin bytes to the client until the origin closes
//!
//! # Design Decisions
//! - Origin responses are not parsed; bytes pass through unmodified
//! - Once any byte has reached the client no status line can be injected,
//!   so a later failure only closes the connection

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::TimeoutConfig;
use crate::error::ServiceError;
use crate::proxy::target::ProxyTarget;
use crate::resilience::{with_deadline, IdleTimeout};

const RELAY_CHUNK: usize = 16 * 1024;

/// Failure while relaying the origin's response.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Nothing was sent to the client yet; an error response may follow.
    #[error("relay failed before any byte was sent: {0}")]
    BeforeResponse(#[source] io::Error),

    /// Part of the response was already sent; only closing remains.
    #[error("relay failed after {relayed} bytes: {source}")]
    MidResponse {
        relayed: u64,
        #[source]
        source: io::Error,
    },
}

/// Connects to origins and relays their responses.
#[derive(Debug, Clone)]
pub struct Forwarder {
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl Forwarder {
    pub fn new(connect_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            idle_timeout,
        }
    }

    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self::new(
            Duration::from_secs(config.connect_secs),
            Duration::from_secs(config.idle_secs),
        )
    }

    /// Open the origin connection and send the request.
    ///
    /// Any failure here maps to 502 and nothing has been written to the
    /// client.
    pub async fn open(&self, target: &ProxyTarget) -> Result<IdleTimeout<TcpStream>, ServiceError> {
        let authority = target.authority();
        let unavailable = |source| ServiceError::UpstreamUnavailable {
            authority: authority.clone(),
            source,
        };

        let stream = with_deadline(self.connect_timeout, "origin connect", TcpStream::connect(&authority))
            .await
            .map_err(unavailable)?;
        let _ = stream.set_nodelay(true);
        let mut origin = IdleTimeout::new(stream, self.idle_timeout);

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            target.request_target(),
            authority
        );
        origin.write_all(request.as_bytes()).await.map_err(unavailable)?;
        origin.flush().await.map_err(unavailable)?;

        tracing::debug!(origin = %authority, target = target.request_target(), "Request forwarded");
        Ok(origin)
    }

    /// Open, send and relay in one go.
    pub async fn forward<W>(&self, target: &ProxyTarget, client: &mut W) -> Result<u64, ForwardError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut origin = self.open(target).await.map_err(ForwardError::Upstream)?;
        relay(&mut origin, client).await.map_err(ForwardError::Relay)
    }
}

/// Outcome of a failed forward, split by whether a response may still be sent.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    Upstream(ServiceError),

    #[error(transparent)]
    Relay(RelayError),
}

/// Copy everything from `origin` to `client` until `origin` reaches EOF.
pub async fn relay<R, W>(origin: &mut R, client: &mut W) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; RELAY_CHUNK];
    let mut relayed = 0u64;
    let fail = |relayed: u64, source: io::Error| {
        if relayed == 0 {
            RelayError::BeforeResponse(source)
        } else {
            RelayError::MidResponse { relayed, source }
        }
    };

    loop {
        let n = origin.read(&mut buf).await.map_err(|err| fail(relayed, err))?;
        if n == 0 {
            break;
        }
        client
            .write_all(&buf[..n])
            .await
            .map_err(|err| fail(relayed, err))?;
        relayed += n as u64;
    }
    client.flush().await.map_err(|err| fail(relayed, err))?;
    Ok(relayed)
}
