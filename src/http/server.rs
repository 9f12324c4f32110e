//! Accept loop and per-connection handling.
//!
//! # Responsibilities
//! - Accept connections under the admission limit
//! - Run one task per connection inside a tracing span
//! - Parse one request, dispatch it, write exactly one response (or relay)
//! - Close the connection and release the slot on every exit path
//! - Stop accepting on shutdown and drain in-flight connections

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf};
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::config::ServerConfig;
use crate::error::ServiceError;
use crate::files::{ExtensionPolicy, FileService, FileStore};
use crate::http::request::{read_request, ParseError, ParseLimits};
use crate::http::response::Response;
use crate::net::{ConnectionTracker, Listener, ListenerError};
use crate::proxy::{ForwardError, Forwarder, RelayError};
use crate::resilience::IdleTimeout;
use crate::routing::{Route, Router};

/// Upper bound on unread request bytes swallowed after responding.
const LINGER_BYTES: usize = 256 * 1024;
const LINGER_TIME: Duration = Duration::from_secs(2);
/// Pause after a failed `accept()` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// State shared by every connection task.
#[derive(Debug)]
struct Handler {
    router: Router,
    files: FileService,
    forwarder: Forwarder,
    limits: ParseLimits,
    header_timeout: Duration,
    idle_timeout: Duration,
}

/// The TCP server for either deployment role.
pub struct HttpServer {
    handler: Arc<Handler>,
    tracker: ConnectionTracker,
    drain_timeout: Duration,
}

impl HttpServer {
    /// Build the server from a validated configuration.
    pub fn new(config: &ServerConfig) -> Self {
        let policy = Arc::new(ExtensionPolicy::from_config(&config.files));
        let store = Arc::new(FileStore::from_config(&config.files));

        let handler = Handler {
            router: Router::new(config.mode, Arc::clone(&policy)),
            files: FileService::new(store, policy, config.parser.max_part_header_bytes),
            forwarder: Forwarder::from_config(&config.timeouts),
            limits: ParseLimits::from(&config.parser),
            header_timeout: Duration::from_secs(config.timeouts.header_secs),
            idle_timeout: Duration::from_secs(config.timeouts.idle_secs),
        };

        Self {
            handler: Arc::new(handler),
            tracker: ConnectionTracker::new(),
            drain_timeout: Duration::from_secs(config.timeouts.drain_secs),
        }
    }

    /// In-flight connection counters.
    pub fn connection_tracker(&self) -> ConnectionTracker {
        self.tracker.clone()
    }

    /// Accept connections until `shutdown` fires, then drain.
    pub async fn run(
        self,
        listener: Listener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ListenerError> {
        let address = listener
            .local_addr()
            .map_or_else(|_| "<unknown>".to_string(), |addr| addr.to_string());
        tracing::info!(
            address = %address,
            mode = %self.handler.router.mode(),
            max_connections = listener.limiter().capacity(),
            "Server starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, slot)) => {
                        let _ = stream.set_nodelay(true);
                        let guard = self.tracker.track();
                        let handler = Arc::clone(&self.handler);
                        let span = tracing::info_span!(
                            "connection",
                            connection_id = %guard.id(),
                            peer_addr = %peer,
                        );
                        tokio::spawn(
                            async move {
                                let reader = handler.respond(stream).await;
                                drop(guard);
                                slot.release();
                                linger(reader).await;
                                tracing::trace!("Connection finished");
                            }
                            .instrument(span),
                        );
                    }
                    Err(ListenerError::Accept(err)) => {
                        tracing::warn!(error = %err, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    Err(err) => return Err(err),
                },
            }
        }

        let active = self.tracker.active_count();
        if active > 0 {
            tracing::info!(active, "Draining in-flight connections");
        }
        if !self.tracker.wait_idle(self.drain_timeout).await {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                "Drain timeout elapsed with connections still open"
            );
        }
        tracing::info!(served = self.tracker.total_count(), "Server stopped");
        Ok(())
    }
}

impl Handler {
    /// Serve one request on `stream` and shut down its write side.
    ///
    /// The returned read side still holds the connection open; the caller
    /// releases the admission slot before draining it.
    async fn respond<S>(&self, stream: S) -> BufReader<ReadHalf<IdleTimeout<S>>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = IdleTimeout::new(stream, self.idle_timeout);
        let (read_half, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        self.exchange(&mut reader, &mut writer).await;

        if let Err(err) = writer.shutdown().await {
            tracing::trace!(error = %err, "Shutdown of write side failed");
        }
        reader
    }

    /// Read one request and produce its single response or relay.
    async fn exchange<R, W>(&self, reader: &mut R, writer: &mut W)
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let parsed = tokio::time::timeout(self.header_timeout, read_request(reader, &self.limits)).await;
        let request = match parsed {
            Err(_) => {
                tracing::debug!(timeout = ?self.header_timeout, "Request head not received in time");
                return;
            }
            Ok(Err(ParseError::Closed)) => {
                tracing::trace!("Peer closed before sending a request");
                return;
            }
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "Rejecting malformed request");
                send(writer, &ServiceError::from(err).to_response()).await;
                return;
            }
            Ok(Ok(request)) => request,
        };

        let (head, body) = request.into_parts();
        tracing::debug!(method = %head.method(), target = %head.target(), "Request received");

        let result = match self.router.route(&head) {
            Ok(Route::ServeFile { path }) => self.files.get(&path).await,
            Ok(Route::Upload) => self.files.upload(&head, body).await,
            Ok(Route::Forward(target)) => {
                match self.forwarder.forward(&target, writer).await {
                    Ok(relayed) => {
                        tracing::info!(
                            method = %head.method(),
                            target = %head.target(),
                            origin = %target.authority(),
                            relayed,
                            "Relayed origin response"
                        );
                        return;
                    }
                    Err(ForwardError::Upstream(err)) => Err(err),
                    Err(ForwardError::Relay(RelayError::BeforeResponse(err))) => {
                        Err(ServiceError::Internal(err))
                    }
                    Err(ForwardError::Relay(err @ RelayError::MidResponse { .. })) => {
                        tracing::warn!(error = %err, "Relay interrupted, closing");
                        return;
                    }
                }
            }
            Err(err) => Err(err),
        };

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                log_failure(&err);
                err.to_response()
            }
        };
        tracing::info!(
            method = %head.method(),
            target = %head.target(),
            status = response.status().code(),
            "Request handled"
        );
        send(writer, &response).await;
    }
}

fn log_failure(err: &ServiceError) {
    if err.status().code() >= 500 {
        tracing::error!(error = %err, "Request failed");
    } else {
        tracing::debug!(error = %err, "Request rejected");
    }
}

async fn send<W>(writer: &mut W, response: &Response)
where
    W: AsyncWrite + Unpin,
{
    if let Err(err) = response.write_to(writer).await {
        tracing::debug!(error = %err, status = response.status().code(), "Failed to write response");
    }
}

/// Swallow what the client is still sending so closing does not reset the
/// connection before the response is read.
async fn linger<R>(mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut drained = 0usize;
    let _ = tokio::time::timeout(LINGER_TIME, async {
        while drained < LINGER_BYTES {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => drained += n,
            }
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceMode;
    use tempfile::TempDir;
    use tokio::io::DuplexStream;

    fn files_config(dir: &TempDir) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.mode = ServiceMode::Files;
        config.files.root = dir.path().to_path_buf();
        config
    }

    /// Serve one connection outside any accept loop or admission limit.
    async fn serve_connection(config: &ServerConfig, stream: DuplexStream) {
        let server = HttpServer::new(config);
        let reader = server.handler.respond(stream).await;
        linger(reader).await;
    }

    async fn exchange(config: &ServerConfig, request: &[u8]) -> Vec<u8> {
        let (mut client, server): (DuplexStream, DuplexStream) = tokio::io::duplex(64 * 1024);
        let config = config.clone();
        let task = tokio::spawn(async move { serve_connection(&config, server).await });

        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        drop(client);
        task.await.unwrap();
        out
    }

    fn text(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).into_owned()
    }

    #[tokio::test]
    async fn serves_file_over_stream() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();

        let out = exchange(&files_config(&dir), b"GET /a.txt HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert_eq!(
            text(&out),
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: close\r\n\r\nalpha"
        );
    }

    #[tokio::test]
    async fn missing_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let out = exchange(&files_config(&dir), b"GET /missing.txt HTTP/1.1\r\nHost: x\r\n\r\n").await;
        let out = text(&out);
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(out.ends_with("\r\n\r\n404: /missing.txt not found"));
    }

    #[tokio::test]
    async fn malformed_request_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let out = exchange(&files_config(&dir), b"GET /a.txt\r\n\r\n").await;
        assert!(text(&out).starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn chunked_body_is_501() {
        let dir = tempfile::tempdir().unwrap();
        let out = exchange(
            &files_config(&dir),
            b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
        )
        .await;
        assert!(text(&out).starts_with("HTTP/1.1 501 Not Implemented\r\n"));
    }

    #[tokio::test]
    async fn unsupported_method_is_501() {
        let dir = tempfile::tempdir().unwrap();
        let out = exchange(&files_config(&dir), b"DELETE /a.txt HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert!(text(&out).ends_with("501: Not Implemented"));
    }

    #[tokio::test]
    async fn silent_close_without_request() {
        let dir = tempfile::tempdir().unwrap();
        let out = exchange(&files_config(&dir), b"").await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn upload_over_stream() {
        let dir = tempfile::tempdir().unwrap();
        let body = "--B\r\nContent-Disposition: form-data; name=\"f\"; filename=\"up.txt\"\r\n\r\nhello\r\n--B--\r\n";
        let request = format!(
            "POST /upload HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=B\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );

        let out = exchange(&files_config(&dir), request.as_bytes()).await;
        assert!(text(&out).ends_with("\r\n\r\nok"));
        assert_eq!(std::fs::read(dir.path().join("up.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn proxy_mode_rejects_post() {
        let mut config = ServerConfig::default();
        config.mode = ServiceMode::Proxy;
        let out = exchange(&config, b"POST / HTTP/1.1\r\nHost: origin\r\n\r\n").await;
        assert!(text(&out).starts_with("HTTP/1.1 501 Not Implemented\r\n"));
    }
}
