//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use filerelay::config::{ServerConfig, ServiceMode};
use filerelay::lifecycle::prepare;
use filerelay::net::{ConnectionTracker, ListenerError};
use filerelay::{HttpServer, Shutdown};

/// A server running on an ephemeral port for the duration of a test.
pub struct TestServer {
    pub addr: SocketAddr,
    pub root: TempDir,
    pub tracker: ConnectionTracker,
    shutdown: Shutdown,
    handle: JoinHandle<Result<(), ListenerError>>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn root_path(&self) -> &Path {
        self.root.path()
    }

    /// Trigger shutdown and wait for the accept loop to finish draining.
    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.handle).await;
    }
}

pub fn test_config(mode: ServiceMode, max_connections: usize) -> (ServerConfig, TempDir) {
    let root = tempfile::tempdir().unwrap();
    let mut config = ServerConfig::default();
    config.mode = mode;
    config.listener.bind_host = "127.0.0.1".into();
    config.listener.port = 0;
    config.listener.max_connections = max_connections;
    config.files.root = root.path().to_path_buf();
    config.timeouts.connect_secs = 2;
    config.timeouts.drain_secs = 2;
    (config, root)
}

pub async fn start_server(config: ServerConfig, root: TempDir) -> TestServer {
    let listener = prepare(&config).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(&config);
    let tracker = server.connection_tracker();
    let shutdown = Shutdown::new();
    let handle = tokio::spawn(server.run(listener, shutdown.subscribe()));

    TestServer {
        addr,
        root,
        tracker,
        shutdown,
        handle,
    }
}

pub async fn start_files_server() -> TestServer {
    let (config, root) = test_config(ServiceMode::Files, 10);
    start_server(config, root).await
}

pub async fn start_proxy_server() -> TestServer {
    let (config, root) = test_config(ServiceMode::Proxy, 10);
    start_server(config, root).await
}

/// Start a mock origin that answers every connection with `response`
/// once it has read the request head, then closes.
pub async fn start_mock_origin(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                if !read_head(&mut socket).await {
                    return;
                }
                let _ = socket.write_all(response).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// Start a mock origin that reads the request and closes without replying.
pub async fn start_closing_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                read_head(&mut socket).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// Start a mock origin that closes with the request still unread, so the
/// kernel answers with a reset instead of a clean end of stream.
pub async fn start_resetting_origin() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = socket.readable().await;
                drop(socket);
            });
        }
    });

    addr
}

async fn read_head(socket: &mut TcpStream) -> bool {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.ends_with(b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return false,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
    true
}

/// An address nothing listens on.
pub async fn unused_addr() -> SocketAddr {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);
    addr
}

/// HTTP client that neither pools connections nor honors proxy variables.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Send raw bytes and collect everything until the server closes.
pub async fn raw_request(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response))
        .await
        .expect("server did not close the connection")
        .unwrap();
    response
}
