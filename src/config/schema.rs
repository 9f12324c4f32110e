//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Which role this deployment plays.
    pub mode: ServiceMode,

    /// Listener configuration (bind host, admission capacity).
    pub listener: ListenerConfig,

    /// Static file service settings.
    pub files: FilesConfig,

    /// Request parser limits.
    pub parser: ParserConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Deployment role. File service and proxy never share a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// Serve and accept files beneath the store root.
    #[default]
    Files,
    /// Forward GET requests to the origin named by the request.
    Proxy,
}

impl std::fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceMode::Files => f.write_str("files"),
            ServiceMode::Proxy => f.write_str("proxy"),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Host or IP to bind (the port is supplied on the command line).
    pub bind_host: String,

    /// Port to bind. `0` asks the OS for an ephemeral port.
    pub port: u16,

    /// Maximum concurrently admitted connections.
    pub max_connections: usize,
}

impl ListenerConfig {
    /// `host:port` string handed to `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        if self.bind_host.contains(':') && !self.bind_host.starts_with('[') {
            format!("[{}]:{}", self.bind_host, self.port)
        } else {
            format!("{}:{}", self.bind_host, self.port)
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 8080,
            max_connections: 10,
        }
    }
}

/// Static file service configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Directory all served and uploaded files live under.
    pub root: PathBuf,

    /// Replace an existing file on upload (otherwise 409 Conflict).
    pub overwrite: bool,

    /// Extension (without the dot) to MIME type. Unlisted extensions are rejected.
    pub extensions: BTreeMap<String, String>,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("public"),
            overwrite: true,
            extensions: default_extensions(),
        }
    }
}

fn default_extensions() -> BTreeMap<String, String> {
    [
        ("html", "text/html"),
        ("css", "text/css"),
        ("txt", "text/plain"),
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("gif", "image/gif"),
    ]
    .into_iter()
    .map(|(ext, mime)| (ext.to_string(), mime.to_string()))
    .collect()
}

/// Limits enforced by the request and multipart parsers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Longest accepted request or header line, excluding CRLF.
    pub max_line_bytes: usize,

    /// Maximum number of header lines per request.
    pub max_headers: usize,

    /// Maximum size of a single multipart part's header block.
    pub max_part_header_bytes: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: 8 * 1024,
            max_headers: 100,
            max_part_header_bytes: 8 * 1024,
        }
    }
}

/// Timeout configuration for the inbound and outbound connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed for the full request head to arrive, in seconds.
    pub header_secs: u64,

    /// Idle read/write timeout on either connection, in seconds.
    pub idle_secs: u64,

    /// Origin connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// How long shutdown waits for in-flight connections, in seconds.
    pub drain_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            header_secs: 30,
            idle_secs: 60,
            connect_secs: 10,
            drain_secs: 30,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level directive (trace, debug, info, warn, error).
    pub level: String,

    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}
