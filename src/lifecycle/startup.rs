//! Startup orchestration.
//!
//! # Responsibilities
//! - Load configuration and apply command-line overrides
//! - Validate the merged configuration
//! - Create the file store root (file mode)
//! - Bind the listener
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Overrides are applied before validation so a bad flag is reported like
//!   a bad config value

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::{
    load_config, validate_config, ConfigError, LogFormat, ServerConfig, ServiceMode,
};
use crate::files::FileStore;
use crate::net::{Listener, ListenerError};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to prepare file root {root}: {source}")]
    Store {
        root: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Listener(#[from] ListenerError),
}

/// Values supplied on the command line; `None` keeps the configured value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: u16,
    pub mode: Option<ServiceMode>,
    pub root: Option<PathBuf>,
    pub max_connections: Option<usize>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
}

impl Overrides {
    pub fn apply(&self, config: &mut ServerConfig) {
        config.listener.port = self.port;
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(root) = &self.root {
            config.files.root = root.clone();
        }
        if let Some(max) = self.max_connections {
            config.listener.max_connections = max;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
    }
}

/// Load `path` (or defaults), apply `overrides` and validate the result.
pub fn build_config(path: Option<&Path>, overrides: &Overrides) -> Result<ServerConfig, StartupError> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    overrides.apply(&mut config);
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Prepare on-disk state and bind the listener.
pub async fn prepare(config: &ServerConfig) -> Result<Listener, StartupError> {
    if config.mode == ServiceMode::Files {
        let store = FileStore::from_config(&config.files);
        store.prepare().await.map_err(|source| StartupError::Store {
            root: store.root().to_path_buf(),
            source,
        })?;
        tracing::info!(root = %store.root().display(), "File store ready");
    }

    Ok(Listener::bind(&config.listener).await?)
}
