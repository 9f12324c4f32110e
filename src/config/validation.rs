//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (capacity > 0, limits > 0, timeouts > 0)
//! - Check the extension policy is usable as a whitelist
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use thiserror::Error;

use crate::config::schema::ServerConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("files.root must not be empty")]
    EmptyRoot,

    #[error("files.extensions must list at least one extension")]
    EmptyPolicy,

    #[error("files.extensions key {0:?} must be a bare extension without dots or slashes")]
    BadExtension(String),

    #[error("files.extensions.{0} has an empty content type")]
    EmptyContentType(String),

    #[error("listener.bind_host must not be empty")]
    EmptyBindHost,
}

/// Check every semantic rule and collect all violations.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_host.trim().is_empty() {
        errors.push(ValidationError::EmptyBindHost);
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::Zero { field: "listener.max_connections" });
    }

    if config.files.root.as_os_str().is_empty() {
        errors.push(ValidationError::EmptyRoot);
    }
    if config.files.extensions.is_empty() {
        errors.push(ValidationError::EmptyPolicy);
    }
    for (ext, mime) in &config.files.extensions {
        if ext.is_empty() || ext.contains(['.', '/', '\\']) {
            errors.push(ValidationError::BadExtension(ext.clone()));
        }
        if mime.trim().is_empty() {
            errors.push(ValidationError::EmptyContentType(ext.clone()));
        }
    }

    let limits = [
        ("parser.max_line_bytes", config.parser.max_line_bytes as u64),
        ("parser.max_headers", config.parser.max_headers as u64),
        ("parser.max_part_header_bytes", config.parser.max_part_header_bytes as u64),
        ("timeouts.header_secs", config.timeouts.header_secs),
        ("timeouts.idle_secs", config.timeouts.idle_secs),
        ("timeouts.connect_secs", config.timeouts.connect_secs),
    ];
    for (field, value) in limits {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
