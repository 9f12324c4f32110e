//! Request dispatch.
//!
//! # Responsibilities
//! - Decide, from the request head alone, which handler serves a request
//! - Reject unsupported methods and unacceptable targets before any file
//!   system or network access
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - The deployment mode is fixed at startup; a router never mixes roles

use std::sync::Arc;

use crate::config::ServiceMode;
use crate::error::ServiceError;
use crate::files::{decode_path, ExtensionPolicy};
use crate::http::request::{Method, RequestHead};
use crate::proxy::ProxyTarget;

/// Where a request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Serve a file; `path` is the raw (still percent-encoded) target path.
    ServeFile { path: String },
    /// Store the multipart upload in the body.
    Upload,
    /// Forward the GET to an origin.
    Forward(ProxyTarget),
}

#[derive(Debug, Clone)]
pub struct Router {
    mode: ServiceMode,
    policy: Arc<ExtensionPolicy>,
}

impl Router {
    pub fn new(mode: ServiceMode, policy: Arc<ExtensionPolicy>) -> Self {
        Self { mode, policy }
    }

    pub fn mode(&self) -> ServiceMode {
        self.mode
    }

    /// Pick the route for a request head.
    pub fn route(&self, head: &RequestHead) -> Result<Route, ServiceError> {
        match self.mode {
            ServiceMode::Files => self.route_files(head),
            ServiceMode::Proxy => route_proxy(head),
        }
    }

    fn route_files(&self, head: &RequestHead) -> Result<Route, ServiceError> {
        match head.method() {
            Method::Get => {
                let path = head.target().path();
                if path.is_empty() || path == "/" {
                    return Err(ServiceError::validation("missing target path"));
                }
                if !self.policy.allows(&decode_path(path)?) {
                    return Err(ServiceError::invalid_path("extension not allowed", path));
                }
                Ok(Route::ServeFile {
                    path: path.to_string(),
                })
            }
            Method::Post => Ok(Route::Upload),
            other => Err(ServiceError::UnsupportedMethod(other.to_string())),
        }
    }
}

fn route_proxy(head: &RequestHead) -> Result<Route, ServiceError> {
    match head.method() {
        Method::Get => ProxyTarget::from_head(head).map(Route::Forward),
        other => Err(ServiceError::UnsupportedMethod(other.to_string())),
    }
}
