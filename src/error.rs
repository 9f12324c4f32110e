//! Per-request failure taxonomy.
//!
//! Every handler returns `Result<_, ServiceError>`; the connection task turns
//! an error into exactly one terminal response via [`ServiceError::to_response`].

use std::io;

use thiserror::Error;

use crate::http::multipart::MultipartError;
use crate::http::request::ParseError;
use crate::http::response::{Response, Status};

/// Errors that end the handling of one request.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request could not be parsed.
    #[error("malformed request: {0}")]
    Protocol(#[source] ParseError),

    /// The request framing uses a transfer coding we do not implement.
    #[error("unsupported transfer coding {0:?}")]
    UnsupportedTransferEncoding(String),

    /// Method not served in this deployment mode.
    #[error("method {0} not implemented")]
    UnsupportedMethod(String),

    /// Request is well-formed but not acceptable (extension, target, upload shape).
    #[error("{reason}")]
    Validation {
        reason: String,
        path: Option<String>,
    },

    /// The upload body is not usable multipart.
    #[error("invalid upload: {0}")]
    Upload(#[source] MultipartError),

    /// The requested file could not be read.
    #[error("{path} not found")]
    NotFound {
        path: String,
        #[source]
        source: io::Error,
    },

    /// Upload target exists and overwriting is disabled.
    #[error("{path} already exists")]
    Conflict { path: String },

    /// The origin could not be reached.
    #[error("upstream {authority} unavailable: {source}")]
    UpstreamUnavailable {
        authority: String,
        #[source]
        source: io::Error,
    },

    /// I/O failure after the request was accepted.
    #[error("internal failure: {0}")]
    Internal(#[source] io::Error),
}

impl ServiceError {
    pub fn validation(reason: impl Into<String>) -> Self {
        ServiceError::Validation {
            reason: reason.into(),
            path: None,
        }
    }

    pub fn invalid_path(reason: impl Into<String>, path: impl Into<String>) -> Self {
        ServiceError::Validation {
            reason: reason.into(),
            path: Some(path.into()),
        }
    }

    /// Response status for this error.
    pub fn status(&self) -> Status {
        match self {
            ServiceError::Protocol(_) => Status::BadRequest,
            ServiceError::UnsupportedTransferEncoding(_) => Status::NotImplemented,
            ServiceError::UnsupportedMethod(_) => Status::NotImplemented,
            ServiceError::Validation { .. } => Status::BadRequest,
            ServiceError::Upload(err) if err.is_client_error() => Status::BadRequest,
            ServiceError::Upload(_) => Status::InternalServerError,
            ServiceError::NotFound { .. } => Status::NotFound,
            ServiceError::Conflict { .. } => Status::Conflict,
            ServiceError::UpstreamUnavailable { .. } => Status::BadGateway,
            ServiceError::Internal(_) => Status::InternalServerError,
        }
    }

    /// Plain-text response naming the status and, where known, the path.
    pub fn to_response(&self) -> Response {
        let status = self.status();
        let detail = match self {
            ServiceError::NotFound { path, .. } => Some(format!("{} not found", path)),
            ServiceError::Conflict { path } => Some(format!("{} already exists", path)),
            ServiceError::Validation {
                path: Some(path), ..
            } => Some(format!("{} ({})", status.reason(), path)),
            _ => None,
        };
        Response::error(status, detail.as_deref())
    }
}

impl From<ParseError> for ServiceError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::TransferEncoding(coding) => ServiceError::UnsupportedTransferEncoding(coding),
            other => ServiceError::Protocol(other),
        }
    }
}

impl From<MultipartError> for ServiceError {
    fn from(err: MultipartError) -> Self {
        ServiceError::Upload(err)
    }
}
