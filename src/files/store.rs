//! On-disk file store rooted at a single directory.
//!
//! # Responsibilities
//! - Map request paths to files strictly beneath the root
//! - Reduce uploaded filenames to a bare base name
//! - Stage uploads in a temporary file and publish them by rename
//!
//! # Design Decisions
//! - `..`, drive prefixes, backslashes and NUL are rejected rather than
//!   normalized away
//! - A failed or abandoned upload never leaves a partial file under the
//!   destination name; the staging file is removed
//! - Concurrent uploads of the same name each stage separately; the last
//!   rename wins

use std::io;
use std::path::{Component, Path, PathBuf};

use percent_encoding::percent_decode_str;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::FilesConfig;
use crate::error::ServiceError;

/// The directory every served and uploaded file lives under.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    overwrite: bool,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, overwrite: bool) -> Self {
        Self {
            root: root.into(),
            overwrite,
        }
    }

    pub fn from_config(config: &FilesConfig) -> Self {
        Self::new(config.root.clone(), config.overwrite)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if it does not exist yet.
    pub async fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    /// Map a request path (percent-encoded, `/`-separated) to a file path.
    pub fn resolve(&self, request_path: &str) -> Result<PathBuf, ServiceError> {
        let decoded = decode_path(request_path)?;

        let mut resolved = self.root.clone();
        let mut depth = 0usize;
        for component in Path::new(&decoded).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(segment) => {
                    resolved.push(segment);
                    depth += 1;
                }
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(ServiceError::invalid_path("path escapes the file store", request_path));
                }
            }
        }

        if depth == 0 {
            return Err(ServiceError::validation("missing target path"));
        }
        Ok(resolved)
    }

    /// Read a whole file named by a request path.
    pub async fn read(&self, request_path: &str) -> Result<Vec<u8>, ServiceError> {
        let path = self.resolve(request_path)?;
        fs::read(&path).await.map_err(|source| ServiceError::NotFound {
            path: request_path.to_string(),
            source,
        })
    }

    /// Open a staging file for an upload named `filename`.
    ///
    /// `filename` must already be a sanitized base name.
    pub async fn begin_upload(&self, filename: &str) -> Result<PendingUpload, ServiceError> {
        let dest_path = self.root.join(filename);
        if !self.overwrite && fs::try_exists(&dest_path).await.unwrap_or(false) {
            return Err(ServiceError::Conflict {
                path: filename.to_string(),
            });
        }

        let temp_path = self
            .root
            .join(format!(".{}.{}.part", filename, Uuid::new_v4().simple()));
        let file = File::create(&temp_path).await.map_err(ServiceError::Internal)?;

        Ok(PendingUpload {
            file,
            staging: StagingPath::new(temp_path),
            filename: filename.to_string(),
            dest_path,
            overwrite: self.overwrite,
        })
    }
}

/// Percent-decode a request path.
///
/// Extension checks must run on the decoded form: `%2F` becomes a real
/// separator once the path is resolved.
pub fn decode_path(request_path: &str) -> Result<String, ServiceError> {
    let decoded = percent_decode_str(request_path)
        .decode_utf8()
        .map_err(|_| ServiceError::invalid_path("path is not valid UTF-8", request_path))?;

    if decoded.contains(['\\', '\0']) {
        return Err(ServiceError::invalid_path("path contains forbidden characters", request_path));
    }
    Ok(decoded.into_owned())
}

/// Reduce a client-declared filename to its base name.
///
/// Both `/` and `\` count as separators. Returns `None` when nothing usable
/// remains (empty, `.` or `..`).
pub fn sanitize_filename(declared: &str) -> Option<String> {
    let base = declared
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    match base {
        "" | "." | ".." => None,
        name if name.contains('\0') => None,
        name => Some(name.to_string()),
    }
}

/// An upload being written to a staging file.
///
/// Call [`commit`](Self::commit) to publish it or [`abort`](Self::abort) to
/// discard it. Dropping it without either removes the staging file.
#[derive(Debug)]
pub struct PendingUpload {
    file: File,
    staging: StagingPath,
    filename: String,
    dest_path: PathBuf,
    overwrite: bool,
}

impl PendingUpload {
    /// Writer for the upload's bytes.
    pub fn writer(&mut self) -> &mut File {
        &mut self.file
    }

    /// Flush, close and move the staging file to its destination.
    pub async fn commit(self) -> Result<PathBuf, ServiceError> {
        let PendingUpload {
            mut file,
            staging,
            filename,
            dest_path,
            overwrite,
        } = self;

        file.flush().await.map_err(ServiceError::Internal)?;
        file.sync_all().await.map_err(ServiceError::Internal)?;
        drop(file);

        if overwrite {
            fs::rename(&staging.path, &dest_path)
                .await
                .map_err(ServiceError::Internal)?;
            staging.disarm();
        } else {
            // hard_link refuses to replace an existing destination.
            match fs::hard_link(&staging.path, &dest_path).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(ServiceError::Conflict { path: filename });
                }
                Err(err) => return Err(ServiceError::Internal(err)),
            }
            staging.remove().await;
        }

        Ok(dest_path)
    }

    /// Discard the staging file.
    pub async fn abort(self) {
        let PendingUpload { file, staging, .. } = self;
        drop(file);
        staging.remove().await;
    }
}

/// Staging file path, removed on drop unless disarmed.
#[derive(Debug)]
struct StagingPath {
    path: PathBuf,
    armed: bool,
}

impl StagingPath {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    async fn remove(mut self) {
        self.armed = false;
        if let Err(err) = fs::remove_file(&self.path).await {
            tracing::warn!(path = %self.path.display(), error = %err, "Failed to remove staging file");
        }
    }
}

impl Drop for StagingPath {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
