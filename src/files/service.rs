//! GET and upload handlers for the static file service.

use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::error::ServiceError;
use crate::files::policy::ExtensionPolicy;
use crate::files::store::{decode_path, sanitize_filename, FileStore};
use crate::http::multipart::{self, Multipart};
use crate::http::request::RequestHead;
use crate::http::response::{Response, Status};

/// Serves and accepts whitelisted files beneath the store root.
#[derive(Debug, Clone)]
pub struct FileService {
    store: Arc<FileStore>,
    policy: Arc<ExtensionPolicy>,
    max_part_header_bytes: usize,
}

impl FileService {
    pub fn new(store: Arc<FileStore>, policy: Arc<ExtensionPolicy>, max_part_header_bytes: usize) -> Self {
        Self {
            store,
            policy,
            max_part_header_bytes,
        }
    }

    /// Return the whole file named by `path` with its policy content type.
    pub async fn get(&self, path: &str) -> Result<Response, ServiceError> {
        let content_type = self
            .policy
            .content_type(&decode_path(path)?)
            .ok_or_else(|| ServiceError::invalid_path("extension not allowed", path))?
            .to_string();

        let body = self.store.read(path).await?;
        tracing::debug!(path, bytes = body.len(), content_type = %content_type, "Serving file");
        Ok(Response::new(Status::Ok, content_type, body))
    }

    /// Store the first file part of a multipart body.
    ///
    /// The part is streamed to a staging file and published by rename; on
    /// any failure the staging file is removed.
    pub async fn upload<R>(&self, head: &RequestHead, body: Option<R>) -> Result<Response, ServiceError>
    where
        R: AsyncRead + Unpin,
    {
        let body = body.ok_or_else(|| ServiceError::validation("upload has no body"))?;
        let content_type = head
            .content_type()
            .ok_or_else(|| ServiceError::validation("upload has no content type"))?;
        let boundary = multipart::boundary(content_type)?;

        let mut form = Multipart::new(body, &boundary, self.max_part_header_bytes);
        let declared = loop {
            match form.next_part().await? {
                Some(part) => {
                    if let Some(filename) = part.filename() {
                        break filename.to_string();
                    }
                    tracing::trace!(field = ?part.name(), "Skipping non-file part");
                }
                None => return Err(ServiceError::validation("no file part in upload")),
            }
        };

        if declared.is_empty() {
            return Err(ServiceError::validation("file part has an empty filename"));
        }
        let filename = sanitize_filename(&declared)
            .ok_or_else(|| ServiceError::invalid_path("unusable filename", declared.as_str()))?;
        if !self.policy.allows(&filename) {
            return Err(ServiceError::invalid_path("extension not allowed", filename));
        }

        let mut pending = self.store.begin_upload(&filename).await?;
        match form.copy_part_to(pending.writer()).await {
            Ok(bytes) => {
                let path = pending.commit().await?;
                tracing::info!(file = %filename, bytes, path = %path.display(), "Upload stored");
                Ok(Response::ok())
            }
            Err(err) => {
                tracing::warn!(file = %filename, error = %err, "Upload failed, discarding");
                pending.abort().await;
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::{read_request, ParseLimits};
    use tempfile::TempDir;

    fn service(dir: &TempDir, overwrite: bool) -> FileService {
        FileService::new(
            Arc::new(FileStore::new(dir.path(), overwrite)),
            Arc::new(ExtensionPolicy::default()),
            1024,
        )
    }

    fn upload_request(filename: &str, data: &str) -> Vec<u8> {
        let body = format!(
            "--XX\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nignored\r\n\
             --XX\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\
             Content-Type: text/plain\r\n\r\n{}\r\n--XX--\r\n",
            filename, data
        );
        format!(
            "POST / HTTP/1.1\r\nHost: test\r\nContent-Type: multipart/form-data; boundary=XX\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes()
    }

    async fn run_upload(service: &FileService, raw: &[u8]) -> Result<Response, ServiceError> {
        let mut input = raw;
        let request = read_request(&mut input, &ParseLimits::default()).await.unwrap();
        let (head, body) = request.into_parts();
        service.upload(&head, body).await
    }

    #[tokio::test]
    async fn get_returns_bytes_and_type() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page.html"), b"<h1>hi</h1>").unwrap();

        let response = service(&dir, true).get("/page.html").await.unwrap();
        assert_eq!(response.status(), Status::Ok);
        assert_eq!(response.content_type(), "text/html");
        assert_eq!(response.body().as_ref(), b"<h1>hi</h1>");
    }

    #[tokio::test]
    async fn get_disallowed_extension_is_validation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tool.exe"), b"MZ").unwrap();
        let err = service(&dir, true).get("/tool.exe").await.unwrap_err();
        assert_eq!(err.status(), Status::BadRequest);
    }

    #[tokio::test]
    async fn get_checks_extension_of_decoded_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("secret.conf")).unwrap();
        std::fs::write(dir.path().join("secret.conf/.txt"), b"hidden").unwrap();

        let err = service(&dir, true).get("/secret.conf%2F.txt").await.unwrap_err();
        assert_eq!(err.status(), Status::BadRequest);
    }

    #[tokio::test]
    async fn upload_stores_first_file_part() {
        let dir = tempfile::tempdir().unwrap();
        let response = run_upload(&service(&dir, true), &upload_request("test.txt", "hello"))
            .await
            .unwrap();

        assert_eq!(response, Response::ok());
        assert_eq!(std::fs::read(dir.path().join("test.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn upload_strips_directories() {
        let dir = tempfile::tempdir().unwrap();
        run_upload(&service(&dir, true), &upload_request("../../evil/x.css", "a{}"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("x.css")).unwrap(), b"a{}");
    }

    #[tokio::test]
    async fn upload_rejects_bad_extension_without_creating_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_upload(&service(&dir, true), &upload_request("payload.sh", "rm -rf"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::BadRequest);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn upload_rejects_dotfile_name() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_upload(&service(&dir, true), &upload_request(".txt", "data"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::BadRequest);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn upload_rejects_empty_filename() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_upload(&service(&dir, true), &upload_request("", "data"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::BadRequest);
    }

    #[tokio::test]
    async fn upload_without_file_part() {
        let dir = tempfile::tempdir().unwrap();
        let body = "--XX\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n--XX--\r\n";
        let raw = format!(
            "POST / HTTP/1.1\r\nHost: t\r\nContent-Type: multipart/form-data; boundary=XX\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let err = run_upload(&service(&dir, true), raw.as_bytes()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation { .. }));
    }

    #[tokio::test]
    async fn upload_requires_multipart_body() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(&dir, true);

        let no_body = b"POST / HTTP/1.1\r\nHost: t\r\n\r\n";
        assert_eq!(run_upload(&svc, no_body).await.unwrap_err().status(), Status::BadRequest);

        let json = b"POST / HTTP/1.1\r\nHost: t\r\nContent-Type: application/json\r\nContent-Length: 2\r\n\r\n{}";
        assert_eq!(run_upload(&svc, json).await.unwrap_err().status(), Status::BadRequest);
    }

    #[tokio::test]
    async fn truncated_upload_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = upload_request("big.txt", "0123456789");
        raw.truncate(raw.len() - 15);

        let err = run_upload(&service(&dir, true), &raw).await.unwrap_err();
        assert_eq!(err.status(), Status::BadRequest);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn collision_policy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("same.txt"), b"old").unwrap();

        let err = run_upload(&service(&dir, false), &upload_request("same.txt", "new"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::Conflict);
        assert_eq!(std::fs::read(dir.path().join("same.txt")).unwrap(), b"old");

        run_upload(&service(&dir, true), &upload_request("same.txt", "new"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("same.txt")).unwrap(), b"new");
    }
}
