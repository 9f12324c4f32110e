//! Static file service subsystem.
//!
//! # Data Flow
//! ```text
//! GET  /name.ext  → policy.rs (extension → content type)
//!                 → store.rs (resolve beneath root, read)
//!                 → 200 with file bytes
//!
//! POST multipart  → http::multipart (first file part)
//!                 → store.rs (sanitize name, stage, rename)
//!                 → 200 "ok"
//! ```

pub mod policy;
pub mod service;
pub mod store;

pub use policy::ExtensionPolicy;
pub use service::FileService;
pub use store::{decode_path, sanitize_filename, FileStore, PendingUpload};
