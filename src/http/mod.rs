//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (slot held)
//!     → server.rs (per-connection task, deadlines)
//!     → request.rs (request line, headers, lazy body)
//!     → [routing layer picks file service or proxy]
//!     → multipart.rs (upload bodies only)
//!     → response.rs (status line, headers, body)
//!     → close
//! ```

pub mod multipart;
pub mod request;
pub mod response;
pub mod server;

pub use request::{read_request, Body, Headers, Method, ParseError, ParseLimits, Request, RequestHead, Target, Version};
pub use response::{Response, Status};
pub use server::HttpServer;
