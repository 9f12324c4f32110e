//! Bounded-concurrency HTTP/1.x file server and GET forwarding proxy.

pub mod config;
pub mod error;
pub mod files;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod resilience;
pub mod routing;

pub use config::schema::ServerConfig;
pub use error::ServiceError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
