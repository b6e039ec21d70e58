//! Authenticating forward proxy for services behind an identity-aware access gateway.
//!
//! Every request sent to the listening address is forwarded to one configured
//! backend with a bearer token attached and hop-by-hop headers stripped on
//! both legs.

pub mod auth;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod security;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
