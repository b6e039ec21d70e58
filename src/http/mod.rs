//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, every request to one handler)
//!     → forward.rs (rewrite, authenticate, sanitize, dispatch)
//!     → backend
//!     → forward.rs (sanitize, relay status + headers, stream body)
//!     → Send to client
//! ```

pub mod forward;
pub mod server;

pub use forward::{AppState, Backend, ForwardConfig, ForwardError, SetupError};
pub use server::HttpServer;
