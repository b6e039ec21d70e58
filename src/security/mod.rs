//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound request:
//!     → headers.rs (strip hop-by-hop, fold X-Forwarded-For)
//!     → backend
//! Backend response:
//!     → headers.rs (strip hop-by-hop, copy onto caller response)
//! ```

pub mod headers;
