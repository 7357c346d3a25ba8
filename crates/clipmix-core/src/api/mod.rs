//! HTTP plumbing for the clipmix backend.
//!
//! This module provides:
//! - `RawTransport`: the bare request seam (no credential injection, no retry)
//! - `HttpTransport`: the `reqwest` implementation of that seam
//! - `ApiClient`: typed JSON calls routed through the session manager
//!
//! Authenticated traffic always goes through `auth::SessionManager`; the
//! transport itself never decides which bearer credential to send.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{ApiClient, UserInfo};
pub use error::{human_readable_error, ApiError, TransportError};
pub use transport::{HttpTransport, RawResponse, RawTransport, RequestSpec, StatusClass};
