//! Core library for clipmix.
//!
//! Owns everything about staying logged in to the clipmix backend: the
//! credential store, the session manager with its renew-and-retry protocol,
//! the login flows that mint credentials, and a typed client for
//! authenticated calls.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, HttpTransport, RawResponse, RawTransport, RequestSpec};
pub use auth::{
    CredentialKind, CredentialStore, LoginError, LoginExchange, SessionError, SessionManager,
    SessionState,
};
pub use config::{Config, StorageBackend};
