//! Authentication module for managing credentials and sessions.
//!
//! This module provides:
//! - `SessionManager`: owns the refresh/session credential pair, injects the
//!   session credential into requests and renews it (single-flight) on demand
//! - `CredentialStore`: persistence for the pair (keychain, file or memory)
//! - `LoginExchange`: password, Google and one-time-link login flows
//!
//! A session credential never outlives the refresh credential it came from.

pub mod credentials;
pub mod login;
pub mod otp;
pub mod session;

pub use credentials::{
    CredentialKind, CredentialStore, FileStore, KeyringStore, MemoryStore, RefreshCredential,
    SessionCredential, StorageError,
};
pub use login::{LoginError, LoginExchange, OtpRedemption};
pub use otp::take_otp_payload;
pub use session::{SessionError, SessionManager, SessionState, DEFAULT_RENEWAL_PATH};
