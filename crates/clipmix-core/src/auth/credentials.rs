use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Keychain service name for credential entries
pub const SERVICE_NAME: &str = "clipmix";

/// Credential file name in cache directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Long-lived credential, only ever used to obtain session credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshCredential(String);

impl RefreshCredential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RefreshCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RefreshCredential(<redacted>)")
    }
}

/// Short-lived credential attached to ordinary authenticated calls.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredential(String);

impl SessionCredential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionCredential(<redacted>)")
    }
}

/// Token payload returned by every endpoint that issues a credential.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TokenResponse {
    pub token: String,
}

impl TokenResponse {
    /// The token, if the server actually sent one
    pub fn into_token(self) -> Option<String> {
        let token = self.token.trim();
        if token.is_empty() {
            None
        } else {
            Some(token.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    Refresh,
    Session,
}

impl CredentialKind {
    pub const ALL: [CredentialKind; 2] = [CredentialKind::Refresh, CredentialKind::Session];

    /// Fixed storage key for this kind
    pub fn key(self) -> &'static str {
        match self {
            CredentialKind::Refresh => "refresh_token",
            CredentialKind::Session => "session_token",
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Credential storage unavailable: {0}")]
    Unavailable(String),

    #[error("Credential file is corrupt: {0}")]
    Corrupt(String),
}

/// Synchronous key/value persistence for the two credentials.
pub trait CredentialStore: Send + Sync {
    fn get(&self, kind: CredentialKind) -> Result<Option<String>, StorageError>;
    fn set(&self, kind: CredentialKind, value: &str) -> Result<(), StorageError>;
    fn clear(&self, kind: CredentialKind) -> Result<(), StorageError>;
}

/// Credentials kept in the OS keychain, one entry per kind.
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, kind: CredentialKind) -> Result<Entry, StorageError> {
        Entry::new(&self.service, kind.key())
            .map_err(|e| StorageError::Unavailable(format!("Failed to create keyring entry: {}", e)))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}

impl CredentialStore for KeyringStore {
    fn get(&self, kind: CredentialKind) -> Result<Option<String>, StorageError> {
        match self.entry(kind)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StorageError::Unavailable(format!(
                "Failed to read {} from keychain: {}",
                kind.key(),
                e
            ))),
        }
    }

    /// Store `value`, then read it back through a fresh entry. A keychain
    /// that accepts writes it cannot return (such as keyring's mock backend
    /// on a platform without native support) is reported as unavailable.
    fn set(&self, kind: CredentialKind, value: &str) -> Result<(), StorageError> {
        self.entry(kind)?.set_password(value).map_err(|e| {
            StorageError::Unavailable(format!("Failed to store {} in keychain: {}", kind.key(), e))
        })?;
        match self.get(kind)? {
            Some(stored) if stored == value => Ok(()),
            _ => Err(StorageError::Unavailable(format!(
                "Keychain did not keep {}; no persistent keychain backend available",
                kind.key()
            ))),
        }
    }

    fn clear(&self, kind: CredentialKind) -> Result<(), StorageError> {
        match self.entry(kind)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StorageError::Unavailable(format!(
                "Failed to delete {} from keychain: {}",
                kind.key(),
                e
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCredential {
    value: String,
    updated_at: DateTime<Utc>,
}

/// Credentials kept in a JSON file, for machines without a usable keychain.
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(cache_dir: &Path) -> Self {
        Self::at_path(cache_dir.join(CREDENTIALS_FILE))
    }

    pub fn at_path(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_all(&self) -> Result<HashMap<String, StoredCredential>, StorageError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| StorageError::Unavailable(format!("Failed to read credential file: {}", e)))?;
        serde_json::from_str(&contents).map_err(|e| StorageError::Corrupt(e.to_string()))
    }

    fn save_all(&self, entries: &HashMap<String, StoredCredential>) -> Result<(), StorageError> {
        if entries.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path).map_err(|e| {
                    StorageError::Unavailable(format!("Failed to remove credential file: {}", e))
                })?;
            }
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Unavailable(format!("Failed to create cache dir: {}", e)))?;
        }
        let contents = serde_json::to_string_pretty(entries).map_err(|e| {
            StorageError::Unavailable(format!("Failed to encode credentials: {}", e))
        })?;

        // Write a private temp file next to the target, then swap it in
        let temp_path = self.temp_path();
        let _ = std::fs::remove_file(&temp_path);
        let result = write_private(&temp_path, contents.as_bytes())
            .and_then(|()| std::fs::rename(&temp_path, &self.path));
        if let Err(e) = result {
            let _ = std::fs::remove_file(&temp_path);
            return Err(StorageError::Unavailable(format!(
                "Failed to write credential file: {}",
                e
            )));
        }
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| CREDENTIALS_FILE.to_string());
        self.path
            .with_file_name(format!(".{}.tmp.{}", name, std::process::id()))
    }
}

/// Create `path` readable by the owner only and fill it with `contents`.
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

impl CredentialStore for FileStore {
    fn get(&self, kind: CredentialKind) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load_all()?.remove(kind.key()).map(|stored| stored.value))
    }

    fn set(&self, kind: CredentialKind, value: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.load_all()?;
        entries.insert(
            kind.key().to_string(),
            StoredCredential {
                value: value.to_string(),
                updated_at: Utc::now(),
            },
        );
        self.save_all(&entries)
    }

    fn clear(&self, kind: CredentialKind) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.load_all()?;
        if entries.remove(kind.key()).is_some() {
            self.save_all(&entries)?;
        }
        Ok(())
    }
}

/// Credentials held only for the lifetime of the process.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<CredentialKind, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self, kind: CredentialKind) -> Result<Option<String>, StorageError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(&kind).cloned())
    }

    fn set(&self, kind: CredentialKind, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(kind, value.to_string());
        Ok(())
    }

    fn clear(&self, kind: CredentialKind) -> Result<(), StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&kind);
        Ok(())
    }
}

// Lets a caller keep a handle on the store it gave to a session manager,
// which is how restarts are simulated.
impl<S: CredentialStore + ?Sized> CredentialStore for std::sync::Arc<S> {
    fn get(&self, kind: CredentialKind) -> Result<Option<String>, StorageError> {
        (**self).get(kind)
    }

    fn set(&self, kind: CredentialKind, value: &str) -> Result<(), StorageError> {
        (**self).set(kind, value)
    }

    fn clear(&self, kind: CredentialKind) -> Result<(), StorageError> {
        (**self).clear(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("clipmix-test-{}-{}", name, std::process::id()))
            .join(CREDENTIALS_FILE)
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let refresh = RefreshCredential::new("super-secret");
        let session = SessionCredential::new("also-secret");
        assert!(!format!("{:?}", refresh).contains("super-secret"));
        assert!(!format!("{:?}", session).contains("also-secret"));
        assert_eq!(refresh.as_str(), "super-secret");
    }

    #[test]
    fn test_kind_keys_are_distinct() {
        assert_ne!(CredentialKind::Refresh.key(), CredentialKind::Session.key());
    }

    #[test]
    fn test_token_response_rejects_blank_token() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"token": "  ", "token_type": "bearer"}"#).expect("valid json");
        assert_eq!(response.into_token(), None);

        let response: TokenResponse = serde_json::from_str(r#"{"token": "abc"}"#).expect("valid json");
        assert_eq!(response.into_token(), Some("abc".to_string()));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert_eq!(store.get(CredentialKind::Refresh).unwrap(), None);

        store.set(CredentialKind::Refresh, "r1").unwrap();
        store.set(CredentialKind::Session, "s1").unwrap();
        assert_eq!(store.get(CredentialKind::Refresh).unwrap().as_deref(), Some("r1"));

        store.clear(CredentialKind::Session).unwrap();
        assert_eq!(store.get(CredentialKind::Session).unwrap(), None);
        assert_eq!(store.get(CredentialKind::Refresh).unwrap().as_deref(), Some("r1"));

        // Clearing twice is fine
        store.clear(CredentialKind::Session).unwrap();
    }

    #[test]
    fn test_file_store_round_trip() {
        let path = temp_path("round-trip");
        let _ = std::fs::remove_file(&path);

        let store = FileStore::at_path(path.clone());
        store.set(CredentialKind::Refresh, "r1").unwrap();
        store.set(CredentialKind::Session, "s1").unwrap();

        let reopened = FileStore::at_path(path.clone());
        assert_eq!(reopened.get(CredentialKind::Refresh).unwrap().as_deref(), Some("r1"));
        assert_eq!(reopened.get(CredentialKind::Session).unwrap().as_deref(), Some("s1"));

        reopened.clear(CredentialKind::Session).unwrap();
        reopened.clear(CredentialKind::Refresh).unwrap();
        assert!(!path.exists());
        assert_eq!(store.get(CredentialKind::Refresh).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let path = temp_path("private");
        let _ = std::fs::remove_file(&path);

        let store = FileStore::at_path(path.clone());
        store.set(CredentialKind::Refresh, "r1").unwrap();
        store.set(CredentialKind::Session, "s1").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!store.temp_path().exists());

        store.clear(CredentialKind::Session).unwrap();
        store.clear(CredentialKind::Refresh).unwrap();
    }

    #[test]
    fn test_file_store_replaces_leftover_temp_file() {
        let path = temp_path("leftover");
        let _ = std::fs::remove_file(&path);

        let store = FileStore::at_path(path.clone());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(store.temp_path(), "half written").unwrap();

        store.set(CredentialKind::Refresh, "r1").unwrap();
        assert_eq!(store.get(CredentialKind::Refresh).unwrap().as_deref(), Some("r1"));
        assert!(!store.temp_path().exists());

        store.clear(CredentialKind::Refresh).unwrap();
    }

    // Needs a real OS keychain
    #[test]
    #[ignore]
    fn test_keyring_store_survives_new_instance() {
        let service = format!("clipmix-test-{}", std::process::id());
        let writer = KeyringStore::new(service.clone());
        writer.set(CredentialKind::Refresh, "r-keychain").unwrap();

        let reader = KeyringStore::new(service);
        assert_eq!(reader.get(CredentialKind::Refresh).unwrap().as_deref(), Some("r-keychain"));

        reader.clear(CredentialKind::Refresh).unwrap();
        assert_eq!(writer.get(CredentialKind::Refresh).unwrap(), None);
    }

    #[test]
    fn test_file_store_corrupt_file() {
        let path = temp_path("corrupt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "not json").unwrap();

        let store = FileStore::at_path(path.clone());
        assert!(matches!(
            store.get(CredentialKind::Refresh),
            Err(StorageError::Corrupt(_))
        ));

        let _ = std::fs::remove_file(&path);
    }
}
