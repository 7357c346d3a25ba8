//! API client for authenticated calls to the clipmix backend.
//!
//! `ApiClient` is a thin typed layer over `SessionManager::authenticated_request`:
//! it encodes JSON bodies, decodes JSON responses, maps error statuses and
//! backs off on rate limiting. Credential handling stays in the manager.

use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::SessionManager;

use super::{ApiError, RawResponse, RequestSpec, StatusClass};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

const USER_INFO_PATH: &str = "/users/me";
const DELETE_ACCOUNT_PATH: &str = "/users/myself";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub email: String,
}

/// Typed access to authenticated endpoints.
/// Clone is cheap - the session manager is shared.
#[derive(Clone)]
pub struct ApiClient {
    session: SessionManager,
    initial_backoff: Duration,
}

impl ApiClient {
    pub fn new(session: SessionManager) -> Self {
        Self {
            session,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        }
    }

    /// Override the first rate-limit backoff delay (doubles on each retry)
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Send through the session manager, retrying on 429 with exponential backoff.
    async fn send(&self, request: RequestSpec) -> Result<RawResponse, ApiError> {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = self.session.authenticated_request(request.clone()).await?;

            match response.class() {
                StatusClass::Success => return Ok(response),
                StatusClass::RateLimited => {
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(
                        path = request.path(),
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                _ => return Err(ApiError::from_status(response.status(), response.text())),
            }
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestSpec) -> Result<T, ApiError> {
        let path = request.path().to_string();
        let response = self.send(request).await?;
        response.json().map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response from {}: {}", path, e))
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(RequestSpec::get(path)).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode request body: {}", e)))?;
        self.send_json(RequestSpec::post(path).json(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(RequestSpec::delete(path)).await
    }

    // ===== Account =====

    /// Fetch the logged-in user's profile
    pub async fn user_info(&self) -> Result<UserInfo, ApiError> {
        self.get(USER_INFO_PATH).await
    }

    /// Delete the account, then drop the now-useless credentials locally.
    pub async fn delete_account(&self) -> Result<(), ApiError> {
        let _: serde_json::Value = self.delete(DELETE_ACCOUNT_PATH).await?;
        self.session.logout();
        info!("Account deleted");
        Ok(())
    }
}
