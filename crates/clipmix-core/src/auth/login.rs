//! Login flows that produce a refresh credential.
//!
//! Every flow validates its own input, calls one backend endpoint through
//! the bare transport, and on success hands the issued credential to the
//! `SessionManager`. Failures are turned into messages fit for display;
//! raw transport errors never reach the user.

use std::sync::Arc;

use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use super::credentials::{RefreshCredential, TokenResponse};
use super::otp::take_otp_payload;
use super::SessionManager;
use crate::api::{human_readable_error, RawTransport, RequestSpec, TransportError};

const LOGIN_PATH: &str = "/users/login";
const SIGNUP_PATH: &str = "/users/signup";
const GOOGLE_PATH: &str = "/users/google";
const OTP_PATH: &str = "/users/otp";
const LOGIN_EMAIL_PATH: &str = "/users/login/email";

/// Maximum email length accepted by the login form
pub const MAX_EMAIL_LENGTH: usize = 254;

/// Maximum password length accepted by the login form
pub const MAX_PASSWORD_LENGTH: usize = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoginError {
    /// Input rejected locally, before any request was made
    #[error("{0}")]
    Validation(String),

    /// The backend refused the login; carries its message
    #[error("{0}")]
    Rejected(String),

    #[error("Unable to connect to server. Check your internet connection.")]
    Network,

    #[error("Connection timed out. Please try again.")]
    Timeout,
}

impl From<TransportError> for LoginError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => LoginError::Timeout,
            TransportError::Network(_) | TransportError::InvalidRequest(_) => LoginError::Network,
        }
    }
}

/// Outcome of looking for a one-time login link on page load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpRedemption {
    /// The URL with the payload stripped; the caller should navigate here
    pub cleaned_url: Url,
    pub logged_in: bool,
}

/// Entry points for every way of obtaining a refresh credential.
#[derive(Clone)]
pub struct LoginExchange {
    session: SessionManager,
    transport: Arc<dyn RawTransport>,
}

impl LoginExchange {
    pub fn new(session: SessionManager) -> Self {
        let transport = session.transport();
        Self { session, transport }
    }

    /// Log in with email and password
    pub async fn login_with_password(&self, email: &str, password: &str) -> Result<(), LoginError> {
        let email = validate_email(email)?;
        validate_password(password)?;

        let refresh = self
            .exchange(LOGIN_PATH, json!({ "email": email, "password": password }))
            .await?;
        self.session.set_refresh_credential(refresh);
        info!("Logged in with password");
        Ok(())
    }

    /// Create an account and log straight into it
    pub async fn sign_up(&self, email: &str, password: &str, confirm: &str) -> Result<(), LoginError> {
        let email = validate_email(email)?;
        validate_password(password)?;
        if password != confirm {
            return Err(LoginError::Validation("Passwords do not match".to_string()));
        }

        let refresh = self
            .exchange(SIGNUP_PATH, json!({ "email": email, "password": password }))
            .await?;
        self.session.set_refresh_credential(refresh);
        info!("Signed up");
        Ok(())
    }

    /// Trade a Google identity token for a refresh credential.
    ///
    /// The identity token is consumed and dropped whatever the outcome.
    pub async fn login_with_google(&self, id_token: String) -> Result<(), LoginError> {
        if id_token.trim().is_empty() {
            return Err(LoginError::Validation("Google sign-in did not return a token".to_string()));
        }

        let refresh = self.exchange(GOOGLE_PATH, json!({ "token": id_token })).await?;
        self.session.set_refresh_credential(refresh);
        info!("Logged in with Google");
        Ok(())
    }

    /// Ask the backend to email a one-time login link. Issues no credential.
    pub async fn request_login_link(&self, email: &str, login_url: &str) -> Result<(), LoginError> {
        let email = validate_email(email)?;
        let login_url = Url::parse(login_url)
            .map_err(|_| LoginError::Validation("Invalid login URL".to_string()))?;

        let request = RequestSpec::post(LOGIN_EMAIL_PATH)
            .json(json!({ "email": email, "login_url": login_url.as_str() }));
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(LoginError::Rejected(human_readable_error(
                response.status(),
                response.text(),
            )));
        }
        info!("Login link requested");
        Ok(())
    }

    /// Redeem a one-time login payload carried by `url`, if there is one.
    ///
    /// The payload is stripped from the URL before the exchange so a reload
    /// cannot redeem it twice. A failed redemption is silent: the payload may
    /// simply be expired or used, and the user stays logged out.
    pub async fn redeem_otp_link(&self, url: &Url) -> Option<OtpRedemption> {
        let (payload, cleaned_url) = take_otp_payload(url)?;

        let logged_in = match self.exchange(OTP_PATH, json!({ "payload": payload })).await {
            Ok(refresh) => {
                self.session.set_refresh_credential(refresh);
                info!("Logged in with one-time link");
                true
            }
            Err(e) => {
                debug!(error = %e, "One-time link redemption failed");
                false
            }
        };

        Some(OtpRedemption {
            cleaned_url,
            logged_in,
        })
    }

    async fn exchange(&self, path: &str, body: serde_json::Value) -> Result<RefreshCredential, LoginError> {
        let response = self.transport.send(RequestSpec::post(path).json(body)).await?;

        if !response.is_success() {
            debug!(path, status = response.status().as_u16(), "Login exchange refused");
            return Err(LoginError::Rejected(human_readable_error(
                response.status(),
                response.text(),
            )));
        }

        response
            .json::<TokenResponse>()
            .ok()
            .and_then(TokenResponse::into_token)
            .map(RefreshCredential::new)
            .ok_or_else(|| {
                warn!(path, "Login response did not contain a token");
                LoginError::Rejected("Unexpected response from server".to_string())
            })
    }
}

fn validate_email(email: &str) -> Result<String, LoginError> {
    let email = email.trim();
    let invalid = || LoginError::Validation("Please enter a valid email address".to_string());

    if email.is_empty() || email.len() > MAX_EMAIL_LENGTH || email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') || !domain.contains('.') {
        return Err(invalid());
    }
    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(invalid());
    }
    Ok(email.to_string())
}

fn validate_password(password: &str) -> Result<(), LoginError> {
    if password.is_empty() {
        return Err(LoginError::Validation("Password is required".to_string()));
    }
    if password.chars().count() > MAX_PASSWORD_LENGTH {
        return Err(LoginError::Validation(format!(
            "Password must be at most {} characters",
            MAX_PASSWORD_LENGTH
        )));
    }
    if password.chars().any(char::is_control) {
        return Err(LoginError::Validation("Password contains invalid characters".to_string()));
    }
    Ok(())
}
