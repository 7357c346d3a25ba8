//! Bare HTTP transport for the clipmix backend.
//!
//! A `RawTransport` sends exactly what it is given. It never attaches a
//! credential on its own and never retries; both of those are the session
//! manager's job.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::TransportError;

/// Description of one outbound call, relative to the backend base URL.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
    bearer: Option<String>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            bearer: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Append a query parameter
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Attach a bearer credential. Replaces any credential already set.
    pub fn with_bearer(mut self, token: &str) -> Self {
        self.bearer = Some(token.to_string());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    pub fn bearer(&self) -> Option<&str> {
        self.bearer.as_deref()
    }
}

/// Coarse classification of a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// The bearer credential was rejected (HTTP 401)
    CredentialRejected,
    RateLimited,
    ClientError,
    ServerError,
    Other,
}

/// A fully-read response: status plus body text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    status: StatusCode,
    body: String,
}

impl RawResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn class(&self) -> StatusClass {
        match self.status.as_u16() {
            200..=299 => StatusClass::Success,
            401 => StatusClass::CredentialRejected,
            429 => StatusClass::RateLimited,
            400..=499 => StatusClass::ClientError,
            500..=599 => StatusClass::ServerError,
            _ => StatusClass::Other,
        }
    }

    pub fn is_success(&self) -> bool {
        self.class() == StatusClass::Success
    }

    pub fn text(&self) -> &str {
        &self.body
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

/// The bare request seam used by the session manager and login flows.
#[async_trait]
pub trait RawTransport: Send + Sync {
    async fn send(&self, request: RequestSpec) -> Result<RawResponse, TransportError>;
}

/// `RawTransport` over a shared `reqwest::Client`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

#[async_trait]
impl RawTransport for HttpTransport {
    async fn send(&self, request: RequestSpec) -> Result<RawResponse, TransportError> {
        let url = self.url_for(request.path());

        let mut builder = self
            .client
            .request(request.method().clone(), &url)
            .header(header::ACCEPT, "application/json");

        if !request.query_pairs().is_empty() {
            builder = builder.query(request.query_pairs());
        }
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }
        if let Some(token) = request.bearer() {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        debug!(method = %request.method(), path = request.path(), status = status.as_u16(), "Response received");

        Ok(RawResponse::new(status, body))
    }
}
