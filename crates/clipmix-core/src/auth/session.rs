//! Session manager: owns the credential pair and the renew-and-retry protocol.
//!
//! State lives in one object behind a short-lived mutex that is never held
//! across an `.await`. Renewal is single-flight: the first caller that needs a
//! session credential spawns the renewal task and parks a shared handle to it
//! in the state; everyone else awaits that same handle. The task runs to
//! completion even if every waiter goes away, so credential state is never
//! left half-updated.
//!
//! Both credentials are mirrored into the `CredentialStore` on every change,
//! while the state lock is held, so the persisted pair always matches memory.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::credentials::{
    CredentialKind, CredentialStore, RefreshCredential, SessionCredential, TokenResponse,
};
use crate::api::{ApiError, RawResponse, RawTransport, RequestSpec, StatusClass, TransportError};

/// Endpoint that trades a refresh credential for a session credential
pub const DEFAULT_RENEWAL_PATH: &str = "/users/refresh";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No usable credential: the caller must send the user to log in.
    #[error("Not authenticated - please log in")]
    Unauthenticated,

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The renewal endpoint answered with something other than a token or a
    /// rejection. Credentials are left in place.
    #[error("Session renewal failed with status {status}: {message}")]
    RenewalFailed { status: u16, message: String },

    #[error("Session renewal task was aborted")]
    RenewalAborted,
}

/// Externally visible position in the session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No refresh credential
    LoggedOut,
    /// Refresh credential present, no session credential yet
    NoSession,
    /// A renewal is in flight
    Renewing,
    /// Both credentials present
    Active,
}

/// Which send of an authenticated request this is. There is exactly one
/// retry, and only after a renewal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Initial,
    AfterRenewal,
}

impl Attempt {
    fn next(self) -> Option<Attempt> {
        match self {
            Attempt::Initial => Some(Attempt::AfterRenewal),
            Attempt::AfterRenewal => None,
        }
    }
}

enum Dispatch {
    Completed(RawResponse),
    Rejected(SessionCredential),
}

/// Result shared by every waiter on one renewal
#[derive(Debug, Clone)]
enum RenewalOutcome {
    Renewed(SessionCredential),
    Failed(SessionError),
    /// The refresh credential changed while the renewal was in flight
    Superseded,
}

type RenewalFuture = Shared<BoxFuture<'static, RenewalOutcome>>;

struct PendingRenewal {
    id: u64,
    future: RenewalFuture,
}

#[derive(Default)]
struct State {
    refresh: Option<RefreshCredential>,
    session: Option<SessionCredential>,
    pending: Option<PendingRenewal>,
    // Bumped whenever the refresh credential is replaced or cleared
    generation: u64,
    next_renewal_id: u64,
}

struct Inner {
    state: Mutex<State>,
    store: Box<dyn CredentialStore>,
    storage_degraded: AtomicBool,
    transport: Arc<dyn RawTransport>,
    renewal_path: String,
}

/// Owner of the refresh/session credential pair.
/// Clone is cheap - all clones share the same state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager, restoring whatever credentials the store holds.
    ///
    /// If a refresh credential is found without a session credential and a
    /// Tokio runtime is running, a renewal is started right away.
    pub fn new(store: Box<dyn CredentialStore>, transport: Arc<dyn RawTransport>) -> Self {
        Self::with_renewal_path(store, transport, DEFAULT_RENEWAL_PATH)
    }

    pub fn with_renewal_path(
        store: Box<dyn CredentialStore>,
        transport: Arc<dyn RawTransport>,
        renewal_path: &str,
    ) -> Self {
        let manager = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                store,
                storage_degraded: AtomicBool::new(false),
                transport,
                renewal_path: renewal_path.to_string(),
            }),
        };
        manager.restore();
        manager
    }

    fn restore(&self) {
        let refresh = self.load(CredentialKind::Refresh).map(RefreshCredential::new);
        let mut session = self.load(CredentialKind::Session).map(SessionCredential::new);

        let needs_renewal = {
            let mut state = self.lock_state();
            if refresh.is_none() && session.is_some() {
                warn!("Discarding stored session credential without a refresh credential");
                session = None;
                self.persist(CredentialKind::Session, None);
            }
            debug!(
                has_refresh = refresh.is_some(),
                has_session = session.is_some(),
                "Credentials restored"
            );
            state.refresh = refresh;
            state.session = session;
            state.refresh.is_some() && state.session.is_none()
        };

        if needs_renewal {
            self.schedule_renewal();
        }
    }

    // =========================================================================
    // Credential lifecycle
    // =========================================================================

    /// Install a freshly issued refresh credential.
    ///
    /// Any session credential derived from an older refresh credential is
    /// dropped, and any renewal still in flight for it is disowned.
    pub fn set_refresh_credential(&self, refresh: RefreshCredential) {
        {
            let mut state = self.lock_state();
            state.generation += 1;
            state.pending = None;
            state.session = None;
            self.persist(CredentialKind::Session, None);
            self.persist(CredentialKind::Refresh, Some(refresh.as_str()));
            state.refresh = Some(refresh);
        }
        info!("Refresh credential installed");
        self.schedule_renewal();
    }

    /// Forget both credentials. Local only, idempotent.
    ///
    /// Sending the user back to the login surface is up to the caller.
    pub fn logout(&self) {
        let mut state = self.lock_state();
        let was_logged_in = state.refresh.is_some();
        self.clear_credentials(&mut state);
        if was_logged_in {
            info!("Logged out");
        }
    }

    pub fn state(&self) -> SessionState {
        let state = self.lock_state();
        if state.refresh.is_none() {
            SessionState::LoggedOut
        } else if state.pending.is_some() {
            SessionState::Renewing
        } else if state.session.is_some() {
            SessionState::Active
        } else {
            SessionState::NoSession
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.lock_state().refresh.is_some()
    }

    pub fn refresh_credential(&self) -> Option<RefreshCredential> {
        self.lock_state().refresh.clone()
    }

    pub fn session_credential(&self) -> Option<SessionCredential> {
        self.lock_state().session.clone()
    }

    /// True once the store has failed and credentials live in memory only
    pub fn storage_degraded(&self) -> bool {
        self.inner.storage_degraded.load(Ordering::Relaxed)
    }

    /// The transport used for unauthenticated calls such as login
    pub fn transport(&self) -> Arc<dyn RawTransport> {
        Arc::clone(&self.inner.transport)
    }

    // =========================================================================
    // Authenticated requests
    // =========================================================================

    /// Send `request` with the current session credential.
    ///
    /// A credential rejection triggers one renewal and exactly one resend. A
    /// second rejection, or a missing refresh credential, clears both
    /// credentials and yields `SessionError::Unauthenticated`. Every other
    /// response, success or not, is handed back untouched.
    pub async fn authenticated_request(
        &self,
        request: RequestSpec,
    ) -> Result<RawResponse, SessionError> {
        let mut attempt = Attempt::Initial;
        loop {
            match self.dispatch(&request, attempt).await? {
                Dispatch::Completed(response) => return Ok(response),
                Dispatch::Rejected(rejected) => match attempt.next() {
                    Some(next) => {
                        self.invalidate_session(&rejected);
                        attempt = next;
                    }
                    None => {
                        warn!(path = request.path(), "Credential rejected again after renewal, logging out");
                        let mut state = self.lock_state();
                        self.clear_credentials(&mut state);
                        return Err(SessionError::Unauthenticated);
                    }
                },
            }
        }
    }

    async fn dispatch(&self, request: &RequestSpec, attempt: Attempt) -> Result<Dispatch, SessionError> {
        let session = self.current_session().await?;
        let response = self
            .inner
            .transport
            .send(request.clone().with_bearer(session.as_str()))
            .await?;

        if response.class() == StatusClass::CredentialRejected {
            debug!(path = request.path(), ?attempt, "Session credential rejected");
            return Ok(Dispatch::Rejected(session));
        }
        Ok(Dispatch::Completed(response))
    }

    /// The session credential to use now, renewing first if there is none.
    async fn current_session(&self) -> Result<SessionCredential, SessionError> {
        {
            let mut state = self.lock_state();
            if state.refresh.is_none() {
                // Keeps a stray session from outliving its refresh credential
                if state.session.is_some() {
                    self.clear_credentials(&mut state);
                }
                return Err(SessionError::Unauthenticated);
            }
            if let Some(ref session) = state.session {
                return Ok(session.clone());
            }
        }
        self.renew().await
    }

    /// Drop `rejected` if it is still the current session credential. A
    /// concurrent caller may already have replaced it with a fresh one.
    fn invalidate_session(&self, rejected: &SessionCredential) {
        let mut state = self.lock_state();
        if state.session.as_ref() == Some(rejected) {
            state.session = None;
            self.persist(CredentialKind::Session, None);
        }
    }

    // =========================================================================
    // Renewal
    // =========================================================================

    async fn renew(&self) -> Result<SessionCredential, SessionError> {
        // A superseded renewal is followed once onto the renewal for the new
        // refresh credential; a second supersession means the user is
        // actively logging in and out, and the caller just starts over.
        for _ in 0..2 {
            let future = self.join_or_start_renewal()?;
            match future.await {
                RenewalOutcome::Renewed(session) => return Ok(session),
                RenewalOutcome::Failed(err) => return Err(err),
                RenewalOutcome::Superseded => {
                    debug!("Renewal superseded by a new refresh credential");
                }
            }
        }
        Err(SessionError::Unauthenticated)
    }

    fn join_or_start_renewal(&self) -> Result<RenewalFuture, SessionError> {
        let mut state = self.lock_state();
        if let Some(ref pending) = state.pending {
            debug!(renewal_id = pending.id, "Joining in-flight renewal");
            return Ok(pending.future.clone());
        }
        self.start_renewal(&mut state)
    }

    /// Start a renewal in the background if a refresh credential exists and
    /// nothing else is already providing a session credential.
    fn schedule_renewal(&self) {
        if Handle::try_current().is_err() {
            debug!("No async runtime, deferring renewal to the first request");
            return;
        }
        let mut state = self.lock_state();
        if state.refresh.is_none() || state.session.is_some() || state.pending.is_some() {
            return;
        }
        if let Err(e) = self.start_renewal(&mut state) {
            debug!(error = %e, "Eager renewal not started");
        }
    }

    fn start_renewal(&self, state: &mut State) -> Result<RenewalFuture, SessionError> {
        let refresh = state.refresh.clone().ok_or(SessionError::Unauthenticated)?;
        state.next_renewal_id += 1;
        let id = state.next_renewal_id;
        let generation = state.generation;

        let manager = self.clone();
        let task = async move { manager.run_renewal(id, generation, refresh).await };

        let future: BoxFuture<'static, RenewalOutcome> = match Handle::try_current() {
            Ok(handle) => {
                let join = handle.spawn(task);
                async move {
                    join.await.unwrap_or_else(|e| {
                        error!(renewal_id = id, error = %e, "Renewal task failed");
                        RenewalOutcome::Failed(SessionError::RenewalAborted)
                    })
                }
                .boxed()
            }
            // Without a runtime the first waiter drives the renewal itself
            Err(_) => task.boxed(),
        };

        let shared = future.shared();
        state.pending = Some(PendingRenewal {
            id,
            future: shared.clone(),
        });
        debug!(renewal_id = id, "Renewal started");
        Ok(shared)
    }

    async fn run_renewal(
        self,
        id: u64,
        generation: u64,
        refresh: RefreshCredential,
    ) -> RenewalOutcome {
        let request = RequestSpec::post(self.inner.renewal_path.as_str()).with_bearer(refresh.as_str());
        let result = self.inner.transport.send(request).await;

        let mut state = self.lock_state();
        if state.pending.as_ref().map(|p| p.id) == Some(id) {
            state.pending = None;
        }
        if state.generation != generation {
            debug!(renewal_id = id, "Discarding renewal result for a replaced refresh credential");
            return RenewalOutcome::Superseded;
        }

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(renewal_id = id, error = %e, "Session renewal could not reach the server");
                return RenewalOutcome::Failed(SessionError::Transport(e));
            }
        };

        match response.class() {
            StatusClass::Success => {
                match response.json::<TokenResponse>().ok().and_then(TokenResponse::into_token) {
                    Some(token) => {
                        let session = SessionCredential::new(token);
                        self.persist(CredentialKind::Session, Some(session.as_str()));
                        state.session = Some(session.clone());
                        info!(renewal_id = id, "Session credential renewed");
                        RenewalOutcome::Renewed(session)
                    }
                    None => {
                        warn!(renewal_id = id, "Renewal response did not contain a token");
                        RenewalOutcome::Failed(SessionError::RenewalFailed {
                            status: response.status().as_u16(),
                            message: "response did not contain a token".to_string(),
                        })
                    }
                }
            }
            StatusClass::CredentialRejected => {
                warn!(renewal_id = id, "Refresh credential rejected, logging out");
                self.clear_credentials(&mut state);
                RenewalOutcome::Failed(SessionError::Unauthenticated)
            }
            _ => {
                let status = response.status();
                warn!(renewal_id = id, status = status.as_u16(), "Session renewal failed");
                RenewalOutcome::Failed(SessionError::RenewalFailed {
                    status: status.as_u16(),
                    message: ApiError::truncate_body(response.text()),
                })
            }
        }
    }

    // =========================================================================
    // State and storage helpers
    // =========================================================================

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear both credentials together, in memory and in the store.
    fn clear_credentials(&self, state: &mut State) {
        state.generation += 1;
        state.pending = None;
        state.session = None;
        state.refresh = None;
        self.persist(CredentialKind::Session, None);
        self.persist(CredentialKind::Refresh, None);
    }

    fn load(&self, kind: CredentialKind) -> Option<String> {
        match self.inner.store.get(kind) {
            Ok(value) => value,
            Err(e) => {
                self.mark_degraded(&e.to_string());
                None
            }
        }
    }

    /// Write through to the store. Writes are attempted even once storage is
    /// degraded, so a clear always reaches a store that has recovered.
    fn persist(&self, kind: CredentialKind, value: Option<&str>) {
        let result = match value {
            Some(value) => self.inner.store.set(kind, value).inspect_err(|_| {
                // Never leave an older value behind a failed overwrite
                let _ = self.inner.store.clear(kind);
            }),
            None => self.inner.store.clear(kind),
        };
        if let Err(e) = result {
            self.mark_degraded(&e.to_string());
        }
    }

    fn mark_degraded(&self, reason: &str) {
        if self.inner.storage_degraded.swap(true, Ordering::Relaxed) {
            debug!(error = reason, "Credential storage still unavailable");
        } else {
            warn!(error = reason, "Credential storage unavailable, keeping credentials in memory only");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::{MemoryStore, StorageError};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::time::Duration;

    type Responder = dyn Fn(&RequestSpec) -> Result<RawResponse, TransportError> + Send + Sync;

    /// Transport that answers from a closure and records every call.
    struct MockTransport {
        responder: Box<Responder>,
        calls: Mutex<Vec<(String, Option<String>)>>,
        delay: Duration,
    }

    impl MockTransport {
        fn new<F>(responder: F) -> Arc<Self>
        where
            F: Fn(&RequestSpec) -> Result<RawResponse, TransportError> + Send + Sync + 'static,
        {
            Self::with_delay(Duration::from_millis(20), responder)
        }

        fn with_delay<F>(delay: Duration, responder: F) -> Arc<Self>
        where
            F: Fn(&RequestSpec) -> Result<RawResponse, TransportError> + Send + Sync + 'static,
        {
            Arc::new(Self {
                responder: Box::new(responder),
                calls: Mutex::new(Vec::new()),
                delay,
            })
        }

        fn calls_to(&self, path: &str) -> Vec<Option<String>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(p, _)| p == path)
                .map(|(_, bearer)| bearer.clone())
                .collect()
        }

        fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RawTransport for MockTransport {
        async fn send(&self, request: RequestSpec) -> Result<RawResponse, TransportError> {
            self.calls
                .lock()
                .unwrap()
                .push((request.path().to_string(), request.bearer().map(str::to_string)));
            tokio::time::sleep(self.delay).await;
            (self.responder)(&request)
        }
    }

    struct FailingStore;

    impl CredentialStore for FailingStore {
        fn get(&self, _kind: CredentialKind) -> Result<Option<String>, StorageError> {
            Err(StorageError::Unavailable("disabled".to_string()))
        }
        fn set(&self, _kind: CredentialKind, _value: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disabled".to_string()))
        }
        fn clear(&self, _kind: CredentialKind) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disabled".to_string()))
        }
    }

    fn token(value: &str) -> Result<RawResponse, TransportError> {
        Ok(RawResponse::new(
            StatusCode::OK,
            format!(r#"{{"token": "{}", "token_type": "bearer"}}"#, value),
        ))
    }

    fn status(code: u16) -> Result<RawResponse, TransportError> {
        Ok(RawResponse::new(StatusCode::from_u16(code).unwrap(), ""))
    }

    fn ok(body: &str) -> Result<RawResponse, TransportError> {
        Ok(RawResponse::new(StatusCode::OK, body))
    }

    fn store_with(refresh: Option<&str>, session: Option<&str>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        if let Some(r) = refresh {
            store.set(CredentialKind::Refresh, r).unwrap();
        }
        if let Some(s) = session {
            store.set(CredentialKind::Session, s).unwrap();
        }
        store
    }

    fn manager(store: &Arc<MemoryStore>, transport: &Arc<MockTransport>) -> SessionManager {
        SessionManager::new(Box::new(Arc::clone(store)), transport.clone())
    }

    fn assert_invariant(manager: &SessionManager) {
        if manager.session_credential().is_some() {
            assert!(manager.refresh_credential().is_some(), "session without refresh");
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_renewal() {
        let transport = MockTransport::new(|req| match req.path() {
            "/users/refresh" => token("S1"),
            _ if req.bearer() == Some("S1") => ok("{}"),
            _ => status(401),
        });
        let store = store_with(Some("R1"), None);
        let manager = manager(&store, &transport);

        let requests = (0..8).map(|i| manager.authenticated_request(RequestSpec::get(format!("/items/{}", i))));
        let results = futures::future::join_all(requests).await;

        for result in results {
            assert_eq!(result.unwrap().status(), StatusCode::OK);
        }
        assert_eq!(transport.calls_to("/users/refresh"), vec![Some("R1".to_string())]);
        assert_eq!(manager.session_credential(), Some(SessionCredential::new("S1")));
        assert_eq!(store.get(CredentialKind::Session).unwrap().as_deref(), Some("S1"));
    }

    #[tokio::test]
    async fn test_two_requests_same_instant_use_one_session() {
        let transport = MockTransport::new(|req| match req.path() {
            "/users/refresh" => token("S1"),
            _ => ok(r#"{"ok": true}"#),
        });
        let store = store_with(Some("R1"), None);
        let manager = manager(&store, &transport);

        let (a, b) = tokio::join!(
            manager.authenticated_request(RequestSpec::get("/a")),
            manager.authenticated_request(RequestSpec::get("/b")),
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(transport.calls_to("/users/refresh").len(), 1);
        assert_eq!(transport.calls_to("/a"), vec![Some("S1".to_string())]);
        assert_eq!(transport.calls_to("/b"), vec![Some("S1".to_string())]);
    }

    #[tokio::test]
    async fn test_rejected_session_is_renewed_and_retried_once() {
        let transport = MockTransport::new(|req| match (req.path(), req.bearer()) {
            ("/users/refresh", Some("R1")) => token("S2"),
            ("/target", Some("S2")) => ok(r#"{"done": true}"#),
            _ => status(401),
        });
        let store = store_with(Some("R1"), Some("S1"));
        let manager = manager(&store, &transport);

        let response = manager
            .authenticated_request(RequestSpec::get("/target"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text(), r#"{"done": true}"#);
        assert_eq!(
            transport.calls_to("/target"),
            vec![Some("S1".to_string()), Some("S2".to_string())]
        );
        assert_eq!(transport.calls_to("/users/refresh").len(), 1);
        assert_eq!(manager.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_second_rejection_is_not_retried() {
        let transport = MockTransport::new(|req| match req.path() {
            "/users/refresh" => token("S2"),
            _ => status(401),
        });
        let store = store_with(Some("R1"), Some("S1"));
        let manager = manager(&store, &transport);

        let result = manager.authenticated_request(RequestSpec::get("/target")).await;

        assert_eq!(result.unwrap_err(), SessionError::Unauthenticated);
        assert_eq!(transport.calls_to("/target").len(), 2);
        assert_eq!(transport.calls_to("/users/refresh").len(), 1);
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert_eq!(store.get(CredentialKind::Refresh).unwrap(), None);
        assert_eq!(store.get(CredentialKind::Session).unwrap(), None);
    }

    #[tokio::test]
    async fn test_renewal_rejection_fails_every_waiter() {
        let transport = MockTransport::new(|req| match req.path() {
            "/users/refresh" => status(401),
            _ => ok("{}"),
        });
        let store = store_with(Some("R1"), None);
        let manager = manager(&store, &transport);

        let requests = (0..5).map(|_| manager.authenticated_request(RequestSpec::get("/list")));
        let results = futures::future::join_all(requests).await;

        for result in results {
            assert_eq!(result.unwrap_err(), SessionError::Unauthenticated);
        }
        assert_eq!(transport.calls_to("/users/refresh").len(), 1);
        assert!(transport.calls_to("/list").is_empty());
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert_eq!(store.get(CredentialKind::Refresh).unwrap(), None);
    }

    #[tokio::test]
    async fn test_logout_clears_store_and_fails_fast() {
        let transport = MockTransport::new(|_| ok("{}"));
        let store = store_with(Some("R1"), Some("S1"));
        let manager = manager(&store, &transport);

        manager.logout();
        manager.logout();

        assert_eq!(store.get(CredentialKind::Refresh).unwrap(), None);
        assert_eq!(store.get(CredentialKind::Session).unwrap(), None);

        let result = manager.authenticated_request(RequestSpec::get("/me")).await;
        assert_eq!(result.unwrap_err(), SessionError::Unauthenticated);
        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_refresh_survives_restart() {
        let transport = MockTransport::new(|req| match req.path() {
            "/users/refresh" => token("S1"),
            _ => ok("{}"),
        });
        let store = store_with(None, None);

        let first = manager(&store, &transport);
        first.set_refresh_credential(RefreshCredential::new("R-x"));
        drop(first);

        let reloaded = manager(&store, &transport);
        assert_eq!(reloaded.refresh_credential(), Some(RefreshCredential::new("R-x")));
        assert!(reloaded.is_authenticated());
    }

    #[tokio::test]
    async fn test_set_refresh_clears_stale_session_and_renews_eagerly() {
        let transport = MockTransport::new(|req| match (req.path(), req.bearer()) {
            ("/users/refresh", Some("R2")) => token("S2"),
            _ => status(401),
        });
        let store = store_with(Some("R1"), Some("S1"));
        let manager = manager(&store, &transport);

        manager.set_refresh_credential(RefreshCredential::new("R2"));
        assert_eq!(manager.session_credential(), None);
        assert_eq!(store.get(CredentialKind::Session).unwrap(), None);
        assert_eq!(manager.state(), SessionState::Renewing);

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(manager.session_credential(), Some(SessionCredential::new("S2")));
        assert_eq!(manager.state(), SessionState::Active);
        assert_eq!(transport.calls_to("/users/refresh"), vec![Some("R2".to_string())]);
    }

    #[tokio::test]
    async fn test_non_auth_errors_are_returned_unchanged() {
        let transport = MockTransport::new(|req| match req.path() {
            "/missing" => status(404),
            "/broken" => Ok(RawResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "boom")),
            _ => ok("{}"),
        });
        let store = store_with(Some("R1"), Some("S1"));
        let manager = manager(&store, &transport);

        let missing = manager.authenticated_request(RequestSpec::get("/missing")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let broken = manager.authenticated_request(RequestSpec::get("/broken")).await.unwrap();
        assert_eq!(broken.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(broken.text(), "boom");

        assert!(transport.calls_to("/users/refresh").is_empty());
        assert_eq!(manager.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_network_failure_keeps_credentials() {
        let transport = MockTransport::new(|req| match req.path() {
            "/users/refresh" => Err(TransportError::Network("connection refused".to_string())),
            _ => Err(TransportError::Timeout),
        });
        let store = store_with(Some("R1"), Some("S1"));
        let manager = manager(&store, &transport);

        let result = manager.authenticated_request(RequestSpec::get("/me")).await;
        assert_eq!(result.unwrap_err(), SessionError::Transport(TransportError::Timeout));
        assert_eq!(manager.state(), SessionState::Active);

        manager.invalidate_session(&SessionCredential::new("S1"));
        let result = manager.authenticated_request(RequestSpec::get("/me")).await;
        assert!(matches!(result, Err(SessionError::Transport(TransportError::Network(_)))));
        assert_eq!(manager.refresh_credential(), Some(RefreshCredential::new("R1")));
        assert_eq!(store.get(CredentialKind::Refresh).unwrap().as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn test_renewal_server_error_keeps_refresh() {
        let transport = MockTransport::new(|req| match req.path() {
            "/users/refresh" => Ok(RawResponse::new(StatusCode::SERVICE_UNAVAILABLE, "maintenance")),
            _ => ok("{}"),
        });
        let store = store_with(Some("R1"), None);
        let manager = manager(&store, &transport);

        let result = manager.authenticated_request(RequestSpec::get("/me")).await;
        assert_eq!(
            result.unwrap_err(),
            SessionError::RenewalFailed {
                status: 503,
                message: "maintenance".to_string()
            }
        );
        assert_eq!(manager.state(), SessionState::NoSession);
    }

    #[tokio::test]
    async fn test_logout_during_renewal_wins() {
        let transport = MockTransport::with_delay(Duration::from_millis(50), |req| match req.path() {
            "/users/refresh" => token("S1"),
            _ => ok("{}"),
        });
        let store = store_with(Some("R1"), None);
        let manager = manager(&store, &transport);

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.authenticated_request(RequestSpec::get("/me")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.state(), SessionState::Renewing);

        manager.logout();

        let result = pending.await.unwrap();
        assert_eq!(result.unwrap_err(), SessionError::Unauthenticated);

        // Let the abandoned renewal task finish and confirm it wrote nothing
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert_eq!(manager.session_credential(), None);
        assert_eq!(store.get(CredentialKind::Session).unwrap(), None);
        assert!(transport.calls_to("/me").is_empty());
    }

    #[tokio::test]
    async fn test_orphaned_session_is_discarded_on_restore() {
        let transport = MockTransport::new(|_| ok("{}"));
        let store = store_with(None, Some("S1"));
        let manager = manager(&store, &transport);

        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert_invariant(&manager);
        assert_eq!(store.get(CredentialKind::Session).unwrap(), None);
    }

    #[tokio::test]
    async fn test_invariant_holds_across_lifecycle() {
        let transport = MockTransport::new(|req| match (req.path(), req.bearer()) {
            ("/users/refresh", Some("R1")) => token("S1"),
            ("/users/refresh", _) => status(401),
            (_, Some("S1")) => ok("{}"),
            _ => status(401),
        });
        let store = store_with(None, None);
        let manager = manager(&store, &transport);
        assert_invariant(&manager);

        manager.set_refresh_credential(RefreshCredential::new("R1"));
        assert_invariant(&manager);

        manager.authenticated_request(RequestSpec::get("/a")).await.unwrap();
        assert_invariant(&manager);

        manager.set_refresh_credential(RefreshCredential::new("R-bad"));
        assert_invariant(&manager);

        let result = manager.authenticated_request(RequestSpec::get("/a")).await;
        assert_eq!(result.unwrap_err(), SessionError::Unauthenticated);
        assert_invariant(&manager);
        assert_eq!(manager.state(), SessionState::LoggedOut);
    }

    #[tokio::test]
    async fn test_unavailable_storage_degrades_to_memory() {
        let transport = MockTransport::new(|req| match req.path() {
            "/users/refresh" => token("S1"),
            _ => ok("{}"),
        });
        let manager = SessionManager::new(Box::new(FailingStore), transport.clone());

        assert_eq!(manager.state(), SessionState::LoggedOut);
        assert!(manager.storage_degraded());

        manager.set_refresh_credential(RefreshCredential::new("R1"));
        let response = manager.authenticated_request(RequestSpec::get("/me")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(manager.state(), SessionState::Active);
    }

    /// Memory-backed store whose writes of one kind always fail.
    struct RejectsWritesOf {
        kind: CredentialKind,
        inner: Arc<MemoryStore>,
    }

    impl CredentialStore for RejectsWritesOf {
        fn get(&self, kind: CredentialKind) -> Result<Option<String>, StorageError> {
            self.inner.get(kind)
        }
        fn set(&self, kind: CredentialKind, value: &str) -> Result<(), StorageError> {
            if kind == self.kind {
                return Err(StorageError::Unavailable("read-only".to_string()));
            }
            self.inner.set(kind, value)
        }
        fn clear(&self, kind: CredentialKind) -> Result<(), StorageError> {
            self.inner.clear(kind)
        }
    }

    #[tokio::test]
    async fn test_logout_clears_store_after_partial_write_failure() {
        let transport = MockTransport::new(|req| match req.path() {
            "/users/refresh" => token("S1"),
            _ => ok("{}"),
        });
        let store = store_with(Some("R1"), None);
        let manager = SessionManager::new(
            Box::new(RejectsWritesOf {
                kind: CredentialKind::Session,
                inner: Arc::clone(&store),
            }),
            transport.clone(),
        );

        manager.authenticated_request(RequestSpec::get("/me")).await.unwrap();
        assert!(manager.storage_degraded());
        assert_eq!(store.get(CredentialKind::Refresh).unwrap().as_deref(), Some("R1"));

        manager.logout();

        assert_eq!(store.get(CredentialKind::Refresh).unwrap(), None);
        assert_eq!(store.get(CredentialKind::Session).unwrap(), None);

        let restarted = self::manager(&store, &transport);
        assert_eq!(restarted.state(), SessionState::LoggedOut);
    }

    #[tokio::test]
    async fn test_failed_overwrite_does_not_leave_stale_value() {
        let transport = MockTransport::new(|req| match req.path() {
            "/users/refresh" => token("S-new"),
            _ => ok("{}"),
        });
        let store = store_with(Some("R1"), Some("S-old"));
        let manager = SessionManager::new(
            Box::new(RejectsWritesOf {
                kind: CredentialKind::Refresh,
                inner: Arc::clone(&store),
            }),
            transport.clone(),
        );

        manager.set_refresh_credential(RefreshCredential::new("R2"));

        assert!(manager.storage_degraded());
        assert_eq!(manager.refresh_credential(), Some(RefreshCredential::new("R2")));
        assert_eq!(store.get(CredentialKind::Refresh).unwrap(), None);
    }

    #[test]
    fn test_restore_without_runtime_defers_renewal() {
        let transport = MockTransport::new(|_| token("S1"));
        let store = store_with(Some("R1"), None);
        let manager = manager(&store, &transport);

        assert_eq!(manager.state(), SessionState::NoSession);
        assert_eq!(transport.total_calls(), 0);
    }

    #[test]
    fn test_attempt_sequence_is_bounded() {
        assert_eq!(Attempt::Initial.next(), Some(Attempt::AfterRenewal));
        assert_eq!(Attempt::AfterRenewal.next(), None);
    }
}
