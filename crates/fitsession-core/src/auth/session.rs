//! The session core: owns the token pair and the identity decoded from it.
//!
//! A `SessionManager` is built once at startup and cloned into every consumer
//! (clones share state). All mutation goes through it; consumers observe
//! changes by subscribing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::{Response, StatusCode};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use crate::api::{AuthApi, RequestOptions};
use crate::error::SessionError;
use crate::models::{Identity, TokenPair};

use super::jwt::{self, Claims};
use super::navigator::Navigator;
use super::storage::{SessionStore, RETURN_PATH_KEY, TOKENS_KEY};
use super::subscribers::{Listener, Subscribers, Subscription};

/// Where to go after an OAuth login when no return path was recorded
pub const DEFAULT_RETURN_PATH: &str = "/dashboard";

/// Refresh once the access token is this close to expiry (5 minutes)
const REFRESH_WINDOW_SECS: i64 = 5 * 60;

/// How often the background task checks token expiry (5 minutes)
const REFRESH_CHECK_INTERVAL_SECS: u64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Uninitialized,
    Initializing,
    Authenticated,
    Refreshing,
    Unauthenticated,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub refresh_window: Duration,
    pub check_interval: StdDuration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            refresh_window: Duration::seconds(REFRESH_WINDOW_SECS),
            check_interval: StdDuration::from_secs(REFRESH_CHECK_INTERVAL_SECS),
        }
    }
}

/// Outcome of one proactive expiry check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshCheck {
    NotNeeded,
    AlreadyPending,
    Refreshed,
    Failed,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<TokenPair, SessionError>>>;

struct PendingRefresh {
    id: u64,
    future: RefreshFuture,
}

struct SessionState {
    phase: SessionPhase,
    tokens: Option<TokenPair>,
    // Always Some exactly when `tokens` is.
    claims: Option<Claims>,
}

struct Inner {
    api: AuthApi,
    store: Arc<dyn SessionStore>,
    navigator: Arc<dyn Navigator>,
    settings: SessionSettings,
    state: RwLock<SessionState>,
    subscribers: Subscribers,
    // Cleared when the session it was started for ends.
    refresh_in_flight: Mutex<Option<PendingRefresh>>,
    next_refresh_id: AtomicU64,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        api: AuthApi,
        store: Arc<dyn SessionStore>,
        navigator: Arc<dyn Navigator>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                navigator,
                settings,
                state: RwLock::new(SessionState {
                    phase: SessionPhase::Uninitialized,
                    tokens: None,
                    claims: None,
                }),
                subscribers: Subscribers::new(),
                refresh_in_flight: Mutex::new(None),
                next_refresh_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn api(&self) -> &AuthApi {
        &self.inner.api
    }

    // ===== State accessors =====

    pub fn phase(&self) -> SessionPhase {
        self.read_state().phase
    }

    /// The signed-in user, if any
    pub fn user(&self) -> Option<Identity> {
        self.read_state().claims.as_ref().map(|c| c.identity.clone())
    }

    pub fn access_token(&self) -> Option<String> {
        self.read_state().tokens.as_ref().map(|t| t.access_token.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        let state = self.read_state();
        state.tokens.is_some() && state.claims.is_some()
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.read_state().claims.as_ref().map(|c| c.expires_at)
    }

    pub fn refresh_pending(&self) -> bool {
        self.refresh_slot().is_some()
    }

    // ===== Startup =====

    /// Load the persisted token pair. Never fails: anything unusable is
    /// discarded and the session ends up unauthenticated.
    pub async fn initialize(&self) {
        self.write_state().phase = SessionPhase::Initializing;

        let store = self.inner.store.clone();
        let loaded = tokio::task::spawn_blocking(move || store.get(TOKENS_KEY))
            .await
            .context("Session load task failed")
            .and_then(|result| result);

        let raw = match loaded {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("No persisted session found");
                self.write_state().phase = SessionPhase::Unauthenticated;
                return;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read persisted session");
                self.discard_persisted_tokens();
                return;
            }
        };

        match Self::restore(&raw) {
            Ok((tokens, claims)) => {
                info!(
                    email = %claims.identity.email,
                    expires_at = %claims.expires_at,
                    "Restored persisted session"
                );
                self.apply(tokens, claims);
            }
            Err(e) => {
                warn!(error = %e, "Discarding persisted session");
                self.discard_persisted_tokens();
            }
        }
    }

    fn restore(raw: &str) -> anyhow::Result<(TokenPair, Claims)> {
        let tokens: TokenPair =
            serde_json::from_str(raw).context("Failed to parse persisted tokens")?;
        let claims = jwt::decode(&tokens.access_token)?;
        if claims.is_expired(Utc::now()) {
            return Err(anyhow!("access token expired at {}", claims.expires_at));
        }
        Ok((tokens, claims))
    }

    fn discard_persisted_tokens(&self) {
        {
            let mut state = self.write_state();
            state.tokens = None;
            state.claims = None;
            state.phase = SessionPhase::Unauthenticated;
        }
        if let Err(e) = self.inner.store.remove(TOKENS_KEY) {
            warn!(error = %e, "Failed to clear persisted tokens");
        }
    }

    // ===== Login =====

    /// Record the current path and send the user to the provider's
    /// authorization page. The backend later redirects back with tokens in
    /// the query string (see `complete_oauth_callback`).
    pub fn login_with_redirect(&self, provider: &str) -> Result<(), SessionError> {
        let provider = provider.trim();
        if provider.is_empty() {
            return Err(SessionError::Validation("an OAuth provider is required".to_string()));
        }

        let url = self
            .inner
            .api
            .authorization_url(provider)
            .map_err(|e| SessionError::Auth(e.to_string()))?;

        let return_path = self.inner.navigator.current_path();
        self.inner
            .store
            .set(RETURN_PATH_KEY, &return_path)
            .map_err(|e| SessionError::Auth(format!("Failed to record return path: {}", e)))?;

        info!(provider, url = %url, "Redirecting to OAuth authorization");
        self.inner
            .navigator
            .navigate(&url)
            .map_err(|e| SessionError::Auth(format!("Failed to open authorization page: {}", e)))
    }

    pub async fn login_with_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Identity, SessionError> {
        let email = email.trim();
        if email.is_empty() || password.is_empty() {
            return Err(SessionError::Validation(
                "email and password are required".to_string(),
            ));
        }

        let tokens = self.inner.api.login(email, password).await.map_err(|e| {
            warn!(email, error = %e, "Login failed");
            SessionError::Auth(e.to_string())
        })?;

        let identity = self.accept_new_tokens(tokens)?;
        info!(email = %identity.email, "Logged in with credentials");
        Ok(identity)
    }

    /// Accept the token pair delivered to the OAuth success route.
    pub fn complete_oauth_redirect(&self, tokens: TokenPair) -> Result<Identity, SessionError> {
        if tokens.access_token.is_empty() || tokens.refresh_token.is_empty() {
            return Err(SessionError::Auth("missing authentication tokens".to_string()));
        }
        let identity = self.accept_new_tokens(tokens)?;
        info!(email = %identity.email, provider = ?identity.provider, "Completed OAuth login");
        Ok(identity)
    }

    /// Pull `accessToken` and `refreshToken` out of the OAuth landing URL.
    pub fn complete_oauth_callback(&self, url: &Url) -> Result<Identity, SessionError> {
        let param = |name: &str| {
            url.query_pairs()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.into_owned())
                .filter(|value| !value.is_empty())
        };

        match (param("accessToken"), param("refreshToken")) {
            (Some(access), Some(refresh)) => self.complete_oauth_redirect(TokenPair::new(access, refresh)),
            _ => Err(SessionError::Auth("missing authentication tokens".to_string())),
        }
    }

    /// The path recorded before the OAuth redirect, consumed on read.
    pub fn take_return_path(&self) -> String {
        let path = match self.inner.store.get(RETURN_PATH_KEY) {
            Ok(path) => path.filter(|p| !p.is_empty()),
            Err(e) => {
                warn!(error = %e, "Failed to read return path");
                None
            }
        };
        if let Err(e) = self.inner.store.remove(RETURN_PATH_KEY) {
            warn!(error = %e, "Failed to clear return path");
        }
        path.unwrap_or_else(|| DEFAULT_RETURN_PATH.to_string())
    }

    fn accept_new_tokens(&self, tokens: TokenPair) -> Result<Identity, SessionError> {
        let claims = jwt::decode(&tokens.access_token).map_err(|e| {
            SessionError::Auth(format!("server issued an unreadable access token: {}", e))
        })?;
        let identity = claims.identity.clone();
        // A refresh still running belongs to the session being replaced.
        self.clear_pending_refresh();
        self.install(None, tokens, claims);
        Ok(identity)
    }

    // ===== Logout =====

    /// Clear the session and its persisted entries. Safe to call repeatedly;
    /// subscribers only hear about the first call.
    pub fn logout(&self) {
        self.end_session(|_| true);
    }

    /// Log out only if `is_current` accepts the token pair still held.
    /// Returns whether a signed-in session was ended.
    fn end_session<F>(&self, is_current: F) -> bool
    where
        F: FnOnce(&TokenPair) -> bool,
    {
        let was_authenticated = {
            let mut state = self.write_state();
            if state.tokens.as_ref().is_some_and(|tokens| !is_current(tokens)) {
                return false;
            }
            state.claims = None;
            state.phase = SessionPhase::Unauthenticated;
            let was_authenticated = state.tokens.take().is_some();

            // Under the state lock so a login racing this logout keeps its tokens.
            for key in [TOKENS_KEY, RETURN_PATH_KEY] {
                if let Err(e) = self.inner.store.remove(key) {
                    warn!(key, error = %e, "Failed to clear persisted session entry");
                }
            }
            was_authenticated
        };
        self.clear_pending_refresh();

        if was_authenticated {
            info!("Logged out");
            self.inner.subscribers.notify(None);
        }
        was_authenticated
    }

    // ===== Refresh =====

    /// Exchange the refresh token for a new pair.
    ///
    /// Only one refresh request is ever outstanding: callers arriving while
    /// one is in flight wait for its result. Any failure other than a missing
    /// refresh token logs the session out.
    pub async fn refresh(&self) -> Result<TokenPair, SessionError> {
        let refresh = {
            let mut slot = self.refresh_slot();
            match slot.as_ref() {
                Some(pending) => {
                    debug!("Joining in-flight token refresh");
                    pending.future.clone()
                }
                None => {
                    let id = self.inner.next_refresh_id.fetch_add(1, Ordering::Relaxed);
                    let session = self.clone();
                    let future = async move {
                        let result = session.perform_refresh().await;
                        session.release_refresh(id);
                        result
                    }
                    .boxed()
                    .shared();
                    *slot = Some(PendingRefresh {
                        id,
                        future: future.clone(),
                    });
                    // Driven to completion even if every caller goes away.
                    tokio::spawn(future.clone());
                    future
                }
            }
        };
        refresh.await
    }

    async fn perform_refresh(&self) -> Result<TokenPair, SessionError> {
        let (email, current) = {
            let mut state = self.write_state();
            let current = match state.tokens.as_ref() {
                Some(tokens) if !tokens.refresh_token.is_empty() => tokens.clone(),
                _ => return Err(SessionError::NoRefreshToken),
            };
            let email = state
                .claims
                .as_ref()
                .map(|c| c.identity.email.clone())
                .unwrap_or_default();
            state.phase = SessionPhase::Refreshing;
            (email, current)
        };

        info!(email = %email, "Refreshing access token");
        let outcome = match self.inner.api.refresh(&email, &current.refresh_token).await {
            Ok(tokens) => jwt::decode(&tokens.access_token)
                .map(|claims| (tokens, claims))
                .map_err(SessionError::Decode),
            Err(e) => Err(SessionError::RefreshFailed(e.to_string())),
        };

        // A logout or new login while the request was out wins over its
        // outcome: only the session this refresh was started for is touched.
        match outcome {
            Ok((tokens, claims)) => {
                let expires_at = claims.expires_at;
                if !self.install(Some(&current), tokens.clone(), claims) {
                    debug!("Session changed during refresh, discarding refreshed tokens");
                    return Err(SessionError::RefreshFailed(
                        "session changed while refreshing".to_string(),
                    ));
                }
                info!(%expires_at, "Access token refreshed");
                Ok(tokens)
            }
            Err(e) => {
                if self.end_session(|tokens| *tokens == current) {
                    warn!(error = %e, "Token refresh failed, logged out");
                } else {
                    debug!(error = %e, "Token refresh failed for a session that already ended");
                }
                Err(e)
            }
        }
    }

    /// Refresh after `rejected` drew a 401, unless it has already been
    /// replaced, in which case the current token is used as-is.
    async fn refresh_after_rejection(&self, rejected: &str) -> Result<String, SessionError> {
        match self.access_token() {
            Some(current) if current != rejected => {
                debug!("Access token already rotated, retrying with current token");
                Ok(current)
            }
            _ => self.refresh().await.map(|tokens| tokens.access_token),
        }
    }

    /// Refresh if the access token is within the refresh window. Failures are
    /// logged rather than returned: nobody is waiting on a background check.
    pub async fn check_expiry(&self) -> RefreshCheck {
        if self.refresh_pending() {
            debug!("Refresh already pending, skipping expiry check");
            return RefreshCheck::AlreadyPending;
        }

        let expiring = self
            .read_state()
            .claims
            .as_ref()
            .is_some_and(|c| c.expires_within(self.inner.settings.refresh_window, Utc::now()));
        if !expiring {
            return RefreshCheck::NotNeeded;
        }

        debug!("Access token expiring soon, refreshing proactively");
        match self.refresh().await {
            Ok(_) => RefreshCheck::Refreshed,
            Err(e) => {
                warn!(error = %e, "Proactive token refresh failed");
                RefreshCheck::Failed
            }
        }
    }

    /// Run `check_expiry` every `check_interval` until the last handle to
    /// this session is dropped. Each check runs on its own task so a slow
    /// refresh never delays the next tick.
    pub fn spawn_refresh_task(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self
            .inner
            .settings
            .check_interval
            .max(StdDuration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("Session dropped, stopping refresh task");
                    break;
                };
                let session = SessionManager { inner };
                tokio::spawn(async move {
                    session.check_expiry().await;
                });
            }
        })
    }

    // ===== Requests =====

    /// Send `{API_BASE}{path}` with the current bearer token.
    ///
    /// A 401 triggers one refresh and one retry. Any other status, success or
    /// not, is returned for the caller to inspect.
    pub async fn authenticated_request(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> Result<Response, SessionError> {
        let token = self.access_token().ok_or(SessionError::NoToken)?;

        let response = self.send(path, &options, &token).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        info!(path, "Request unauthorized, refreshing token and retrying");
        // Failures below only end the session whose token was rejected.
        let fresh = match self.refresh_after_rejection(&token).await {
            Ok(fresh) => fresh,
            Err(e) => {
                self.end_session(|tokens| tokens.access_token == token);
                return Err(e);
            }
        };

        let retried = self.send(path, &options, &fresh).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            warn!(path, "Request still unauthorized after refresh, logging out");
            self.end_session(|tokens| tokens.access_token == fresh);
            return Err(SessionError::RefreshFailed(
                "request still unauthorized after token refresh".to_string(),
            ));
        }
        Ok(retried)
    }

    async fn send(
        &self,
        path: &str,
        options: &RequestOptions,
        token: &str,
    ) -> Result<Response, SessionError> {
        self.inner
            .api
            .send(path, options, token)
            .await
            .map_err(|e| SessionError::Network(e.to_string()))
    }

    // ===== Subscriptions =====

    /// Register `listener` for identity changes. It is called right away with
    /// the current identity, then after every login, refresh and logout.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Option<&Identity>) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.inner
            .subscribers
            .add_with_snapshot(listener, || self.user())
    }

    // ===== Internals =====

    /// Install a restored session without writing it back to the store.
    fn apply(&self, tokens: TokenPair, claims: Claims) {
        let identity = claims.identity.clone();
        Self::set_session(&mut self.write_state(), tokens, claims);
        self.inner.subscribers.notify(Some(&identity));
    }

    /// Persist and install a new pair, then notify. With `expected`, only
    /// replaces a session still holding exactly that pair; returns false
    /// when it no longer does.
    fn install(&self, expected: Option<&TokenPair>, tokens: TokenPair, claims: Claims) -> bool {
        let identity = claims.identity.clone();
        {
            let mut state = self.write_state();
            if expected.is_some_and(|expected| state.tokens.as_ref() != Some(expected)) {
                return false;
            }
            self.persist(&tokens);
            Self::set_session(&mut state, tokens, claims);
        }
        self.inner.subscribers.notify(Some(&identity));
        true
    }

    fn set_session(state: &mut SessionState, tokens: TokenPair, claims: Claims) {
        state.tokens = Some(tokens);
        state.claims = Some(claims);
        state.phase = SessionPhase::Authenticated;
    }

    fn persist(&self, tokens: &TokenPair) {
        let result = serde_json::to_string(tokens)
            .context("Failed to encode tokens")
            .and_then(|json| self.inner.store.set(TOKENS_KEY, &json));
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist tokens, session will not survive a restart");
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.inner.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.inner.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn refresh_slot(&self) -> MutexGuard<'_, Option<PendingRefresh>> {
        self.inner
            .refresh_in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn clear_pending_refresh(&self) {
        self.refresh_slot().take();
    }

    /// Clear the slot if it still holds refresh `id`.
    fn release_refresh(&self, id: u64) {
        let mut slot = self.refresh_slot();
        if slot.as_ref().is_some_and(|pending| pending.id == id) {
            *slot = None;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
