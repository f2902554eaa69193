//! Authenticated API client for the labtrack backend.
//!
//! Every backend call goes through [`AuthClient::send`], which attaches the
//! current access token, detects expiry (401), coordinates a single refresh
//! for all callers that hit it, and re-dispatches each suspended call once.
//! An unrecoverable refresh failure ends the session and sends the UI to the
//! login route.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::{header, Client, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error, info, warn};

use super::refresh::{Join, RefreshCoordinator, RefreshOutcome};
use super::{ApiError, ApiRequest, ApiResponse};
use crate::auth::{
    CredentialStore, IdClaims, KeyValueStore, SessionState, SessionStatus, StoredSession,
};
use crate::config::Config;
use crate::models::{LoginResponse, RefreshResponse, RoleResponse, TokenSet, UserProfile};
use crate::routing::{self, Navigator, NoopNavigator, Route};

// ============================================================================
// Constants
// ============================================================================

const LOGIN_PATH: &str = "/login";
const REFRESH_PATH: &str = "/refresh";
const ROLE_PATH: &str = "/user/role";

const JSON: &str = "application/json";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound on a whole refresh, retries included.
const REFRESH_TIMEOUT_SECS: u64 = 15;

/// Attempts for the refresh call on network errors and 5xx.
const REFRESH_MAX_ATTEMPTS: u32 = 3;

/// Initial backoff in milliseconds between refresh attempts.
const REFRESH_BACKOFF_MS: u64 = 250;

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Outcome of one dispatch. Expiry is its own branch so the refresh
/// decision is explicit at the call site.
enum Dispatch {
    Completed(Result<ApiResponse, ApiError>),
    AuthExpired,
}

#[derive(Debug, Clone, Copy)]
struct RefreshSettings {
    timeout: Duration,
    max_attempts: u32,
    backoff: Duration,
}

pub struct AuthClientBuilder {
    base_url: String,
    request_timeout: Duration,
    refresh: RefreshSettings,
    navigator: Arc<dyn Navigator>,
}

impl AuthClientBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            refresh: RefreshSettings {
                timeout: Duration::from_secs(REFRESH_TIMEOUT_SECS),
                max_attempts: REFRESH_MAX_ATTEMPTS,
                backoff: Duration::from_millis(REFRESH_BACKOFF_MS),
            },
            navigator: Arc::new(NoopNavigator),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.effective_api_base_url())
            .request_timeout(config.request_timeout())
            .refresh_timeout(config.refresh_timeout())
            .refresh_max_attempts(config.refresh_max_attempts)
            .refresh_backoff(config.refresh_backoff())
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh.timeout = timeout;
        self
    }

    pub fn refresh_max_attempts(mut self, attempts: u32) -> Self {
        self.refresh.max_attempts = attempts.max(1);
        self
    }

    pub fn refresh_backoff(mut self, backoff: Duration) -> Self {
        self.refresh.backoff = backoff;
        self
    }

    pub fn navigator(mut self, navigator: Arc<dyn Navigator>) -> Self {
        self.navigator = navigator;
        self
    }

    /// Load the stored session and build the client.
    ///
    /// The returned snapshot is the initial load; status reads and routing
    /// decisions are valid from here on.
    pub async fn build(
        self,
        backend: Arc<dyn KeyValueStore>,
    ) -> Result<(AuthClient, StoredSession), ApiError> {
        let http = Client::builder().timeout(self.request_timeout).build()?;
        let store = Arc::new(CredentialStore::new(backend));
        let (session, loaded) = SessionState::restore(store).await?;

        let client = AuthClient {
            inner: Arc::new(Inner {
                http,
                base_url: self.base_url.trim_end_matches('/').to_string(),
                session,
                refresh: Arc::new(RefreshCoordinator::new()),
                navigator: self.navigator,
                settings: self.refresh,
            }),
        };
        Ok((client, loaded))
    }
}

struct Inner {
    http: Client,
    base_url: String,
    session: SessionState,
    refresh: Arc<RefreshCoordinator>,
    navigator: Arc<dyn Navigator>,
    settings: RefreshSettings,
}

/// Session-aware API client.
/// Construct once at startup and clone into call sites; clones share the
/// connection pool, the credential store and the refresh coordinator.
#[derive(Clone)]
pub struct AuthClient {
    inner: Arc<Inner>,
}

impl AuthClient {
    pub fn builder(base_url: impl Into<String>) -> AuthClientBuilder {
        AuthClientBuilder::new(base_url)
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.session.status()
    }

    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<SessionStatus> {
        self.inner.session.subscribe()
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.refresh.is_outstanding()
    }

    fn store(&self) -> &Arc<CredentialStore> {
        self.inner.session.store()
    }

    pub async fn profile(&self) -> Result<Option<UserProfile>, ApiError> {
        Ok(self.store().load().await?.profile)
    }

    /// Route the UI should show for the current session.
    pub async fn initial_route(&self) -> Result<Route, ApiError> {
        let loaded = self.store().load().await?;
        Ok(routing::initial_route(self.status(), loaded.profile.as_ref()))
    }

    // ===== Login / Logout =====

    /// Log in and persist the new session.
    ///
    /// Runs on its own task so a caller giving up mid-login cannot leave the
    /// session stuck in `Authenticating`.
    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile, ApiError> {
        let client = self.clone();
        let email = email.to_string();
        let password = password.to_string();
        tokio::spawn(async move { client.run_login(&email, &password).await })
            .await
            .map_err(|e| ApiError::Interrupted(format!("login task failed: {}", e)))?
    }

    async fn run_login(&self, email: &str, password: &str) -> Result<UserProfile, ApiError> {
        self.inner
            .session
            .transition(SessionStatus::Authenticating)
            .await?;
        info!("Logging in");

        let (tokens, profile) = match self.authenticate(email, password).await {
            Ok(established) => established,
            Err(e) => {
                warn!(error = %e, "Login failed");
                self.abort_login().await;
                return Err(e);
            }
        };

        if let Err(e) = self.inner.session.complete_login(&tokens, &profile).await {
            error!(error = %e, "Failed to persist new session");
            self.abort_login().await;
            return Err(e.into());
        }
        Ok(profile)
    }

    async fn abort_login(&self) {
        if let Err(e) = self.inner.session.terminate().await {
            error!(error = %e, "Failed to reset session after login failure");
        }
    }

    async fn authenticate(
        &self,
        email: &str,
        password: &str,
    ) -> Result<(TokenSet, UserProfile), ApiError> {
        let response = self
            .inner
            .http
            .post(self.url(LOGIN_PATH))
            .header(header::ACCEPT, JSON)
            .json(&LoginRequest { email, password })
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ApiError::InvalidCredentials);
        }
        let tokens: TokenSet = Self::read_response(response)
            .await?
            .json::<LoginResponse>()?
            .into();

        let claims = IdClaims::decode(&tokens.id_token)?;
        let server_role = match self.fetch_role(&tokens.id_token).await {
            Ok(role) => Some(role),
            Err(e) if claims.role.is_some() => {
                warn!(error = %e, "Role lookup failed, using id token role");
                None
            }
            Err(e) => return Err(e),
        };

        let profile = claims.into_profile(server_role);
        debug!(user = %profile.id, role = %profile.role, "Profile built from id token");
        Ok((tokens, profile))
    }

    async fn fetch_role(&self, id_token: &str) -> Result<String, ApiError> {
        let response = self
            .inner
            .http
            .get(self.url(ROLE_PATH))
            .bearer_auth(id_token)
            .header(header::ACCEPT, JSON)
            .send()
            .await?;
        let role: RoleResponse = Self::read_response(response).await?.json()?;
        Ok(role.role)
    }

    /// End the session on the user's request. Idempotent.
    pub async fn logout(&self) -> Result<(), ApiError> {
        match self.inner.session.terminate().await {
            Ok(false) => Ok(()),
            Ok(true) => {
                info!("Logged out");
                self.inner.navigator.present(routing::route(None));
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Logged out, but stored credentials were not fully cleared");
                self.inner.navigator.present(routing::route(None));
                Err(e.into())
            }
        }
    }

    // ===== Authenticated requests =====

    /// Send an authenticated request.
    ///
    /// Only a 401 is handled here; every other failure is returned as is.
    /// A call is re-dispatched at most once, and a second 401 ends the
    /// session with `UnrecoverableAuth`.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let url = self.request_url(&request.path)?;
        let token = self.current_access_token().await?;

        let token = match self.dispatch(request, &url, &token).await {
            Dispatch::Completed(result) => return result,
            Dispatch::AuthExpired => {
                debug!(method = %request.method, path = %request.path, "Access token rejected");
                self.token_for_retry(&token).await?
            }
        };

        match self.dispatch(request, &url, &token).await {
            Dispatch::Completed(result) => result,
            Dispatch::AuthExpired => {
                warn!(
                    method = %request.method,
                    path = %request.path,
                    "Request rejected again after token refresh"
                );
                self.terminal_logout(&token).await;
                Err(ApiError::UnrecoverableAuth(
                    "credentials rejected after refresh".to_string(),
                ))
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(&ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(&ApiRequest::post(path).json(body)?).await?.json()
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(&ApiRequest::put(path).json(body)?).await?.json()
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send(&ApiRequest::delete(path)).await.map(|_| ())
    }

    async fn current_access_token(&self) -> Result<String, ApiError> {
        self.store()
            .access_token()
            .await?
            .ok_or_else(|| ApiError::UnrecoverableAuth("not logged in".to_string()))
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.inner.base_url, path)
        } else {
            format!("{}/{}", self.inner.base_url, path)
        }
    }

    /// URL for a caller-supplied path. Absolute URLs are only accepted under
    /// the base URL, since the bearer token goes with every request.
    fn request_url(&self, path: &str) -> Result<String, ApiError> {
        if !path.contains("://") {
            return Ok(self.url(path));
        }
        let base = &self.inner.base_url;
        let under_base = path
            .strip_prefix(base.as_str())
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(['/', '?']));
        if under_base {
            Ok(path.to_string())
        } else {
            warn!(url = %path, "Refusing to send credentials outside the API base URL");
            Err(ApiError::InvalidRequest(format!(
                "{} is outside the API base URL {}",
                path, base
            )))
        }
    }

    async fn dispatch(&self, request: &ApiRequest, url: &str, token: &str) -> Dispatch {
        let mut builder = self
            .inner
            .http
            .request(request.method.clone(), url)
            .bearer_auth(token)
            .header(header::ACCEPT, JSON);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return Dispatch::Completed(Err(e.into())),
        };
        if response.status() == StatusCode::UNAUTHORIZED {
            return Dispatch::AuthExpired;
        }
        Dispatch::Completed(Self::read_response(response).await)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn read_response(response: reqwest::Response) -> Result<ApiResponse, ApiError> {
        let status = response.status();
        if status.is_success() {
            let body = response.bytes().await?;
            Ok(ApiResponse::new(status, body.to_vec()))
        } else {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    debug!(%status, error = %e, "Failed to read error response body");
                    String::new()
                }
            };
            Err(ApiError::from_status(status, &body))
        }
    }

    // ===== Refresh protocol =====

    /// Token to re-dispatch with after `rejected` got a 401.
    async fn token_for_retry(&self, rejected: &str) -> Result<String, ApiError> {
        // Blocks behind an in-progress refresh write.
        match self.store().access_token().await? {
            None => Err(ApiError::UnrecoverableAuth("session has ended".to_string())),
            Some(current) if current != rejected => {
                debug!("Token was refreshed while the request was in flight");
                Ok(current)
            }
            Some(_) => self.await_refresh(rejected).await,
        }
    }

    /// Join the outstanding refresh, or start one, and wait for its outcome.
    async fn await_refresh(&self, rejected: &str) -> Result<String, ApiError> {
        let waiter = match self.inner.refresh.join() {
            Join::Waiter(waiter) => waiter,
            Join::Owner(owner, waiter) => {
                // Spawned so the refresh completes even if this caller is dropped.
                let client = self.clone();
                let rejected = rejected.to_string();
                tokio::spawn(async move {
                    let outcome = client.run_refresh(&rejected).await;
                    owner.resolve(outcome);
                });
                waiter
            }
        };

        match waiter.wait().await {
            RefreshOutcome::Retry => self.store().access_token().await?.ok_or_else(|| {
                ApiError::UnrecoverableAuth("session ended during refresh".to_string())
            }),
            RefreshOutcome::Fail(reason) => Err(ApiError::UnrecoverableAuth(reason)),
        }
    }

    /// Body of the ticket owner's task.
    async fn run_refresh(&self, rejected: &str) -> RefreshOutcome {
        let store = self.store();

        match store.access_token().await {
            Ok(Some(current)) if current != rejected => {
                debug!("Access token already replaced, skipping refresh");
                return RefreshOutcome::Retry;
            }
            Ok(Some(_)) => {}
            Ok(None) => return RefreshOutcome::Fail("not logged in".to_string()),
            Err(e) => return self.fail_refresh(rejected, format!("storage read failed: {}", e)).await,
        }

        let refresh_token = match store.refresh_token().await {
            Ok(Some(token)) => token,
            Ok(None) => return self.fail_refresh(rejected, "no refresh token stored".to_string()).await,
            Err(e) => return self.fail_refresh(rejected, format!("storage read failed: {}", e)).await,
        };

        let timeout = self.inner.settings.timeout;
        let refreshed =
            match tokio::time::timeout(timeout, self.request_refresh(&refresh_token)).await {
                Ok(Ok(refreshed)) => refreshed,
                Ok(Err(reason)) => return self.fail_refresh(rejected, reason).await,
                Err(_) => {
                    let reason = format!("refresh timed out after {}s", timeout.as_secs_f32());
                    return self.fail_refresh(rejected, reason).await;
                }
            };

        match self.inner.session.apply_refresh(&refresh_token, refreshed).await {
            Ok(Some(_)) => {
                info!("Access token refreshed");
                RefreshOutcome::Retry
            }
            Ok(None) => RefreshOutcome::Fail("session ended during refresh".to_string()),
            Err(e) => {
                // The session has already been ended by the failed write.
                self.inner.navigator.present(routing::route(None));
                RefreshOutcome::Fail(format!("could not store refreshed tokens: {}", e))
            }
        }
    }

    async fn fail_refresh(&self, rejected: &str, reason: String) -> RefreshOutcome {
        warn!(reason = %reason, "Token refresh failed, ending session");
        self.terminal_logout(rejected).await;
        RefreshOutcome::Fail(reason)
    }

    /// Call `POST /refresh`, retrying network errors and 5xx with backoff.
    async fn request_refresh(&self, refresh_token: &str) -> Result<RefreshResponse, String> {
        let url = self.url(REFRESH_PATH);
        let settings = self.inner.settings;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let sent = self
                .inner
                .http
                .post(&url)
                .header(header::ACCEPT, JSON)
                .json(&RefreshRequest { refresh_token })
                .send()
                .await;

            let transient = match sent {
                Ok(response) if response.status().is_success() => {
                    let refreshed: RefreshResponse = response
                        .json()
                        .await
                        .map_err(|e| format!("malformed refresh response: {}", e))?;
                    if refreshed.access_token.is_empty() {
                        return Err("refresh response carried an empty access token".to_string());
                    }
                    return Ok(refreshed);
                }
                Ok(response) if response.status().is_server_error() => {
                    format!("refresh endpoint returned {}", response.status())
                }
                Ok(response) => {
                    return Err(format!("refresh token rejected ({})", response.status()));
                }
                Err(e) => format!("refresh request failed: {}", e),
            };

            if attempt >= settings.max_attempts {
                return Err(transient);
            }
            let delay = backoff_delay(settings.backoff, attempt);
            warn!(
                attempt,
                max_attempts = settings.max_attempts,
                delay_ms = delay.as_millis() as u64,
                reason = %transient,
                "Refresh attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Clear the session if `failed_token` is still current, then send the
    /// UI to the login route. Runs at most once per dead token.
    async fn terminal_logout(&self, failed_token: &str) {
        match self.inner.session.terminate_if_current(failed_token).await {
            Ok(true) => {
                info!("Session ended after unrecoverable authentication failure");
                self.inner.navigator.present(routing::route(None));
            }
            Ok(false) => debug!("Session already ended or replaced"),
            Err(e) => {
                error!(error = %e, "Failed to clear credentials after authentication failure");
                self.inner.navigator.present(routing::route(None));
            }
        }
    }
}

/// Exponential backoff with up to one base interval of jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.saturating_sub(1).min(10));
    let base_ms = base.as_millis() as u64;
    let jitter = if base_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=base_ms)
    };
    exp + Duration::from_millis(jitter)
}
