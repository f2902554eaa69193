use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use super::credentials::{CredentialStore, StoredSession};
use super::storage::StorageError;
use crate::models::{RefreshResponse, TokenSet, UserProfile};

/// Login lifecycle as seen by the UI.
///
/// `LoggedOut` and `LoggedIn` are rest states. `Authenticating` only lives
/// for the duration of a login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionStatus {
    #[default]
    LoggedOut,
    Authenticating,
    LoggedIn,
}

impl SessionStatus {
    /// Value persisted under the `loginStatus` key.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::LoggedOut => "loggedOut",
            SessionStatus::Authenticating => "loading",
            SessionStatus::LoggedIn => "loggedIn",
        }
    }

    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (LoggedOut, Authenticating)
                | (Authenticating, LoggedIn)
                | (Authenticating, LoggedOut)
                | (LoggedIn, LoggedOut)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loggedOut" => Ok(SessionStatus::LoggedOut),
            "loading" => Ok(SessionStatus::Authenticating),
            "loggedIn" => Ok(SessionStatus::LoggedIn),
            other => Err(format!("unknown login status: {}", other)),
        }
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Session state machine backed by the credential store.
///
/// The in-memory status is published through a watch channel so UI
/// consumers can react to transitions; every transition is persisted before
/// it is published.
pub struct SessionState {
    store: Arc<CredentialStore>,
    status_tx: watch::Sender<SessionStatus>,
    // Serializes transitions so check-then-persist is atomic.
    transition: Mutex<()>,
}

impl SessionState {
    /// Build the state machine from whatever the store holds.
    ///
    /// A persisted `loading` status means the process died mid-login, and
    /// `loggedIn` without tokens cannot be used; both are resolved to
    /// `LoggedOut` and the store is cleared. Credentials left behind under
    /// `loggedOut` are cleared as well.
    pub async fn restore(store: Arc<CredentialStore>) -> Result<(Self, StoredSession), StorageError> {
        let mut loaded = match store.load().await {
            Ok(loaded) => loaded,
            Err(StorageError::Corrupt { key, reason }) => {
                // Logged out with leftover credentials: a clear was interrupted.
                if store.status().await? != SessionStatus::LoggedOut {
                    return Err(StorageError::Corrupt { key, reason });
                }
                warn!(key = %key, reason = %reason, "Finishing interrupted credential clear");
                store.clear().await?;
                store.load().await?
            }
            Err(e) => return Err(e),
        };

        let stale = match loaded.status {
            SessionStatus::Authenticating => true,
            SessionStatus::LoggedIn => loaded.tokens.is_none(),
            SessionStatus::LoggedOut => loaded.tokens.is_some() || loaded.profile.is_some(),
        };
        if stale {
            warn!(status = %loaded.status, "Discarding unusable stored session");
            store.clear().await?;
            loaded = StoredSession {
                tokens: None,
                profile: None,
                status: SessionStatus::LoggedOut,
            };
        }

        debug!(status = %loaded.status, has_profile = loaded.profile.is_some(), "Session restored");
        let (status_tx, _) = watch::channel(loaded.status);
        Ok((
            Self {
                store,
                status_tx,
                transition: Mutex::new(()),
            },
            loaded,
        ))
    }

    pub fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Move to `next`, persisting it first. Rejects transitions the
    /// lifecycle does not allow.
    pub async fn transition(&self, next: SessionStatus) -> Result<(), SessionError> {
        let _guard = self.transition.lock().await;
        let current = self.status();
        if !current.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        self.store.save_status(next).await?;
        self.publish(next);
        Ok(())
    }

    /// Finish a login attempt: persist tokens, profile and `LoggedIn` together.
    pub async fn complete_login(
        &self,
        tokens: &TokenSet,
        profile: &UserProfile,
    ) -> Result<(), SessionError> {
        let _guard = self.transition.lock().await;
        let current = self.status();
        if !current.can_transition_to(SessionStatus::LoggedIn) {
            return Err(SessionError::InvalidTransition {
                from: current,
                to: SessionStatus::LoggedIn,
            });
        }
        self.store
            .save_session(tokens, profile, SessionStatus::LoggedIn)
            .await?;
        self.publish(SessionStatus::LoggedIn);
        info!(role = %profile.role, "Login complete");
        Ok(())
    }

    /// Clear credentials and enter `LoggedOut` unconditionally.
    ///
    /// Returns `false` when the session was already logged out and nothing
    /// was touched. A storage failure is returned after `LoggedOut` has been
    /// published.
    pub async fn terminate(&self) -> Result<bool, SessionError> {
        let _guard = self.transition.lock().await;
        if self.status() == SessionStatus::LoggedOut {
            return Ok(false);
        }
        let cleared = self.store.clear().await;
        self.publish(SessionStatus::LoggedOut);
        cleared?;
        Ok(true)
    }

    /// Terminal logout keyed on the access token that failed.
    ///
    /// Only clears when `access_token` is still the stored one, so several
    /// calls failing on the same dead token log out exactly once. On a
    /// storage failure the session is still ended and the error returned.
    pub async fn terminate_if_current(&self, access_token: &str) -> Result<bool, SessionError> {
        let _guard = self.transition.lock().await;
        match self.store.clear_if_current(access_token).await {
            Ok(false) => Ok(false),
            Ok(true) => {
                self.publish(SessionStatus::LoggedOut);
                Ok(true)
            }
            Err(e) => {
                self.publish(SessionStatus::LoggedOut);
                Err(e.into())
            }
        }
    }

    /// Store refreshed tokens for the session `sent_refresh_token` belongs to.
    ///
    /// `Ok(None)` means that session is gone and nothing was written. If the
    /// write fails the session is ended: credentials are cleared as far as
    /// storage allows and `LoggedOut` is published before the error returns.
    pub async fn apply_refresh(
        &self,
        sent_refresh_token: &str,
        refreshed: RefreshResponse,
    ) -> Result<Option<TokenSet>, SessionError> {
        let _guard = self.transition.lock().await;
        match self.store.apply_refresh(sent_refresh_token, refreshed).await {
            Ok(applied) => Ok(applied),
            Err(e) => {
                warn!(error = %e, "Failed to store refreshed tokens, ending session");
                if let Err(clear_err) = self.store.clear().await {
                    error!(error = %clear_err, "Failed to clear credentials after refresh write failure");
                }
                self.publish(SessionStatus::LoggedOut);
                Err(e.into())
            }
        }
    }

    fn publish(&self, status: SessionStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            info!(from = %previous, to = %status, "Session status changed");
        }
    }
}
