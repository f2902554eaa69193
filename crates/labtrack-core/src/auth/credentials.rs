use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::session::SessionStatus;
use super::storage::{KeyValueStore, StorageError};
use crate::models::{RefreshResponse, TokenSet, UserProfile};

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";
pub const ID_TOKEN_KEY: &str = "idToken";
pub const USER_PROFILE_KEY: &str = "userProfile";
pub const LOGIN_STATUS_KEY: &str = "loginStatus";

/// Everything the credential store holds, read under one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSession {
    pub tokens: Option<TokenSet>,
    pub profile: Option<UserProfile>,
    pub status: SessionStatus,
}

/// Owns the persisted token set, user profile and login status.
///
/// Every operation holds the store's lock for its whole duration: readers
/// share it, writers take it exclusively, and the guard is released on every
/// exit path. A refresh write therefore blocks any caller trying to read the
/// access token until the new value is in place, and a `clear` is never seen
/// half-done.
pub struct CredentialStore {
    backend: Arc<dyn KeyValueStore>,
    lock: RwLock<()>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            lock: RwLock::new(()),
        }
    }

    /// Load tokens, profile and status.
    ///
    /// A partially stored token set or an unparseable value is reported as
    /// `StorageError::Corrupt` rather than treated as absent.
    pub async fn load(&self) -> Result<StoredSession, StorageError> {
        let _guard = self.lock.read().await;
        Ok(StoredSession {
            tokens: self.read_tokens().await?,
            profile: self.read_profile().await?,
            status: self.read_status().await?,
        })
    }

    /// Current access token, read fresh from storage.
    pub async fn access_token(&self) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.read().await;
        self.backend.get(ACCESS_TOKEN_KEY).await
    }

    pub async fn refresh_token(&self) -> Result<Option<String>, StorageError> {
        let _guard = self.lock.read().await;
        self.backend.get(REFRESH_TOKEN_KEY).await
    }

    pub async fn status(&self) -> Result<SessionStatus, StorageError> {
        let _guard = self.lock.read().await;
        self.read_status().await
    }

    pub async fn save_tokens(&self, tokens: &TokenSet) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        self.write_tokens(tokens).await
    }

    pub async fn save_status(&self, status: SessionStatus) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        self.backend.set(LOGIN_STATUS_KEY, status.as_str()).await
    }

    /// Persist a freshly established session in one acquisition.
    pub async fn save_session(
        &self,
        tokens: &TokenSet,
        profile: &UserProfile,
        status: SessionStatus,
    ) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        self.write_tokens(tokens).await?;
        self.write_profile(profile).await?;
        self.backend.set(LOGIN_STATUS_KEY, status.as_str()).await
    }

    /// Apply a refresh result to the token set it was requested for.
    ///
    /// Writes only when `sent_refresh_token` is still the stored refresh
    /// token. Returns `None` when the session was cleared or replaced while
    /// the refresh was in flight; a refresh never resurrects or overwrites
    /// another session. Rotated tokens are written before the access token,
    /// so a failed write never pairs a new access token with a superseded
    /// refresh token.
    pub async fn apply_refresh(
        &self,
        sent_refresh_token: &str,
        refreshed: RefreshResponse,
    ) -> Result<Option<TokenSet>, StorageError> {
        let _guard = self.lock.write().await;
        let mut tokens = match self.read_tokens().await? {
            Some(tokens) if tokens.refresh_token == sent_refresh_token => tokens,
            Some(_) => {
                debug!("Session replaced during refresh, discarding new tokens");
                return Ok(None);
            }
            None => {
                debug!("Session cleared during refresh, discarding new tokens");
                return Ok(None);
            }
        };
        let rotated_refresh = refreshed.refresh_token.is_some();
        let rotated_id = refreshed.id_token.is_some();
        tokens.apply_refresh(refreshed);

        if rotated_refresh {
            self.backend.set(REFRESH_TOKEN_KEY, &tokens.refresh_token).await?;
        }
        if rotated_id {
            self.backend.set(ID_TOKEN_KEY, &tokens.id_token).await?;
        }
        self.backend.set(ACCESS_TOKEN_KEY, &tokens.access_token).await?;
        debug!(rotated_refresh, rotated_id, "Stored refreshed tokens");
        Ok(Some(tokens))
    }

    /// Remove tokens and profile and mark the session logged out.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.lock.write().await;
        self.clear_locked().await
    }

    /// Clear only if `access_token` is still the stored one.
    ///
    /// Returns whether anything was cleared. Concurrent failures carrying
    /// the same dead token clear once; a newer session is left alone.
    pub async fn clear_if_current(&self, access_token: &str) -> Result<bool, StorageError> {
        let _guard = self.lock.write().await;
        match self.backend.get(ACCESS_TOKEN_KEY).await? {
            Some(current) if current == access_token => {
                self.clear_locked().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Status goes first and the refresh token before the rest, so an
    /// interrupted clear never leaves a usable session behind. Every key is
    /// attempted; the first failure is returned.
    async fn clear_locked(&self) -> Result<(), StorageError> {
        let mut first_error = self
            .backend
            .set(LOGIN_STATUS_KEY, SessionStatus::LoggedOut.as_str())
            .await
            .err();
        for key in [REFRESH_TOKEN_KEY, ACCESS_TOKEN_KEY, ID_TOKEN_KEY, USER_PROFILE_KEY] {
            if let Err(e) = self.backend.delete(key).await {
                warn!(key, error = %e, "Failed to remove stored credential");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Credential store cleared");
                Ok(())
            }
        }
    }

    async fn read_tokens(&self) -> Result<Option<TokenSet>, StorageError> {
        let access = self.backend.get(ACCESS_TOKEN_KEY).await?;
        let refresh = self.backend.get(REFRESH_TOKEN_KEY).await?;
        let id = self.backend.get(ID_TOKEN_KEY).await?;

        match (access, refresh, id) {
            (None, None, None) => Ok(None),
            (Some(access_token), Some(refresh_token), Some(id_token)) => Ok(Some(TokenSet {
                access_token,
                refresh_token,
                id_token,
            })),
            (access, refresh, id) => Err(StorageError::Corrupt {
                key: "tokens".to_string(),
                reason: format!(
                    "partial token set (access: {}, refresh: {}, id: {})",
                    access.is_some(),
                    refresh.is_some(),
                    id.is_some()
                ),
            }),
        }
    }

    async fn read_profile(&self) -> Result<Option<UserProfile>, StorageError> {
        let Some(raw) = self.backend.get(USER_PROFILE_KEY).await? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                key: USER_PROFILE_KEY.to_string(),
                reason: e.to_string(),
            })
    }

    async fn read_status(&self) -> Result<SessionStatus, StorageError> {
        match self.backend.get(LOGIN_STATUS_KEY).await? {
            None => Ok(SessionStatus::LoggedOut),
            Some(raw) => raw.parse().map_err(|_| StorageError::Corrupt {
                key: LOGIN_STATUS_KEY.to_string(),
                reason: format!("unknown status {:?}", raw),
            }),
        }
    }

    async fn write_tokens(&self, tokens: &TokenSet) -> Result<(), StorageError> {
        self.backend.set(ACCESS_TOKEN_KEY, &tokens.access_token).await?;
        self.backend.set(REFRESH_TOKEN_KEY, &tokens.refresh_token).await?;
        self.backend.set(ID_TOKEN_KEY, &tokens.id_token).await
    }

    async fn write_profile(&self, profile: &UserProfile) -> Result<(), StorageError> {
        let raw = serde_json::to_string(profile).map_err(|e| StorageError::Corrupt {
            key: USER_PROFILE_KEY.to_string(),
            reason: e.to_string(),
        })?;
        self.backend.set(USER_PROFILE_KEY, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryStore;

    fn tokens() -> TokenSet {
        TokenSet {
            access_token: "at-1".to_string(),
            refresh_token: "rt-1".to_string(),
            id_token: "it-1".to_string(),
        }
    }

    fn profile() -> UserProfile {
        UserProfile {
            id: "u-7".to_string(),
            first_name: "Nimal".to_string(),
            last_name: "Perera".to_string(),
            email: "nimal@example.edu".to_string(),
            role: "Technician".to_string(),
            contact_number: "0771234567".to_string(),
        }
    }

    fn store() -> (Arc<MemoryStore>, CredentialStore) {
        let backend = Arc::new(MemoryStore::new());
        let store = CredentialStore::new(backend.clone());
        (backend, store)
    }

    #[tokio::test]
    async fn test_cold_start_is_logged_out() {
        let (_, store) = store();
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.tokens, None);
        assert_eq!(loaded.profile, None);
        assert_eq!(loaded.status, SessionStatus::LoggedOut);
    }

    #[tokio::test]
    async fn test_token_set_round_trip() {
        let (_, store) = store();
        store.save_tokens(&tokens()).await.expect("save");
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.tokens, Some(tokens()));
    }

    #[tokio::test]
    async fn test_partial_token_set_is_corrupt() {
        let (backend, store) = store();
        backend.set(ACCESS_TOKEN_KEY, "at").await.expect("set");

        let result = store.load().await;
        assert!(matches!(result, Err(StorageError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_unknown_status_is_corrupt() {
        let (backend, store) = store();
        backend.set(LOGIN_STATUS_KEY, "maybe").await.expect("set");
        assert!(matches!(store.load().await, Err(StorageError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_read_failure_is_not_defaulted() {
        let (backend, store) = store();
        store.save_tokens(&tokens()).await.expect("save");
        backend.fail_reads(true);

        assert!(store.load().await.is_err());
        assert!(store.access_token().await.is_err());
    }

    #[tokio::test]
    async fn test_clear_removes_everything_and_logs_out() {
        let (backend, store) = store();
        store
            .save_session(&tokens(), &profile(), SessionStatus::LoggedIn)
            .await
            .expect("save");

        store.clear().await.expect("clear");

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.tokens, None);
        assert_eq!(loaded.profile, None);
        assert_eq!(loaded.status, SessionStatus::LoggedOut);
        assert_eq!(backend.peek(LOGIN_STATUS_KEY).as_deref(), Some("loggedOut"));
    }

    #[tokio::test]
    async fn test_clear_if_current_only_clears_matching_token() {
        let (_, store) = store();
        store.save_tokens(&tokens()).await.expect("save");

        assert!(!store.clear_if_current("stale").await.expect("clear"));
        assert!(store.load().await.expect("load").tokens.is_some());

        assert!(store.clear_if_current("at-1").await.expect("clear"));
        assert!(!store.clear_if_current("at-1").await.expect("clear"));
        assert!(store.load().await.expect("load").tokens.is_none());
    }

    #[tokio::test]
    async fn test_apply_refresh_after_clear_does_not_resurrect() {
        let (_, store) = store();
        store.save_tokens(&tokens()).await.expect("save");
        store.clear().await.expect("clear");

        let refreshed = RefreshResponse {
            access_token: "at-2".to_string(),
            refresh_token: None,
            id_token: None,
        };
        assert_eq!(store.apply_refresh("rt-1", refreshed).await.expect("apply"), None);
        assert_eq!(store.access_token().await.expect("read"), None);
    }

    #[tokio::test]
    async fn test_apply_refresh_writes_rotated_tokens() {
        let (_, store) = store();
        store.save_tokens(&tokens()).await.expect("save");

        let refreshed = RefreshResponse {
            access_token: "at-2".to_string(),
            refresh_token: Some("rt-2".to_string()),
            id_token: None,
        };
        let updated = store
            .apply_refresh("rt-1", refreshed)
            .await
            .expect("apply")
            .expect("session present");

        assert_eq!(updated.access_token, "at-2");
        let loaded = store.load().await.expect("load").tokens.expect("tokens");
        assert_eq!(loaded.refresh_token, "rt-2");
        assert_eq!(loaded.id_token, "it-1");
    }

    #[tokio::test]
    async fn test_apply_refresh_leaves_replaced_session_alone() {
        let (_, store) = store();
        let replacement = TokenSet {
            access_token: "userB-at".to_string(),
            refresh_token: "userB-rt".to_string(),
            id_token: "userB-it".to_string(),
        };
        store.save_tokens(&replacement).await.expect("save");

        let refreshed = RefreshResponse {
            access_token: "userA-at-2".to_string(),
            refresh_token: Some("userA-rt-2".to_string()),
            id_token: None,
        };
        assert_eq!(store.apply_refresh("rt-1", refreshed).await.expect("apply"), None);
        assert_eq!(store.load().await.expect("load").tokens, Some(replacement));
    }

    #[tokio::test]
    async fn test_failed_rotation_keeps_old_access_token() {
        let (backend, store) = store();
        store.save_tokens(&tokens()).await.expect("save");
        backend.fail_sets_of(REFRESH_TOKEN_KEY);

        let refreshed = RefreshResponse {
            access_token: "at-2".to_string(),
            refresh_token: Some("rt-2".to_string()),
            id_token: None,
        };
        assert!(store.apply_refresh("rt-1", refreshed).await.is_err());
        assert_eq!(backend.peek(ACCESS_TOKEN_KEY).as_deref(), Some("at-1"));
        assert_eq!(backend.peek(REFRESH_TOKEN_KEY).as_deref(), Some("rt-1"));
    }

    #[tokio::test]
    async fn test_interrupted_clear_still_logs_out_and_drops_refresh_token() {
        let (backend, store) = store();
        store
            .save_session(&tokens(), &profile(), SessionStatus::LoggedIn)
            .await
            .expect("save");
        backend.fail_deletes_of(ID_TOKEN_KEY);

        assert!(store.clear().await.is_err());
        assert_eq!(backend.peek(LOGIN_STATUS_KEY).as_deref(), Some("loggedOut"));
        assert_eq!(backend.peek(REFRESH_TOKEN_KEY), None);
        assert_eq!(backend.peek(ACCESS_TOKEN_KEY), None);
        assert_eq!(backend.peek(USER_PROFILE_KEY), None);
        assert_eq!(backend.peek(ID_TOKEN_KEY).as_deref(), Some("it-1"));
    }

    #[tokio::test]
    async fn test_write_failure_surfaces() {
        let (backend, store) = store();
        backend.fail_writes(true);
        assert!(store.save_tokens(&tokens()).await.is_err());
        assert!(store.clear().await.is_err());
    }
}
