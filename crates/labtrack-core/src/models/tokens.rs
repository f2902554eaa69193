use serde::{Deserialize, Serialize};

/// The credential triple issued at login.
///
/// All three values are opaque to this crate except `id_token`, whose JWT
/// payload is decoded once at login to build the [`UserProfile`](super::UserProfile).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub id_token: String,
}

impl TokenSet {
    /// Apply a refresh result in place. Refresh and id tokens are only
    /// replaced when the backend rotated them.
    pub fn apply_refresh(&mut self, refreshed: RefreshResponse) {
        self.access_token = refreshed.access_token;
        if let Some(refresh_token) = refreshed.refresh_token {
            self.refresh_token = refresh_token;
        }
        if let Some(id_token) = refreshed.id_token {
            self.id_token = id_token;
        }
    }
}

// Tokens never reach logs.
impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("id_token", &"<redacted>")
            .finish()
    }
}

/// Body returned by `POST /login`.
#[derive(Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub id_token: String,
}

impl From<LoginResponse> for TokenSet {
    fn from(resp: LoginResponse) -> Self {
        Self {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            id_token: resp.id_token,
        }
    }
}

/// Body returned by `POST /refresh`. Rotation of the refresh and id tokens
/// is optional on the backend side.
#[derive(Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens() -> TokenSet {
        TokenSet {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            id_token: "it".to_string(),
        }
    }

    #[test]
    fn test_apply_refresh_keeps_unrotated_tokens() {
        let mut set = tokens();
        let refreshed: RefreshResponse =
            serde_json::from_str(r#"{"access_token":"at2"}"#).expect("valid refresh body");
        set.apply_refresh(refreshed);

        assert_eq!(set.access_token, "at2");
        assert_eq!(set.refresh_token, "rt");
        assert_eq!(set.id_token, "it");
    }

    #[test]
    fn test_apply_refresh_with_rotation() {
        let mut set = tokens();
        let refreshed: RefreshResponse = serde_json::from_str(
            r#"{"access_token":"at2","refresh_token":"rt2","id_token":"it2"}"#,
        )
        .expect("valid refresh body");
        set.apply_refresh(refreshed);

        assert_eq!(set.refresh_token, "rt2");
        assert_eq!(set.id_token, "it2");
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let rendered = format!("{:?}", tokens());
        assert!(!rendered.contains("\"at\""));
        assert!(rendered.contains("redacted"));
    }
}
