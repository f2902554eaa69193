//! Id token claim decoding.
//!
//! The id token is only decoded to pre-fill the user profile; its signature
//! is checked by the backend on every call that uses it, never here.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;
use thiserror::Error;

use crate::models::UserProfile;

#[derive(Error, Debug)]
pub enum ClaimsError {
    #[error("Id token is not a three-part JWT")]
    Malformed,

    #[error("Id token payload is not valid base64url: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Id token payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdClaims {
    pub sub: Option<String>,
    pub email: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
    pub name: Option<String>,
    #[serde(alias = "contact_number", alias = "custom:contact_number")]
    pub phone_number: Option<String>,
    #[serde(rename = "custom:role", alias = "role")]
    pub role: Option<String>,
}

impl IdClaims {
    /// Decode the payload segment of a JWT without verifying it.
    pub fn decode(id_token: &str) -> Result<Self, ClaimsError> {
        let mut parts = id_token.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ClaimsError::Malformed);
        };

        let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('='))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Given name, falling back to the first word of `name`.
    pub fn first_name(&self) -> String {
        if let Some(ref given) = self.given_name {
            return given.clone();
        }
        self.name
            .as_deref()
            .and_then(|n| n.split_whitespace().next())
            .unwrap_or_default()
            .to_string()
    }

    /// Family name, falling back to everything after the first word of `name`.
    pub fn last_name(&self) -> String {
        if let Some(ref family) = self.family_name {
            return family.clone();
        }
        self.name
            .as_deref()
            .and_then(|n| n.trim().split_once(char::is_whitespace))
            .map(|(_, rest)| rest.trim().to_string())
            .unwrap_or_default()
    }

    /// Build the profile persisted at login. The server-reported role wins
    /// over the claim.
    pub fn into_profile(self, server_role: Option<String>) -> UserProfile {
        let first_name = self.first_name();
        let last_name = self.last_name();
        UserProfile {
            id: self.sub.unwrap_or_default(),
            first_name,
            last_name,
            email: self.email.unwrap_or_default(),
            role: server_role.or(self.role).unwrap_or_default(),
            contact_number: self.phone_number.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
pub(crate) fn encode_test_token(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig", header, payload)
}
