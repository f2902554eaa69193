use std::collections::BTreeMap;

use thiserror::Error;

use crate::auth::{ClaimsError, SessionError, StorageError};

#[derive(Error, Debug)]
pub enum ApiError {
    /// 401 on a protected call. Consumed by the refresh protocol and never
    /// returned from `AuthClient::send`.
    #[error("Unauthorized - token may be expired")]
    AuthExpired,

    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field_errors: BTreeMap<String, Vec<String>>,
    },

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Operation interrupted: {0}")]
    Interrupted(String),

    #[error("Session expired, please log in again ({0})")]
    UnrecoverableAuth(String),

    #[error("Credential storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Could not read id token: {0}")]
    Claims(#[from] ClaimsError),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            400 | 422 => Self::validation(body),
            401 => ApiError::AuthExpired,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            code @ 500..=599 => ApiError::ServerError {
                status: code,
                body: truncated,
            },
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Build a validation error from a 400/422 body, keeping the server's
    /// per-field messages. Accepts `{"message", "errors": {field: [..]}}`
    /// with string or list values; anything else becomes the message.
    fn validation(body: &str) -> Self {
        let mut message = Self::truncate_body(body);
        let mut field_errors = BTreeMap::new();

        if let Ok(serde_json::Value::Object(obj)) = serde_json::from_str(body) {
            if let Some(msg) = obj
                .get("message")
                .or_else(|| obj.get("error"))
                .and_then(|m| m.as_str())
            {
                message = msg.to_string();
            }
            if let Some(serde_json::Value::Object(errors)) = obj.get("errors") {
                for (field, value) in errors {
                    let messages = match value {
                        serde_json::Value::String(s) => vec![s.clone()],
                        serde_json::Value::Array(items) => items
                            .iter()
                            .filter_map(|i| i.as_str().map(str::to_string))
                            .collect(),
                        other => vec![other.to_string()],
                    };
                    field_errors.insert(field.clone(), messages);
                }
            }
        }

        ApiError::Validation {
            message,
            field_errors,
        }
    }

    pub fn is_unrecoverable_auth(&self) -> bool {
        matches!(self, ApiError::UnrecoverableAuth(_))
    }
}
