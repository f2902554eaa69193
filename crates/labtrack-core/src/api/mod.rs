//! Authenticated request layer for the labtrack backend.
//!
//! This module provides the `AuthClient` through which every backend call
//! is made. It attaches the stored bearer token, refreshes it when the
//! backend answers 401 (one refresh at a time, shared by every caller that
//! hit the expiry), and ends the session when the refresh itself fails.

pub mod client;
pub mod error;
pub mod refresh;
pub mod request;

pub use client::{AuthClient, AuthClientBuilder};
pub use error::ApiError;
pub use refresh::RefreshOutcome;
pub use request::{ApiRequest, ApiResponse};
