//! Data models for the authenticated session.
//!
//! - `TokenSet`: the access/refresh/id credential triple
//! - `UserProfile`: the signed-in user, derived at login
//! - `LoginResponse`, `RefreshResponse`, `RoleResponse`: wire bodies

pub mod tokens;
pub mod user;

pub use tokens::{LoginResponse, RefreshResponse, TokenSet};
pub use user::{RoleResponse, UserProfile};
