//! Labtrack core library.
//!
//! The authenticated request layer of the labtrack inventory and
//! reservation client: credential storage, the session state machine,
//! role-based landing routes, and an API client that refreshes expired
//! access tokens once for all concurrent callers.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod routing;

pub use api::{ApiError, ApiRequest, ApiResponse, AuthClient, AuthClientBuilder};
pub use auth::{CredentialStore, SessionStatus, StoredSession};
pub use config::Config;
pub use models::{TokenSet, UserProfile};
pub use routing::{ChannelNavigator, Navigator, NoopNavigator, Route};
