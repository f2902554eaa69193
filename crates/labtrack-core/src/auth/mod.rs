//! Authentication state: credentials, session lifecycle and storage.
//!
//! This module provides:
//! - `CredentialStore`: persisted token set, user profile and login status
//! - `SessionState`: the LoggedOut / Authenticating / LoggedIn state machine
//! - `IdClaims`: id token payload decoding used at login
//! - `KeyValueStore` backends: file, OS keychain, memory

pub mod claims;
pub mod credentials;
pub mod session;
pub mod storage;

pub use claims::{ClaimsError, IdClaims};
pub use credentials::{CredentialStore, StoredSession};
pub use session::{SessionError, SessionState, SessionStatus};
pub use storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore, StorageError};
