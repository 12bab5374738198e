//! Authentication module for keeping a client session alive.
//!
//! This module provides:
//! - `CredentialStore`: the persisted access/refresh token pair (file,
//!   OS keychain or memory)
//! - `RefreshCoordinator`: single-flight refresh-token exchange
//! - `ProactiveRefreshTimer`: periodic refresh while idle
//! - `SessionExpiryNotifier`: the session-expired dialog state machine
//! - `Session`: wires the above together with an `ApiClient`
//!
//! Refresh tokens rotate: every successful refresh stores a new pair.

pub mod credentials;
pub mod expiry;
pub mod refresh;
pub mod session;
pub mod timer;

pub use credentials::{CredentialStore, FileBackend, KeyringBackend, MemoryBackend, TokenBackend, TokenPair};
pub use expiry::{SessionExpiryNotifier, SessionExpiryState, ShowOutcome};
pub use refresh::{RefreshCoordinator, RefreshError, TokenExchange, TransportTokenExchange};
pub use session::Session;
pub use timer::ProactiveRefreshTimer;
