//! Core library for tokenrelay.
//!
//! Keeps an API session alive on the client side:
//!
//! - `auth`: credential storage, single-flight refresh, the proactive refresh
//!   timer, the session-expired state machine, and the `Session` that wires
//!   them together
//! - `api`: the request interceptor (`ApiClient`), transport abstraction and
//!   error taxonomy
//! - `surface`: the traits the UI layer implements (notices and navigation)
//! - `config`: application configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod surface;

#[cfg(test)]
mod testing;

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse, Delivery, Transport};
pub use auth::{
    CredentialStore, RefreshCoordinator, RefreshError, Session, SessionExpiryNotifier,
    SessionExpiryState, TokenPair,
};
pub use config::Config;
pub use surface::{Navigator, Notice, NoticeKind, NoticeSink};
