//! API client module.
//!
//! This module provides the `ApiClient`, which decorates outgoing requests
//! with the stored bearer token and recovers from expired tokens, plus the
//! `Transport` abstraction it sends through and the `ApiError` taxonomy.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{ApiClient, Delivery};
pub use error::{ApiError, Unrecoverable};
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, RequestBody, Transport};
