//! Authenticated API client.
//!
//! Every request goes out with the current access token. A 401 triggers one
//! refresh (shared with any other request that hit a 401 at the same time)
//! and one replay of the request; callers only ever see the replayed
//! response. When the session can't be recovered the caller gets
//! [`ApiError::SessionExpired`] and the session-expired dialog is shown.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::auth::{CredentialStore, RefreshCoordinator, SessionExpiryNotifier};
use crate::surface::{Navigator, Notice, NoticeSink};

use super::{ApiError, ApiRequest, ApiResponse, Transport, Unrecoverable};

// ============================================================================
// Constants
// ============================================================================

/// A request is replayed at most once after refreshing credentials.
const MAX_AUTH_RETRIES: u32 = 1;

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
/// 1 second is polite to the server while not making users wait too long.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// How a request ended up once authentication recovery has played out.
#[derive(Debug)]
pub enum Delivery<T> {
    /// Succeeded on the first attempt.
    Success(T),
    /// Got a 401, refreshed credentials, and succeeded on the replay.
    AuthRecovered(T),
    /// Credentials could not be recovered; the session has ended.
    Unrecoverable(Unrecoverable),
}

impl<T> Delivery<T> {
    pub fn into_result(self) -> Result<T, ApiError> {
        match self {
            Delivery::Success(value) | Delivery::AuthRecovered(value) => Ok(value),
            Delivery::Unrecoverable(reason) => Err(ApiError::SessionExpired(reason)),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Delivery<U> {
        match self {
            Delivery::Success(value) => Delivery::Success(f(value)),
            Delivery::AuthRecovered(value) => Delivery::AuthRecovered(f(value)),
            Delivery::Unrecoverable(reason) => Delivery::Unrecoverable(reason),
        }
    }

    pub fn was_recovered(&self) -> bool {
        matches!(self, Delivery::AuthRecovered(_))
    }
}

/// Per-call state carried through the attempts of one request.
#[derive(Debug, Clone)]
struct CallContext {
    token: Option<String>,
    auth_retries: u32,
}

impl CallContext {
    fn new(token: Option<String>) -> Self {
        Self {
            token,
            auth_retries: 0,
        }
    }

    fn can_retry(&self) -> bool {
        self.auth_retries < MAX_AUTH_RETRIES
    }

    fn retry_with(self, token: String) -> Self {
        Self {
            token: Some(token),
            auth_retries: self.auth_retries + 1,
        }
    }

    fn deliver<T>(&self, value: T) -> Delivery<T> {
        if self.auth_retries == 0 {
            Delivery::Success(value)
        } else {
            Delivery::AuthRecovered(value)
        }
    }
}

/// API client that keeps its session alive.
/// Clone is cheap - every field is a shared handle.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    store: CredentialStore,
    refresher: RefreshCoordinator,
    expiry: SessionExpiryNotifier,
    navigator: Arc<dyn Navigator>,
    notices: Arc<dyn NoticeSink>,
    base_url: Option<String>,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: CredentialStore,
        refresher: RefreshCoordinator,
        expiry: SessionExpiryNotifier,
        navigator: Arc<dyn Navigator>,
        notices: Arc<dyn NoticeSink>,
    ) -> Self {
        Self {
            transport,
            store,
            refresher,
            expiry,
            navigator,
            notices,
            base_url: None,
        }
    }

    /// Resolve relative paths against `base_url`.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into().trim_end_matches('/').to_string());
        self
    }

    /// Build a full URL from a path. Absolute URLs pass through untouched.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        match self.base_url {
            Some(ref base) => format!("{}/{}", base, path.trim_start_matches('/')),
            None => path.to_string(),
        }
    }

    /// The stored access token, for callers that must have one.
    pub fn current_token(&self) -> Result<String, ApiError> {
        self.store.access_token().ok_or(ApiError::Unauthenticated)
    }

    /// Send a request, recovering from an expired access token transparently.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.dispatch(&request).await?.into_result()
    }

    /// Send a request and report how authentication played out.
    ///
    /// Errors other than 401 (403, 5xx, validation, network) are returned
    /// as-is and never retried, apart from the 429 backoff.
    pub async fn dispatch(&self, request: &ApiRequest) -> Result<Delivery<ApiResponse>, ApiError> {
        let mut ctx = CallContext::new(self.store.access_token());

        loop {
            let response = self.send_with_backoff(request, ctx.token.as_deref()).await?;
            if response.status != StatusCode::UNAUTHORIZED {
                return self.check_response(response).map(|r| ctx.deliver(r));
            }

            if !ctx.can_retry() {
                warn!(url = %request.url, "Request rejected again after refreshing credentials");
                return Ok(Delivery::Unrecoverable(
                    self.expire_session(Unrecoverable::RejectedAfterRefresh),
                ));
            }

            debug!(url = %request.url, "Got 401, refreshing credentials");
            match self.refresher.refresh_rejected(ctx.token.as_deref()).await {
                Ok(token) => ctx = ctx.retry_with(token),
                Err(e) => {
                    return Ok(Delivery::Unrecoverable(
                        self.expire_session(Unrecoverable::RefreshFailed(e)),
                    ));
                }
            }
        }
    }

    /// GET `path` and parse the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.send(ApiRequest::get(self.url(path))).await?;
        response.json()
    }

    /// POST a JSON body to `path` and parse the JSON response.
    pub async fn post_json<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let request = ApiRequest::post(self.url(path)).json(body)?;
        let response = self.send(request).await?;
        response.json()
    }

    /// One attempt with the given token, backing off while rate limited.
    async fn send_with_backoff(&self, request: &ApiRequest, token: Option<&str>) -> Result<ApiResponse, ApiError> {
        let decorated = request.with_bearer(token)?;
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = match self.transport.send(decorated.clone()).await {
                Ok(response) => response,
                Err(e) => return Err(self.report(e)),
            };
            if response.status != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Ok(response);
            }
            warn!(url = %request.url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2; // Exponential backoff
        }
    }

    /// Check if response is successful, returning an error with body if not.
    fn check_response(&self, response: ApiResponse) -> Result<ApiResponse, ApiError> {
        if response.status.is_success() {
            Ok(response)
        } else {
            Err(self.report(ApiError::from_status(response.status, &response.body)))
        }
    }

    /// Tell the user about a failed request.
    fn report(&self, error: ApiError) -> ApiError {
        let notice = match &error {
            ApiError::AccessDenied(_) => Notice::access_denied(error.to_string()),
            _ => Notice::request_failed(error.to_string()),
        };
        self.notices.notify(notice);
        error
    }

    /// Log out locally and hand the transition to the session-expired dialog.
    fn expire_session(&self, reason: Unrecoverable) -> Unrecoverable {
        warn!(reason = %reason, "Session could not be recovered");
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear credentials");
        }
        // The dialog redirects when it closes; only redirect here if nothing will
        if !self.expiry.show().is_managed() {
            self.navigator.redirect_to_login();
        }
        reason
    }
}
