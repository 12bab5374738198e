//! Refresh-token exchange with single-flight coordination.
//!
//! However many callers ask for a refresh at once, only one exchange goes out
//! on the wire. Everyone who asks while it is outstanding awaits the same
//! shared future and receives the same outcome.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ApiRequest, Transport};

use super::{CredentialStore, TokenPair};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("no refresh token stored")]
    NoRefreshCredential,

    #[error("refresh token rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("token endpoint unreachable: {0}")]
    Transport(String),

    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    #[error("failed to store refreshed credentials: {0}")]
    Storage(String),

    #[error("refresh task aborted: {0}")]
    Aborted(String),
}

/// Exchanges a refresh token for a new token pair.
#[async_trait]
pub trait TokenExchange: Send + Sync {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, RefreshError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
}

/// `grant_type=refresh_token` form post to the token endpoint.
pub struct TransportTokenExchange {
    transport: Arc<dyn Transport>,
    token_url: String,
    client_id: Option<String>,
}

impl TransportTokenExchange {
    pub fn new(transport: Arc<dyn Transport>, token_url: impl Into<String>) -> Self {
        Self {
            transport,
            token_url: token_url.into(),
            client_id: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    fn build_request(&self, refresh_token: &str) -> ApiRequest {
        let mut fields = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ];
        if let Some(ref client_id) = self.client_id {
            fields.push(("client_id", client_id.clone()));
        }
        ApiRequest::post(&self.token_url).form(fields)
    }
}

#[async_trait]
impl TokenExchange for TransportTokenExchange {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, RefreshError> {
        let response = self
            .transport
            .send(self.build_request(refresh_token))
            .await
            .map_err(|e| RefreshError::Transport(e.to_string()))?;

        if !response.status.is_success() {
            return Err(RefreshError::Rejected {
                status: response.status.as_u16(),
                body: ApiError::truncate_body(&response.body),
            });
        }

        let token: TokenResponse = response
            .json()
            .map_err(|e| RefreshError::InvalidResponse(e.to_string()))?;
        if token.access_token.is_empty() || token.refresh_token.is_empty() {
            return Err(RefreshError::InvalidResponse("empty token in response".to_string()));
        }
        Ok(TokenPair::new(token.access_token, token.refresh_token))
    }
}

type RefreshOutcome = Result<String, RefreshError>;
type InFlight = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Serializes refresh exchanges. Clone is cheap - clones share the in-flight marker.
#[derive(Clone)]
pub struct RefreshCoordinator {
    store: CredentialStore,
    exchange: Arc<dyn TokenExchange>,
    in_flight: Arc<Mutex<Option<InFlight>>>,
}

impl RefreshCoordinator {
    pub fn new(store: CredentialStore, exchange: Arc<dyn TokenExchange>) -> Self {
        Self {
            store,
            exchange,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Get a fresh access token, joining the outstanding exchange if there is one.
    ///
    /// On success both stored credentials have been replaced; on failure the
    /// store has been cleared. Must be called from within a Tokio runtime.
    pub async fn refresh(&self) -> RefreshOutcome {
        self.begin(None).await
    }

    /// Refresh because `rejected` got a 401. If the stored access token has
    /// already moved past it, that token is returned and nothing is exchanged.
    pub async fn refresh_rejected(&self, rejected: Option<&str>) -> RefreshOutcome {
        self.begin(Some(rejected)).await
    }

    async fn begin(&self, rejected: Option<Option<&str>>) -> RefreshOutcome {
        let in_flight = {
            let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(existing) => {
                    debug!("Joining in-flight token refresh");
                    existing.clone()
                }
                None => {
                    let Some(pair) = self.store.get() else {
                        debug!("No refresh token stored, not refreshing");
                        return Err(RefreshError::NoRefreshCredential);
                    };
                    // Checked under the lock so a late 401 can't spend the rotated token
                    if rejected.is_some_and(|token| token != Some(pair.access_token.as_str())) {
                        debug!("Rejected token already superseded, not refreshing");
                        return Ok(pair.access_token);
                    }
                    let started = self.start(pair.refresh_token);
                    *slot = Some(started.clone());
                    started
                }
            }
        };
        in_flight.await
    }

    /// True while an exchange is outstanding.
    pub fn is_refreshing(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Spawn the exchange so it finishes even if every waiter goes away.
    fn start(&self, refresh_token: String) -> InFlight {
        let store = self.store.clone();
        let exchange = Arc::clone(&self.exchange);
        let in_flight = Arc::clone(&self.in_flight);

        let handle = tokio::spawn(async move {
            debug!("Starting token refresh exchange");
            let outcome = match exchange.exchange(&refresh_token).await {
                Ok(pair) => match store.set_pair(&pair) {
                    Ok(()) => {
                        info!("Token refresh succeeded");
                        Ok(pair.access_token)
                    }
                    Err(e) => Err(RefreshError::Storage(e.to_string())),
                },
                Err(e) => Err(e),
            };
            if let Err(ref e) = outcome {
                warn!(error = %e, "Token refresh failed, clearing stored credentials");
                if let Err(clear_err) = store.clear() {
                    warn!(error = %clear_err, "Failed to clear credentials after refresh failure");
                }
            }
            // Credentials are settled before the marker goes away
            *in_flight.lock().unwrap_or_else(PoisonError::into_inner) = None;
            outcome
        });

        async move {
            match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(RefreshError::Aborted(e.to_string())),
            }
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RequestBody;
    use crate::testing::{CountingExchange, FakeTransport};
    use reqwest::StatusCode;

    fn store_with(access: &str, refresh: &str) -> CredentialStore {
        let store = CredentialStore::in_memory();
        store.set(access, refresh).expect("memory store never fails");
        store
    }

    #[tokio::test]
    async fn test_no_refresh_token_fails_without_exchange() {
        let exchange = Arc::new(CountingExchange::succeeding("A2", "R2"));
        let coordinator = RefreshCoordinator::new(CredentialStore::in_memory(), exchange.clone());

        let result = coordinator.refresh().await;
        assert_eq!(result, Err(RefreshError::NoRefreshCredential));
        assert_eq!(exchange.calls(), 0);
    }

    #[tokio::test]
    async fn test_success_rotates_both_credentials() {
        let store = store_with("A1", "R1");
        let exchange = Arc::new(CountingExchange::succeeding("A2", "R2"));
        let coordinator = RefreshCoordinator::new(store.clone(), exchange.clone());

        let token = coordinator.refresh().await.expect("refresh should succeed");
        assert_eq!(token, "A2");
        assert_eq!(exchange.seen(), vec!["R1".to_string()]);

        let pair = store.get().expect("pair should be stored");
        assert_eq!((pair.access_token.as_str(), pair.refresh_token.as_str()), ("A2", "R2"));
        assert!(!coordinator.is_refreshing());
    }

    #[tokio::test]
    async fn test_failure_clears_store() {
        let store = store_with("A1", "R1");
        let exchange = Arc::new(CountingExchange::failing(RefreshError::Rejected {
            status: 400,
            body: "invalid_grant".to_string(),
        }));
        let coordinator = RefreshCoordinator::new(store.clone(), exchange.clone());

        let result = coordinator.refresh().await;
        assert!(matches!(result, Err(RefreshError::Rejected { status: 400, .. })));
        assert!(store.get().is_none());
        assert!(!coordinator.is_refreshing());

        // Not retried automatically, and nothing left to refresh with
        assert_eq!(coordinator.refresh().await, Err(RefreshError::NoRefreshCredential));
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_exchange() {
        let store = store_with("A1", "R1");
        let exchange = Arc::new(CountingExchange::succeeding("A2", "R2").with_delay_ms(50));
        let coordinator = RefreshCoordinator::new(store.clone(), exchange.clone());

        let waiters: Vec<_> = (0..8).map(|_| coordinator.refresh()).collect();
        let results = futures::future::join_all(waiters).await;

        assert_eq!(exchange.calls(), 1);
        assert!(results.iter().all(|r| r.as_deref() == Ok("A2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_failure() {
        let store = store_with("A1", "R1");
        let exchange = Arc::new(
            CountingExchange::failing(RefreshError::Transport("connection reset".to_string()))
                .with_delay_ms(50),
        );
        let coordinator = RefreshCoordinator::new(store.clone(), exchange.clone());

        let results = futures::future::join_all((0..5).map(|_| coordinator.refresh())).await;

        assert_eq!(exchange.calls(), 1);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(RefreshError::Transport(msg)) if msg == "connection reset")));
        assert!(store.get().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_survives_dropped_caller() {
        let store = store_with("A1", "R1");
        let exchange = Arc::new(CountingExchange::succeeding("A2", "R2").with_delay_ms(50));
        let coordinator = RefreshCoordinator::new(store.clone(), exchange.clone());

        // Give up on the refresh before it finishes
        let abandoned = tokio::time::timeout(std::time::Duration::from_millis(10), coordinator.refresh()).await;
        assert!(abandoned.is_err());
        assert!(coordinator.is_refreshing());

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(store.access_token().as_deref(), Some("A2"));
        assert!(!coordinator.is_refreshing());
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test]
    async fn test_sequential_refreshes_use_rotated_token() {
        let store = store_with("A1", "R1");
        let exchange = Arc::new(CountingExchange::rotating());
        let coordinator = RefreshCoordinator::new(store.clone(), exchange.clone());

        coordinator.refresh().await.expect("first refresh");
        coordinator.refresh().await.expect("second refresh");

        assert_eq!(exchange.seen(), vec!["R1".to_string(), "R2".to_string()]);
        assert_eq!(store.refresh_token().as_deref(), Some("R3"));
    }

    #[tokio::test]
    async fn test_late_rejection_reuses_rotated_token() {
        let store = store_with("A1", "R1");
        let exchange = Arc::new(CountingExchange::rotating());
        let coordinator = RefreshCoordinator::new(store.clone(), exchange.clone());

        coordinator.refresh_rejected(Some("A1")).await.expect("first refresh");
        // A second request rejected with A1 arrives after the rotation finished
        let token = coordinator.refresh_rejected(Some("A1")).await.expect("reuse rotated token");

        assert_eq!(token, "A2");
        assert_eq!(exchange.seen(), vec!["R1".to_string()]);
        assert_eq!(store.refresh_token().as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn test_rejection_of_current_token_refreshes() {
        let store = store_with("A2", "R2");
        let exchange = Arc::new(CountingExchange::succeeding("A3", "R3"));
        let coordinator = RefreshCoordinator::new(store.clone(), exchange.clone());

        let token = coordinator.refresh_rejected(Some("A2")).await.expect("refresh");
        assert_eq!(token, "A3");
        assert_eq!(exchange.seen(), vec!["R2".to_string()]);
    }

    #[tokio::test]
    async fn test_transport_exchange_posts_form() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond_to_token_endpoint(200, r#"{"access_token": "A2", "refresh_token": "R2", "token_type": "Bearer"}"#);
        let exchange = TransportTokenExchange::new(transport.clone(), FakeTransport::TOKEN_URL)
            .with_client_id("cli");

        let pair = exchange.exchange("R1").await.expect("exchange should succeed");
        assert_eq!(pair.access_token, "A2");
        assert_eq!(pair.refresh_token, "R2");

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, reqwest::Method::POST);
        assert!(requests[0].bearer_token().is_none());
        match &requests[0].body {
            RequestBody::Form(fields) => {
                assert!(fields.contains(&("grant_type".to_string(), "refresh_token".to_string())));
                assert!(fields.contains(&("refresh_token".to_string(), "R1".to_string())));
                assert!(fields.contains(&("client_id".to_string(), "cli".to_string())));
            }
            other => panic!("expected form body, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transport_exchange_rejected() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond_to_token_endpoint(400, r#"{"error": "invalid_grant"}"#);
        let exchange = TransportTokenExchange::new(transport, FakeTransport::TOKEN_URL);

        let err = exchange.exchange("R1").await.expect_err("exchange should fail");
        assert_eq!(
            err,
            RefreshError::Rejected {
                status: StatusCode::BAD_REQUEST.as_u16(),
                body: r#"{"error": "invalid_grant"}"#.to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_transport_exchange_missing_fields() {
        let transport = Arc::new(FakeTransport::new());
        transport.respond_to_token_endpoint(200, r#"{"access_token": "A2"}"#);
        let exchange = TransportTokenExchange::new(transport, FakeTransport::TOKEN_URL);

        let err = exchange.exchange("R1").await.expect_err("exchange should fail");
        assert!(matches!(err, RefreshError::InvalidResponse(_)));
    }
}
