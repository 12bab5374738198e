//! Fakes shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::api::{ApiClient, ApiError, ApiRequest, ApiResponse, Transport};
use crate::auth::{
    CredentialStore, RefreshCoordinator, RefreshError, SessionExpiryNotifier, TokenExchange, TokenPair,
};
use crate::surface::{Navigator, Notice, NoticeSink};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Route {
    Status(u16, String),
    Fail(String),
}

type Hook = Box<dyn Fn() + Send + Sync>;

/// In-memory server. Fixed routes answer regardless of credentials; every
/// other URL answers 200 for an accepted bearer token and 401 otherwise.
#[derive(Default)]
pub struct FakeTransport {
    routes: Mutex<HashMap<String, Route>>,
    hooks: Mutex<HashMap<String, Hook>>,
    accepted: Mutex<HashSet<String>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl FakeTransport {
    pub const TOKEN_URL: &'static str = "https://auth.example.com/oauth/token";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept_token(&self, token: &str) {
        lock(&self.accepted).insert(token.to_string());
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) {
        lock(&self.routes).insert(url.to_string(), Route::Status(status, body.to_string()));
    }

    pub fn respond_to_token_endpoint(&self, status: u16, body: &str) {
        self.respond(Self::TOKEN_URL, status, body);
    }

    pub fn fail(&self, url: &str, message: &str) {
        lock(&self.routes).insert(url.to_string(), Route::Fail(message.to_string()));
    }

    /// Run `hook` whenever `url` is requested, before answering.
    pub fn on_send(&self, url: &str, hook: impl Fn() + Send + Sync + 'static) {
        lock(&self.hooks).insert(url.to_string(), Box::new(hook));
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        lock(&self.requests).push(request.clone());
        if let Some(hook) = lock(&self.hooks).get(&request.url) {
            hook();
        }

        match lock(&self.routes).get(&request.url) {
            Some(Route::Status(status, body)) => {
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return Ok(ApiResponse::new(status, body.clone()));
            }
            Some(Route::Fail(message)) => return Err(ApiError::Transport(message.clone())),
            None => {}
        }

        let authorized = request
            .bearer_token()
            .is_some_and(|token| lock(&self.accepted).contains(token));
        if authorized {
            Ok(ApiResponse::new(StatusCode::OK, r#"{"ok": true}"#))
        } else {
            Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, ""))
        }
    }
}

#[derive(Clone)]
enum Behavior {
    Succeed(String, String),
    Fail(RefreshError),
    /// Hands out A2/R2, A3/R3, ... on successive calls
    Rotate,
}

/// Token exchange that records every refresh token it is given.
pub struct CountingExchange {
    behavior: Mutex<Behavior>,
    delay: Mutex<Option<Duration>>,
    seen: Mutex<Vec<String>>,
}

impl CountingExchange {
    fn with_behavior(behavior: Behavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            delay: Mutex::new(None),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding(access: &str, refresh: &str) -> Self {
        Self::with_behavior(Behavior::Succeed(access.to_string(), refresh.to_string()))
    }

    pub fn failing(error: RefreshError) -> Self {
        Self::with_behavior(Behavior::Fail(error))
    }

    pub fn rotating() -> Self {
        Self::with_behavior(Behavior::Rotate)
    }

    pub fn with_delay_ms(self, ms: u64) -> Self {
        self.set_delay_ms(ms);
        self
    }

    pub fn set_delay_ms(&self, ms: u64) {
        *lock(&self.delay) = Some(Duration::from_millis(ms));
    }

    pub fn fail_with(&self, error: RefreshError) {
        *lock(&self.behavior) = Behavior::Fail(error);
    }

    pub fn calls(&self) -> usize {
        lock(&self.seen).len()
    }

    pub fn seen(&self) -> Vec<String> {
        lock(&self.seen).clone()
    }
}

#[async_trait]
impl TokenExchange for CountingExchange {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenPair, RefreshError> {
        let call = {
            let mut seen = lock(&self.seen);
            seen.push(refresh_token.to_string());
            seen.len()
        };
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let behavior = lock(&self.behavior).clone();
        match behavior {
            Behavior::Succeed(access, refresh) => Ok(TokenPair::new(access, refresh)),
            Behavior::Fail(error) => Err(error),
            Behavior::Rotate => Ok(TokenPair::new(format!("A{}", call + 1), format!("R{}", call + 1))),
        }
    }
}

#[derive(Default)]
pub struct RecordingNavigator {
    redirects: AtomicUsize,
}

impl RecordingNavigator {
    pub fn redirects(&self) -> usize {
        self.redirects.load(Ordering::SeqCst)
    }
}

impl Navigator for RecordingNavigator {
    fn redirect_to_login(&self) {
        self.redirects.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingNotices {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotices {
    pub fn notices(&self) -> Vec<Notice> {
        lock(&self.notices).clone()
    }
}

impl NoticeSink for RecordingNotices {
    fn notify(&self, notice: Notice) {
        lock(&self.notices).push(notice);
    }
}

/// A fully wired client over fakes. The exchange hands out A2/R2.
pub struct Harness {
    pub client: ApiClient,
    pub store: CredentialStore,
    pub transport: Arc<FakeTransport>,
    pub exchange: Arc<CountingExchange>,
    pub expiry: SessionExpiryNotifier,
    pub navigator: Arc<RecordingNavigator>,
    pub notices: Arc<RecordingNotices>,
}

impl Harness {
    pub fn logged_out() -> Self {
        let store = CredentialStore::in_memory();
        let transport = Arc::new(FakeTransport::new());
        let exchange = Arc::new(CountingExchange::succeeding("A2", "R2"));
        let navigator = Arc::new(RecordingNavigator::default());
        let notices = Arc::new(RecordingNotices::default());

        let refresher = RefreshCoordinator::new(store.clone(), exchange.clone());
        let expiry = SessionExpiryNotifier::new(store.clone(), navigator.clone(), Duration::from_secs(10));
        let client = ApiClient::new(
            transport.clone(),
            store.clone(),
            refresher,
            expiry.clone(),
            navigator.clone(),
            notices.clone(),
        );

        Self {
            client,
            store,
            transport,
            exchange,
            expiry,
            navigator,
            notices,
        }
    }

    pub fn logged_in(access: &str, refresh: &str) -> Self {
        let harness = Self::logged_out();
        harness
            .store
            .set(access, refresh)
            .expect("memory store never fails");
        harness
    }
}
