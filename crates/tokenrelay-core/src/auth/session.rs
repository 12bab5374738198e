use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::api::{ApiClient, ReqwestTransport, Transport};
use crate::config::{BackendKind, Config};
use crate::surface::{Navigator, NoticeSink};

use super::refresh::{TokenExchange, TransportTokenExchange};
use super::{
    CredentialStore, FileBackend, KeyringBackend, MemoryBackend, ProactiveRefreshTimer,
    RefreshCoordinator, SessionExpiryNotifier, TokenPair,
};

/// One client session: the stored credentials and everything that keeps
/// them fresh. Create one at startup and share it.
pub struct Session {
    store: CredentialStore,
    refresher: RefreshCoordinator,
    expiry: SessionExpiryNotifier,
    client: ApiClient,
    refresh_interval: Duration,
    timer: Mutex<Option<ProactiveRefreshTimer>>,
}

impl Session {
    /// Build a session from config: backend, reqwest transport and the
    /// configured token endpoint.
    pub fn open(config: &Config, navigator: Arc<dyn Navigator>, notices: Arc<dyn NoticeSink>) -> Result<Self> {
        let store = Self::open_store(config)?;
        let transport: Arc<dyn Transport> =
            Arc::new(ReqwestTransport::new(config.request_timeout()).context("Failed to build HTTP client")?);
        Self::with_transport(config, store, transport, navigator, notices)
    }

    /// Build a session that sends everything, including the refresh
    /// exchange, through `transport`.
    pub fn with_transport(
        config: &Config,
        store: CredentialStore,
        transport: Arc<dyn Transport>,
        navigator: Arc<dyn Navigator>,
        notices: Arc<dyn NoticeSink>,
    ) -> Result<Self> {
        let token_url = config
            .resolved_token_url()
            .ok_or_else(|| anyhow::anyhow!("No token_url or api_base_url configured"))?;
        let mut exchange = TransportTokenExchange::new(Arc::clone(&transport), token_url);
        if let Some(ref client_id) = config.client_id {
            exchange = exchange.with_client_id(client_id.clone());
        }
        Ok(Self::with_exchange(config, store, transport, Arc::new(exchange), navigator, notices))
    }

    pub fn with_exchange(
        config: &Config,
        store: CredentialStore,
        transport: Arc<dyn Transport>,
        exchange: Arc<dyn TokenExchange>,
        navigator: Arc<dyn Navigator>,
        notices: Arc<dyn NoticeSink>,
    ) -> Self {
        let refresher = RefreshCoordinator::new(store.clone(), exchange);
        let expiry = SessionExpiryNotifier::new(
            store.clone(),
            Arc::clone(&navigator),
            config.session_expiry_timeout(),
        );
        let mut client = ApiClient::new(
            transport,
            store.clone(),
            refresher.clone(),
            expiry.clone(),
            navigator,
            notices,
        );
        if let Some(ref base_url) = config.api_base_url {
            client = client.with_base_url(base_url.clone());
        }

        Self {
            store,
            refresher,
            expiry,
            client,
            refresh_interval: config.refresh_interval(),
            timer: Mutex::new(None),
        }
    }

    /// The credential store selected by `config.credential_backend`.
    pub fn open_store(config: &Config) -> Result<CredentialStore> {
        let store = match config.credential_backend {
            BackendKind::File => CredentialStore::new(FileBackend::new(config.cache_dir()?)),
            BackendKind::Keyring => CredentialStore::new(KeyringBackend::new()),
            BackendKind::Memory => CredentialStore::new(MemoryBackend::new()),
        };
        debug!(backend = ?config.credential_backend, "Credential store opened");
        Ok(store)
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.refresher
    }

    pub fn expiry(&self) -> &SessionExpiryNotifier {
        &self.expiry
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.get().is_some()
    }

    /// Store a freshly issued pair and keep it fresh from now on.
    pub fn login(&self, pair: &TokenPair) -> Result<()> {
        self.store.set_pair(pair).context("Failed to store credentials")?;
        info!("Logged in");
        self.start();
        Ok(())
    }

    /// Drop all local credential state. No network call.
    pub fn logout(&self) -> Result<()> {
        self.stop();
        self.store.clear().context("Failed to clear credentials")?;
        info!("Logged out");
        Ok(())
    }

    /// Start the proactive refresh timer if it isn't running.
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut timer = self.timer();
        if timer.as_ref().is_some_and(|t| t.is_running()) {
            return;
        }
        *timer = Some(ProactiveRefreshTimer::start(
            self.refresher.clone(),
            self.store.clone(),
            self.refresh_interval,
        ));
    }

    pub fn stop(&self) {
        if let Some(mut timer) = self.timer().take() {
            timer.stop();
        }
    }

    pub fn is_refreshing_proactively(&self) -> bool {
        self.timer().as_ref().is_some_and(|t| t.is_running())
    }

    /// The owning UI context is going away: stop the timer and detach the
    /// session-expired dialog. Stored credentials are kept.
    pub fn teardown(&self) {
        self.stop();
        self.expiry.close();
        debug!("Session torn down");
    }

    fn timer(&self) -> MutexGuard<'_, Option<ProactiveRefreshTimer>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
