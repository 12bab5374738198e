//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! API and token endpoints, refresh cadence, the session-expiry countdown and
//! which credential backend to use.
//!
//! Configuration is stored at `~/.config/tokenrelay/config.json`. A handful
//! of environment variables override the file (see [`Config::apply_env`]).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "tokenrelay";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Proactive refresh cadence. Well inside the lifetime of a typical access token.
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 600;

/// How long the session-expired dialog stays up before forcing logout.
const DEFAULT_SESSION_EXPIRY_SECS: u64 = 10;

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_LOGIN_URL: &str = "/login";

/// Where the token pair is persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// JSON file in the cache directory
    #[default]
    File,
    /// OS keychain
    Keyring,
    /// Process memory only; nothing survives a restart
    Memory,
}

impl BackendKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Some(Self::File),
            "keyring" | "keychain" => Some(Self::Keyring),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL that relative request paths are resolved against
    pub api_base_url: Option<String>,
    /// Token endpoint used for the refresh exchange
    pub token_url: Option<String>,
    /// Sent as `client_id` in the refresh exchange when set
    pub client_id: Option<String>,
    /// Login surface the user is redirected to when the session expires
    pub login_url: String,
    pub refresh_interval_secs: u64,
    pub session_expiry_secs: u64,
    pub request_timeout_secs: u64,
    pub credential_backend: BackendKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: None,
            token_url: None,
            client_id: None,
            login_url: DEFAULT_LOGIN_URL.to_string(),
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            session_expiry_secs: DEFAULT_SESSION_EXPIRY_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            credential_backend: BackendKind::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Read a config file, falling back to defaults when it doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Override file settings from `TOKENRELAY_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("TOKENRELAY_API_URL") {
            self.api_base_url = Some(url);
        }
        if let Some(url) = var("TOKENRELAY_TOKEN_URL") {
            self.token_url = Some(url);
        }
        if let Some(id) = var("TOKENRELAY_CLIENT_ID") {
            self.client_id = Some(id);
        }
        if let Some(backend) = var("TOKENRELAY_BACKEND") {
            match BackendKind::from_str(&backend) {
                Some(kind) => self.credential_backend = kind,
                None => warn!(value = %backend, "Unknown TOKENRELAY_BACKEND, keeping configured backend"),
            }
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn session_expiry_timeout(&self) -> Duration {
        Duration::from_secs(self.session_expiry_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The token endpoint, falling back to `<api_base_url>/oauth/token`.
    pub fn resolved_token_url(&self) -> Option<String> {
        self.token_url.clone().or_else(|| {
            self.api_base_url
                .as_ref()
                .map(|base| format!("{}/oauth/token", base.trim_end_matches('/')))
        })
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}
