use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const SERVICE_NAME: &str = "tokenrelay";

/// Keychain account the token pair is filed under
const KEYRING_USER: &str = "session";

/// Credentials file name in cache directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// The access/refresh credential pair. Always stored and replaced as one record.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub issued_at: DateTime<Utc>,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            issued_at: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        Utc::now() - self.issued_at
    }

    /// Age for display, e.g. "4m ago"
    pub fn age_display(&self) -> String {
        let minutes = self.age().num_minutes();
        if minutes < 1 {
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", minutes / 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Persistent storage for the token pair.
pub trait TokenBackend: Send + Sync {
    fn load(&self) -> Result<Option<TokenPair>>;
    fn save(&self, pair: &TokenPair) -> Result<()>;
    fn delete(&self) -> Result<()>;
}

/// JSON file in the cache directory.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self {
            path: cache_dir.as_ref().join(CREDENTIALS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TokenBackend for FileBackend {
    fn load(&self) -> Result<Option<TokenPair>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)
            .context("Failed to read credentials file")?;
        let pair = serde_json::from_str(&contents)
            .context("Failed to parse credentials file")?;
        Ok(Some(pair))
    }

    /// Write to a temp file and rename so a reader never sees half a pair.
    /// Each save gets its own temp file (PID + counter) so concurrent saves
    /// never rename each other's file away.
    fn save(&self, pair: &TokenPair) -> Result<()> {
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(pair)?;
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_path = self
            .path
            .with_file_name(format!("{}.{}.{}.tmp", CREDENTIALS_FILE, std::process::id(), seq));
        std::fs::write(&tmp_path, contents)
            .context("Failed to write credentials file")?;
        std::fs::rename(&tmp_path, &self.path)
            .context("Failed to replace credentials file")?;
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .context("Failed to remove credentials file")?;
        }
        Ok(())
    }
}

/// OS keychain entry holding the pair as JSON.
#[derive(Default)]
pub struct KeyringBackend;

impl KeyringBackend {
    pub fn new() -> Self {
        Self
    }

    fn entry(&self) -> Result<Entry> {
        Entry::new(SERVICE_NAME, KEYRING_USER).context("Failed to create keyring entry")
    }
}

impl TokenBackend for KeyringBackend {
    fn load(&self) -> Result<Option<TokenPair>> {
        match self.entry()?.get_password() {
            Ok(json) => Ok(Some(
                serde_json::from_str(&json).context("Failed to parse keychain credentials")?,
            )),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve credentials from keychain"),
        }
    }

    fn save(&self, pair: &TokenPair) -> Result<()> {
        let json = serde_json::to_string(pair)?;
        self.entry()?
            .set_password(&json)
            .context("Failed to store credentials in keychain")
    }

    fn delete(&self) -> Result<()> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credentials from keychain"),
        }
    }
}

/// Process-local storage; nothing survives a restart.
#[derive(Default)]
pub struct MemoryBackend {
    pair: Mutex<Option<TokenPair>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenBackend for MemoryBackend {
    fn load(&self) -> Result<Option<TokenPair>> {
        Ok(self.pair.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, pair: &TokenPair) -> Result<()> {
        *self.pair.lock().unwrap_or_else(PoisonError::into_inner) = Some(pair.clone());
        Ok(())
    }

    fn delete(&self) -> Result<()> {
        *self.pair.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Shared handle to the stored token pair.
/// Clone is cheap - all clones read and write the same backend.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn TokenBackend>,
}

impl CredentialStore {
    pub fn new(backend: impl TokenBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    /// Current pair. An unreadable store counts as empty.
    pub fn get(&self) -> Option<TokenPair> {
        match self.backend.load() {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Credential store unavailable, treating as logged out");
                None
            }
        }
    }

    pub fn set(&self, access_token: impl Into<String>, refresh_token: impl Into<String>) -> Result<()> {
        self.set_pair(&TokenPair::new(access_token, refresh_token))
    }

    pub fn set_pair(&self, pair: &TokenPair) -> Result<()> {
        self.backend.save(pair)?;
        debug!(issued_at = %pair.issued_at, "Stored new token pair");
        Ok(())
    }

    /// Remove both credentials. Safe to call when already empty.
    pub fn clear(&self) -> Result<()> {
        self.backend.delete()?;
        debug!("Cleared stored credentials");
        Ok(())
    }

    pub fn access_token(&self) -> Option<String> {
        self.get().map(|p| p.access_token)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.get().map(|p| p.refresh_token)
    }

    pub fn has_refresh_token(&self) -> bool {
        self.get().is_some()
    }
}
