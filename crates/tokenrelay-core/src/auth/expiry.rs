//! Session-expired dialog state.
//!
//! `Hidden` until recovery fails for good, then `Shown` with a countdown.
//! Leaving `Shown`, whether the user acknowledged or the countdown ran out,
//! always logs out and redirects to the login screen, exactly once.
//!
//! The UI layer subscribes to state changes; everything that can trigger the
//! dialog holds a cloned handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::surface::Navigator;

use super::CredentialStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum SessionExpiryState {
    #[default]
    Hidden,
    Shown,
}

/// What a call to [`SessionExpiryNotifier::show`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowOutcome {
    /// Went from hidden to shown; the countdown started.
    Opened,
    /// Already shown; nothing changed.
    AlreadyShown,
    /// The notifier was closed; the caller has to handle logout itself.
    Detached,
}

impl ShowOutcome {
    /// Whether the notifier now owns the logout and redirect.
    pub fn is_managed(self) -> bool {
        !matches!(self, ShowOutcome::Detached)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Acknowledged,
    TimedOut,
}

#[derive(Default)]
struct Countdown {
    /// Bumped on every show so a stale timer can't close a newer episode
    episode: u64,
    deadline: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    state: watch::Sender<SessionExpiryState>,
    countdown: Mutex<Countdown>,
    closed: AtomicBool,
    timeout: Duration,
    store: CredentialStore,
    navigator: Arc<dyn Navigator>,
}

/// Handle to the process-wide session-expired dialog. Clones share state.
#[derive(Clone)]
pub struct SessionExpiryNotifier {
    inner: Arc<Inner>,
}

impl SessionExpiryNotifier {
    pub fn new(store: CredentialStore, navigator: Arc<dyn Navigator>, timeout: Duration) -> Self {
        let (state, _) = watch::channel(SessionExpiryState::Hidden);
        Self {
            inner: Arc::new(Inner {
                state,
                countdown: Mutex::new(Countdown::default()),
                closed: AtomicBool::new(false),
                timeout,
                store,
                navigator,
            }),
        }
    }

    pub fn state(&self) -> SessionExpiryState {
        *self.inner.state.borrow()
    }

    pub fn is_shown(&self) -> bool {
        self.state() == SessionExpiryState::Shown
    }

    /// Receive every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionExpiryState> {
        self.inner.state.subscribe()
    }

    /// Wait until the dialog is no longer shown. Returns at once when hidden.
    pub async fn resolved(&self) {
        let mut states = self.subscribe();
        while self.is_shown() {
            if states.changed().await.is_err() {
                break;
            }
        }
    }

    /// Time left before the dialog closes itself.
    pub fn remaining(&self) -> Option<Duration> {
        self.countdown()
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Show the dialog and start the countdown. No-op while already shown.
    /// Must be called from within a Tokio runtime.
    pub fn show(&self) -> ShowOutcome {
        if self.inner.closed.load(Ordering::Acquire) {
            debug!("Session expiry notifier closed, not showing");
            return ShowOutcome::Detached;
        }

        let mut countdown = self.countdown();
        if self.is_shown() {
            return ShowOutcome::AlreadyShown;
        }

        countdown.episode += 1;
        let episode = countdown.episode;
        let timeout = self.inner.timeout;
        countdown.deadline = Some(Instant::now() + timeout);

        let notifier = self.clone();
        countdown.task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            notifier.resolve(Resolution::TimedOut, Some(episode));
        }));

        self.inner.state.send_replace(SessionExpiryState::Shown);
        info!(timeout_secs = timeout.as_secs(), "Session expired, showing notice");
        ShowOutcome::Opened
    }

    /// User dismissed the dialog ("log in again"). Returns false if it wasn't shown.
    pub fn hide(&self) -> bool {
        self.resolve(Resolution::Acknowledged, None)
    }

    pub fn acknowledge(&self) -> bool {
        self.hide()
    }

    /// Detach from the UI (teardown). Cancels any countdown without redirecting.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut countdown = self.countdown();
        if let Some(task) = countdown.task.take() {
            task.abort();
        }
        countdown.deadline = None;
        self.inner.state.send_replace(SessionExpiryState::Hidden);
        debug!("Session expiry notifier closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn resolve(&self, resolution: Resolution, episode: Option<u64>) -> bool {
        {
            let mut countdown = self.countdown();
            if !self.is_shown() {
                return false;
            }
            if episode.is_some_and(|e| e != countdown.episode) {
                return false;
            }
            self.inner.state.send_replace(SessionExpiryState::Hidden);
            countdown.deadline = None;
            let task = countdown.task.take();
            if resolution == Resolution::Acknowledged {
                if let Some(task) = task {
                    task.abort();
                }
            }
        }

        info!(?resolution, "Session expiry resolved, logging out");
        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "Failed to clear credentials on session expiry");
        }
        self.inner.navigator.redirect_to_login();
        true
    }

    fn countdown(&self) -> MutexGuard<'_, Countdown> {
        self.inner.countdown.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
