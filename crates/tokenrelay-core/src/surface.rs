//! Hooks into the UI layer.
//!
//! The core never renders anything itself. It emits [`Notice`]s for failures
//! the user should see and asks a [`Navigator`] to move to the login screen.
//! The session-expired dialog is driven separately through
//! [`crate::auth::SessionExpiryNotifier`].

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    /// 403: the user is signed in but not allowed to do this. Blocking.
    AccessDenied,
    /// Anything else that failed (server errors, network, validation).
    RequestFailed,
}

/// A user-visible notification (toast or dialog).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn access_denied(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::AccessDenied,
            message: message.into(),
        }
    }

    pub fn request_failed(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::RequestFailed,
            message: message.into(),
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.kind == NoticeKind::AccessDenied
    }
}

/// Receives user-visible notices.
pub trait NoticeSink: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Forwards notices to a UI task over a channel.
impl NoticeSink for mpsc::UnboundedSender<Notice> {
    fn notify(&self, notice: Notice) {
        if self.send(notice).is_err() {
            warn!("Notice receiver dropped");
        }
    }
}

/// Writes notices to the log. Used when no UI is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotices;

impl NoticeSink for LogNotices {
    fn notify(&self, notice: Notice) {
        match notice.kind {
            NoticeKind::AccessDenied => warn!(message = %notice.message, "Access denied"),
            NoticeKind::RequestFailed => warn!(message = %notice.message, "Request failed"),
        }
    }
}

/// Moves the user to the login surface.
pub trait Navigator: Send + Sync {
    fn redirect_to_login(&self);
}
