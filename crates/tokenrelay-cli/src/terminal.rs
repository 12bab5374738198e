//! Terminal implementations of the UI hooks.

use tokenrelay_core::surface::{Navigator, Notice, NoticeKind, NoticeSink};

pub struct TerminalNavigator {
    pub login_url: String,
}

impl Navigator for TerminalNavigator {
    fn redirect_to_login(&self) {
        eprintln!(
            "Session ended. Log in again at {} and run `tokenrelay import`.",
            self.login_url
        );
    }
}

pub struct TerminalNotices;

impl NoticeSink for TerminalNotices {
    fn notify(&self, notice: Notice) {
        match notice.kind {
            NoticeKind::AccessDenied => eprintln!("⛔ {}", notice.message),
            NoticeKind::RequestFailed => eprintln!("✗ {}", notice.message),
        }
    }
}
