use std::time::Duration;

use tokio::time::Instant;

/// Ephemeral user notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToastNotice {
    pub text: String,
    pub expires_at: Instant,
}

/// Holds at most one toast; a newer one replaces the older.
#[derive(Debug)]
pub struct ToastSlot {
    ttl: Duration,
    current: Option<ToastNotice>,
}

impl ToastSlot {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, current: None }
    }

    pub fn show(&mut self, text: impl Into<String>) {
        self.current = Some(ToastNotice {
            text: text.into(),
            expires_at: Instant::now() + self.ttl,
        });
    }

    /// The visible toast, dropping it once expired.
    pub fn visible(&mut self) -> Option<&ToastNotice> {
        if let Some(t) = &self.current {
            if Instant::now() >= t.expires_at {
                self.current = None;
            }
        }
        self.current.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.current.as_ref().map(|t| t.expires_at)
    }
}
