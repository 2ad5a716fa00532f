// Duplicate-submit guard for the composer.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct SendGuard {
    window: Duration,
    last: Option<(String, Instant)>,
}

impl SendGuard {
    pub fn new(window: Duration) -> Self {
        SendGuard { window, last: None }
    }

    /// Returns false when `text` repeats the last accepted text within the
    /// window. Accepted texts restart the window.
    pub fn admit(&mut self, text: &str, now: Instant) -> bool {
        if let Some((last_text, at)) = &self.last {
            if last_text == text && now.saturating_duration_since(*at) < self.window {
                return false;
            }
        }
        self.last = Some((text.to_string(), now));
        true
    }
}
