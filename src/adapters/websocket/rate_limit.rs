//! Per-client fixed-window rate limiting.
//!
//! Each client gets a message-count window that resets when its span
//! elapses. Not shared across processes; state is per-hub like
//! everything else here.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::domain::foundation::{SessionId, SharedClock};

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed { remaining: u32 },
    Denied { retry_after_ms: u64 },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

#[derive(Debug, Clone)]
struct WindowState {
    count: u32,
    window_start: i64,
}

/// Fixed-window counter keyed by session.
pub struct FixedWindowLimiter {
    limit: u32,
    window_ms: i64,
    clock: SharedClock,
    windows: Mutex<HashMap<SessionId, WindowState>>,
}

impl FixedWindowLimiter {
    pub fn new(limit: u32, window_ms: u64, clock: SharedClock) -> Self {
        Self {
            limit,
            window_ms: window_ms as i64,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one message against the client's current window.
    pub fn check(&self, client: SessionId) -> RateLimitResult {
        let now = self.clock.now_millis();
        let mut windows = self.windows.lock();

        let state = windows.entry(client).or_insert(WindowState {
            count: 0,
            window_start: now,
        });

        if now - state.window_start >= self.window_ms {
            state.count = 0;
            state.window_start = now;
        }

        if state.count >= self.limit {
            let retry_after = (state.window_start + self.window_ms - now).max(1) as u64;
            return RateLimitResult::Denied {
                retry_after_ms: retry_after,
            };
        }

        state.count += 1;
        RateLimitResult::Allowed {
            remaining: self.limit - state.count,
        }
    }

    /// Drops a client's window on disconnect.
    pub fn forget(&self, client: SessionId) {
        self.windows.lock().remove(&client);
    }
}
