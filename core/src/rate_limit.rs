use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

struct WindowState {
    window_start: Instant,
    count: u32,
}

/// Fixed (non-sliding) window counter per opaque client key. The clock is
/// monotonic; `allow_at` exists so tests can drive time explicitly. No
/// eviction: the key space is the operator-facing IP set.
pub struct FixedWindowRateLimiter {
    limit: u32,
    window: Duration,
    state: Mutex<HashMap<String, WindowState>>,
}

impl FixedWindowRateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.get_mut(key) {
            Some(current) if now.duration_since(current.window_start) < self.window => {
                if current.count >= self.limit {
                    return false;
                }
                current.count += 1;
                true
            }
            _ => {
                state.insert(
                    key.to_string(),
                    WindowState {
                        window_start: now,
                        count: 1,
                    },
                );
                true
            }
        }
    }
}
