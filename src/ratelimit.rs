//! Sliding-window rate limiter.
//!
//! Counts admitted requests per `(actor, action_type)` over a trailing
//! window. Denied requests are not counted, so a caller that backs off is
//! admitted again as soon as the oldest request leaves the window.

use crate::clock::Clock;
use crate::types::Timestamp;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

type WindowKey = (String, String);

/// Per-actor, per-action sliding window counter.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<WindowKey, VecDeque<Timestamp>>>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Admit and record a request, or deny it.
    pub fn check(
        &self,
        actor_id: &str,
        action_type: &str,
        max_requests: u32,
        window_minutes: u32,
    ) -> bool {
        let now = self.clock.now();
        let window = window_duration(window_minutes);
        let mut windows = self.windows.lock();
        let entries = windows
            .entry((actor_id.to_string(), action_type.to_string()))
            .or_default();

        evict(entries, now, window);
        if entries.len() >= max_requests as usize {
            return false;
        }
        entries.push_back(now);
        true
    }

    /// Whether a request would be admitted, without recording it.
    pub fn peek(
        &self,
        actor_id: &str,
        action_type: &str,
        max_requests: u32,
        window_minutes: u32,
    ) -> bool {
        self.retry_after(actor_id, action_type, max_requests, window_minutes)
            .is_none()
    }

    /// How long until the next request would be admitted (None = now).
    ///
    /// A zero limit never admits; it reports a full window.
    pub fn retry_after(
        &self,
        actor_id: &str,
        action_type: &str,
        max_requests: u32,
        window_minutes: u32,
    ) -> Option<Duration> {
        let now = self.clock.now();
        let window = window_duration(window_minutes);
        if max_requests == 0 {
            return Some(window);
        }
        let mut windows = self.windows.lock();
        let entries = windows.get_mut(&(actor_id.to_string(), action_type.to_string()))?;

        evict(entries, now, window);
        if entries.len() < max_requests as usize {
            return None;
        }
        // Admission needs the oldest `len - max + 1` entries to fall out.
        let blocking = entries[entries.len() - max_requests as usize];
        Some(now.until(blocking.plus(window)))
    }

    /// Number of admitted requests still inside the window.
    pub fn count(&self, actor_id: &str, action_type: &str, window_minutes: u32) -> usize {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        match windows.get_mut(&(actor_id.to_string(), action_type.to_string())) {
            Some(entries) => {
                evict(entries, now, window_duration(window_minutes));
                entries.len()
            }
            None => 0,
        }
    }

    /// Drop keys whose windows are empty.
    pub fn prune(&self, window_minutes: u32) {
        let now = self.clock.now();
        let window = window_duration(window_minutes);
        self.windows.lock().retain(|_, entries| {
            evict(entries, now, window);
            !entries.is_empty()
        });
    }
}

fn window_duration(window_minutes: u32) -> Duration {
    Duration::from_secs(u64::from(window_minutes) * 60)
}

fn evict(entries: &mut VecDeque<Timestamp>, now: Timestamp, window: Duration) {
    let cutoff = now.minus(window);
    while matches!(entries.front(), Some(t) if *t <= cutoff) {
        entries.pop_front();
    }
}
