//! In-process fixed-window rate limiter.
//!
//! Counts requests per opaque identity (e.g. `"ingest:ops@acme.test"`)
//! inside a fixed window created lazily on the identity's first request.
//! Once the window expires, the next request starts a fresh one rather
//! than resetting mid-window. The limiter is process-local: it does not
//! coordinate across instances, an accepted limitation for the expected
//! load.
//!
//! Expired entries are swept opportunistically during `check` calls, at
//! most once per sweep interval. Sweeping only bounds memory; counts
//! within a live window are never affected.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::RateLimitConfig;

const SWEEP_INTERVAL_MS: u64 = 120_000;

#[derive(Debug)]
struct Window {
    count: u32,
    started_at_ms: u64,
    window_ms: u64,
}

impl Window {
    fn expires_at(&self) -> u64 {
        self.started_at_ms + self.window_ms
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Requests left in the current window (0 when rejected).
    pub remaining: u32,
    /// Epoch milliseconds at which the current window expires.
    pub reset_at_ms: u64,
    /// How long a rejected caller should wait; 0 when allowed.
    pub retry_after_ms: u64,
}

pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

struct LimiterState {
    windows: HashMap<String, Window>,
    last_sweep_ms: u64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LimiterState {
                windows: HashMap::new(),
                last_sweep_ms: 0,
            }),
        }
    }

    /// Count one request against `identity`. The read-modify-write runs
    /// under a single lock acquisition, so concurrent checks for the same
    /// identity cannot race.
    pub fn check(&self, identity: &str, policy: &RateLimitConfig) -> RateLimitDecision {
        let now = now_ms();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if now.saturating_sub(state.last_sweep_ms) >= SWEEP_INTERVAL_MS {
            sweep(&mut state, now);
        }

        let window = state
            .windows
            .entry(identity.to_string())
            .or_insert_with(|| Window {
                count: 0,
                started_at_ms: now,
                window_ms: policy.window_ms,
            });

        // Expired: the next request starts a fresh window.
        if window.expires_at() <= now {
            window.count = 0;
            window.started_at_ms = now;
            window.window_ms = policy.window_ms;
        }

        if window.count < policy.max_requests {
            window.count += 1;
            RateLimitDecision {
                allowed: true,
                remaining: policy.max_requests - window.count,
                reset_at_ms: window.expires_at(),
                retry_after_ms: 0,
            }
        } else {
            RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at_ms: window.expires_at(),
                retry_after_ms: window.expires_at().saturating_sub(now),
            }
        }
    }

    /// Number of live identity entries (for tests and diagnostics).
    pub fn tracked_identities(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.windows.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop windows that expired before `now`. Live windows and their counts
/// are untouched; sweeping only bounds memory.
fn sweep(state: &mut LimiterState, now: u64) {
    state.windows.retain(|_, w| w.expires_at() > now);
    state.last_sweep_ms = now;
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
