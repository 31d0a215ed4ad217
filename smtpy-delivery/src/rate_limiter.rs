//! Fixed-window rate limiting
//!
//! Bounds how many connections (direct delivery, keyed by recipient domain)
//! or messages (relay delivery, one global key) may start within a window.
//! Each key owns a counter that resets when its window rolls over.
//!
//! # Example
//!
//! ```text
//! Limit: 10 per 60s
//! - t=0s..59s: the first 10 acquires succeed, the 11th is refused
//! - t=60s: a new window opens and acquires succeed again
//! ```

use std::{collections::HashMap, sync::Arc, time::Duration};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Key used for limits that apply across all destinations.
pub const GLOBAL_KEY: &str = "*";

/// Configuration for rate limiting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Connections per window per recipient domain on the direct path
    #[serde(default = "default_direct_limit")]
    pub direct_per_window: u32,

    /// Messages per window across the whole relay path
    #[serde(default = "default_relay_limit")]
    pub relay_per_window: u32,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Per-domain overrides of `direct_per_window`
    #[serde(default)]
    pub domain_limits: HashMap<String, u32>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            direct_per_window: default_direct_limit(),
            relay_per_window: default_relay_limit(),
            window_secs: default_window_secs(),
            domain_limits: HashMap::new(),
        }
    }
}

const fn default_direct_limit() -> u32 {
    10
}

const fn default_relay_limit() -> u32 {
    100
}

const fn default_window_secs() -> u64 {
    60
}

impl RateLimitConfig {
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Counter for a single key
#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
    limit: u32,
}

impl Window {
    fn roll(&mut self, now: Instant, length: Duration) {
        if now.duration_since(self.started) >= length {
            self.started = now;
            self.count = 0;
        }
    }
}

/// Snapshot of one key's window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStats {
    pub used: u32,
    pub limit: u32,
    pub resets_in: Duration,
}

/// Fixed-window limiter over arbitrary string keys
#[derive(Debug)]
pub struct RateLimiter {
    default_limit: u32,
    window: Duration,
    overrides: HashMap<String, u32>,
    windows: DashMap<String, Arc<Mutex<Window>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            default_limit: limit,
            window,
            overrides: HashMap::new(),
            windows: DashMap::new(),
        }
    }

    /// Limiter for the direct path: per-domain budget with overrides.
    #[must_use]
    pub fn direct(config: &RateLimitConfig) -> Self {
        Self::new(config.direct_per_window, config.window()).with_overrides(
            config
                .domain_limits
                .iter()
                .map(|(domain, limit)| (domain.to_ascii_lowercase(), *limit)),
        )
    }

    /// Limiter for the relay path: a single budget under [`GLOBAL_KEY`].
    #[must_use]
    pub fn relay(config: &RateLimitConfig) -> Self {
        Self::new(config.relay_per_window, config.window())
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: impl IntoIterator<Item = (String, u32)>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    fn window_for(&self, key: &str) -> Arc<Mutex<Window>> {
        if let Some(existing) = self.windows.get(key) {
            return Arc::clone(&existing);
        }

        self.windows
            .entry(key.to_string())
            .or_insert_with(|| {
                let limit = self.overrides.get(key).copied().unwrap_or(self.default_limit);
                Arc::new(Mutex::new(Window {
                    started: Instant::now(),
                    count: 0,
                    limit,
                }))
            })
            .clone()
    }

    /// Take one slot from `key`'s current window. Returns `false` when the
    /// window's budget is spent.
    pub fn try_acquire(&self, key: &str) -> bool {
        let window = self.window_for(key);
        let mut window = window.lock();
        window.roll(Instant::now(), self.window);

        if window.count < window.limit {
            window.count += 1;
            true
        } else {
            debug!(
                key,
                limit = window.limit,
                "Rate limit exceeded for current window"
            );
            false
        }
    }

    /// How long until `key` can acquire again. Zero if it can right now.
    pub fn time_until_available(&self, key: &str) -> Duration {
        let Some(window) = self.windows.get(key).map(|w| Arc::clone(&w)) else {
            return Duration::ZERO;
        };
        let mut window = window.lock();
        let now = Instant::now();
        window.roll(now, self.window);

        if window.count < window.limit {
            Duration::ZERO
        } else {
            self.window.saturating_sub(now.duration_since(window.started))
        }
    }

    #[must_use]
    pub fn stats(&self, key: &str) -> Option<RateLimitStats> {
        self.windows.get(key).map(|window| {
            let window = window.lock();
            RateLimitStats {
                used: window.count,
                limit: window.limit,
                resets_in: self
                    .window
                    .saturating_sub(Instant::now().duration_since(window.started)),
            }
        })
    }
}
