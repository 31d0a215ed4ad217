//! Delivery statistics snapshots
//!
//! Services keep plain atomic counters and hand out copies; a snapshot never
//! holds a lock on the service it describes.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::{DeliveryMode, dns::CacheStats};

/// A monotonically increasing event counter.
#[derive(Debug, Default)]
pub(crate) struct Counter(AtomicU64);

impl Counter {
    pub(crate) fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Direct MX delivery counters.
///
/// `sent`, `bounced` and `failed` count recipients by final outcome;
/// `deferred` counts attempts that ended in a temporary failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DirectStats {
    pub sent: u64,
    pub failed: u64,
    pub deferred: u64,
    pub bounced: u64,
}

/// Relay service counters and current state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    /// Recipients the relay accepted.
    pub sent: u64,
    /// Recipients that bounced or ran out of attempts.
    pub failed: u64,
    /// Items put back on the queue after a temporary failure.
    pub retried: u64,
    /// Items currently waiting in the queue.
    pub queued: usize,
    /// Open connections, idle or checked out.
    pub pool_size: usize,
    pub running: bool,
}

/// Everything the router knows about its paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub mode: DeliveryMode,
    pub direct_sent: u64,
    pub direct_failed: u64,
    pub relay_sent: u64,
    pub relay_failed: u64,
    /// Recipients handed to the relay after the direct path gave up.
    pub fallbacks: u64,
    pub dkim_signed: u64,
    pub dkim_unsigned: u64,
    pub direct: DirectStats,
    /// `None` when no relay is configured.
    pub relay: Option<RelayStats>,
    pub mx: CacheStats,
}
