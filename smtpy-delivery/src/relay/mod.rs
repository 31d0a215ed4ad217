//! Delivery through an authenticated upstream relay
//!
//! Messages are placed on a bounded priority queue and drained by a fixed
//! set of workers that share a pool of persistent connections to one relay.
//!
//! Lifecycle: [`RelayService::start`] verifies the relay and spawns the
//! workers, [`RelayService::stop`] stops admissions, drains the queue within
//! the shutdown timeout and closes the pool. A stopped service can be
//! started again.

mod pool;
mod queue;
mod worker;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smtpy_common::{AuditLog, Message};
use tokio::{
    sync::{oneshot, watch},
    task::JoinSet,
};
use tracing::{info, warn};

use self::{
    pool::{ConnectionPool, Endpoint},
    queue::{PushError, QueueItem, RelayQueue},
};
pub use self::queue::RelayResult;
use crate::{
    error::RelayError,
    policy::RetryPolicy,
    rate_limiter::{RateLimitConfig, RateLimiter},
    smtp_transaction::TlsMode,
    stats::{Counter, RelayStats},
    types::{Priority, SmtpTimeouts},
};

/// Upstream relay settings
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(
    clippy::struct_excessive_bools,
    reason = "Configuration flags are intentionally bool-heavy"
)]
pub struct RelayConfig {
    /// Relay host. Empty means no relay is configured.
    #[serde(default)]
    pub host: String,

    /// Default: 587
    #[serde(default = "defaults::port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Upgrade with STARTTLS; the relay must support it.
    ///
    /// Default: true
    #[serde(default = "defaults::yes")]
    pub use_tls: bool,

    /// Implicit TLS from the first byte. Takes precedence over `use_tls`.
    #[serde(default)]
    pub use_ssl: bool,

    /// Skip certificate validation. Testing only.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Default: 5
    #[serde(default = "defaults::pool_size")]
    pub pool_size: usize,

    /// Default: 1000
    #[serde(default = "defaults::max_queue_size")]
    pub max_queue_size: usize,

    /// Default: 3
    #[serde(default = "defaults::num_workers")]
    pub num_workers: usize,

    /// How long a worker waits for a pooled connection.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::checkout_timeout")]
    pub checkout_timeout_secs: u64,

    /// Idle connections older than this are closed instead of reused.
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Items still queued after this long are failed.
    ///
    /// Default: 3600 seconds
    #[serde(default = "defaults::max_age")]
    pub max_age_secs: u64,

    /// How long `stop()` lets workers drain the queue.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Requeue delay for items held back by the rate limiter.
    ///
    /// Default: 250 ms
    #[serde(default = "defaults::throttle_delay")]
    pub throttle_delay_ms: u64,

    /// Connect and authenticate once during `start()`.
    ///
    /// Default: true
    #[serde(default = "defaults::yes")]
    pub verify_on_start: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: defaults::port(),
            username: None,
            password: None,
            use_tls: defaults::yes(),
            use_ssl: false,
            accept_invalid_certs: false,
            pool_size: defaults::pool_size(),
            max_queue_size: defaults::max_queue_size(),
            num_workers: defaults::num_workers(),
            checkout_timeout_secs: defaults::checkout_timeout(),
            idle_timeout_secs: defaults::idle_timeout(),
            max_age_secs: defaults::max_age(),
            shutdown_timeout_secs: defaults::shutdown_timeout(),
            throttle_delay_ms: defaults::throttle_delay(),
            verify_on_start: defaults::yes(),
        }
    }
}

// Hand-written so the password never reaches a log line
impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("use_tls", &self.use_tls)
            .field("use_ssl", &self.use_ssl)
            .field("pool_size", &self.pool_size)
            .field("max_queue_size", &self.max_queue_size)
            .field("num_workers", &self.num_workers)
            .finish_non_exhaustive()
    }
}

mod defaults {
    pub const fn yes() -> bool {
        true
    }

    pub const fn port() -> u16 {
        587
    }

    pub const fn pool_size() -> usize {
        5
    }

    pub const fn max_queue_size() -> usize {
        1000
    }

    pub const fn num_workers() -> usize {
        3
    }

    pub const fn checkout_timeout() -> u64 {
        30
    }

    pub const fn idle_timeout() -> u64 {
        300
    }

    pub const fn max_age() -> u64 {
        3600
    }

    pub const fn shutdown_timeout() -> u64 {
        30
    }

    pub const fn throttle_delay() -> u64 {
        250
    }
}

impl RelayConfig {
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty()
    }

    #[must_use]
    pub const fn tls_mode(&self) -> TlsMode {
        if self.use_ssl {
            TlsMode::Implicit
        } else if self.use_tls {
            TlsMode::Required
        } else {
            TlsMode::Disabled
        }
    }

    fn credentials(&self) -> Option<(String, String)> {
        match (&self.username, &self.password) {
            (Some(user), Some(password)) if !user.is_empty() => {
                Some((user.clone(), password.clone()))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: Counter,
    failed: Counter,
    retried: Counter,
}

/// State shared between the service handle and its workers.
#[derive(Debug)]
struct Shared {
    config: RelayConfig,
    queue: RelayQueue,
    pool: ConnectionPool,
    rate_limiter: RateLimiter,
    retry: RetryPolicy,
    audit: AuditLog,
    counters: Counters,
}

/// Builder for [`RelayService`].
#[derive(Debug)]
pub struct RelayServiceBuilder {
    hostname: String,
    config: RelayConfig,
    rate_limiter: Option<RateLimiter>,
    retry: RetryPolicy,
    timeouts: SmtpTimeouts,
    audit: AuditLog,
}

impl RelayServiceBuilder {
    #[must_use]
    pub fn rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn timeouts(mut self, timeouts: SmtpTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub fn build(self) -> RelayService {
        let endpoint = Endpoint {
            host: self.config.host.trim().to_string(),
            port: self.config.port,
            helo_domain: self.hostname,
            tls: self.config.tls_mode(),
            accept_invalid_certs: self.config.accept_invalid_certs,
            credentials: self.config.credentials(),
            timeouts: self.timeouts,
        };
        let pool = ConnectionPool::new(
            endpoint,
            self.config.pool_size,
            Duration::from_secs(self.config.checkout_timeout_secs),
            Duration::from_secs(self.config.idle_timeout_secs),
        );
        let queue = RelayQueue::new(self.config.max_queue_size);
        // Nothing is admitted before start()
        queue.close();

        let rate_limiter = self
            .rate_limiter
            .unwrap_or_else(|| RateLimiter::relay(&RateLimitConfig::default()));
        let (hard_stop, _) = watch::channel(false);

        RelayService {
            shared: Arc::new(Shared {
                config: self.config,
                queue,
                pool,
                rate_limiter,
                retry: self.retry,
                audit: self.audit,
                counters: Counters::default(),
            }),
            workers: Mutex::new(JoinSet::new()),
            running: AtomicBool::new(false),
            hard_stop,
        }
    }
}

/// Queue-backed delivery through one upstream relay.
#[derive(Debug)]
pub struct RelayService {
    shared: Arc<Shared>,
    workers: Mutex<JoinSet<()>>,
    running: AtomicBool,
    hard_stop: watch::Sender<bool>,
}

impl RelayService {
    /// `hostname` is announced in EHLO.
    #[must_use]
    pub fn builder(hostname: impl Into<String>, config: RelayConfig) -> RelayServiceBuilder {
        RelayServiceBuilder {
            hostname: hostname.into(),
            config,
            rate_limiter: None,
            retry: RetryPolicy::default(),
            timeouts: SmtpTimeouts::default(),
            audit: AuditLog::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Verify the relay and spawn the workers. Starting a running service
    /// does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::NotConfigured`] without a relay host, and
    /// [`RelayError::Startup`] when verification fails.
    pub async fn start(&self) -> Result<(), RelayError> {
        if self.is_running() {
            return Ok(());
        }

        let config = &self.shared.config;
        if !config.is_configured() {
            return Err(RelayError::NotConfigured("no relay host set".to_string()));
        }

        if config.verify_on_start {
            let connection = self
                .shared
                .pool
                .checkout()
                .await
                .map_err(RelayError::Startup)?;
            connection.release();
            info!(relay = %self.shared.pool.endpoint().address(), "Relay verified");
        }

        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.hard_stop.send_replace(false);
        self.shared.queue.reopen();

        let mut workers = JoinSet::new();
        for id in 0..config.num_workers {
            workers.spawn(worker::run(
                Arc::clone(&self.shared),
                id,
                self.hard_stop.subscribe(),
            ));
        }
        *self.workers.lock() = workers;

        info!(
            relay = %self.shared.pool.endpoint().address(),
            workers = config.num_workers,
            pool_size = config.pool_size,
            "Relay service started"
        );
        Ok(())
    }

    /// Stop admitting work, let the workers drain the queue, then close the
    /// pool. Items still queued when the shutdown timeout passes are failed.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        self.shared.queue.close();
        let mut workers = std::mem::take(&mut *self.workers.lock());
        let timeout = Duration::from_secs(self.shared.config.shutdown_timeout_secs);

        // join_next removes finished workers, so the set only holds the ones
        // still running if the drain times out
        if tokio::time::timeout(timeout, join_workers(&mut workers))
            .await
            .is_err()
        {
            warn!(
                remaining = self.shared.queue.len(),
                stuck_workers = workers.len(),
                "Relay drain timed out, failing remaining items"
            );
            self.hard_stop.send_replace(true);
            join_workers(&mut workers).await;
        }

        for item in self.shared.queue.drain() {
            worker::fail_all(&self.shared, item, worker::SHUTDOWN_REASON);
        }

        self.shared.pool.close().await;
        info!("Relay service stopped");
    }

    /// Queue a message for delivery.
    ///
    /// # Errors
    ///
    /// Fails fast with [`RelayError::QueueFull`] at capacity and with
    /// [`RelayError::NotRunning`] before `start()` or after `stop()`.
    pub fn enqueue(
        &self,
        message: Arc<Message>,
        recipients: Vec<String>,
        mail_from: impl Into<String>,
        priority: Priority,
    ) -> Result<oneshot::Receiver<RelayResult>, RelayError> {
        if !self.is_running() {
            return Err(RelayError::NotRunning);
        }

        let (item, rx) = QueueItem::new(message, recipients, mail_from.into(), priority);
        match self.shared.queue.push(item) {
            Ok(()) => Ok(rx),
            Err(PushError::Full) => Err(RelayError::QueueFull(self.shared.queue.capacity())),
            Err(PushError::Closed) => Err(RelayError::NotRunning),
        }
    }

    /// Queue a message and wait for its per-recipient outcomes.
    ///
    /// # Errors
    ///
    /// See [`Self::enqueue`]; also fails if the item's result is lost.
    pub async fn send(
        &self,
        message: Arc<Message>,
        recipients: Vec<String>,
        mail_from: impl Into<String>,
        priority: Priority,
    ) -> Result<RelayResult, RelayError> {
        self.enqueue(message, recipients, mail_from, priority)?
            .await
            .map_err(|_| RelayError::ResultDropped)
    }

    #[must_use]
    pub fn stats(&self) -> RelayStats {
        RelayStats {
            sent: self.shared.counters.sent.get(),
            failed: self.shared.counters.failed.get(),
            retried: self.shared.counters.retried.get(),
            queued: self.shared.queue.len(),
            pool_size: self.shared.pool.open(),
            running: self.is_running(),
        }
    }
}

async fn join_workers(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            warn!(error = %e, "Relay worker ended abnormally");
        }
    }
}
