//! Pooled, authenticated connections to the upstream relay
//!
//! At most `pool_size` connections exist at once, idle or checked out. A
//! checked-out connection is owned by exactly one worker until it is
//! released (returned for reuse) or dropped (closed).

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use smtpy_smtp::SmtpClient;
use tokio::{
    sync::{Semaphore, SemaphorePermit},
    time::Instant,
};
use tracing::debug;

use crate::{
    error::{DeliveryError, SystemError, TemporaryError},
    smtp_transaction::{self, ConnectOptions, TlsMode, timed},
    types::SmtpTimeouts,
};

/// Where and how to connect.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub helo_domain: String,
    pub tls: TlsMode,
    pub accept_invalid_certs: bool,
    pub credentials: Option<(String, String)>,
    pub timeouts: SmtpTimeouts,
}

impl Endpoint {
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

struct Idle {
    client: SmtpClient,
    last_used: Instant,
}

pub struct ConnectionPool {
    endpoint: Endpoint,
    idle: Mutex<Vec<Idle>>,
    permits: Semaphore,
    open: AtomicUsize,
    checkout_timeout: Duration,
    idle_timeout: Duration,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.endpoint.address())
            .field("open", &self.open())
            .finish_non_exhaustive()
    }
}

/// A connection on loan from the pool.
pub struct Checkout<'a> {
    pool: &'a ConnectionPool,
    client: Option<SmtpClient>,
    _permit: SemaphorePermit<'a>,
}

impl Checkout<'_> {
    /// # Errors
    ///
    /// Fails if the connection was already discarded.
    pub fn client(&mut self) -> Result<&mut SmtpClient, DeliveryError> {
        self.client
            .as_mut()
            .ok_or_else(|| SystemError::Internal("Checked-out connection missing".into()).into())
    }

    /// Close the held connection, keeping the pool slot.
    fn discard(&mut self) {
        if self.client.take().is_some() {
            self.pool.open.fetch_sub(1, Ordering::Relaxed);
            debug!(relay = %self.pool.endpoint.address(), "Discarded relay connection");
        }
    }

    /// Return the connection for reuse.
    pub fn release(mut self) {
        if let Some(client) = self.client.take() {
            self.pool.idle.lock().push(Idle {
                client,
                last_used: Instant::now(),
            });
        }
    }
}

impl Drop for Checkout<'_> {
    fn drop(&mut self) {
        self.discard();
    }
}

impl ConnectionPool {
    pub fn new(
        endpoint: Endpoint,
        size: usize,
        checkout_timeout: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Semaphore::new(size),
            open: AtomicUsize::new(0),
            checkout_timeout,
            idle_timeout,
        }
    }

    /// Connections currently open, idle or checked out.
    pub fn open(&self) -> usize {
        self.open.load(Ordering::Relaxed)
    }

    pub const fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Borrow a connection, reusing an idle one when it is still healthy.
    ///
    /// # Errors
    ///
    /// Returns [`TemporaryError::PoolExhausted`] if no connection frees up
    /// within the checkout timeout, or the connect error for a new one.
    pub async fn checkout(&self) -> Result<Checkout<'_>, DeliveryError> {
        let permit = tokio::time::timeout(self.checkout_timeout, self.permits.acquire())
            .await
            .map_err(|_| {
                TemporaryError::PoolExhausted(format!(
                    "No relay connection available within {:?}",
                    self.checkout_timeout
                ))
            })?
            .map_err(|_| SystemError::NotRunning("Connection pool closed".into()))?;

        let mut checkout = Checkout {
            pool: self,
            client: None,
            _permit: permit,
        };

        while let Some(idle) = self.take_idle() {
            checkout.client = Some(idle.client);

            if idle.last_used.elapsed() > self.idle_timeout {
                debug!("Idle relay connection expired");
                smtp_transaction::quit(checkout.client()?, &self.endpoint.timeouts).await;
                checkout.discard();
                continue;
            }

            let timeout = Duration::from_millis(self.endpoint.timeouts.quit_ms);
            match timed(timeout, "RSET", checkout.client()?.rset()).await {
                Ok(response) if response.is_success() => {
                    debug!("Reusing pooled relay connection");
                    return Ok(checkout);
                }
                Ok(response) => {
                    debug!(code = response.code, "RSET refused, discarding connection");
                }
                Err(e) => debug!(error = %e, "RSET failed, discarding connection"),
            }
            checkout.discard();
        }

        checkout.client = Some(self.connect().await?);
        Ok(checkout)
    }

    fn take_idle(&self) -> Option<Idle> {
        self.idle.lock().pop()
    }

    async fn connect(&self) -> Result<SmtpClient, DeliveryError> {
        let address = self.endpoint.address();
        let options = ConnectOptions {
            address: &address,
            server_name: &self.endpoint.host,
            helo_domain: &self.endpoint.helo_domain,
            tls: self.endpoint.tls,
            accept_invalid_certs: self.endpoint.accept_invalid_certs,
            credentials: self
                .endpoint
                .credentials
                .as_ref()
                .map(|(user, password)| (user.as_str(), password.as_str())),
            timeouts: &self.endpoint.timeouts,
        };

        let client = smtp_transaction::connect(&options).await?;
        self.open.fetch_add(1, Ordering::Relaxed);
        debug!(relay = %address, open = self.open(), "Opened relay connection");
        Ok(client)
    }

    /// Send QUIT on every idle connection and drop it.
    pub async fn close(&self) {
        let idle = std::mem::take(&mut *self.idle.lock());
        for mut connection in idle {
            smtp_transaction::quit(&mut connection.client, &self.endpoint.timeouts).await;
            self.open.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
