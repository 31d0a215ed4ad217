//! Direct delivery to recipient mail exchangers
//!
//! Each recipient is delivered independently:
//! 1. Validate the address and take a connection slot from the per-domain
//!    rate limiter
//! 2. Resolve MX hosts (cached)
//! 3. Try hosts in priority order until one answers at the SMTP level
//! 4. Classify the reply: 2xx delivered, 4xx deferred, 5xx bounced
//!
//! Deferred recipients are retried with exponential backoff until the
//! [`RetryPolicy`] is exhausted. A backoff sleep only suspends its own
//! recipient.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use smtpy_common::{AuditLog, AuditRecord, Domain, EmailAddress, Message, internal};
use smtpy_smtp::Response;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    dns::MxResolver,
    error::{DeliveryError, PermanentError, TemporaryError},
    policy::RetryPolicy,
    rate_limiter::RateLimiter,
    smtp_transaction::{ConnectOptions, SmtpTransaction, TlsMode},
    stats::{Counter, DirectStats},
    types::{
        AttemptStatus, DeliveryAttempt, DeliveryOutcome, DeliveryPath, DeliveryStatus,
        SmtpTimeouts,
    },
};

/// Direct delivery settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectConfig {
    /// Refuse to deliver without STARTTLS. Overrides
    /// `allow_plaintext_fallback`.
    #[serde(default)]
    pub require_tls: bool,

    /// Continue in plaintext when a server lacks STARTTLS or the upgrade
    /// fails.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub allow_plaintext_fallback: bool,

    /// Skip certificate validation. Testing only.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Upper bound on one attempt for one recipient, DNS through QUIT.
    ///
    /// Default: 300 seconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            require_tls: false,
            allow_plaintext_fallback: default_true(),
            accept_invalid_certs: false,
            operation_timeout_secs: default_operation_timeout(),
        }
    }
}

impl DirectConfig {
    #[must_use]
    pub const fn tls_mode(&self) -> TlsMode {
        if self.require_tls {
            TlsMode::Required
        } else {
            TlsMode::Opportunistic {
                allow_plaintext: self.allow_plaintext_fallback,
            }
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_operation_timeout() -> u64 {
    300
}

/// What one attempt produced, and where.
struct AttemptResult {
    mx_host: Option<String>,
    result: Result<Response, DeliveryError>,
}

impl AttemptResult {
    const fn unreached(error: DeliveryError) -> Self {
        Self {
            mx_host: None,
            result: Err(error),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: Counter,
    failed: Counter,
    deferred: Counter,
    bounced: Counter,
}

/// Delivers mail by speaking SMTP to each recipient domain's MX hosts.
#[derive(Debug)]
pub struct DirectDeliveryService {
    hostname: String,
    config: DirectConfig,
    resolver: Arc<MxResolver>,
    rate_limiter: RateLimiter,
    retry: RetryPolicy,
    timeouts: SmtpTimeouts,
    audit: AuditLog,
    counters: Counters,
}

impl DirectDeliveryService {
    /// `hostname` is announced in EHLO.
    #[must_use]
    pub fn new(hostname: impl Into<String>, config: DirectConfig, resolver: Arc<MxResolver>) -> Self {
        Self {
            hostname: hostname.into(),
            config,
            resolver,
            rate_limiter: RateLimiter::direct(&crate::RateLimitConfig::default()),
            retry: RetryPolicy::default(),
            timeouts: SmtpTimeouts::default(),
            audit: AuditLog::default(),
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: SmtpTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    #[must_use]
    pub const fn resolver(&self) -> &Arc<MxResolver> {
        &self.resolver
    }

    #[must_use]
    pub fn stats(&self) -> DirectStats {
        DirectStats {
            sent: self.counters.sent.get(),
            failed: self.counters.failed.get(),
            deferred: self.counters.deferred.get(),
            bounced: self.counters.bounced.get(),
        }
    }

    /// Deliver `message` to a single recipient, retrying temporary failures.
    pub async fn send_one(
        &self,
        message: &Message,
        recipient: &str,
        mail_from: &str,
    ) -> DeliveryOutcome {
        let data = message.to_bytes();
        self.deliver(message, &data, recipient, mail_from).await
    }

    /// Deliver `message` to every recipient concurrently. Never fails as a
    /// whole: each recipient gets its own outcome. Duplicate recipients are
    /// delivered once.
    pub async fn send_bulk(
        &self,
        message: &Message,
        recipients: &[String],
        mail_from: &str,
    ) -> HashMap<String, DeliveryOutcome> {
        let data = message.to_bytes();
        let mut unique: Vec<&str> = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            if !unique.contains(&recipient.as_str()) {
                unique.push(recipient);
            }
        }

        let deliveries = unique
            .iter()
            .map(|recipient| self.deliver(message, &data, recipient, mail_from));

        join_all(deliveries)
            .await
            .into_iter()
            .map(|outcome| (outcome.recipient.clone(), outcome))
            .collect()
    }

    #[tracing::instrument(level = "debug", skip(self, message, data), fields(message_id = %message.id()))]
    async fn deliver(
        &self,
        message: &Message,
        data: &[u8],
        recipient: &str,
        mail_from: &str,
    ) -> DeliveryOutcome {
        let mut attempts = Vec::new();

        let address = match EmailAddress::parse(recipient) {
            Ok(address) => address,
            Err(e) => {
                warn!(recipient, error = %e, "Invalid recipient address, bouncing");
                let domain = recipient.rsplit_once('@').map_or("", |(_, d)| d);
                attempts.push(DeliveryAttempt {
                    domain: Domain::new(domain),
                    mx_host: None,
                    status: AttemptStatus::Bounced,
                    code: None,
                    message: PermanentError::InvalidRecipient(e.to_string()).to_string(),
                    timestamp: Utc::now(),
                    attempt: 1,
                    path: DeliveryPath::Direct,
                });
                self.counters.bounced.incr();
                let record = self.audit_record(message, recipient, mail_from, None, 1);
                self.audit
                    .delivery_failure(&record, &e.to_string(), DeliveryStatus::Bounced.as_str());
                return DeliveryOutcome::from_attempts(recipient, DeliveryStatus::Bounced, attempts);
            }
        };

        let envelope_recipient = address.to_string();
        let operation_timeout = Duration::from_secs(self.config.operation_timeout_secs);
        let mut attempt = 1;

        loop {
            let started = Instant::now();
            self.audit
                .delivery_attempt(&self.audit_record(message, recipient, mail_from, None, attempt));

            let AttemptResult { mx_host, result } = tokio::time::timeout(
                operation_timeout,
                self.attempt(address.domain(), &envelope_recipient, mail_from, data),
            )
            .await
            .unwrap_or_else(|_| {
                AttemptResult::unreached(
                    TemporaryError::Timeout(format!(
                        "Delivery attempt exceeded {operation_timeout:?}"
                    ))
                    .into(),
                )
            });

            let record =
                self.audit_record(message, recipient, mail_from, mx_host.as_deref(), attempt);
            let mut history = DeliveryAttempt {
                domain: address.domain().clone(),
                mx_host: mx_host.clone(),
                status: AttemptStatus::Delivered,
                code: None,
                message: String::new(),
                timestamp: Utc::now(),
                attempt,
                path: DeliveryPath::Direct,
            };

            match result {
                Ok(reply) => {
                    history.code = Some(reply.code);
                    history.message = reply.message();
                    attempts.push(history);

                    self.counters.sent.incr();
                    self.audit
                        .delivery_success(&record, started.elapsed().as_millis());
                    info!(recipient, attempt, "Delivered");
                    return DeliveryOutcome::from_attempts(
                        recipient,
                        DeliveryStatus::Delivered,
                        attempts,
                    );
                }
                Err(e) if e.is_permanent() => {
                    history.status = AttemptStatus::Bounced;
                    history.code = e.reply_code();
                    history.message = e.to_string();
                    attempts.push(history);

                    self.counters.bounced.incr();
                    self.audit.delivery_failure(
                        &record,
                        &e.to_string(),
                        DeliveryStatus::Bounced.as_str(),
                    );
                    warn!(recipient, attempt, error = %e, "Bounced");
                    return DeliveryOutcome::from_attempts(
                        recipient,
                        DeliveryStatus::Bounced,
                        attempts,
                    );
                }
                Err(e) => {
                    if e.is_system() {
                        error!(recipient, attempt, error = %e, "System error during delivery");
                    }

                    history.status = AttemptStatus::Deferred;
                    history.code = e.reply_code();
                    history.message = e.to_string();
                    attempts.push(history);
                    self.counters.deferred.incr();

                    if !self.retry.should_retry(attempt) {
                        self.counters.failed.incr();
                        self.audit.delivery_failure(
                            &record,
                            &e.to_string(),
                            DeliveryStatus::Failed.as_str(),
                        );
                        warn!(recipient, attempts = attempt, error = %e, "Retries exhausted");
                        return DeliveryOutcome::from_attempts(
                            recipient,
                            DeliveryStatus::Failed,
                            attempts,
                        );
                    }

                    let delay = self.retry.delay_for(attempt);
                    self.audit.delivery_deferred(&record, &e.to_string());
                    internal!(
                        level = DEBUG,
                        "Deferring {recipient} after attempt {attempt}, retrying in {delay:?}: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One attempt: rate limit, MX resolution, then the host loop.
    async fn attempt(
        &self,
        domain: &Domain,
        recipient: &str,
        mail_from: &str,
        data: &[u8],
    ) -> AttemptResult {
        if !self.rate_limiter.try_acquire(domain) {
            let wait = self.rate_limiter.time_until_available(domain);
            debug!(%domain, ?wait, "Connection rate limit reached");
            return AttemptResult::unreached(
                TemporaryError::RateLimited(format!(
                    "Connection limit reached for {domain}, next slot in {wait:?}"
                ))
                .into(),
            );
        }

        let servers = match self.resolver.resolve(domain).await {
            Ok(servers) => servers,
            Err(e) => return AttemptResult::unreached(e.into()),
        };

        let mut transport_error = None;
        let mut permanent_error = None;

        for server in servers.iter() {
            let address = server.address();
            let options = ConnectOptions {
                address: &address,
                server_name: &server.host,
                helo_domain: &self.hostname,
                tls: self.config.tls_mode(),
                accept_invalid_certs: self.config.accept_invalid_certs,
                credentials: None,
                timeouts: &self.timeouts,
            };

            match SmtpTransaction::new(options)
                .execute(mail_from, recipient, data)
                .await
            {
                Ok(reply) => {
                    return AttemptResult {
                        mx_host: Some(server.host.clone()),
                        result: Ok(reply),
                    };
                }
                // The server answered; another host would not know better
                Err(e) if e.reply_code().is_some() => {
                    return AttemptResult {
                        mx_host: Some(server.host.clone()),
                        result: Err(e),
                    };
                }
                Err(e) => {
                    debug!(server = %address, error = %e, "MX host failed, trying next");
                    let slot = if e.is_permanent() {
                        &mut permanent_error
                    } else {
                        &mut transport_error
                    };
                    *slot = Some((server.host.clone(), e));
                }
            }
        }

        if let Some((host, e)) = permanent_error {
            return AttemptResult {
                mx_host: Some(host),
                result: Err(e),
            };
        }

        self.resolver.invalidate(domain);
        let (mx_host, error) = transport_error.map_or_else(
            || {
                (
                    None,
                    TemporaryError::ConnectionFailed(format!("No MX hosts reachable for {domain}"))
                        .into(),
                )
            },
            |(host, e)| (Some(host), e),
        );
        AttemptResult {
            mx_host,
            result: Err(error),
        }
    }

    fn audit_record<'a>(
        &self,
        message: &'a Message,
        recipient: &'a str,
        mail_from: &'a str,
        mx_host: Option<&'a str>,
        attempt: u32,
    ) -> AuditRecord<'a> {
        AuditRecord {
            message_id: message.id().as_str(),
            sender: mail_from,
            recipient,
            subject: message.subject(),
            action: DeliveryPath::Direct.as_str(),
            mx_host,
            attempt,
        }
    }
}
