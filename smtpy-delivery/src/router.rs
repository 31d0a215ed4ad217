//! Routing between the direct and relay paths
//!
//! The router signs each message once, then hands it to the paths its
//! [`DeliveryMode`] selects. In `hybrid` (and `smart`) mode every recipient
//! the direct path gives up on is offered to the relay exactly once.

use std::{collections::HashMap, sync::Arc};

use smtpy_common::{AuditLog, EmailAddress, Message};
use tracing::{info, warn};

use crate::{
    config::{DeliveryConfig, DeliveryMode},
    direct::DirectDeliveryService,
    dkim::{DkimKeyStore, DkimSigner},
    dns::{DnsError, HickoryMxLookup, MxLookup, MxResolver},
    error::{ConfigError, RelayError},
    rate_limiter::RateLimiter,
    relay::RelayService,
    stats::{Counter, RouterStats},
    types::{DeliveryOutcome, DeliveryPath, DeliveryStatus, Priority},
};

/// External services the engine depends on.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub key_store: Arc<dyn DkimKeyStore>,
    pub mx_lookup: Arc<dyn MxLookup>,
}

impl Collaborators {
    /// Use the system DNS resolver for MX lookups.
    ///
    /// # Errors
    ///
    /// Returns an error if the system resolver configuration cannot be read.
    pub fn system(
        key_store: Arc<dyn DkimKeyStore>,
        config: &DeliveryConfig,
    ) -> Result<Self, DnsError> {
        Ok(Self {
            key_store,
            mx_lookup: Arc::new(HickoryMxLookup::new(&config.dns)?),
        })
    }
}

#[derive(Debug, Default)]
struct Counters {
    direct_sent: Counter,
    direct_failed: Counter,
    relay_sent: Counter,
    relay_failed: Counter,
    fallbacks: Counter,
}

/// Entry point of the delivery engine.
#[derive(Debug)]
pub struct HybridRouter {
    mode: DeliveryMode,
    signer: DkimSigner,
    resolver: Arc<MxResolver>,
    direct: Option<DirectDeliveryService>,
    relay: Option<RelayService>,
    counters: Counters,
}

impl HybridRouter {
    /// Build the engine. Nothing touches the network until [`Self::start`].
    ///
    /// # Errors
    ///
    /// Returns the first configuration problem found by
    /// [`DeliveryConfig::validate`].
    pub fn new(config: DeliveryConfig, collaborators: Collaborators) -> Result<Self, ConfigError> {
        config.validate()?;

        let audit = AuditLog::new(config.audit.clone());
        let resolver = Arc::new(MxResolver::new(collaborators.mx_lookup, config.dns.clone()));
        let signer = DkimSigner::new(collaborators.key_store, config.dkim.clone());

        let direct = config.mode.uses_direct().then(|| {
            DirectDeliveryService::new(
                config.hostname.clone(),
                config.direct.clone(),
                Arc::clone(&resolver),
            )
            .with_rate_limiter(RateLimiter::direct(&config.rate_limit))
            .with_retry_policy(config.retry.clone())
            .with_timeouts(config.timeouts.clone())
            .with_audit(audit.clone())
        });

        let relay = (config.mode.uses_relay() && config.relay.is_configured()).then(|| {
            RelayService::builder(config.hostname.clone(), config.relay.clone())
                .rate_limiter(RateLimiter::relay(&config.rate_limit))
                .retry_policy(config.retry.clone())
                .timeouts(config.timeouts.clone())
                .audit(audit.clone())
                .build()
        });

        if config.mode.uses_relay() && relay.is_none() {
            warn!(mode = %config.mode, "No relay configured, relay fallback disabled");
        }

        Ok(Self {
            mode: config.mode,
            signer,
            resolver,
            direct,
            relay,
            counters: Counters::default(),
        })
    }

    #[must_use]
    pub const fn mode(&self) -> DeliveryMode {
        self.mode
    }

    #[must_use]
    pub const fn relay(&self) -> Option<&RelayService> {
        self.relay.as_ref()
    }

    #[must_use]
    pub const fn direct(&self) -> Option<&DirectDeliveryService> {
        self.direct.as_ref()
    }

    /// Start the relay service, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns the relay's startup error.
    pub async fn start(&self) -> Result<(), RelayError> {
        if let Some(relay) = &self.relay {
            relay.start().await?;
        }
        info!(mode = %self.mode, "Delivery engine started");
        Ok(())
    }

    /// Drain and stop the relay service.
    pub async fn stop(&self) {
        if let Some(relay) = &self.relay {
            relay.stop().await;
        }
        info!("Delivery engine stopped");
    }

    /// Deliver `message` to `recipients` and report one outcome per distinct
    /// recipient.
    #[tracing::instrument(level = "info", skip(self, message, recipients), fields(message_id = %message.id(), recipients = recipients.len()))]
    pub async fn send_email(
        &self,
        message: &Message,
        recipients: &[String],
        mail_from: &str,
        priority: Priority,
    ) -> HashMap<String, DeliveryOutcome> {
        let message = self.sign(message, mail_from).await;

        match self.mode {
            DeliveryMode::Direct => self.send_direct(&message, recipients, mail_from).await,
            DeliveryMode::Relay => {
                self.send_relay(message, recipients.to_vec(), mail_from, priority)
                    .await
            }
            DeliveryMode::Hybrid | DeliveryMode::Smart => {
                let mut outcomes = self.send_direct(&message, recipients, mail_from).await;

                let retry: Vec<String> = outcomes
                    .values()
                    .filter(|o| o.is_terminal_failure())
                    .map(|o| o.recipient.clone())
                    .collect();

                if retry.is_empty() || self.relay.is_none() {
                    return outcomes;
                }

                self.counters
                    .fallbacks
                    .add(u64::try_from(retry.len()).unwrap_or(u64::MAX));
                info!(recipients = retry.len(), "Falling back to relay");

                let relayed = self.send_relay(message, retry, mail_from, priority).await;
                for (recipient, later) in relayed {
                    match outcomes.get_mut(&recipient) {
                        Some(outcome) => outcome.merge(later),
                        None => {
                            outcomes.insert(recipient, later);
                        }
                    }
                }
                outcomes
            }
        }
    }

    async fn sign(&self, message: &Message, mail_from: &str) -> Message {
        let outcome = match EmailAddress::parse(mail_from) {
            Ok(sender) => self.signer.sign(message, sender.domain()).await,
            Err(e) => self
                .signer
                .skip(message, format!("Sender has no signing domain: {e}")),
        };
        outcome.into_message()
    }

    async fn send_direct(
        &self,
        message: &Message,
        recipients: &[String],
        mail_from: &str,
    ) -> HashMap<String, DeliveryOutcome> {
        let Some(direct) = &self.direct else {
            return HashMap::new();
        };

        let outcomes = direct.send_bulk(message, recipients, mail_from).await;
        for outcome in outcomes.values() {
            if outcome.is_delivered() {
                self.counters.direct_sent.incr();
            } else {
                self.counters.direct_failed.incr();
            }
        }
        outcomes
    }

    async fn send_relay(
        &self,
        message: Message,
        recipients: Vec<String>,
        mail_from: &str,
        priority: Priority,
    ) -> HashMap<String, DeliveryOutcome> {
        let result = match &self.relay {
            Some(relay) => {
                relay
                    .send(Arc::new(message), recipients.clone(), mail_from, priority)
                    .await
            }
            None => Err(RelayError::NotConfigured("no relay host set".to_string())),
        };

        let outcomes = result.unwrap_or_else(|e| {
            warn!(error = %e, "Relay submission failed");
            recipients
                .iter()
                .map(|recipient| (recipient.clone(), unsent(recipient, &e)))
                .collect()
        });

        for outcome in outcomes.values() {
            if outcome.is_delivered() {
                self.counters.relay_sent.incr();
            } else {
                self.counters.relay_failed.incr();
            }
        }
        outcomes
    }

    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            mode: self.mode,
            direct_sent: self.counters.direct_sent.get(),
            direct_failed: self.counters.direct_failed.get(),
            relay_sent: self.counters.relay_sent.get(),
            relay_failed: self.counters.relay_failed.get(),
            fallbacks: self.counters.fallbacks.get(),
            dkim_signed: self.signer.signed_count(),
            dkim_unsigned: self.signer.unsigned_count(),
            direct: self
                .direct
                .as_ref()
                .map(DirectDeliveryService::stats)
                .unwrap_or_default(),
            relay: self.relay.as_ref().map(RelayService::stats),
            mx: self.resolver.cache_stats(),
        }
    }
}

/// Outcome for a recipient the relay never accepted.
fn unsent(recipient: &str, error: &RelayError) -> DeliveryOutcome {
    let mut outcome = DeliveryOutcome::from_attempts(recipient, DeliveryStatus::Failed, Vec::new());
    outcome.message = format!("{} path unavailable: {error}", DeliveryPath::Relay.as_str());
    outcome
}
