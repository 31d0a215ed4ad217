//! Outbound delivery engine
//!
//! This crate takes an authored [`Message`](smtpy_common::Message) and gets
//! it onto the public mail network:
//! - Direct delivery to each recipient domain's MX hosts, with MX caching,
//!   per-domain rate limiting and exponential-backoff retries
//! - Delivery through an authenticated upstream relay fed by a bounded
//!   priority queue, a worker pool and pooled connections
//! - DKIM signing with keys from an external store
//! - A router that combines the two paths according to [`DeliveryMode`]

mod config;
mod direct;
mod dkim;
mod dns;
mod error;
pub mod policy;
mod rate_limiter;
mod relay;
mod router;
mod smtp_transaction;
mod stats;
mod types;

pub use config::{DeliveryConfig, DeliveryMode};
pub use direct::{DirectConfig, DirectDeliveryService};
pub use dkim::{
    DkimConfig, DkimError, DkimKey, DkimKeyStore, DkimSigner, SIGNED_HEADERS, SignOutcome,
    StaticKeyStore,
};
pub use dns::{
    CacheStats, DnsConfig, DnsError, HickoryMxLookup, MailServer, MxLookup, MxRecords, MxResolver,
    StaticMxLookup,
};
pub use error::{
    ConfigError, DeliveryError, PermanentError, RelayError, SystemError, TemporaryError,
};
pub use rate_limiter::{GLOBAL_KEY, RateLimitConfig, RateLimitStats, RateLimiter};
pub use relay::{RelayConfig, RelayResult, RelayService, RelayServiceBuilder};
pub use router::{Collaborators, HybridRouter};
pub use smtp_transaction::TlsMode;
pub use stats::{DirectStats, RelayStats, RouterStats};
pub use types::{
    AttemptStatus, DeliveryAttempt, DeliveryOutcome, DeliveryPath, DeliveryStatus, Priority,
    SmtpTimeouts,
};
