//! Typed error handling for delivery operations.
//!
//! Delivery failures fall into three classes:
//! - Permanent failures (5xx SMTP codes, no mail servers) - bounce, never retry
//! - Temporary failures (4xx SMTP codes, network trouble) - retry with backoff
//! - System errors - internal problems, retried like temporary failures but
//!   logged at error level

use smtpy_smtp::ClientError;
use thiserror::Error;

use crate::dns::DnsError;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Permanent failure that should not be retried (e.g., 5xx SMTP codes).
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// Temporary failure that can be retried with backoff (e.g., 4xx SMTP codes).
    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    /// System-level error (configuration, protocol violations).
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Permanent errors that should not be retried.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// Recipient address is malformed or was rejected by the server.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Domain does not exist.
    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// Message was rejected by the server (e.g., policy violation, spam).
    #[error("Message rejected: {code} {message}")]
    MessageRejected { code: u16, message: String },

    /// The server refused one recipient at `RCPT TO`.
    #[error("Recipient rejected: {code} {message}")]
    RecipientRejected { code: u16, message: String },

    /// No mail servers found for the domain (no MX, A, or AAAA records, or a null MX).
    #[error("No mail servers available for domain: {0}")]
    NoMailServers(String),

    /// SMTP authentication failed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// TLS is required but the server does not offer it.
    #[error("TLS required: {0}")]
    TlsRequired(String),
}

/// Temporary errors that should be retried with exponential backoff.
#[derive(Debug, Error)]
pub enum TemporaryError {
    /// Failed to establish connection to the mail server.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Rate limit exceeded.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// DNS lookup failed (temporary network issue).
    #[error("DNS lookup failed: {0}")]
    DnsLookupFailed(String),

    /// An operation timed out.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Server returned a temporary failure code.
    #[error("Temporary SMTP error: {code} {message}")]
    SmtpTemporary { code: u16, message: String },

    /// TLS handshake failed.
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// No pooled relay connection became available in time.
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),
}

/// System-level errors that indicate internal problems.
#[derive(Debug, Error)]
pub enum SystemError {
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The service was used before `start()` or after `stop()`.
    #[error("Service not running: {0}")]
    NotRunning(String),

    /// Other internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeliveryError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Returns `true` if this error is permanent and should not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Returns `true` if this is a system error.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Whether another attempt may succeed. System errors are retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !self.is_permanent()
    }

    /// The SMTP reply code behind this error, if a server answered.
    #[must_use]
    pub const fn reply_code(&self) -> Option<u16> {
        match self {
            Self::Permanent(
                PermanentError::MessageRejected { code, .. }
                | PermanentError::RecipientRejected { code, .. },
            )
            | Self::Temporary(TemporaryError::SmtpTemporary { code, .. }) => Some(*code),
            _ => None,
        }
    }

    /// Classify a non-success reply: 5xx is permanent, anything else is
    /// temporary.
    #[must_use]
    pub fn from_reply(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (500..600).contains(&code) {
            Self::Permanent(PermanentError::MessageRejected { code, message })
        } else {
            Self::Temporary(TemporaryError::SmtpTemporary { code, message })
        }
    }

    /// Like [`Self::from_reply`], but a 5xx only rejects the recipient.
    #[must_use]
    pub fn from_rcpt_reply(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if (500..600).contains(&code) {
            Self::Permanent(PermanentError::RecipientRejected { code, message })
        } else {
            Self::Temporary(TemporaryError::SmtpTemporary { code, message })
        }
    }
}

/// DNS failures map onto permanent or temporary delivery errors depending on
/// whether a later lookup could succeed.
impl From<DnsError> for DeliveryError {
    fn from(error: DnsError) -> Self {
        match error {
            DnsError::NoMailServers(domain) | DnsError::NullMx(domain) => {
                Self::Permanent(PermanentError::NoMailServers(domain))
            }
            DnsError::DomainNotFound(domain) => {
                Self::Permanent(PermanentError::DomainNotFound(domain))
            }
            DnsError::Timeout(msg) => Self::Temporary(TemporaryError::Timeout(msg)),
            DnsError::LookupFailed(msg) => Self::Temporary(TemporaryError::DnsLookupFailed(msg)),
            DnsError::Resolver(msg) => Self::System(SystemError::Configuration(msg)),
        }
    }
}

/// Convert from SMTP `ClientError` to `DeliveryError`.
///
/// - **4xx SMTP codes** → Temporary
/// - **5xx SMTP codes** → Permanent
/// - **Connection/I/O errors** → Temporary
/// - **TLS errors** → Temporary
/// - **Parse errors** → System
impl From<ClientError> for DeliveryError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::SmtpError { code, message } if (400..600).contains(&code) => {
                Self::from_reply(code, message)
            }

            ClientError::AuthenticationFailed { code, message } if (400..500).contains(&code) => {
                Self::Temporary(TemporaryError::SmtpTemporary { code, message })
            }

            ClientError::AuthenticationFailed { code, message } => Self::Permanent(
                PermanentError::AuthenticationFailed(format!("{code} {message}")),
            ),

            ClientError::NoAuthMechanism(offered) => {
                Self::Permanent(PermanentError::AuthenticationFailed(format!(
                    "no supported mechanism (server offers: {offered})"
                )))
            }

            ClientError::SmtpError { code, message }
            | ClientError::UnexpectedResponse { code, message } => Self::System(
                SystemError::Internal(format!("Unexpected SMTP response: {code} {message}")),
            ),

            ClientError::Io(e) => {
                Self::Temporary(TemporaryError::ConnectionFailed(format!("I/O error: {e}")))
            }

            ClientError::ConnectionClosed => Self::Temporary(TemporaryError::ConnectionFailed(
                "Connection closed unexpectedly".to_string(),
            )),

            ClientError::TlsError(msg) => Self::Temporary(TemporaryError::TlsHandshakeFailed(msg)),

            ClientError::ParseError(msg) => Self::System(SystemError::Internal(format!(
                "SMTP protocol parse error: {msg}"
            ))),

            ClientError::Utf8Error(e) => {
                Self::System(SystemError::Internal(format!("UTF-8 decoding error: {e}")))
            }
        }
    }
}

/// Errors from the external relay service.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The bounded queue is at capacity; the caller should back off.
    #[error("Relay queue full ({0} items)")]
    QueueFull(usize),

    /// The service has not been started or is shutting down.
    #[error("Relay service is not running")]
    NotRunning,

    /// Relay verification failed while starting.
    #[error("Relay startup failed: {0}")]
    Startup(#[source] DeliveryError),

    /// A worker dropped the item without reporting a result.
    #[error("Relay result channel closed")]
    ResultDropped,

    /// The relay is not configured.
    #[error("Relay is not configured: {0}")]
    NotConfigured(String),
}

/// Invalid configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
