//! Value types shared across the delivery paths

use std::{
    fmt::{self, Display},
    str::FromStr,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smtpy_common::Domain;

/// SMTP operation timeout configuration
///
/// Every network step of a transaction is bounded so a stalled server cannot
/// hold a delivery task forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpTimeouts {
    /// TCP connect plus the server greeting
    ///
    /// Default: 30 seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_ms: u64,

    /// EHLO/HELO
    ///
    /// Default: 30 seconds
    #[serde(default = "default_command_timeout")]
    pub ehlo_ms: u64,

    /// STARTTLS command and TLS handshake
    ///
    /// Default: 30 seconds
    #[serde(default = "default_command_timeout")]
    pub starttls_ms: u64,

    /// The whole AUTH exchange
    ///
    /// Default: 30 seconds
    #[serde(default = "default_command_timeout")]
    pub auth_ms: u64,

    /// MAIL FROM
    ///
    /// Default: 30 seconds
    #[serde(default = "default_command_timeout")]
    pub mail_from_ms: u64,

    /// Each RCPT TO
    ///
    /// Default: 30 seconds
    #[serde(default = "default_command_timeout")]
    pub rcpt_to_ms: u64,

    /// DATA and message transmission
    ///
    /// Default: 120 seconds
    #[serde(default = "default_data_timeout")]
    pub data_ms: u64,

    /// QUIT and RSET
    ///
    /// Default: 10 seconds
    #[serde(default = "default_quit_timeout")]
    pub quit_ms: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_timeout(),
            ehlo_ms: default_command_timeout(),
            starttls_ms: default_command_timeout(),
            auth_ms: default_command_timeout(),
            mail_from_ms: default_command_timeout(),
            rcpt_to_ms: default_command_timeout(),
            data_ms: default_data_timeout(),
            quit_ms: default_quit_timeout(),
        }
    }
}

impl SmtpTimeouts {
    /// Every step bounded by the same duration.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn uniform(timeout: Duration) -> Self {
        let ms = timeout.as_millis() as u64;
        Self {
            connect_ms: ms,
            ehlo_ms: ms,
            starttls_ms: ms,
            auth_ms: ms,
            mail_from_ms: ms,
            rcpt_to_ms: ms,
            data_ms: ms,
            quit_ms: ms,
        }
    }
}

const fn default_connect_timeout() -> u64 {
    30_000
}

const fn default_command_timeout() -> u64 {
    30_000
}

const fn default_data_timeout() -> u64 {
    120_000
}

const fn default_quit_timeout() -> u64 {
    10_000
}

/// Relay queue priority. Higher priorities are always dequeued first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        })
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Which path carried an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryPath {
    Direct,
    Relay,
}

impl DeliveryPath {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Relay => "relay",
        }
    }
}

impl Display for DeliveryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Delivered,
    Deferred,
    Bounced,
}

/// Terminal result for one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// The receiving server accepted the message.
    Delivered,
    /// A permanent failure; no retry will help.
    Bounced,
    /// Temporary failures until the attempt budget ran out.
    Failed,
}

impl DeliveryStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Bounced => "bounced",
            Self::Failed => "failed",
        }
    }
}

impl Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One try at delivering a message to one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub domain: Domain,
    /// The host that produced the result, if one was reached.
    pub mx_host: Option<String>,
    pub status: AttemptStatus,
    pub code: Option<u16>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// 1-based, counted per path.
    pub attempt: u32,
    pub path: DeliveryPath,
}

/// The final word on one recipient, with the attempts that led to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub recipient: String,
    pub status: DeliveryStatus,
    pub code: Option<u16>,
    pub message: String,
    pub mx_host: Option<String>,
    pub attempts: Vec<DeliveryAttempt>,
}

impl DeliveryOutcome {
    /// Build the outcome from its attempt history. The last attempt supplies
    /// code, message and host.
    #[must_use]
    pub fn from_attempts(
        recipient: impl Into<String>,
        status: DeliveryStatus,
        attempts: Vec<DeliveryAttempt>,
    ) -> Self {
        let (code, message, mx_host) = attempts.last().map_or((None, String::new(), None), |a| {
            (a.code, a.message.clone(), a.mx_host.clone())
        });

        Self {
            recipient: recipient.into(),
            status,
            code,
            message,
            mx_host,
            attempts,
        }
    }

    #[must_use]
    pub const fn is_delivered(&self) -> bool {
        matches!(self.status, DeliveryStatus::Delivered)
    }

    #[must_use]
    pub const fn is_terminal_failure(&self) -> bool {
        !self.is_delivered()
    }

    /// Number of attempts made on `path`.
    #[must_use]
    pub fn attempts_on(&self, path: DeliveryPath) -> usize {
        self.attempts.iter().filter(|a| a.path == path).count()
    }

    /// Path of the most recent attempt.
    #[must_use]
    pub fn last_path(&self) -> Option<DeliveryPath> {
        self.attempts.last().map(|a| a.path)
    }

    /// Append a later path's history, taking its status and reply.
    pub fn merge(&mut self, later: Self) {
        self.status = later.status;
        self.code = later.code;
        self.message = later.message;
        self.mx_host = later.mx_host;
        self.attempts.extend(later.attempts);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn attempt(status: AttemptStatus, code: Option<u16>, path: DeliveryPath) -> DeliveryAttempt {
        DeliveryAttempt {
            domain: Domain::new("example.com"),
            mx_host: Some("mx.example.com".into()),
            status,
            code,
            message: "reply".into(),
            timestamp: Utc::now(),
            attempt: 1,
            path,
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_outcome_from_attempts() {
        let outcome = DeliveryOutcome::from_attempts(
            "a@example.com",
            DeliveryStatus::Bounced,
            vec![attempt(AttemptStatus::Bounced, Some(550), DeliveryPath::Direct)],
        );

        assert_eq!(outcome.code, Some(550));
        assert_eq!(outcome.mx_host.as_deref(), Some("mx.example.com"));
        assert!(outcome.is_terminal_failure());
    }

    #[test]
    fn test_outcome_merge() {
        let mut outcome = DeliveryOutcome::from_attempts(
            "a@example.com",
            DeliveryStatus::Failed,
            vec![attempt(AttemptStatus::Deferred, Some(451), DeliveryPath::Direct)],
        );
        outcome.merge(DeliveryOutcome::from_attempts(
            "a@example.com",
            DeliveryStatus::Delivered,
            vec![attempt(AttemptStatus::Delivered, Some(250), DeliveryPath::Relay)],
        ));

        assert!(outcome.is_delivered());
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts_on(DeliveryPath::Relay), 1);
        assert_eq!(outcome.last_path(), Some(DeliveryPath::Relay));
    }

    #[test]
    fn test_timeout_defaults() {
        let timeouts = SmtpTimeouts::default();
        assert_eq!(timeouts.connect_ms, 30_000);
        assert_eq!(timeouts.data_ms, 120_000);
        assert_eq!(timeouts.quit_ms, 10_000);
    }
}
