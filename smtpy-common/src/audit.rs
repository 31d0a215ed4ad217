//! Audit logging for delivery lifecycle events
//!
//! Every delivery attempt emits one structured event carrying the sender,
//! recipient, subject, action, MX host and outcome. Events are plain
//! `tracing` events under the `smtpy::audit` target so they can be routed
//! to a dedicated sink.
//!
//! ## Audit Events
//!
//! - `DeliveryAttempt`: an attempt against a remote host is starting
//! - `DeliverySuccess`: the remote host accepted the message
//! - `DeliveryDeferred`: a temporary failure; the recipient will be retried
//! - `DeliveryFailure`: a bounce or exhausted retries
//!
//! ## PII Redaction
//!
//! The local part of sender and recipient addresses can be redacted through
//! [`AuditConfig`].

use serde::{Deserialize, Serialize};

/// Audit logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(
    clippy::struct_excessive_bools,
    reason = "Configuration flags are intentionally bool-heavy"
)]
pub struct AuditConfig {
    /// Enable audit logging for delivery events
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Redact sender email addresses from audit logs
    #[serde(default)]
    pub redact_sender: bool,

    /// Redact recipient email addresses from audit logs
    #[serde(default)]
    pub redact_recipients: bool,

    /// Omit the subject line from audit logs
    #[serde(default)]
    pub redact_subject: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redact_sender: false,
            redact_recipients: false,
            redact_subject: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Redact email address if redaction is enabled
#[must_use]
pub fn redact_email(email: &str, redact: bool) -> String {
    if redact {
        // Keep domain but redact local part
        if let Some((_, domain)) = email.rsplit_once('@') {
            format!("[REDACTED]@{domain}")
        } else {
            "[REDACTED]".to_string()
        }
    } else {
        email.to_string()
    }
}

/// The fields shared by every audit event for one (message, recipient) pair.
#[derive(Debug, Clone, Copy)]
pub struct AuditRecord<'a> {
    pub message_id: &'a str,
    pub sender: &'a str,
    pub recipient: &'a str,
    pub subject: Option<&'a str>,
    /// Delivery path, `direct` or `relay`.
    pub action: &'a str,
    pub mx_host: Option<&'a str>,
    pub attempt: u32,
}

/// Emits audit events according to an [`AuditConfig`].
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    config: AuditConfig,
}

impl AuditLog {
    #[must_use]
    pub const fn new(config: AuditConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &AuditConfig {
        &self.config
    }

    fn fields(&self, record: &AuditRecord<'_>) -> (String, String, String) {
        let subject = if self.config.redact_subject {
            "[REDACTED]"
        } else {
            record.subject.unwrap_or_default()
        };
        (
            redact_email(record.sender, self.config.redact_sender),
            redact_email(record.recipient, self.config.redact_recipients),
            subject.to_string(),
        )
    }

    pub fn delivery_attempt(&self, record: &AuditRecord<'_>) {
        if !self.config.enabled {
            return;
        }

        let (sender, recipient, subject) = self.fields(record);
        tracing::event!(
            target: "smtpy::audit",
            tracing::Level::INFO,
            event = "DeliveryAttempt",
            message_id = %record.message_id,
            sender = %sender,
            recipient = %recipient,
            subject = %subject,
            action = %record.action,
            mx_host = record.mx_host.unwrap_or("-"),
            delivery_attempt = record.attempt,
            outcome = "pending",
            "Audit: Delivery attempt"
        );
    }

    pub fn delivery_success(&self, record: &AuditRecord<'_>, duration_ms: u128) {
        if !self.config.enabled {
            return;
        }

        let (sender, recipient, subject) = self.fields(record);
        tracing::event!(
            target: "smtpy::audit",
            tracing::Level::INFO,
            event = "DeliverySuccess",
            message_id = %record.message_id,
            sender = %sender,
            recipient = %recipient,
            subject = %subject,
            action = %record.action,
            mx_host = record.mx_host.unwrap_or("-"),
            delivery_attempt = record.attempt,
            duration_ms = duration_ms,
            outcome = "delivered",
            "Audit: Delivery successful"
        );
    }

    pub fn delivery_deferred(&self, record: &AuditRecord<'_>, reason: &str) {
        if !self.config.enabled {
            return;
        }

        let (sender, recipient, subject) = self.fields(record);
        tracing::event!(
            target: "smtpy::audit",
            tracing::Level::INFO,
            event = "DeliveryDeferred",
            message_id = %record.message_id,
            sender = %sender,
            recipient = %recipient,
            subject = %subject,
            action = %record.action,
            mx_host = record.mx_host.unwrap_or("-"),
            delivery_attempt = record.attempt,
            error = %reason,
            outcome = "deferred",
            "Audit: Delivery deferred"
        );
    }

    /// `outcome` is the terminal status, `bounced` or `failed`.
    pub fn delivery_failure(&self, record: &AuditRecord<'_>, reason: &str, outcome: &str) {
        if !self.config.enabled {
            return;
        }

        let (sender, recipient, subject) = self.fields(record);
        tracing::event!(
            target: "smtpy::audit",
            tracing::Level::WARN,
            event = "DeliveryFailure",
            message_id = %record.message_id,
            sender = %sender,
            recipient = %recipient,
            subject = %subject,
            action = %record.action,
            mx_host = record.mx_host.unwrap_or("-"),
            delivery_attempt = record.attempt,
            error = %reason,
            outcome = %outcome,
            "Audit: Delivery failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> AuditRecord<'static> {
        AuditRecord {
            message_id: "01J0000000000000000000000",
            sender: "sender@example.com",
            recipient: "rcpt@example.org",
            subject: Some("Quarterly report"),
            action: "direct",
            mx_host: Some("mx1.example.org"),
            attempt: 1,
        }
    }

    #[test]
    fn test_redact_email() {
        assert_eq!(
            redact_email("user@example.com", true),
            "[REDACTED]@example.com"
        );
        assert_eq!(redact_email("user@example.com", false), "user@example.com");
        assert_eq!(redact_email("invalid", true), "[REDACTED]");
        assert_eq!(redact_email("invalid", false), "invalid");
    }

    #[test]
    fn test_default_config() {
        let config = AuditConfig::default();
        assert!(config.enabled);
        assert!(!config.redact_sender);
        assert!(!config.redact_recipients);
        assert!(!config.redact_subject);
    }

    #[test]
    fn test_fields_redacted() {
        let audit = AuditLog::new(AuditConfig {
            enabled: true,
            redact_sender: true,
            redact_recipients: true,
            redact_subject: true,
        });

        let (sender, recipient, subject) = audit.fields(&record());
        assert_eq!(sender, "[REDACTED]@example.com");
        assert_eq!(recipient, "[REDACTED]@example.org");
        assert_eq!(subject, "[REDACTED]");
    }

    #[test]
    fn test_audit_disabled() {
        let audit = AuditLog::new(AuditConfig {
            enabled: false,
            ..AuditConfig::default()
        });

        // These should not panic even when disabled
        let record = record();
        audit.delivery_attempt(&record);
        audit.delivery_success(&record, 1000);
        audit.delivery_deferred(&record, "451 try later");
        audit.delivery_failure(&record, "550 no such user", "bounced");
    }
}
