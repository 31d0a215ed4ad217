//! Engine configuration
//!
//! [`DeliveryConfig`] deserializes from RON with every field defaulted, or
//! is assembled from `SMTP_*` environment variables by
//! [`DeliveryConfig::from_env`]. Either way, call
//! [`DeliveryConfig::validate`] before building the engine.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use smtpy_common::AuditConfig;

use crate::{
    direct::DirectConfig, dkim::DkimConfig, dns::DnsConfig, error::ConfigError,
    policy::RetryPolicy, rate_limiter::RateLimitConfig, relay::RelayConfig, types::SmtpTimeouts,
};

/// Which paths the router uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Direct MX delivery only.
    Direct,
    /// External relay only.
    Relay,
    /// Direct first, relay for recipients the direct path gave up on.
    #[default]
    Hybrid,
    /// Same as `Hybrid`.
    Smart,
}

impl DeliveryMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Relay => "relay",
            Self::Hybrid => "hybrid",
            Self::Smart => "smart",
        }
    }

    #[must_use]
    pub const fn uses_direct(self) -> bool {
        !matches!(self, Self::Relay)
    }

    #[must_use]
    pub const fn uses_relay(self) -> bool {
        !matches!(self, Self::Direct)
    }
}

impl Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "relay" => Ok(Self::Relay),
            "hybrid" => Ok(Self::Hybrid),
            "smart" => Ok(Self::Smart),
            other => Err(format!(
                "unknown delivery mode {other:?}, expected direct, relay, hybrid or smart"
            )),
        }
    }
}

/// Complete delivery engine configuration.
///
/// # Example
///
/// ```ron
/// (
///     hostname: "mta.example.com",
///     mode: hybrid,
///     relay: (
///         host: "smtp.relay.example",
///         port: 587,
///         username: Some("mailer"),
///         password: Some("secret"),
///     ),
///     retry: (base_delay_ms: 2000),
/// )
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Our FQDN, announced in EHLO.
    ///
    /// Default: `localhost`
    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default)]
    pub mode: DeliveryMode,

    #[serde(default)]
    pub dkim: DkimConfig,

    #[serde(default)]
    pub direct: DirectConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,

    #[serde(default)]
    pub audit: AuditConfig,
}

fn default_hostname() -> String {
    "localhost".to_string()
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            mode: DeliveryMode::default(),
            dkim: DkimConfig::default(),
            direct: DirectConfig::default(),
            relay: RelayConfig::default(),
            dns: DnsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            timeouts: SmtpTimeouts::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl DeliveryConfig {
    /// Build a configuration from the process environment. Unset variables
    /// keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for a variable that is set but
    /// cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Self::from_env`], reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unparseable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(lookup);
        let mut config = Self::default();

        if let Some(hostname) = env.string("SMTP_HOSTNAME") {
            config.hostname = hostname;
        }
        env.parse("SMTP_DELIVERY_MODE", &mut config.mode)?;

        env.flag("SMTP_ENABLE_DKIM", &mut config.dkim.enabled)?;
        if let Some(selector) = env.string("SMTP_DKIM_SELECTOR") {
            config.dkim.selector = selector;
        }

        if let Some(host) = env.string("SMTP_HOST") {
            config.relay.host = host;
        }
        env.parse("SMTP_PORT", &mut config.relay.port)?;
        if let Some(user) = env.string("SMTP_USER") {
            config.relay.username = Some(user);
        }
        if let Some(password) = env.raw("SMTP_PASSWORD") {
            config.relay.password = Some(password);
        }
        env.flag("SMTP_USE_TLS", &mut config.relay.use_tls)?;
        env.flag("SMTP_USE_SSL", &mut config.relay.use_ssl)?;
        env.parse("SMTP_POOL_SIZE", &mut config.relay.pool_size)?;
        env.parse("SMTP_MAX_QUEUE_SIZE", &mut config.relay.max_queue_size)?;
        env.parse("SMTP_NUM_WORKERS", &mut config.relay.num_workers)?;

        env.parse("SMTP_RATE_LIMIT", &mut config.rate_limit.relay_per_window)?;
        env.parse(
            "SMTP_DIRECT_RATE_LIMIT",
            &mut config.rate_limit.direct_per_window,
        )?;

        env.flag(
            "SMTP_ALLOW_PLAINTEXT",
            &mut config.direct.allow_plaintext_fallback,
        )?;
        env.flag("SMTP_REQUIRE_TLS", &mut config.direct.require_tls)?;

        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hostname.trim().is_empty() {
            return Err(ConfigError::Invalid("hostname must not be empty".into()));
        }

        let positive = [
            ("relay.pool_size", self.relay.pool_size),
            ("relay.num_workers", self.relay.num_workers),
            ("relay.max_queue_size", self.relay.max_queue_size),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: value.to_string(),
                    reason: "must be at least 1".into(),
                });
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "retry.max_attempts",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "rate_limit.window_secs",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return Err(ConfigError::InvalidValue {
                key: "retry.jitter_factor",
                value: self.retry.jitter_factor.to_string(),
                reason: "must be between 0.0 and 1.0".into(),
            });
        }

        if self.mode == DeliveryMode::Relay && !self.relay.is_configured() {
            return Err(ConfigError::Invalid(
                "relay mode requires a relay host (SMTP_HOST)".into(),
            ));
        }

        Ok(())
    }
}

struct Env<F>(F);

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// The value exactly as set. Passwords may carry meaningful whitespace.
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.is_empty())
    }

    /// A set, non-blank variable.
    fn string(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(raw) = self.string(key) {
            *target = raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn flag(&self, key: &'static str, target: &mut bool) -> Result<(), ConfigError> {
        if let Some(raw) = self.string(key) {
            *target = match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key,
                        value: raw,
                        reason: "expected true or false".into(),
                    });
                }
            };
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DeliveryConfig::default();
        assert_eq!(config.mode, DeliveryMode::Hybrid);
        assert_eq!(config.relay.pool_size, 5);
        assert_eq!(config.relay.max_queue_size, 1000);
        assert_eq!(config.relay.num_workers, 3);
        assert_eq!(config.rate_limit.direct_per_window, 10);
        assert_eq!(config.rate_limit.relay_per_window, 100);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.dkim.selector, "smtpy");
        assert!(config.direct.allow_plaintext_fallback);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_reads_every_variable() {
        let config = DeliveryConfig::from_lookup(lookup(&[
            ("SMTP_HOSTNAME", "mta.example.com"),
            ("SMTP_DELIVERY_MODE", "Relay"),
            ("SMTP_ENABLE_DKIM", "false"),
            ("SMTP_DKIM_SELECTOR", "mail2024"),
            ("SMTP_HOST", "smtp.relay.example"),
            ("SMTP_PORT", "2525"),
            ("SMTP_USER", "mailer"),
            ("SMTP_PASSWORD", " secret "),
            ("SMTP_USE_TLS", "no"),
            ("SMTP_USE_SSL", "1"),
            ("SMTP_POOL_SIZE", "8"),
            ("SMTP_MAX_QUEUE_SIZE", "50"),
            ("SMTP_RATE_LIMIT", "200"),
            ("SMTP_NUM_WORKERS", "4"),
            ("SMTP_DIRECT_RATE_LIMIT", "20"),
            ("SMTP_ALLOW_PLAINTEXT", "off"),
            ("SMTP_REQUIRE_TLS", "TRUE"),
        ]))
        .unwrap();

        assert_eq!(config.hostname, "mta.example.com");
        assert_eq!(config.mode, DeliveryMode::Relay);
        assert!(!config.dkim.enabled);
        assert_eq!(config.dkim.selector, "mail2024");
        assert_eq!(config.relay.host, "smtp.relay.example");
        assert_eq!(config.relay.port, 2525);
        assert_eq!(config.relay.username.as_deref(), Some("mailer"));
        assert_eq!(config.relay.password.as_deref(), Some(" secret "));
        assert!(!config.relay.use_tls);
        assert!(config.relay.use_ssl);
        assert_eq!(config.relay.pool_size, 8);
        assert_eq!(config.relay.max_queue_size, 50);
        assert_eq!(config.rate_limit.relay_per_window, 200);
        assert_eq!(config.relay.num_workers, 4);
        assert_eq!(config.rate_limit.direct_per_window, 20);
        assert!(!config.direct.allow_plaintext_fallback);
        assert!(config.direct.require_tls);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values_are_errors() {
        let err = DeliveryConfig::from_lookup(lookup(&[("SMTP_PORT", "smtp")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "SMTP_PORT",
                ..
            }
        ));

        let err =
            DeliveryConfig::from_lookup(lookup(&[("SMTP_DELIVERY_MODE", "fastest")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "SMTP_DELIVERY_MODE",
                ..
            }
        ));

        let err = DeliveryConfig::from_lookup(lookup(&[("SMTP_USE_TLS", "maybe")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "SMTP_USE_TLS",
                ..
            }
        ));
    }

    #[test]
    fn test_blank_values_keep_defaults() {
        let config = DeliveryConfig::from_lookup(lookup(&[("SMTP_PORT", "  ")])).unwrap();
        assert_eq!(config.relay.port, 587);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mutations: [fn(&mut DeliveryConfig); 4] = [
            |c: &mut DeliveryConfig| c.relay.pool_size = 0,
            |c: &mut DeliveryConfig| c.relay.num_workers = 0,
            |c: &mut DeliveryConfig| c.relay.max_queue_size = 0,
            |c: &mut DeliveryConfig| c.retry.max_attempts = 0,
        ];
        for mutate in mutations {
            let mut config = DeliveryConfig::default();
            mutate(&mut config);
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_relay_mode_requires_host() {
        let config = DeliveryConfig {
            mode: DeliveryMode::Relay,
            ..DeliveryConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Invalid(
                "relay mode requires a relay host (SMTP_HOST)".into()
            ))
        );
    }

    #[test]
    fn test_mode_paths() {
        assert!(DeliveryMode::Direct.uses_direct());
        assert!(!DeliveryMode::Direct.uses_relay());
        assert!(!DeliveryMode::Relay.uses_direct());
        assert!(DeliveryMode::Smart.uses_direct() && DeliveryMode::Smart.uses_relay());
        assert_eq!("SMART".parse::<DeliveryMode>(), Ok(DeliveryMode::Smart));
    }

    #[test]
    fn test_ron_partial_config() {
        let config: DeliveryConfig = ron::from_str(
            r#"(
                hostname: "mta.example.com",
                mode: direct,
                relay: (host: "smtp.relay.example", pool_size: 2),
                retry: (base_delay_ms: 10),
            )"#,
        )
        .unwrap();

        assert_eq!(config.mode, DeliveryMode::Direct);
        assert_eq!(config.relay.host, "smtp.relay.example");
        assert_eq!(config.relay.pool_size, 2);
        assert_eq!(config.relay.port, 587);
        assert_eq!(config.retry.base_delay_ms, 10);
        assert_eq!(config.retry.max_attempts, 3);
    }
}
