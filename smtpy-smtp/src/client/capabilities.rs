//! ESMTP service extensions advertised in an EHLO reply (RFC 5321 §4.1.1.1).

use std::fmt::{self, Display};

use super::response::Response;

/// SASL mechanisms the client can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    Plain,
    Login,
}

impl AuthMechanism {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

impl Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the server said it supports after the most recent EHLO.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub starttls: bool,
    pub pipelining: bool,
    pub eight_bit_mime: bool,
    /// Maximum message size from the `SIZE` keyword, `None` if unadvertised
    /// or unlimited.
    pub size: Option<usize>,
    /// Raw mechanism names from the `AUTH` keyword, uppercased.
    pub auth: Vec<String>,
}

impl Capabilities {
    /// Extract capabilities from an EHLO reply. The first line is the server's
    /// greeting and is skipped.
    #[must_use]
    pub fn from_ehlo(response: &Response) -> Self {
        let mut caps = Self::default();

        for line in response.lines.iter().skip(1) {
            let mut parts = line.split_whitespace();
            let Some(keyword) = parts.next() else {
                continue;
            };

            match keyword.to_ascii_uppercase().as_str() {
                "STARTTLS" => caps.starttls = true,
                "PIPELINING" => caps.pipelining = true,
                "8BITMIME" => caps.eight_bit_mime = true,
                "SIZE" => {
                    caps.size = parts
                        .next()
                        .and_then(|s| s.parse::<usize>().ok())
                        .filter(|&s| s > 0);
                }
                // Some older servers use `AUTH=LOGIN PLAIN`
                kw if kw == "AUTH" || kw.starts_with("AUTH=") => {
                    let first = kw.strip_prefix("AUTH=").filter(|m| !m.is_empty());
                    for mechanism in first.into_iter().map(str::to_string).chain(
                        parts.by_ref().map(str::to_ascii_uppercase),
                    ) {
                        if !caps.auth.contains(&mechanism) {
                            caps.auth.push(mechanism);
                        }
                    }
                }
                _ => {}
            }
        }

        caps
    }

    #[must_use]
    pub fn supports_auth(&self, mechanism: AuthMechanism) -> bool {
        self.auth.iter().any(|m| m == mechanism.as_str())
    }

    /// Preferred mechanism among those advertised: PLAIN, then LOGIN.
    #[must_use]
    pub fn preferred_auth(&self) -> Option<AuthMechanism> {
        [AuthMechanism::Plain, AuthMechanism::Login]
            .into_iter()
            .find(|&m| self.supports_auth(m))
    }
}
