use std::fmt::{self, Display};

use mailparse::MailAddr;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Domain;

/// Errors produced while validating an email address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Address could not be parsed: {0}")]
    Unparseable(String),

    #[error("Address is missing a domain: {0}")]
    MissingDomain(String),

    #[error("Address is missing a local part: {0}")]
    MissingLocalPart(String),

    #[error("Expected a single mailbox, got: {0}")]
    NotSingleMailbox(String),
}

/// A validated `local@domain` mailbox as used in SMTP envelopes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    local_part: String,
    domain: Domain,
}

impl EmailAddress {
    /// Parse an address, accepting bare `user@domain`, `<user@domain>` and
    /// `Display Name <user@domain>` forms.
    ///
    /// # Errors
    ///
    /// Returns an [`AddressError`] if the input is not exactly one mailbox
    /// with a non-empty local part and domain.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        let list = mailparse::addrparse(trimmed)
            .map_err(|e| AddressError::Unparseable(format!("{trimmed}: {e}")))?;

        let addr = match list.iter().as_slice() {
            [MailAddr::Single(info)] => info.addr.clone(),
            _ => return Err(AddressError::NotSingleMailbox(trimmed.to_string())),
        };

        let Some((local, domain)) = addr.rsplit_once('@') else {
            return Err(AddressError::MissingDomain(trimmed.to_string()));
        };

        if local.is_empty() {
            return Err(AddressError::MissingLocalPart(trimmed.to_string()));
        }

        let domain = Domain::new(domain);
        if domain.is_empty() || domain.contains(char::is_whitespace) {
            return Err(AddressError::MissingDomain(trimmed.to_string()));
        }

        Ok(Self {
            local_part: local.to_string(),
            domain,
        })
    }

    #[must_use]
    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }
}

impl Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}
