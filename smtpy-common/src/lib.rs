//! Primitives shared by every smtpy crate: the immutable [`Message`] handed to
//! the delivery engine, the [`Domain`] newtype, address helpers, and the
//! logging/audit plumbing.

pub mod address;
pub mod audit;
pub mod domain;
pub mod logging;
pub mod message;

pub use address::{AddressError, EmailAddress};
pub use audit::{AuditConfig, AuditLog, AuditRecord};
pub use domain::Domain;
pub use message::{Attachment, Header, Message, MessageBuilder, MessageError, MessageId};
pub use tracing;
