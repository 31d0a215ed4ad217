//! The SMTP client side of smtpy: connection setup (plain, STARTTLS and
//! implicit TLS), ESMTP capability discovery, AUTH, and the mail
//! transaction commands.

pub mod client;

pub use client::{AuthMechanism, Capabilities, ClientError, Response, SmtpClient};
