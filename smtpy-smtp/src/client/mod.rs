//! SMTP client used for outbound delivery.
//!
//! Supports:
//!
//! - Plain TCP, STARTTLS upgrade (RFC 3207) and implicit TLS
//! - EHLO capability discovery
//! - AUTH PLAIN and AUTH LOGIN (RFC 4954)
//! - Dot-stuffed DATA transfer
//!
//! # Examples
//!
//! ```no_run
//! use smtpy_smtp::SmtpClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = SmtpClient::connect("relay.example.com:587", "relay.example.com".into()).await?;
//! client.read_greeting().await?;
//! client.ehlo("client.example.com").await?;
//! if client.capabilities().starttls {
//!     client.starttls().await?;
//!     client.ehlo("client.example.com").await?;
//! }
//! client.authenticate("user", "secret").await?;
//! client.mail_from("sender@example.com", None).await?;
//! client.rcpt_to("recipient@example.org").await?;
//! client.data().await?;
//! let reply = client.send_data(b"Subject: Test\r\n\r\nHello World\r\n").await?;
//! assert!(reply.is_success());
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

mod capabilities;
mod error;
mod response;
mod smtp_client;

pub use capabilities::{AuthMechanism, Capabilities};
pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use smtp_client::{SmtpClient, dot_stuff};
