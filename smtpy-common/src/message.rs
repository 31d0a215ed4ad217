//! The immutable message value handed to the delivery engine, plus a builder
//! that renders RFC 5322 headers and MIME bodies.

use std::{
    fmt::{self, Display, Write as _},
    sync::Arc,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use mailparse::{DispositionType, MailHeaderMap};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::EmailAddress;

/// Errors raised while constructing or parsing a [`Message`].
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Message has no sender")]
    MissingSender,

    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] crate::AddressError),

    #[error("Failed to parse message: {0}")]
    Parse(#[from] mailparse::MailParseError),

    #[error("Invalid header name: {0:?}")]
    InvalidHeaderName(String),
}

/// Stable identifier of a message, used for logging and queue bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Arc<str>);

impl MessageId {
    /// Generate a fresh, lexicographically sortable identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Arc::from(ulid::Ulid::new().to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value.trim().trim_start_matches('<').trim_end_matches('>')))
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single header field. The value is kept exactly as it will appear on
/// the wire (including any folding), so signatures computed over it stay
/// valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// An authored email ready for delivery.
///
/// Messages are never mutated by the engine. Operations that need a changed
/// message (DKIM signing) return a new value sharing the same body buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    id: MessageId,
    sender: String,
    recipients: Vec<String>,
    headers: Vec<Header>,
    body: Arc<[u8]>,
    has_attachments: bool,
    size: usize,
}

impl Message {
    /// Assemble a message from already-rendered parts.
    #[must_use]
    pub fn from_parts(
        id: MessageId,
        sender: impl Into<String>,
        recipients: Vec<String>,
        headers: Vec<Header>,
        body: impl Into<Arc<[u8]>>,
        has_attachments: bool,
    ) -> Self {
        let body = body.into();
        let size = rendered_size(&headers, &body);
        Self {
            id,
            sender: sender.into(),
            recipients,
            headers,
            body,
            has_attachments,
            size,
        }
    }

    /// Parse raw RFC 5322 bytes into a message with the given envelope.
    ///
    /// The `Message-ID` header becomes the message identifier when present.
    ///
    /// # Errors
    ///
    /// Returns an error if the header block cannot be parsed.
    pub fn parse(
        raw: &[u8],
        sender: impl Into<String>,
        recipients: Vec<String>,
    ) -> Result<Self, MessageError> {
        let (parsed_headers, body_offset) = mailparse::parse_headers(raw)?;

        let id = parsed_headers
            .get_first_value("Message-ID")
            .map_or_else(MessageId::generate, |v| MessageId::from(v.as_str()));

        let headers = parsed_headers
            .iter()
            .map(|h| {
                Header::new(
                    h.get_key(),
                    String::from_utf8_lossy(h.get_value_raw()).into_owned(),
                )
            })
            .collect();

        let has_attachments = mailparse::parse_mail(raw).is_ok_and(|mail| {
            mail.subparts.iter().any(|part| {
                part.get_content_disposition().disposition == DispositionType::Attachment
            })
        });

        let body = raw.get(body_offset..).unwrap_or_default();

        Ok(Self::from_parts(
            id,
            sender,
            recipients,
            headers,
            Arc::<[u8]>::from(body),
            has_attachments,
        ))
    }

    #[must_use]
    pub const fn id(&self) -> &MessageId {
        &self.id
    }

    /// Envelope sender (`MAIL FROM`) recorded when the message was built.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    #[must_use]
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    #[must_use]
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First header with the given name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.trim())
    }

    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.header("Subject")
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub const fn has_attachments(&self) -> bool {
        self.has_attachments
    }

    /// Size in bytes of the rendered message.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Render the message as it is transmitted after `DATA`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for header in &self.headers {
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(header.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }

    /// Return a copy of this message with `header` placed before every other
    /// header. Identity, envelope and body are shared with the original.
    #[must_use]
    pub fn with_prepended_header(&self, header: Header) -> Self {
        let mut headers = Vec::with_capacity(self.headers.len() + 1);
        headers.push(header);
        headers.extend(self.headers.iter().cloned());

        Self::from_parts(
            self.id.clone(),
            self.sender.clone(),
            self.recipients.clone(),
            headers,
            Arc::clone(&self.body),
            self.has_attachments,
        )
    }
}

fn rendered_size(headers: &[Header], body: &[u8]) -> usize {
    headers
        .iter()
        .map(|h| h.name.len() + 2 + h.value.len() + 2)
        .sum::<usize>()
        + 2
        + body.len()
}

/// An email attachment with filename, content type, and data.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Builder for constructing messages with proper MIME formatting.
///
/// ```
/// use smtpy_common::MessageBuilder;
///
/// let message = MessageBuilder::new()
///     .from("sender@example.com")
///     .to("recipient@example.com")
///     .subject("Hello")
///     .body("This is the message body")
///     .build()
///     .unwrap();
///
/// assert_eq!(message.subject(), Some("Hello"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    from: Option<String>,
    to: Vec<String>,
    cc: Vec<String>,
    subject: Option<String>,
    headers: Vec<Header>,
    body: Option<String>,
    attachments: Vec<Attachment>,
}

impl MessageBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from(mut self, email: impl Into<String>) -> Self {
        self.from = Some(email.into());
        self
    }

    #[must_use]
    pub fn to(mut self, email: impl Into<String>) -> Self {
        self.to.push(email.into());
        self
    }

    #[must_use]
    pub fn cc(mut self, email: impl Into<String>) -> Self {
        self.cc.push(email.into());
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Adds a custom header, rendered after the standard ones.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    #[must_use]
    pub fn body(mut self, content: impl Into<String>) -> Self {
        self.body = Some(content.into());
        self
    }

    #[must_use]
    pub fn attach(
        mut self,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        self.attachments.push(Attachment {
            filename: filename.into(),
            content_type: content_type.into(),
            data,
        });
        self
    }

    /// Builds the message. The envelope recipients are the union of `To` and
    /// `Cc`; the envelope sender is the `From` address.
    ///
    /// # Errors
    ///
    /// Returns an error if the sender is missing or any address is invalid.
    pub fn build(self) -> Result<Message, MessageError> {
        let from = self.from.as_deref().ok_or(MessageError::MissingSender)?;
        let sender = EmailAddress::parse(from)?;

        let mut recipients = Vec::with_capacity(self.to.len() + self.cc.len());
        for rcpt in self.to.iter().chain(&self.cc) {
            recipients.push(EmailAddress::parse(rcpt)?.to_string());
        }

        for header in &self.headers {
            if header.name.is_empty()
                || header
                    .name
                    .bytes()
                    .any(|b| b == b':' || !(33..=126).contains(&b))
            {
                return Err(MessageError::InvalidHeaderName(header.name.clone()));
            }
        }

        let id = MessageId::generate();
        let mut headers = vec![Header::new("From", from)];
        if !self.to.is_empty() {
            headers.push(Header::new("To", self.to.join(", ")));
        }
        if !self.cc.is_empty() {
            headers.push(Header::new("Cc", self.cc.join(", ")));
        }
        if let Some(subject) = &self.subject {
            headers.push(Header::new("Subject", subject.as_str()));
        }
        headers.push(Header::new("Date", chrono::Utc::now().to_rfc2822()));
        headers.push(Header::new(
            "Message-ID",
            format!("<{id}@{}>", sender.domain()),
        ));
        headers.extend(self.headers.iter().cloned());
        headers.push(Header::new("MIME-Version", "1.0"));

        let has_attachments = !self.attachments.is_empty();
        let body = if has_attachments {
            let boundary = format!("----=_Part_{}", ulid::Ulid::new());
            headers.push(Header::new(
                "Content-Type",
                format!("multipart/mixed; boundary=\"{boundary}\""),
            ));
            self.render_multipart(&boundary)
        } else {
            headers.push(Header::new("Content-Type", "text/plain; charset=utf-8"));
            normalise_line_endings(self.body.as_deref().unwrap_or_default())
        };

        Ok(Message::from_parts(
            id,
            sender.to_string(),
            recipients,
            headers,
            Arc::<[u8]>::from(body.into_bytes()),
            has_attachments,
        ))
    }

    fn render_multipart(&self, boundary: &str) -> String {
        let mut out = String::with_capacity(2048);

        // Writing into a String cannot fail.
        let _ = write!(
            out,
            "--{boundary}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
            normalise_line_endings(self.body.as_deref().unwrap_or_default())
        );

        for attachment in &self.attachments {
            let _ = write!(
                out,
                "--{boundary}\r\nContent-Type: {}\r\nContent-Transfer-Encoding: base64\r\nContent-Disposition: attachment; filename=\"{}\"\r\n\r\n",
                attachment.content_type, attachment.filename
            );
            out.push_str(&wrapped_base64(&attachment.data));
        }

        let _ = write!(out, "--{boundary}--\r\n");
        out
    }
}

/// Base64 with 76-character lines, each terminated by CRLF.
fn wrapped_base64(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / 76 * 2 + 2);
    for chunk in encoded.as_bytes().chunks(76) {
        out.push_str(&String::from_utf8_lossy(chunk));
        out.push_str("\r\n");
    }
    out
}

fn normalise_line_endings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut lines = text.split('\n').peekable();
    while let Some(line) = lines.next() {
        out.push_str(line.strip_suffix('\r').unwrap_or(line));
        if lines.peek().is_some() {
            out.push_str("\r\n");
        }
    }
    out
}
