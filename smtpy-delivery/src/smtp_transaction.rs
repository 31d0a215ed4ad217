//! SMTP session setup and transaction execution
//!
//! Both delivery paths open sessions through [`connect`]:
//! - TCP connect (or implicit TLS) and greeting
//! - EHLO, falling back to HELO
//! - TLS negotiation via STARTTLS according to [`TlsMode`]
//! - optional AUTH
//!
//! and move mail through [`transmit`]: MAIL FROM, one RCPT TO per recipient,
//! DATA and the dot-stuffed content.

use std::{future::Future, time::Duration};

use smtpy_smtp::{ClientError, Response, SmtpClient};
use tracing::{debug, info, warn};

use crate::{
    SmtpTimeouts,
    error::{DeliveryError, PermanentError, TemporaryError},
};

/// How a session treats TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Never attempt TLS.
    Disabled,
    /// STARTTLS when advertised. Without it, or when it fails, continue in
    /// plaintext only if `allow_plaintext` is set; otherwise the attempt is
    /// deferred.
    Opportunistic { allow_plaintext: bool },
    /// STARTTLS is mandatory. A server that does not advertise it is a
    /// permanent failure; a failed or timed out upgrade is temporary.
    Required,
    /// TLS from the first byte (SMTPS).
    Implicit,
}

/// Outcome of TLS negotiation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsNegotiationOutcome {
    /// TLS was successfully negotiated via STARTTLS
    Success,
    /// TLS was not attempted
    Skipped,
    /// STARTTLS failed on an opportunistic session; reconnect without it
    /// (RFC 3207 §4.1)
    RetryWithoutTls,
}

/// Everything needed to open a session with one server.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions<'a> {
    /// `host:port`
    pub address: &'a str,
    /// Name checked against the server certificate.
    pub server_name: &'a str,
    /// Our name for EHLO.
    pub helo_domain: &'a str,
    pub tls: TlsMode,
    pub accept_invalid_certs: bool,
    pub credentials: Option<(&'a str, &'a str)>,
    pub timeouts: &'a SmtpTimeouts,
}

/// Result of [`transmit`] for a multi-recipient envelope.
#[derive(Debug)]
pub struct TransmitReport {
    /// Recipients the server accepted at `RCPT TO`.
    pub accepted: Vec<String>,
    /// Recipients refused at `RCPT TO`, with the reason.
    pub rejected: Vec<(String, DeliveryError)>,
    /// The reply to the end of DATA; `None` when no recipient was accepted.
    pub reply: Option<Response>,
    /// False when the session could not be reset and must not be reused.
    pub reusable: bool,
}

/// Run `future` under `duration`, mapping a timeout to a temporary error.
pub(crate) async fn timed<T>(
    duration: Duration,
    what: &str,
    future: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, DeliveryError> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TemporaryError::Timeout(format!("{what} timed out after {duration:?}")))?
        .map_err(DeliveryError::from)
}

const fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

async fn connect_and_greet(options: &ConnectOptions<'_>) -> Result<SmtpClient, DeliveryError> {
    let timeout = ms(options.timeouts.connect_ms);
    let address = options.address.to_string();
    let server_name = options.server_name.to_string();

    let connect = async {
        let mut client = if options.tls == TlsMode::Implicit {
            SmtpClient::connect_tls(&address, server_name, options.accept_invalid_certs).await?
        } else {
            SmtpClient::connect(&address, server_name)
                .await?
                .accept_invalid_certs(options.accept_invalid_certs)
        };
        let greeting = client.read_greeting().await?;
        Ok::<_, ClientError>((client, greeting))
    };

    let (client, greeting) = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| {
            TemporaryError::Timeout(format!(
                "Connecting to {} timed out after {timeout:?}",
                options.address
            ))
        })?
        .map_err(|e| match DeliveryError::from(e) {
            DeliveryError::Temporary(TemporaryError::ConnectionFailed(reason)) => {
                TemporaryError::ConnectionFailed(format!(
                    "Failed to connect to {}: {reason}",
                    options.address
                ))
                .into()
            }
            other => other,
        })?;

    if !greeting.is_success() {
        return Err(TemporaryError::ConnectionFailed(format!(
            "Server rejected connection: {} {}",
            greeting.code,
            greeting.message()
        ))
        .into());
    }

    Ok(client)
}

async fn ehlo(client: &mut SmtpClient, options: &ConnectOptions<'_>) -> Result<(), DeliveryError> {
    let timeout = ms(options.timeouts.ehlo_ms);
    let response = timed(timeout, "EHLO", client.ehlo(options.helo_domain)).await?;

    if response.is_success() {
        return Ok(());
    }

    // Pre-ESMTP servers answer EHLO with 500/502
    if matches!(response.code, 500 | 502) {
        let response = timed(timeout, "HELO", client.helo(options.helo_domain)).await?;
        if response.is_success() {
            return Ok(());
        }
        return Err(DeliveryError::from_reply(response.code, response.message()));
    }

    Err(DeliveryError::from_reply(response.code, response.message()))
}

/// Negotiate TLS upgrade via STARTTLS per the session's [`TlsMode`].
async fn negotiate_tls(
    client: &mut SmtpClient,
    options: &ConnectOptions<'_>,
) -> Result<TlsNegotiationOutcome, DeliveryError> {
    let (required, allow_plaintext) = match options.tls {
        TlsMode::Disabled | TlsMode::Implicit => return Ok(TlsNegotiationOutcome::Skipped),
        TlsMode::Opportunistic { allow_plaintext } => (false, allow_plaintext),
        TlsMode::Required => (true, false),
    };

    if !client.capabilities().starttls {
        if required {
            return Err(PermanentError::TlsRequired(format!(
                "{} does not advertise STARTTLS",
                options.address
            ))
            .into());
        }
        if !allow_plaintext {
            return Err(TemporaryError::TlsHandshakeFailed(format!(
                "{} does not advertise STARTTLS and plaintext delivery is disabled",
                options.address
            ))
            .into());
        }
        debug!(server = %options.address, "STARTTLS not advertised, continuing in plaintext");
        return Ok(TlsNegotiationOutcome::Skipped);
    }

    let timeout = ms(options.timeouts.starttls_ms);
    let failure = match tokio::time::timeout(timeout, client.starttls()).await {
        Ok(Ok(response)) if response.is_success() => None,
        Ok(Ok(response)) => Some(format!(
            "Server rejected STARTTLS: {} {}",
            response.code,
            response.message()
        )),
        Ok(Err(e)) => Some(format!("STARTTLS failed: {e}")),
        Err(_) => Some(format!("STARTTLS timed out after {timeout:?}")),
    };

    if let Some(reason) = failure {
        if required || !allow_plaintext {
            return Err(TemporaryError::TlsHandshakeFailed(reason).into());
        }
        info!(
            server = %options.address,
            error = %reason,
            "STARTTLS failed, will retry without TLS per RFC 3207"
        );
        return Ok(TlsNegotiationOutcome::RetryWithoutTls);
    }

    // Re-send EHLO after STARTTLS (RFC 3207)
    ehlo(client, options).await?;
    debug!(server = %options.address, "TLS successfully negotiated via STARTTLS");
    Ok(TlsNegotiationOutcome::Success)
}

async fn authenticate(
    client: &mut SmtpClient,
    options: &ConnectOptions<'_>,
) -> Result<(), DeliveryError> {
    let Some((username, password)) = options.credentials else {
        return Ok(());
    };

    timed(
        ms(options.timeouts.auth_ms),
        "AUTH",
        client.authenticate(username, password),
    )
    .await?;
    debug!(server = %options.address, "Authenticated");
    Ok(())
}

/// Open a ready-to-use session: greeted, TLS negotiated, authenticated.
///
/// # Errors
///
/// Returns a temporary error for network trouble and timeouts, and a
/// permanent one when required TLS is unavailable or credentials are refused.
#[tracing::instrument(level = "debug", skip_all, fields(server = %options.address))]
pub async fn connect(options: &ConnectOptions<'_>) -> Result<SmtpClient, DeliveryError> {
    if options.accept_invalid_certs && options.tls != TlsMode::Disabled {
        warn!(
            server = %options.address,
            "SECURITY WARNING: TLS certificate validation is disabled for this connection"
        );
    }

    let mut client = connect_and_greet(options).await?;
    ehlo(&mut client, options).await?;

    if negotiate_tls(&mut client, options).await? == TlsNegotiationOutcome::RetryWithoutTls {
        drop(client);
        client = connect_and_greet(options).await?;
        ehlo(&mut client, options).await?;
        info!(
            server = %options.address,
            "Reconnected without TLS, proceeding with plaintext delivery"
        );
    }

    authenticate(&mut client, options).await?;
    Ok(client)
}

/// Send one message over an open session.
///
/// A 5xx to `RCPT TO` rejects only that recipient. Any other non-success
/// reply fails the whole envelope.
///
/// # Errors
///
/// Returns the classified error for MAIL FROM, DATA or transport failures.
pub async fn transmit(
    client: &mut SmtpClient,
    timeouts: &SmtpTimeouts,
    mail_from: &str,
    recipients: &[String],
    data: &[u8],
) -> Result<TransmitReport, DeliveryError> {
    let response = timed(
        ms(timeouts.mail_from_ms),
        "MAIL FROM",
        client.mail_from(mail_from, Some(data.len())),
    )
    .await?;
    if !response.is_success() {
        return Err(DeliveryError::from_reply(
            response.code,
            format!("MAIL FROM rejected: {}", response.message()),
        ));
    }

    let mut accepted = Vec::with_capacity(recipients.len());
    let mut rejected = Vec::new();
    for recipient in recipients {
        let response = timed(ms(timeouts.rcpt_to_ms), "RCPT TO", client.rcpt_to(recipient)).await?;

        if response.is_success() {
            accepted.push(recipient.clone());
        } else if response.is_permanent_error() {
            rejected.push((
                recipient.clone(),
                DeliveryError::from_rcpt_reply(response.code, response.message()),
            ));
        } else {
            return Err(DeliveryError::from_reply(
                response.code,
                format!("RCPT TO <{recipient}> deferred: {}", response.message()),
            ));
        }
    }

    if accepted.is_empty() {
        let reusable = match timed(ms(timeouts.quit_ms), "RSET", client.rset()).await {
            Ok(response) if response.is_success() => true,
            Ok(response) => {
                debug!(code = response.code, "RSET refused after rejected envelope");
                false
            }
            Err(e) => {
                debug!(error = %e, "RSET failed after rejected envelope");
                false
            }
        };
        return Ok(TransmitReport {
            accepted,
            rejected,
            reply: None,
            reusable,
        });
    }

    let data_timeout = ms(timeouts.data_ms);
    let response = timed(data_timeout, "DATA", client.data()).await?;
    if !response.is_intermediate() {
        return Err(DeliveryError::from_reply(
            response.code,
            format!("DATA rejected: {}", response.message()),
        ));
    }

    let reply = timed(data_timeout, "Message transmission", client.send_data(data)).await?;
    if !reply.is_success() {
        return Err(DeliveryError::from_reply(reply.code, reply.message()));
    }

    Ok(TransmitReport {
        accepted,
        rejected,
        reply: Some(reply),
        reusable: true,
    })
}

/// Close a session politely. Failures are logged, never returned: the mail
/// has already been handed over.
pub async fn quit(client: &mut SmtpClient, timeouts: &SmtpTimeouts) {
    if let Err(e) = timed(ms(timeouts.quit_ms), "QUIT", client.quit()).await {
        debug!(server = %client.server_domain(), "QUIT failed: {e}");
    }
}

/// A single-recipient delivery against one server, from connect to QUIT.
pub struct SmtpTransaction<'a> {
    options: ConnectOptions<'a>,
}

impl<'a> SmtpTransaction<'a> {
    #[must_use]
    pub const fn new(options: ConnectOptions<'a>) -> Self {
        Self { options }
    }

    /// Execute the complete SMTP transaction and return the server's final
    /// reply.
    ///
    /// # Errors
    /// Returns an error if any part of the SMTP transaction fails
    #[tracing::instrument(level = "info", skip(self, data), fields(server = %self.options.address))]
    pub async fn execute(
        self,
        mail_from: &str,
        recipient: &str,
        data: &[u8],
    ) -> Result<Response, DeliveryError> {
        let mut client = connect(&self.options).await?;

        let report = transmit(
            &mut client,
            self.options.timeouts,
            mail_from,
            std::slice::from_ref(&recipient.to_string()),
            data,
        )
        .await;

        quit(&mut client, self.options.timeouts).await;

        let mut report = report?;
        match (report.reply.take(), report.rejected.pop()) {
            (Some(reply), _) => Ok(reply),
            (None, Some((_, error))) => Err(error),
            (None, None) => Err(TemporaryError::ConnectionFailed(
                "Server accepted no recipients".to_string(),
            )
            .into()),
        }
    }
}
