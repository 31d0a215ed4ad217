//! SMTP client implementation with support for TLS, STARTTLS and AUTH.

use std::{borrow::Cow, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD};
use smtpy_common::{incoming, outgoing, tracing};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};

use super::{
    capabilities::{AuthMechanism, Capabilities},
    error::{ClientError, Result},
    response::Response,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// An SMTP client connection that can be either plain TCP or TLS-wrapped.
enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.write_all(data).await?,
            Self::Tls(stream) => stream.write_all(data).await?,
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        match self {
            Self::Plain(stream) => stream.flush().await?,
            Self::Tls(stream) => stream.flush().await?,
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    async fn upgrade_to_tls(self, domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        match self {
            Self::Plain(stream) => Ok(Self::Tls(Box::new(
                tls_handshake(stream, domain, accept_invalid_certs).await?,
            ))),
            Self::Tls(_) => Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            )),
        }
    }

    async fn shutdown(&mut self) {
        let _ = match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
        };
    }
}

async fn tls_handshake(
    stream: TcpStream,
    domain: &str,
    accept_invalid_certs: bool,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let mut root_store = RootCertStore::empty();

    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        root_store
            .add(cert)
            .map_err(|e| ClientError::TlsError(format!("Failed to add certificate: {e}")))?;
    }
    // Log errors but don't fail if some certs couldn't be loaded
    if !certs.errors.is_empty() {
        tracing::warn!(?certs.errors, "Some certificates could not be loaded");
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    if accept_invalid_certs {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }

    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(domain.to_string())
        .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ClientError::TlsError(e.to_string()))
}

/// A certificate verifier that accepts all certificates.
///
/// Opportunistic STARTTLS to arbitrary MX hosts routinely meets self-signed
/// certificates; callers opt in through [`SmtpClient::accept_invalid_certs`].
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        vec![
            tokio_rustls::rustls::SignatureScheme::RSA_PKCS1_SHA256,
            tokio_rustls::rustls::SignatureScheme::RSA_PSS_SHA256,
            tokio_rustls::rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            tokio_rustls::rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Escape lines beginning with `.` (RFC 5321 §4.5.2) and normalise bare LF
/// line endings to CRLF.
#[must_use]
pub fn dot_stuff(data: &[u8]) -> Cow<'_, [u8]> {
    let leading_dot = data.first() == Some(&b'.') || data.windows(2).any(|w| w == b"\n.");
    let bare_lf = data
        .iter()
        .enumerate()
        .any(|(i, &b)| b == b'\n' && (i == 0 || data[i - 1] != b'\r'));
    let needs_work = leading_dot || bare_lf;

    if !needs_work {
        return Cow::Borrowed(data);
    }

    let mut out = Vec::with_capacity(data.len() + data.len() / 64 + 2);
    let mut at_line_start = true;
    let mut previous = 0u8;

    for &byte in data {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        if byte == b'\n' && previous != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
        previous = byte;
    }

    Cow::Owned(out)
}

/// An SMTP client for sending commands and receiving responses.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    capabilities: Capabilities,
    server_domain: String,
    accept_invalid_certs: bool,
}

impl std::fmt::Debug for SmtpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpClient")
            .field("server_domain", &self.server_domain)
            .field("tls", &self.is_tls())
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl SmtpClient {
    fn with_connection(connection: ClientConnection, server_domain: String) -> Self {
        Self {
            connection: Some(connection),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            capabilities: Capabilities::default(),
            server_domain,
            accept_invalid_certs: false,
        }
    }

    /// Creates a new SMTP client by connecting to the specified address.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails.
    pub async fn connect(addr: &str, server_domain: String) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Io)?;
        Ok(Self::with_connection(
            ClientConnection::Plain(stream),
            server_domain,
        ))
    }

    /// Connects and negotiates TLS before any SMTP traffic (implicit TLS,
    /// usually port 465).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or the TLS handshake fails.
    pub async fn connect_tls(
        addr: &str,
        server_domain: String,
        accept_invalid_certs: bool,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(ClientError::Io)?;
        let tls = tls_handshake(stream, &server_domain, accept_invalid_certs).await?;

        let mut client =
            Self::with_connection(ClientConnection::Tls(Box::new(tls)), server_domain);
        client.accept_invalid_certs = accept_invalid_certs;
        Ok(client)
    }

    /// Sets whether to accept invalid TLS certificates on STARTTLS.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self.connection, Some(ClientConnection::Tls(_)))
    }

    /// Extensions advertised by the most recent EHLO.
    #[must_use]
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    #[must_use]
    pub fn server_domain(&self) -> &str {
        &self.server_domain
    }

    /// Reads the initial server greeting (220 response).
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the greeting is invalid.
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response().await
    }

    /// Sends a command to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_command(&mut self, command: &str) -> Result<()> {
        outgoing!("{}", redact_command(command));

        let data = format!("{command}\r\n");
        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;
        connection.send(data.as_bytes()).await?;
        connection.flush().await
    }

    /// Sends a raw command and reads the response.
    ///
    /// # Errors
    ///
    /// Returns an error if sending or reading fails.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        self.send_command(command).await?;
        self.read_response().await
    }

    /// Sends EHLO and records the advertised extensions.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        let response = self.command(&format!("EHLO {domain}")).await?;
        self.capabilities = if response.is_success() {
            Capabilities::from_ehlo(&response)
        } else {
            Capabilities::default()
        };
        Ok(response)
    }

    /// Sends HELO with the specified domain.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.capabilities = Capabilities::default();
        self.command(&format!("HELO {domain}")).await
    }

    /// Sends MAIL FROM command. `SIZE` is only declared when the server
    /// advertised the extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn mail_from(&mut self, from: &str, size: Option<usize>) -> Result<Response> {
        let cmd = match size {
            Some(sz) if self.capabilities.size.is_some() => format!("MAIL FROM:<{from}> SIZE={sz}"),
            _ => format!("MAIL FROM:<{from}>"),
        };
        self.command(&cmd).await
    }

    /// Sends RCPT TO command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// Sends DATA command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Sends the message content, dot-stuffed, followed by the end-of-data
    /// marker, and reads the final reply.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<Response> {
        let connection = self
            .connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?;

        let stuffed = dot_stuff(data);
        connection.send(&stuffed).await?;

        if !stuffed.ends_with(b"\r\n") {
            connection.send(b"\r\n").await?;
        }

        connection.send(b".\r\n").await?;
        connection.flush().await?;
        outgoing!("<{} bytes of message data>", stuffed.len());

        self.read_response().await
    }

    /// Sends QUIT command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn quit(&mut self) -> Result<Response> {
        let response = self.command("QUIT").await;
        if let Some(connection) = self.connection.as_mut() {
            connection.shutdown().await;
        }
        response
    }

    /// Sends STARTTLS command and upgrades the connection to TLS.
    ///
    /// After a successful upgrade the capabilities are cleared; RFC 3207
    /// requires a fresh EHLO before continuing.
    ///
    /// # Errors
    ///
    /// Returns an error if STARTTLS fails or TLS upgrade fails.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;

        if response.is_success() {
            let Some(old_connection) = self.connection.take() else {
                return Err(ClientError::ConnectionClosed);
            };

            // Anything buffered before the handshake was injected in plaintext
            self.buffer_pos = 0;
            self.capabilities = Capabilities::default();
            self.connection = Some(
                old_connection
                    .upgrade_to_tls(&self.server_domain, self.accept_invalid_certs)
                    .await?,
            );
        }

        Ok(response)
    }

    /// Sends RSET command to reset the transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    /// Authenticates with the best mechanism the server advertised.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NoAuthMechanism`] if neither PLAIN nor LOGIN is
    /// offered, or [`ClientError::AuthenticationFailed`] if the server rejects
    /// the credentials.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<Response> {
        match self.capabilities.preferred_auth() {
            Some(AuthMechanism::Plain) => self.auth_plain(username, password).await,
            Some(AuthMechanism::Login) => self.auth_login(username, password).await,
            None => Err(ClientError::NoAuthMechanism(
                self.capabilities.auth.join(" "),
            )),
        }
    }

    /// `AUTH PLAIN` with an initial response (RFC 4616).
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or the credentials are rejected.
    pub async fn auth_plain(&mut self, username: &str, password: &str) -> Result<Response> {
        let token = STANDARD.encode(format!("\0{username}\0{password}"));
        let response = self.command(&format!("AUTH PLAIN {token}")).await?;
        Self::auth_result(response)
    }

    /// `AUTH LOGIN`: username and password each sent in reply to a 334
    /// challenge.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or the credentials are rejected.
    pub async fn auth_login(&mut self, username: &str, password: &str) -> Result<Response> {
        let response = self.command("AUTH LOGIN").await?;
        if response.code != 334 {
            return Self::auth_result(response);
        }

        let response = self.command(&STANDARD.encode(username)).await?;
        if response.code != 334 {
            return Self::auth_result(response);
        }

        let response = self.command(&STANDARD.encode(password)).await?;
        Self::auth_result(response)
    }

    fn auth_result(response: Response) -> Result<Response> {
        if response.code == 235 {
            Ok(response)
        } else {
            Err(ClientError::AuthenticationFailed {
                code: response.code,
                message: response.message(),
            })
        }
    }

    /// Reads a complete SMTP response from the server.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the response is malformed.
    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;

                incoming!("{} {}", response.code, response.message());

                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                // Buffer is full but no complete response - expand buffer
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

/// Keep credentials out of the wire log. Bare tokens other than the known
/// verbs only appear inside an AUTH exchange.
fn redact_command(command: &str) -> &str {
    let verb = command.split(' ').next().unwrap_or_default();
    if verb.eq_ignore_ascii_case("AUTH") && command.len() > "AUTH LOGIN".len() {
        "AUTH <redacted>"
    } else if verb.len() == command.len()
        && !["DATA", "RSET", "NOOP", "QUIT", "STARTTLS", "AUTH"]
            .iter()
            .any(|known| verb.eq_ignore_ascii_case(known))
    {
        "<redacted>"
    } else {
        command
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_dot_stuff_untouched() {
        let data = b"Subject: hi\r\n\r\nHello\r\n";
        assert!(matches!(dot_stuff(data), Cow::Borrowed(_)));
    }

    #[test]
    fn test_dot_stuff_leading_dots() {
        let data = b".hidden\r\nline\r\n.\r\n..two\r\n";
        assert_eq!(
            dot_stuff(data).as_ref(),
            b"..hidden\r\nline\r\n..\r\n...two\r\n"
        );
    }

    #[test]
    fn test_dot_stuff_bare_lf() {
        assert_eq!(dot_stuff(b"a\nb\n.c").as_ref(), b"a\r\nb\r\n..c");
    }

    #[test]
    fn test_redact_command() {
        assert_eq!(
            redact_command("AUTH PLAIN AGFsaWNlAHNlY3JldA=="),
            "AUTH <redacted>"
        );
        assert_eq!(redact_command("AUTH LOGIN"), "AUTH LOGIN");
        assert_eq!(redact_command("YWxpY2U="), "<redacted>");
        assert_eq!(redact_command("DATA"), "DATA");
        assert_eq!(
            redact_command("MAIL FROM:<a@example.com>"),
            "MAIL FROM:<a@example.com>"
        );
    }
}
