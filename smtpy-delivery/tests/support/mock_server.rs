//! Mock SMTP server for delivery tests
//!
//! This module provides a configurable mock SMTP server that can:
#![allow(dead_code)] // Test utility module - not all methods used in every test
//! - Answer each command with a configured reply, per recipient for RCPT TO
//! - Accept AUTH PLAIN and AUTH LOGIN for one set of credentials
//! - Inject network failures (hangs, dropped connections, slow replies)
//! - Record received commands and message content for verification
//!
//! # Example
//!
//! ```rust,no_run
//! use support::mock_server::MockSmtpServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = MockSmtpServer::builder()
//!     .with_rcpt_response("nobody@example.com", 550, "User unknown")
//!     .with_auth("mailer", "secret")
//!     .build()
//!     .await?;
//!
//! // Point a MailServer or relay config at server.port()
//!
//! server.shutdown();
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{ReadHalf, WriteHalf},
    },
    sync::RwLock,
    time::timeout,
};

/// SMTP command received by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content after DATA, dot-unstuffed, without the terminator
    MessageContent(Vec<u8>),
    /// AUTH with the mechanism name and whether the credentials matched
    Auth { mechanism: String, accepted: bool },
    Rset,
    Noop,
    Quit,
    StartTls,
    Other(String),
}

/// Response configuration for SMTP commands
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    pub code: u16,
    pub message: String,
}

impl SmtpResponse {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct MockServerConfig {
    greeting: SmtpResponse,
    ehlo_code: u16,
    capabilities: Vec<String>,
    helo_response: SmtpResponse,
    mail_from_response: SmtpResponse,
    rcpt_to_response: SmtpResponse,
    rcpt_overrides: HashMap<String, SmtpResponse>,
    data_response: SmtpResponse,
    /// Replies to successive messages; the last one repeats
    data_end_responses: Vec<SmtpResponse>,
    quit_response: SmtpResponse,
    rset_response: SmtpResponse,
    starttls_response: SmtpResponse,
    credentials: Option<(String, String)>,
    auth_mechanisms: String,

    // Failure injection
    connection_delay: Option<Duration>,
    response_delay: Option<Duration>,
    drop_after_commands: Option<usize>,
    timeout_on_command: Option<usize>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            greeting: SmtpResponse::new(220, "Mock SMTP Server"),
            ehlo_code: 250,
            capabilities: vec!["localhost".to_string(), "SIZE 10000000".to_string()],
            helo_response: SmtpResponse::new(250, "Hello"),
            mail_from_response: SmtpResponse::new(250, "OK"),
            rcpt_to_response: SmtpResponse::new(250, "OK"),
            rcpt_overrides: HashMap::new(),
            data_response: SmtpResponse::new(354, "Start mail input; end with <CRLF>.<CRLF>"),
            data_end_responses: vec![SmtpResponse::new(250, "OK: Message accepted")],
            quit_response: SmtpResponse::new(221, "Bye"),
            rset_response: SmtpResponse::new(250, "OK"),
            starttls_response: SmtpResponse::new(502, "Command not implemented"),
            credentials: None,
            auth_mechanisms: "PLAIN LOGIN".to_string(),
            connection_delay: None,
            response_delay: None,
            drop_after_commands: None,
            timeout_on_command: None,
        }
    }
}

impl MockServerConfig {
    fn ehlo_bytes(&self) -> Vec<u8> {
        let mut lines = self.capabilities.clone();
        if self.credentials.is_some() {
            lines.push(format!("AUTH {}", self.auth_mechanisms));
        }

        let mut response = String::new();
        let last = lines.len().saturating_sub(1);
        for (i, line) in lines.iter().enumerate() {
            let separator = if i < last { '-' } else { ' ' };
            let _ = write!(&mut response, "{}{separator}{line}\r\n", self.ehlo_code);
        }
        response.into_bytes()
    }

    fn rcpt_response(&self, argument: &str) -> &SmtpResponse {
        let address = argument
            .trim()
            .trim_start_matches("TO:")
            .trim_start_matches("to:")
            .trim()
            .trim_start_matches('<')
            .split('>')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        self.rcpt_overrides
            .get(&address)
            .unwrap_or(&self.rcpt_to_response)
    }

    fn credentials_match(&self, username: &str, password: &str) -> bool {
        self.credentials
            .as_ref()
            .is_some_and(|(u, p)| u == username && p == password)
    }
}

#[derive(Default)]
struct Counters {
    commands: AtomicUsize,
    connections: AtomicUsize,
    messages: AtomicUsize,
}

/// Mock SMTP server for testing
pub struct MockSmtpServer {
    addr: SocketAddr,
    commands_received: Arc<RwLock<Vec<SmtpCommand>>>,
    shutdown: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder::new()
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Get all commands received by the server
    pub async fn commands(&self) -> Vec<SmtpCommand> {
        self.commands_received.read().await.clone()
    }

    /// Message bodies received so far, in order
    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.commands_received
            .read()
            .await
            .iter()
            .filter_map(|c| match c {
                SmtpCommand::MessageContent(content) => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn command_count(&self) -> usize {
        self.counters.commands.load(Ordering::Relaxed)
    }

    /// Number of TCP connections accepted
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.counters.connections.load(Ordering::Relaxed)
    }

    /// Number of messages that reached the end of DATA
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.counters.messages.load(Ordering::Relaxed)
    }

    /// Stop accepting connections
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn reply(
        writer: &mut WriteHalf<'_>,
        config: &MockServerConfig,
        bytes: &[u8],
    ) -> std::io::Result<()> {
        if let Some(delay) = config.response_delay {
            tokio::time::sleep(delay).await;
        }
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    async fn read_line(reader: &mut BufReader<ReadHalf<'_>>) -> std::io::Result<Option<String>> {
        let mut line = String::new();
        match timeout(Duration::from_secs(10), reader.read_line(&mut line)).await {
            Ok(Ok(0)) | Err(_) => Ok(None),
            Ok(Ok(_)) => Ok(Some(line)),
            Ok(Err(e)) => Err(e),
        }
    }

    /// Run an AUTH exchange. Returns `None` if the client went away.
    async fn authenticate(
        reader: &mut BufReader<ReadHalf<'_>>,
        writer: &mut WriteHalf<'_>,
        config: &MockServerConfig,
        argument: &str,
    ) -> std::io::Result<Option<(String, bool)>> {
        let mut args = argument.split_whitespace();
        let mechanism = args.next().unwrap_or_default().to_ascii_uppercase();

        let decode = |token: &str| {
            STANDARD
                .decode(token.trim())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .unwrap_or_default()
        };

        let accepted = match mechanism.as_str() {
            "PLAIN" => {
                let token = match args.next() {
                    Some(token) => token.to_string(),
                    None => {
                        Self::reply(writer, config, b"334 \r\n").await?;
                        let Some(line) = Self::read_line(reader).await? else {
                            return Ok(None);
                        };
                        line
                    }
                };
                let decoded = decode(&token);
                let mut parts = decoded.split('\0');
                let _authzid = parts.next();
                let username = parts.next().unwrap_or_default();
                let password = parts.next().unwrap_or_default();
                config.credentials_match(username, password)
            }
            "LOGIN" => {
                Self::reply(writer, config, b"334 VXNlcm5hbWU6\r\n").await?;
                let Some(username) = Self::read_line(reader).await? else {
                    return Ok(None);
                };
                Self::reply(writer, config, b"334 UGFzc3dvcmQ6\r\n").await?;
                let Some(password) = Self::read_line(reader).await? else {
                    return Ok(None);
                };
                config.credentials_match(&decode(&username), &decode(&password))
            }
            _ => {
                Self::reply(writer, config, b"504 Unrecognized authentication type\r\n").await?;
                return Ok(Some((mechanism, false)));
            }
        };

        let response = if accepted {
            SmtpResponse::new(235, "Authentication successful")
        } else {
            SmtpResponse::new(535, "Authentication credentials invalid")
        };
        Self::reply(writer, config, &response.to_bytes()).await?;
        Ok(Some((mechanism, accepted)))
    }

    /// Handle a single client connection
    #[allow(clippy::too_many_lines)]
    async fn handle_client(
        mut stream: TcpStream,
        config: Arc<MockServerConfig>,
        commands: Arc<RwLock<Vec<SmtpCommand>>>,
        counters: Arc<Counters>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(delay) = config.connection_delay {
            tokio::time::sleep(delay).await;
        }

        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut local_command_count = 0;

        writer.write_all(&config.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            if let Some(drop_after) = config.drop_after_commands
                && local_command_count >= drop_after
            {
                return Ok(());
            }

            if let Some(timeout_on) = config.timeout_on_command
                && local_command_count == timeout_on
            {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(());
            }

            let Some(line) = Self::read_line(&mut reader).await? else {
                return Ok(());
            };

            local_command_count += 1;
            counters.commands.fetch_add(1, Ordering::Relaxed);

            let cmd_line = line.trim();
            tracing::debug!("Mock server received: {}", cmd_line);

            let (verb, argument) = cmd_line.split_once(' ').unwrap_or((cmd_line, ""));
            let verb = verb.to_ascii_uppercase();

            let (response, smtp_cmd) = match verb.as_str() {
                "EHLO" => (config.ehlo_bytes(), SmtpCommand::Ehlo(argument.to_string())),
                "HELO" => (
                    config.helo_response.to_bytes(),
                    SmtpCommand::Helo(argument.to_string()),
                ),
                "MAIL" => (
                    config.mail_from_response.to_bytes(),
                    SmtpCommand::MailFrom(argument.to_string()),
                ),
                "RCPT" => (
                    config.rcpt_response(argument).to_bytes(),
                    SmtpCommand::RcptTo(argument.to_string()),
                ),
                "DATA" => (config.data_response.to_bytes(), SmtpCommand::Data),
                "RSET" => (config.rset_response.to_bytes(), SmtpCommand::Rset),
                "NOOP" => (SmtpResponse::new(250, "OK").to_bytes(), SmtpCommand::Noop),
                "AUTH" => {
                    let Some((mechanism, accepted)) =
                        Self::authenticate(&mut reader, &mut writer, &config, argument).await?
                    else {
                        return Ok(());
                    };
                    commands
                        .write()
                        .await
                        .push(SmtpCommand::Auth { mechanism, accepted });
                    continue;
                }
                "QUIT" => {
                    commands.write().await.push(SmtpCommand::Quit);
                    writer.write_all(&config.quit_response.to_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                "STARTTLS" => (config.starttls_response.to_bytes(), SmtpCommand::StartTls),
                _ => (
                    SmtpResponse::new(500, "Unknown command").to_bytes(),
                    SmtpCommand::Other(cmd_line.to_string()),
                ),
            };

            commands.write().await.push(smtp_cmd.clone());

            if matches!(smtp_cmd, SmtpCommand::Data) && config.data_response.code == 354 {
                Self::reply(&mut writer, &config, &response).await?;

                let mut message_content = Vec::new();
                loop {
                    let Some(data_line) = Self::read_line(&mut reader).await? else {
                        return Ok(());
                    };

                    if data_line == ".\r\n" || data_line == ".\n" {
                        commands
                            .write()
                            .await
                            .push(SmtpCommand::MessageContent(message_content));

                        let index = counters.messages.fetch_add(1, Ordering::Relaxed);
                        let responses = &config.data_end_responses;
                        let response = responses
                            .get(index)
                            .or_else(|| responses.last())
                            .map_or_else(
                                || SmtpResponse::new(250, "OK").to_bytes(),
                                SmtpResponse::to_bytes,
                            );
                        Self::reply(&mut writer, &config, &response).await?;
                        break;
                    }

                    let unstuffed = data_line.strip_prefix('.').unwrap_or(&data_line);
                    message_content.extend_from_slice(unstuffed.as_bytes());
                }
                continue;
            }

            Self::reply(&mut writer, &config, &response).await?;
        }
    }
}

/// Builder for configuring a `MockSmtpServer`
pub struct MockSmtpServerBuilder {
    config: MockServerConfig,
}

impl MockSmtpServerBuilder {
    fn new() -> Self {
        Self {
            config: MockServerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.greeting = SmtpResponse::new(code, message);
        self
    }

    /// Replace the EHLO reply. The first line is the server name.
    #[must_use]
    pub fn with_ehlo_response(mut self, code: u16, capabilities: Vec<String>) -> Self {
        self.config.ehlo_code = code;
        self.config.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_helo_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.helo_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.mail_from_response = SmtpResponse::new(code, message);
        self
    }

    /// Reply for every RCPT TO without a per-recipient override
    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rcpt_to_response = SmtpResponse::new(code, message);
        self
    }

    /// Reply for RCPT TO of one address
    #[must_use]
    pub fn with_rcpt_response(
        mut self,
        address: &str,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        self.config
            .rcpt_overrides
            .insert(address.to_ascii_lowercase(), SmtpResponse::new(code, message));
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_response = SmtpResponse::new(code, message);
        self
    }

    /// Reply after the message content (after `<CRLF>.<CRLF>`)
    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.data_end_responses = vec![SmtpResponse::new(code, message)];
        self
    }

    /// Replies for successive messages; the last one repeats
    #[must_use]
    pub fn with_data_end_sequence(mut self, responses: &[(u16, &str)]) -> Self {
        self.config.data_end_responses = responses
            .iter()
            .map(|(code, message)| SmtpResponse::new(*code, *message))
            .collect();
        self
    }

    #[must_use]
    pub fn with_quit_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.quit_response = SmtpResponse::new(code, message);
        self
    }

    #[must_use]
    pub fn with_rset_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.rset_response = SmtpResponse::new(code, message);
        self
    }

    /// Reply to STARTTLS; the mock never performs a TLS handshake
    #[must_use]
    pub fn with_starttls_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.config.starttls_response = SmtpResponse::new(code, message);
        self
    }

    /// Advertise AUTH and accept these credentials
    #[must_use]
    pub fn with_auth(mut self, username: &str, password: &str) -> Self {
        self.config.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    /// Mechanisms listed in the EHLO `AUTH` line (default `PLAIN LOGIN`)
    #[must_use]
    pub fn with_auth_mechanisms(mut self, mechanisms: &str) -> Self {
        self.config.auth_mechanisms = mechanisms.to_string();
        self
    }

    /// Add a delay before the greeting
    #[must_use]
    pub const fn with_connection_delay(mut self, delay: Duration) -> Self {
        self.config.connection_delay = Some(delay);
        self
    }

    /// Add a delay before sending each response
    #[must_use]
    pub const fn with_response_delay(mut self, delay: Duration) -> Self {
        self.config.response_delay = Some(delay);
        self
    }

    /// Drop the connection after N commands
    #[must_use]
    pub const fn with_network_error_after_commands(mut self, count: usize) -> Self {
        self.config.drop_after_commands = Some(count);
        self
    }

    /// Timeout (hang) on the Nth command (0-indexed)
    #[must_use]
    pub const fn with_timeout_on_command(mut self, command_index: usize) -> Self {
        self.config.timeout_on_command = Some(command_index);
        self
    }

    /// Build and start the mock SMTP server
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to a port
    pub async fn build(self) -> Result<MockSmtpServer, std::io::Error> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let config = Arc::new(self.config);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());

        let commands_clone = Arc::clone(&commands);
        let shutdown_clone = Arc::clone(&shutdown);
        let counters_clone = Arc::clone(&counters);

        tokio::spawn(async move {
            loop {
                if shutdown_clone.load(Ordering::Relaxed) {
                    break;
                }

                // Accept connection with timeout to allow checking shutdown flag
                let accept_result = timeout(Duration::from_millis(100), listener.accept()).await;

                if let Ok(Ok((stream, _peer))) = accept_result {
                    counters_clone.connections.fetch_add(1, Ordering::Relaxed);
                    let config = Arc::clone(&config);
                    let commands = Arc::clone(&commands_clone);
                    let counters = Arc::clone(&counters_clone);

                    tokio::spawn(async move {
                        if let Err(e) =
                            MockSmtpServer::handle_client(stream, config, commands, counters).await
                        {
                            tracing::debug!("Mock server client error: {}", e);
                        }
                    });
                }
            }
        });

        Ok(MockSmtpServer {
            addr,
            commands_received: commands,
            shutdown,
            counters,
        })
    }
}
