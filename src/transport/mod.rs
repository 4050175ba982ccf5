//! Transport layer for SMTP connections.
//!
//! [`Transport`] is the session a pooled connection delegates to.
//! [`TcpTransport`] implements it over TCP with optional TLS.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::auth::{AuthMethod, Authenticator, Credentials};
use crate::config::{SmtpConfig, TlsConfig, TlsMode};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::events::{ListenerRegistry, TransportEvent, TransportEventKind, TransportListener};
use crate::message::{Address, MimeMessage};
use crate::protocol::{codes, dot_stuff, EsmtpCapabilities, SmtpCommand, SmtpResponse};

/// An open session to a mail relay.
///
/// Listener identity is `Arc` identity. `set_use_rset` is part of the
/// extended protocol; transports without it keep the default, which fails
/// with [`SmtpErrorKind::ExtensionNotSupported`].
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// Probes the session. Never cached.
    async fn is_connected(&mut self) -> bool;

    /// Transmits `message` to `recipients`.
    async fn send_message(&mut self, message: &MimeMessage, recipients: &[Address])
        -> SmtpResult<()>;

    /// Registers a delivery listener.
    fn add_transport_listener(&mut self, listener: Arc<dyn TransportListener>);

    /// Unregisters the first registration of `listener`.
    fn remove_transport_listener(&mut self, listener: &Arc<dyn TransportListener>);

    /// Returns true if `listener` is registered.
    fn is_listener_registered(&self, listener: &Arc<dyn TransportListener>) -> bool;

    /// Selects RSET instead of NOOP for liveness probes.
    fn set_use_rset(&mut self, _use_rset: bool) -> SmtpResult<()> {
        Err(SmtpError::new(
            SmtpErrorKind::ExtensionNotSupported,
            "transport does not support RSET keep-alive selection",
        ))
    }

    /// Ends the session.
    async fn close(&mut self);
}

/// Stream type that can be plain TCP or TLS.
enum TransportStream {
    Plain(BufReader<TcpStream>),
    #[cfg(feature = "rustls-tls")]
    Tls(Box<BufReader<tokio_rustls::client::TlsStream<TcpStream>>>),
}

/// SMTP session over TCP with optional TLS.
pub struct TcpTransport {
    /// `None` once the session is closed or broken.
    stream: Option<TransportStream>,
    command_timeout: Duration,
    capabilities: EsmtpCapabilities,
    tls_enabled: bool,
    host: String,
    client_id: String,
    use_rset: bool,
    send_partial: bool,
    listeners: ListenerRegistry,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("host", &self.host)
            .field("open", &self.stream.is_some())
            .field("tls_enabled", &self.tls_enabled)
            .field("use_rset", &self.use_rset)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl TcpTransport {
    /// Opens a session: greeting, EHLO, TLS and authentication.
    ///
    /// `credentials` overrides the username/password of `config`.
    pub async fn connect(config: &SmtpConfig, credentials: Option<&Credentials>) -> SmtpResult<Self> {
        let address = config.address();

        let stream = timeout(config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| SmtpError::new(SmtpErrorKind::ConnectTimeout, "Connect timed out"))?
            .map_err(|e| Self::map_io_error(e, &address))?;

        stream.set_nodelay(true).ok();

        #[cfg(feature = "tracing")]
        tracing::debug!(address = %address, "Connected to SMTP server");

        let mut transport = Self {
            stream: Some(TransportStream::Plain(BufReader::new(stream))),
            command_timeout: config.command_timeout,
            capabilities: EsmtpCapabilities::default(),
            tls_enabled: false,
            host: config.host.clone(),
            client_id: config.client_id().to_string(),
            use_rset: config.use_rset,
            send_partial: config.send_partial,
            listeners: ListenerRegistry::new(),
        };

        if config.tls.mode == TlsMode::Implicit {
            transport.upgrade_tls(&config.tls).await?;
        }

        let greeting = transport.read_response().await?;
        if greeting.code != codes::SERVICE_READY {
            return Err(greeting.to_error());
        }

        transport.hello().await?;
        transport.negotiate_starttls(&config.tls).await?;

        let config_credentials = config.credentials();
        if let Some(credentials) = credentials.or(config_credentials.as_ref()) {
            transport.authenticate(credentials, config.auth_method).await?;
        }

        Ok(transport)
    }

    /// Returns the capabilities advertised in the last EHLO.
    pub fn capabilities(&self) -> &EsmtpCapabilities {
        &self.capabilities
    }

    /// Returns true if the session is encrypted.
    pub fn is_tls(&self) -> bool {
        self.tls_enabled
    }

    /// Returns true if liveness probes use RSET.
    pub fn use_rset(&self) -> bool {
        self.use_rset
    }

    fn map_io_error(error: io::Error, address: &str) -> SmtpError {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => SmtpError::new(
                SmtpErrorKind::ConnectionRefused,
                format!("Connection refused to {}", address),
            ),
            io::ErrorKind::TimedOut => {
                SmtpError::new(SmtpErrorKind::ConnectTimeout, "Connect timed out")
            }
            io::ErrorKind::ConnectionReset => {
                SmtpError::new(SmtpErrorKind::ConnectionReset, "Connection reset by server")
            }
            _ => SmtpError::connection(format!("Connection error: {}", error)).with_cause(error),
        }
    }

    async fn hello(&mut self) -> SmtpResult<()> {
        let ehlo = SmtpCommand::Ehlo(self.client_id.clone());
        let response = self.command(&ehlo).await?;
        if response.is_success() {
            self.capabilities = EsmtpCapabilities::from_ehlo_response(&response);
            return Ok(());
        }

        let helo = SmtpCommand::Helo(self.client_id.clone());
        let response = self.command(&helo).await?;
        if !response.is_success() {
            return Err(response.to_error());
        }
        self.capabilities = EsmtpCapabilities::default();
        Ok(())
    }

    async fn negotiate_starttls(&mut self, tls: &TlsConfig) -> SmtpResult<()> {
        if self.tls_enabled {
            return Ok(());
        }

        match tls.mode {
            TlsMode::None | TlsMode::Implicit => return Ok(()),
            TlsMode::StartTls if !self.capabilities.starttls => return Ok(()),
            TlsMode::StartTlsRequired if !self.capabilities.starttls => {
                return Err(SmtpError::new(
                    SmtpErrorKind::StarttlsNotSupported,
                    "Server does not advertise STARTTLS",
                ));
            }
            _ => {}
        }

        let response = self.command(&SmtpCommand::StartTls).await?;
        if response.code != codes::SERVICE_READY {
            return Err(response.to_error());
        }

        self.upgrade_tls(tls).await?;
        // Capabilities must be rediscovered after the upgrade (RFC 3207).
        self.hello().await
    }

    #[cfg(feature = "rustls-tls")]
    async fn upgrade_tls(&mut self, tls: &TlsConfig) -> SmtpResult<()> {
        use rustls::pki_types::ServerName;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(path) = &tls.ca_cert_path {
            load_ca_file(&mut root_store, path)?;
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));

        let name = tls.sni_override.as_deref().unwrap_or(&self.host);
        let server_name = ServerName::try_from(name.to_string())
            .map_err(|_| SmtpError::tls(format!("Invalid server name: {}", name)))?;

        let tcp_stream = match self.stream.take() {
            Some(TransportStream::Plain(reader)) => reader.into_inner(),
            Some(stream) => {
                self.stream = Some(stream);
                return Err(SmtpError::tls("Already using TLS"));
            }
            None => return Err(Self::closed_error()),
        };

        let tls_stream = timeout(self.command_timeout, connector.connect(server_name, tcp_stream))
            .await
            .map_err(|_| SmtpError::new(SmtpErrorKind::ConnectTimeout, "TLS handshake timed out"))?
            .map_err(|e| SmtpError::tls(format!("TLS handshake failed: {}", e)))?;

        self.stream = Some(TransportStream::Tls(Box::new(BufReader::new(tls_stream))));
        self.tls_enabled = true;

        #[cfg(feature = "tracing")]
        tracing::debug!(host = %self.host, "TLS established");

        Ok(())
    }

    #[cfg(not(feature = "rustls-tls"))]
    async fn upgrade_tls(&mut self, _tls: &TlsConfig) -> SmtpResult<()> {
        Err(SmtpError::configuration("No TLS implementation available"))
    }

    async fn authenticate(
        &mut self,
        credentials: &Credentials,
        preferred: Option<AuthMethod>,
    ) -> SmtpResult<()> {
        let offered: Vec<AuthMethod> = self.capabilities.auth_mechanisms.iter().copied().collect();
        let method = Authenticator::select_method(&offered, credentials, preferred, self.tls_enabled)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(method = %method, "Authenticating");

        let response = match (method, credentials) {
            (AuthMethod::Plain, Credentials::Plain { username, password }) => {
                self.command(&SmtpCommand::Auth {
                    mechanism: method.mechanism_name().to_string(),
                    initial_response: Some(Authenticator::plain_initial_response(username, password)),
                })
                .await?
            }
            (AuthMethod::Login, Credentials::Plain { username, password }) => {
                let response = self
                    .command(&SmtpCommand::Auth {
                        mechanism: method.mechanism_name().to_string(),
                        initial_response: None,
                    })
                    .await?;
                if response.code != codes::AUTH_CONTINUE {
                    return Err(response.to_error());
                }
                let response = self.raw_line(&Authenticator::login_username(username)).await?;
                if response.code != codes::AUTH_CONTINUE {
                    return Err(response.to_error());
                }
                self.raw_line(&Authenticator::login_password(password)).await?
            }
            (AuthMethod::XOAuth2, Credentials::XOAuth2 { username, access_token }) => {
                let response = self
                    .command(&SmtpCommand::Auth {
                        mechanism: method.mechanism_name().to_string(),
                        initial_response: Some(Authenticator::xoauth2_initial_response(
                            username,
                            access_token,
                        )),
                    })
                    .await?;
                if response.is_intermediate() {
                    // The challenge carries the error details; an empty line ends the exchange.
                    self.raw_line("").await?
                } else {
                    response
                }
            }
            _ => {
                return Err(SmtpError::new(
                    SmtpErrorKind::AuthMethodNotSupported,
                    format!("{} cannot be used with these credentials", method),
                ))
            }
        };

        if response.code != codes::AUTH_SUCCESS {
            return Err(SmtpError::authentication(response.full_message())
                .with_smtp_code(response.code));
        }
        Ok(())
    }

    fn closed_error() -> SmtpError {
        SmtpError::new(SmtpErrorKind::ConnectionReset, "Transport is closed")
    }

    async fn command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        #[cfg(feature = "tracing")]
        tracing::debug!(command = %command, "Sending SMTP command");

        self.write(format!("{}\r\n", command.to_smtp_string()).as_bytes())
            .await?;
        self.read_response().await
    }

    /// Sends a SASL continuation line. Never logged.
    async fn raw_line(&mut self, line: &str) -> SmtpResult<SmtpResponse> {
        self.write(format!("{}\r\n", line).as_bytes()).await?;
        self.read_response().await
    }

    async fn write(&mut self, data: &[u8]) -> SmtpResult<()> {
        let timeout_duration = self.command_timeout;
        let result = match self.stream.as_mut() {
            Some(TransportStream::Plain(stream)) => {
                Self::write_all(stream.get_mut(), data, timeout_duration).await
            }
            #[cfg(feature = "rustls-tls")]
            Some(TransportStream::Tls(stream)) => {
                Self::write_all(stream.get_mut(), data, timeout_duration).await
            }
            None => return Err(Self::closed_error()),
        };
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        let timeout_duration = self.command_timeout;
        let result = match self.stream.as_mut() {
            Some(TransportStream::Plain(stream)) => {
                Self::read_response_inner(stream, timeout_duration).await
            }
            #[cfg(feature = "rustls-tls")]
            Some(TransportStream::Tls(stream)) => {
                Self::read_response_inner(&mut **stream, timeout_duration).await
            }
            None => return Err(Self::closed_error()),
        };

        match result {
            Ok(response) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(code = response.code, message = %response.first_message(), "Received SMTP response");

                if response.code == 421 {
                    self.stream = None;
                }
                Ok(response)
            }
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }

    /// Reads lines until a reply is complete.
    async fn read_response_inner<R: AsyncBufReadExt + Unpin>(
        reader: &mut R,
        timeout_duration: Duration,
    ) -> SmtpResult<SmtpResponse> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();

            let read = timeout(timeout_duration, reader.read_line(&mut line))
                .await
                .map_err(|_| SmtpError::new(SmtpErrorKind::ReadTimeout, "Read timed out"))?
                .map_err(|e| SmtpError::protocol(format!("Read error: {}", e)))?;

            if read == 0 {
                return Err(SmtpError::new(
                    SmtpErrorKind::ConnectionReset,
                    "Server closed connection",
                ));
            }

            let line = line.trim_end().to_string();
            let is_continuation = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line);

            if !is_continuation {
                break;
            }
        }

        SmtpResponse::parse(&lines)
    }

    async fn write_all<W: AsyncWrite + Unpin>(
        writer: &mut W,
        data: &[u8],
        timeout_duration: Duration,
    ) -> SmtpResult<()> {
        timeout(timeout_duration, writer.write_all(data))
            .await
            .map_err(|_| SmtpError::new(SmtpErrorKind::WriteTimeout, "Write timed out"))?
            .map_err(|e| SmtpError::protocol(format!("Write error: {}", e)))?;

        timeout(timeout_duration, writer.flush())
            .await
            .map_err(|_| SmtpError::new(SmtpErrorKind::WriteTimeout, "Flush timed out"))?
            .map_err(|e| SmtpError::protocol(format!("Flush error: {}", e)))?;

        Ok(())
    }

    /// Aborts the current mail transaction, ignoring the reply.
    async fn abort_transaction(&mut self) {
        if self.stream.is_some() {
            let _ = self.command(&SmtpCommand::Rset).await;
        }
    }

    fn notify(
        &self,
        kind: TransportEventKind,
        message: &MimeMessage,
        valid_sent: Vec<Address>,
        valid_unsent: Vec<Address>,
        invalid: Vec<Address>,
    ) {
        let mut event = TransportEvent::new(kind, message.message_id().map(str::to_owned));
        event.valid_sent = valid_sent;
        event.valid_unsent = valid_unsent;
        event.invalid = invalid;
        self.listeners.notify(&event);
    }
}

#[cfg(feature = "rustls-tls")]
fn load_ca_file(root_store: &mut rustls::RootCertStore, path: &std::path::Path) -> SmtpResult<()> {
    let file = std::fs::File::open(path).map_err(|e| {
        SmtpError::configuration(format!("cannot open CA file {}: {}", path.display(), e))
    })?;
    let mut reader = io::BufReader::new(file);

    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| SmtpError::tls(format!("invalid CA file: {}", e)))?;
        root_store
            .add(cert)
            .map_err(|e| SmtpError::tls(format!("invalid CA certificate: {}", e)))?;
    }
    Ok(())
}

#[async_trait]
impl Transport for TcpTransport {
    async fn is_connected(&mut self) -> bool {
        if self.stream.is_none() {
            return false;
        }
        let probe = if self.use_rset {
            SmtpCommand::Rset
        } else {
            SmtpCommand::Noop
        };
        match self.command(&probe).await {
            Ok(response) if response.is_success() => true,
            _ => {
                self.stream = None;
                false
            }
        }
    }

    async fn send_message(
        &mut self,
        message: &MimeMessage,
        recipients: &[Address],
    ) -> SmtpResult<()> {
        if recipients.is_empty() {
            return Err(SmtpError::message_error(
                SmtpErrorKind::InvalidRecipientAddress,
                "No recipient addresses",
            ));
        }
        let sender = message.sender().ok_or_else(|| {
            SmtpError::message_error(SmtpErrorKind::InvalidFromAddress, "Message has no sender")
        })?;

        let data = dot_stuff(&message.to_bytes());
        if let Some(max) = self.capabilities.size {
            if data.len() > max {
                return Err(SmtpError::message_error(
                    SmtpErrorKind::MessageTooLarge,
                    format!("Message size {} exceeds server limit {}", data.len(), max),
                ));
            }
        }

        let response = self
            .command(&SmtpCommand::MailFrom {
                address: sender.to_smtp(),
                size: self.capabilities.size.map(|_| data.len()),
            })
            .await?;
        if !response.is_success() {
            self.abort_transaction().await;
            self.notify(
                TransportEventKind::NotDelivered,
                message,
                Vec::new(),
                recipients.to_vec(),
                Vec::new(),
            );
            return Err(response.to_error());
        }

        let mut accepted = Vec::with_capacity(recipients.len());
        let mut rejected = Vec::new();
        let mut rejection = None;
        for recipient in recipients {
            let response = self
                .command(&SmtpCommand::RcptTo {
                    address: recipient.to_smtp(),
                })
                .await?;
            if response.is_success() {
                accepted.push(recipient.clone());
            } else {
                rejected.push(recipient.clone());
                rejection = Some(response);
            }
        }

        if accepted.is_empty() || (!rejected.is_empty() && !self.send_partial) {
            self.abort_transaction().await;
            let error = recipients_rejected(&rejected, rejection.as_ref());
            self.notify(TransportEventKind::NotDelivered, message, Vec::new(), accepted, rejected);
            return Err(error);
        }

        let response = self.command(&SmtpCommand::Data).await?;
        if response.code != codes::START_MAIL_INPUT {
            self.abort_transaction().await;
            self.notify(TransportEventKind::NotDelivered, message, Vec::new(), accepted, rejected);
            return Err(response.to_error());
        }

        self.write(&data).await?;
        let response = self.read_response().await?;
        if !response.is_success() {
            self.notify(TransportEventKind::NotDelivered, message, Vec::new(), accepted, rejected);
            return Err(response.to_error());
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            message_id = ?message.message_id(),
            delivered = accepted.len(),
            rejected = rejected.len(),
            "Message transmitted"
        );

        if rejected.is_empty() {
            self.notify(TransportEventKind::Delivered, message, accepted, Vec::new(), Vec::new());
            Ok(())
        } else {
            let error = recipients_rejected(&rejected, rejection.as_ref());
            self.notify(
                TransportEventKind::PartiallyDelivered,
                message,
                accepted,
                Vec::new(),
                rejected,
            );
            Err(error)
        }
    }

    fn add_transport_listener(&mut self, listener: Arc<dyn TransportListener>) {
        self.listeners.add(listener);
    }

    fn remove_transport_listener(&mut self, listener: &Arc<dyn TransportListener>) {
        self.listeners.remove(listener);
    }

    fn is_listener_registered(&self, listener: &Arc<dyn TransportListener>) -> bool {
        self.listeners.contains(listener)
    }

    fn set_use_rset(&mut self, use_rset: bool) -> SmtpResult<()> {
        self.use_rset = use_rset;
        Ok(())
    }

    async fn close(&mut self) {
        if self.stream.is_some() {
            let _ = self.command(&SmtpCommand::Quit).await;
        }
        self.stream = None;

        #[cfg(feature = "tracing")]
        tracing::debug!(host = %self.host, "Transport closed");
    }
}

fn recipients_rejected(rejected: &[Address], last: Option<&SmtpResponse>) -> SmtpError {
    let list = rejected
        .iter()
        .map(Address::email)
        .collect::<Vec<_>>()
        .join(", ");
    let error = SmtpError::new(
        SmtpErrorKind::InvalidRecipientAddress,
        format!("Recipients rejected: {}", list),
    );
    match last {
        Some(response) => error.with_smtp_code(response.code),
        None => error,
    }
}
