//! Error types for pooled SMTP connections.
//!
//! `SmtpError` covers single transmissions, transport setup and lease
//! violations. `MailSendError` is the aggregate produced by batch sends.

use std::fmt;
use thiserror::Error;

use crate::message::MimeMessage;

/// Result type for SMTP operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// SMTP error kinds categorizing different failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpErrorKind {
    // Connection errors
    /// Connection was refused.
    ConnectionRefused,
    /// Connection was reset or dropped by the server.
    ConnectionReset,
    /// Connect timed out.
    ConnectTimeout,

    // TLS errors
    /// TLS handshake failed.
    TlsHandshakeFailed,
    /// STARTTLS not supported by server.
    StarttlsNotSupported,

    // Authentication errors
    /// Credentials are invalid.
    CredentialsInvalid,
    /// Authentication method not supported.
    AuthMethodNotSupported,
    /// Authentication is required.
    AuthenticationRequired,

    // Protocol errors
    /// Invalid response from server.
    InvalidResponse,
    /// Unexpected response code.
    UnexpectedResponse,
    /// Server is shutting down (421).
    ServerShutdown,
    /// The transport does not implement a requested protocol extension.
    ExtensionNotSupported,

    // Message errors
    /// Invalid sender address.
    InvalidFromAddress,
    /// Invalid or rejected recipient address.
    InvalidRecipientAddress,
    /// Message exceeds size limit.
    MessageTooLarge,
    /// Invalid header format.
    InvalidHeader,

    // Timeout errors
    /// Read timeout.
    ReadTimeout,
    /// Write timeout.
    WriteTimeout,

    // Pool and lease errors
    /// No connection became available in time.
    AcquireTimeout,
    /// Pooled connection failed validation.
    ConnectionUnhealthy,
    /// The pool has been shut down.
    PoolClosed,
    /// The owning pool no longer exists.
    PoolUnavailable,
    /// The connection was already returned to its pool.
    ConnectionReleased,

    // Configuration errors
    /// Configuration is invalid.
    ConfigurationInvalid,

    // Generic
    /// Unknown or internal error.
    Unknown,
}

impl SmtpErrorKind {
    /// Returns true if this error kind is typically retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SmtpErrorKind::ConnectionReset
                | SmtpErrorKind::ConnectTimeout
                | SmtpErrorKind::ReadTimeout
                | SmtpErrorKind::WriteTimeout
                | SmtpErrorKind::ServerShutdown
                | SmtpErrorKind::AcquireTimeout
                | SmtpErrorKind::ConnectionUnhealthy
        )
    }
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SmtpErrorKind::ConnectionRefused => "Connection refused",
            SmtpErrorKind::ConnectionReset => "Connection reset",
            SmtpErrorKind::ConnectTimeout => "Connect timeout",
            SmtpErrorKind::TlsHandshakeFailed => "TLS handshake failed",
            SmtpErrorKind::StarttlsNotSupported => "STARTTLS not supported",
            SmtpErrorKind::CredentialsInvalid => "Invalid credentials",
            SmtpErrorKind::AuthMethodNotSupported => "Auth method not supported",
            SmtpErrorKind::AuthenticationRequired => "Authentication required",
            SmtpErrorKind::InvalidResponse => "Invalid server response",
            SmtpErrorKind::UnexpectedResponse => "Unexpected response",
            SmtpErrorKind::ServerShutdown => "Server shutting down",
            SmtpErrorKind::ExtensionNotSupported => "Protocol extension not supported",
            SmtpErrorKind::InvalidFromAddress => "Invalid sender address",
            SmtpErrorKind::InvalidRecipientAddress => "Invalid recipient address",
            SmtpErrorKind::MessageTooLarge => "Message too large",
            SmtpErrorKind::InvalidHeader => "Invalid header",
            SmtpErrorKind::ReadTimeout => "Read timeout",
            SmtpErrorKind::WriteTimeout => "Write timeout",
            SmtpErrorKind::AcquireTimeout => "Pool acquire timeout",
            SmtpErrorKind::ConnectionUnhealthy => "Connection unhealthy",
            SmtpErrorKind::PoolClosed => "Connection pool closed",
            SmtpErrorKind::PoolUnavailable => "Connection pool unavailable",
            SmtpErrorKind::ConnectionReleased => "Connection already released",
            SmtpErrorKind::ConfigurationInvalid => "Invalid configuration",
            SmtpErrorKind::Unknown => "Unknown error",
        };
        f.write_str(text)
    }
}

/// Enhanced SMTP status code (RFC 3463).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnhancedStatusCode {
    /// Class (2=success, 4=temporary, 5=permanent).
    pub class: u8,
    /// Subject (e.g., 1=addressing, 2=mailbox, 3=mail system).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Creates a new enhanced status code.
    pub fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self { class, subject, detail }
    }

    /// Parses an enhanced status code such as `5.1.1`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let class = parts.next()?.parse().ok()?;
        let subject = parts.next()?.parse().ok()?;
        let detail = parts.next()?.parse().ok()?;
        if parts.next().is_some() || !matches!(class, 2 | 4 | 5) {
            return None;
        }
        Some(Self { class, subject, detail })
    }

    /// Returns true if this is a permanent failure.
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// SMTP error with detailed information.
#[derive(Error, Debug)]
pub struct SmtpError {
    kind: SmtpErrorKind,
    message: String,
    smtp_code: Option<u16>,
    enhanced_code: Option<EnhancedStatusCode>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SmtpError {
    /// Creates a new SMTP error.
    pub fn new(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            enhanced_code: None,
            cause: None,
        }
    }

    /// Sets the SMTP status code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Sets the enhanced status code.
    pub fn with_enhanced_code(mut self, code: EnhancedStatusCode) -> Self {
        self.enhanced_code = Some(code);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> SmtpErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP status code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the enhanced status code if available.
    pub fn enhanced_code(&self) -> Option<&EnhancedStatusCode> {
        self.enhanced_code.as_ref()
    }

    /// Returns true if retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        if let Some(code) = self.smtp_code {
            return matches!(code, 421 | 450 | 451 | 452);
        }
        self.kind.is_retryable()
    }

    // Convenience constructors

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConnectionRefused, message)
    }

    /// Creates a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::TlsHandshakeFailed, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::CredentialsInvalid, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::InvalidResponse, message)
    }

    /// Creates a message error.
    pub fn message_error(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConfigurationInvalid, message)
    }

    /// Creates a pool error.
    pub fn pool(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates the error reported for operations on a returned connection.
    pub fn released() -> Self {
        Self::new(
            SmtpErrorKind::ConnectionReleased,
            "connection has already been returned to its pool",
        )
    }

    /// Creates an error from an SMTP reply code.
    pub fn from_smtp_response(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            421 => SmtpErrorKind::ServerShutdown,
            500..=503 => SmtpErrorKind::InvalidResponse,
            530 => SmtpErrorKind::AuthenticationRequired,
            535 => SmtpErrorKind::CredentialsInvalid,
            550 | 551 => SmtpErrorKind::InvalidRecipientAddress,
            552 => SmtpErrorKind::MessageTooLarge,
            553 => SmtpErrorKind::InvalidFromAddress,
            400..=599 => SmtpErrorKind::UnexpectedResponse,
            _ => SmtpErrorKind::Unknown,
        };
        Self::new(kind, message).with_smtp_code(code)
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        if let Some(enhanced) = &self.enhanced_code {
            write!(f, " [{}]", enhanced)?;
        }
        Ok(())
    }
}

/// A message from a batch that could not be sent.
#[derive(Debug)]
pub struct FailedMessage {
    /// Position of the message in the batch.
    pub index: usize,
    /// The message as it was handed to the transport.
    pub message: MimeMessage,
    /// Why the transmission failed.
    pub error: SmtpError,
}

/// Error returned by batch sends.
///
/// `Failed` is only produced after every message of the batch was attempted;
/// its entries are in send order.
#[derive(Error, Debug)]
pub enum MailSendError {
    /// The batch was rejected before any message was attempted.
    #[error("batch not attempted: {0}")]
    NotAttempted(#[source] SmtpError),
    /// One or more messages failed.
    #[error("{} message(s) of the batch failed to send", .0.len())]
    Failed(Vec<FailedMessage>),
}

impl MailSendError {
    /// Returns the per-message failures, empty for `NotAttempted`.
    pub fn failed_messages(&self) -> &[FailedMessage] {
        match self {
            MailSendError::NotAttempted(_) => &[],
            MailSendError::Failed(failures) => failures,
        }
    }

    /// Returns the batch positions that failed, in send order.
    pub fn failed_indices(&self) -> Vec<usize> {
        self.failed_messages().iter().map(|f| f.index).collect()
    }

    /// Consumes the error, returning the per-message failures.
    pub fn into_failed_messages(self) -> Vec<FailedMessage> {
        match self {
            MailSendError::NotAttempted(_) => Vec::new(),
            MailSendError::Failed(failures) => failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_retryable() {
        assert!(SmtpErrorKind::ConnectionReset.is_retryable());
        assert!(SmtpErrorKind::ServerShutdown.is_retryable());
        assert!(!SmtpErrorKind::ConnectionReleased.is_retryable());
        assert!(!SmtpErrorKind::InvalidRecipientAddress.is_retryable());
    }

    #[test]
    fn test_enhanced_status_code_parse() {
        let code = EnhancedStatusCode::parse("5.1.1").unwrap();
        assert_eq!(code, EnhancedStatusCode::new(5, 1, 1));
        assert!(code.is_permanent());

        assert!(EnhancedStatusCode::parse("5.1").is_none());
        assert!(EnhancedStatusCode::parse("9.1.1").is_none());
        assert!(EnhancedStatusCode::parse("mx.example.com").is_none());
    }

    #[test]
    fn test_smtp_error_from_response() {
        let err = SmtpError::from_smtp_response(550, "No such user");
        assert_eq!(err.kind(), SmtpErrorKind::InvalidRecipientAddress);
        assert_eq!(err.smtp_code(), Some(550));
        assert!(!err.is_retryable());

        let err = SmtpError::from_smtp_response(451, "Try again later");
        assert_eq!(err.kind(), SmtpErrorKind::UnexpectedResponse);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SmtpError::from_smtp_response(550, "No such user")
            .with_enhanced_code(EnhancedStatusCode::new(5, 1, 1));
        assert_eq!(
            err.to_string(),
            "Invalid recipient address: No such user (SMTP 550) [5.1.1]"
        );
    }

    #[test]
    fn test_mail_send_error_accessors() {
        let err = MailSendError::NotAttempted(SmtpError::released());
        assert!(err.failed_messages().is_empty());
        assert!(err.to_string().contains("already been returned"));
    }
}
