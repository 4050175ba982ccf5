//! SMTP protocol primitives.
//!
//! Commands, reply parsing and ESMTP capability discovery (RFC 5321).

use std::collections::HashSet;
use std::fmt;

use crate::auth::AuthMethod;
use crate::errors::{EnhancedStatusCode, SmtpError, SmtpResult};

/// SMTP commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: String,
        /// Initial response (optional).
        initial_response: Option<String>,
    },
    /// MAIL FROM command.
    MailFrom {
        /// Sender address, already in `<addr>` form.
        address: String,
        /// SIZE parameter (optional).
        size: Option<usize>,
    },
    /// RCPT TO command.
    RcptTo {
        /// Recipient address, already in `<addr>` form.
        address: String,
    },
    /// DATA command.
    Data,
    /// Reset transaction.
    Rset,
    /// No operation (keepalive).
    Noop,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command line without the trailing CRLF.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(response),
            } => format!("AUTH {} {}", mechanism, response),
            SmtpCommand::Auth { mechanism, .. } => format!("AUTH {}", mechanism),
            SmtpCommand::MailFrom { address, size } => match size {
                Some(size) => format!("MAIL FROM:{} SIZE={}", address, size),
                None => format!("MAIL FROM:{}", address),
            },
            SmtpCommand::RcptTo { address } => format!("RCPT TO:{}", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Noop => "NOOP".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Command line safe for logs (AUTH payloads redacted).
    pub fn redacted(&self) -> String {
        match self {
            SmtpCommand::Auth { mechanism, initial_response: Some(_) } => {
                format!("AUTH {} ****", mechanism)
            }
            other => other.to_smtp_string(),
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// SMTP reply from the server.
#[derive(Debug, Clone)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Enhanced status code, when the server sends one.
    pub enhanced_code: Option<EnhancedStatusCode>,
    /// Reply text, one entry per line.
    pub message: Vec<String>,
}

impl SmtpResponse {
    /// Creates a single-line reply.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced_code: None,
            message: vec![message.into()],
        }
    }

    /// Parses a reply from its raw lines (CRLF already stripped).
    pub fn parse(lines: &[String]) -> SmtpResult<Self> {
        if lines.is_empty() {
            return Err(SmtpError::protocol("Empty response"));
        }

        let mut code = 0u16;
        let mut enhanced_code = None;
        let mut message = Vec::with_capacity(lines.len());

        for (i, line) in lines.iter().enumerate() {
            let parsed: u16 = line
                .get(..3)
                .and_then(|c| c.parse().ok())
                .ok_or_else(|| SmtpError::protocol(format!("Invalid reply line: {}", line)))?;

            if i == 0 {
                code = parsed;
            } else if parsed != code {
                return Err(SmtpError::protocol(
                    "Inconsistent status codes in multiline response",
                ));
            }

            let text = line.get(4..).unwrap_or("");
            if i == 0 {
                if let Some((esc, rest)) = text
                    .split_once(' ')
                    .and_then(|(head, rest)| EnhancedStatusCode::parse(head).map(|e| (e, rest)))
                {
                    enhanced_code = Some(esc);
                    message.push(rest.trim().to_string());
                    continue;
                }
            }
            message.push(text.to_string());
        }

        Ok(Self {
            code,
            enhanced_code,
            message,
        })
    }

    /// Returns true if this is a success reply (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns true if this is a positive intermediate reply (3xx).
    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(String::as_str).unwrap_or("")
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join("\n")
    }

    /// Converts the reply into an error.
    pub fn to_error(&self) -> SmtpError {
        let mut err = SmtpError::from_smtp_response(self.code, self.full_message());
        if let Some(enhanced) = &self.enhanced_code {
            err = err.with_enhanced_code(enhanced.clone());
        }
        err
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

/// ESMTP server capabilities.
#[derive(Debug, Clone, Default)]
pub struct EsmtpCapabilities {
    /// Maximum message size.
    pub size: Option<usize>,
    /// Supported authentication mechanisms.
    pub auth_mechanisms: HashSet<AuthMethod>,
    /// STARTTLS supported.
    pub starttls: bool,
    /// PIPELINING supported.
    pub pipelining: bool,
    /// Enhanced status codes supported.
    pub enhanced_status_codes: bool,
}

impl EsmtpCapabilities {
    /// Parses capabilities from an EHLO reply. The first line is the greeting.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_uppercase();
            let (keyword, params) = line.split_once(' ').unwrap_or((line.as_str(), ""));

            match keyword {
                "SIZE" => caps.size = params.trim().parse().ok().filter(|s| *s > 0),
                "AUTH" => caps
                    .auth_mechanisms
                    .extend(params.split_whitespace().filter_map(AuthMethod::from_capability)),
                "STARTTLS" => caps.starttls = true,
                "PIPELINING" => caps.pipelining = true,
                "ENHANCEDSTATUSCODES" => caps.enhanced_status_codes = true,
                _ => {}
            }
        }

        caps
    }
}

/// Escapes a message for the DATA phase and appends the terminator.
///
/// Lines starting with `.` get an extra `.`, bare LF is normalized to CRLF
/// and the payload always ends with `CRLF.CRLF`.
pub fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64 + 5);
    let mut at_line_start = true;
    let mut prev = 0u8;

    for &byte in data {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        if byte == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(byte);
        at_line_start = byte == b'\n';
        prev = byte;
    }

    if !out.is_empty() && !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

/// Reply codes used by the transport.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Authentication successful.
    pub const AUTH_SUCCESS: u16 = 235;
    /// OK.
    pub const OK: u16 = 250;
    /// Continue (AUTH).
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
    /// Mailbox unavailable (permanent).
    pub const MAILBOX_UNAVAILABLE: u16 = 550;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_formatting() {
        assert_eq!(
            SmtpCommand::MailFrom {
                address: "<a@example.com>".to_string(),
                size: Some(1024),
            }
            .to_smtp_string(),
            "MAIL FROM:<a@example.com> SIZE=1024"
        );
        assert_eq!(SmtpCommand::Rset.to_smtp_string(), "RSET");

        let auth = SmtpCommand::Auth {
            mechanism: "PLAIN".to_string(),
            initial_response: Some("c2VjcmV0".to_string()),
        };
        assert_eq!(auth.to_string(), "AUTH PLAIN ****");
    }

    #[test]
    fn test_response_parse_multiline() {
        let lines = vec![
            "250-smtp.example.com Hello".to_string(),
            "250-SIZE 10485760".to_string(),
            "250-AUTH PLAIN LOGIN".to_string(),
            "250 STARTTLS".to_string(),
        ];
        let response = SmtpResponse::parse(&lines).unwrap();
        assert_eq!(response.code, 250);
        assert_eq!(response.message.len(), 4);

        let caps = EsmtpCapabilities::from_ehlo_response(&response);
        assert_eq!(caps.size, Some(10485760));
        assert!(caps.starttls);
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Plain));
        assert!(caps.auth_mechanisms.contains(&AuthMethod::Login));
    }

    #[test]
    fn test_response_with_enhanced_code() {
        let lines = vec!["550 5.1.1 User unknown".to_string()];
        let response = SmtpResponse::parse(&lines).unwrap();
        assert_eq!(response.enhanced_code, Some(EnhancedStatusCode::new(5, 1, 1)));
        assert_eq!(response.first_message(), "User unknown");
        assert_eq!(response.to_error().smtp_code(), Some(550));
    }

    #[test]
    fn test_response_classification() {
        let challenge = SmtpResponse::parse(&["334 eyJzdGF0dXMiOiI0MDEifQ==".to_string()]).unwrap();
        assert!(challenge.is_intermediate());
        assert!(!challenge.is_success());

        let data = SmtpResponse::parse(&["354 End data with <CR><LF>.<CR><LF>".to_string()]).unwrap();
        assert!(data.is_intermediate());

        let ok = SmtpResponse::parse(&["235 2.7.0 Accepted".to_string()]).unwrap();
        assert!(ok.is_success());
        assert!(!ok.is_intermediate());
    }

    #[test]
    fn test_response_rejects_garbage() {
        assert!(SmtpResponse::parse(&[]).is_err());
        assert!(SmtpResponse::parse(&["hello".to_string()]).is_err());
        assert!(SmtpResponse::parse(&["250-a".to_string(), "251 b".to_string()]).is_err());
    }

    #[test]
    fn test_dot_stuff() {
        assert_eq!(dot_stuff(b".hidden\nline\r\n"), b"..hidden\r\nline\r\n.\r\n".to_vec());
        assert_eq!(dot_stuff(b"no newline"), b"no newline\r\n.\r\n".to_vec());
        assert_eq!(dot_stuff(b"a\r\n.\r\n"), b"a\r\n..\r\n.\r\n".to_vec());
    }
}
