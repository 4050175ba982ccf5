//! Outgoing message model.
//!
//! `MimeMessage` is an already composed message: headers, recipients and a
//! pre-encoded body. The connection layer only touches its sent date, its
//! `Message-ID` header and calls [`MimeMessage::save_changes`] before handing
//! it to a transport.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};

/// Name of the message identifier header.
pub const HEADER_MESSAGE_ID: &str = "Message-ID";

const HEADER_DATE: &str = "Date";
const HEADER_MIME_VERSION: &str = "MIME-Version";
const HEADER_CONTENT_TYPE: &str = "Content-Type";
const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com").
    pub email: String,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> SmtpResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        Ok(Self { name: None, email })
    }

    /// Creates a new address with display name and email.
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> SmtpResult<Self> {
        let name = name.into();
        let email = email.into();
        Self::validate_email(&email)?;
        validate_header_value("display name", &name)?;
        Ok(Self {
            name: Some(name),
            email,
        })
    }

    /// Parses an address such as `John Doe <john@example.com>`.
    pub fn parse(s: &str) -> SmtpResult<Self> {
        let s = s.trim();

        if let (Some(start), Some(end)) = (s.find('<'), s.rfind('>')) {
            if start < end {
                let name = s[..start].trim().trim_matches('"');
                let email = s[start + 1..end].trim();
                if name.is_empty() {
                    return Self::new(email);
                }
                return Self::with_name(name, email);
            }
        }

        Self::new(s)
    }

    fn validate_email(email: &str) -> SmtpResult<()> {
        let invalid = |reason: &str| {
            Err(SmtpError::message_error(
                SmtpErrorKind::InvalidRecipientAddress,
                format!("invalid address {:?}: {}", email, reason),
            ))
        };

        if email.is_empty() {
            return invalid("empty");
        }
        if email.len() > 254 {
            return invalid("longer than 254 characters");
        }
        if email.chars().any(|c| c.is_control() || c.is_whitespace()) {
            return invalid("contains whitespace or control characters");
        }

        match email.split_once('@') {
            Some((local, domain)) => {
                if local.is_empty() || local.len() > 64 {
                    return invalid("local part must be 1-64 characters");
                }
                if domain.is_empty() || domain.contains('@') {
                    return invalid("domain must be non-empty and contain no '@'");
                }
                Ok(())
            }
            None => invalid("missing '@'"),
        }
    }

    /// Returns the email part only.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Returns the domain part of the address.
    pub fn domain(&self) -> &str {
        self.email.rsplit_once('@').map(|(_, d)| d).unwrap_or("")
    }

    /// Formats the address for SMTP MAIL FROM/RCPT TO commands.
    pub fn to_smtp(&self) -> String {
        format!("<{}>", self.email)
    }

    /// Formats the address for message headers.
    pub fn to_header(&self) -> String {
        match &self.name {
            Some(name) if name.contains(|c: char| !c.is_alphanumeric() && c != ' ') => {
                format!("\"{}\" <{}>", name.replace('"', "\\\""), self.email)
            }
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_header())
    }
}

impl TryFrom<&str> for Address {
    type Error = SmtpError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = SmtpError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Address::parse(&s)
    }
}

/// An outgoing, already composed message.
///
/// Headers keep their insertion order and are matched case-insensitively.
/// Address headers (From/To/Cc) are rendered from the address lists; Bcc
/// recipients are part of [`all_recipients`](Self::all_recipients) but are
/// never written out.
#[derive(Debug, Clone, PartialEq)]
pub struct MimeMessage {
    from: Vec<Address>,
    to: Vec<Address>,
    cc: Vec<Address>,
    bcc: Vec<Address>,
    subject: Option<String>,
    headers: Vec<(String, String)>,
    sent_date: Option<DateTime<Utc>>,
    content_type: String,
    body: String,
    saved: bool,
}

impl MimeMessage {
    /// Creates a new message builder.
    pub fn builder() -> MimeMessageBuilder {
        MimeMessageBuilder::default()
    }

    /// Returns the sender addresses.
    pub fn from(&self) -> &[Address] {
        &self.from
    }

    /// Returns the envelope sender (the first From address).
    pub fn sender(&self) -> Option<&Address> {
        self.from.first()
    }

    /// Returns the primary recipients.
    pub fn to(&self) -> &[Address] {
        &self.to
    }

    /// Returns the CC recipients.
    pub fn cc(&self) -> &[Address] {
        &self.cc
    }

    /// Returns the BCC recipients.
    pub fn bcc(&self) -> &[Address] {
        &self.bcc
    }

    /// Returns every recipient (To, then Cc, then Bcc) as currently set.
    pub fn all_recipients(&self) -> Vec<Address> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .cloned()
            .collect()
    }

    /// Adds a primary recipient.
    pub fn add_to(&mut self, address: Address) -> SmtpResult<()> {
        validate_address(&address)?;
        self.to.push(address);
        self.saved = false;
        Ok(())
    }

    /// Adds a BCC recipient.
    pub fn add_bcc(&mut self, address: Address) {
        self.bcc.push(address);
        self.saved = false;
    }

    /// Returns the subject.
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Returns the body as composed by the caller.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Returns the sent date, if one was set.
    pub fn sent_date(&self) -> Option<DateTime<Utc>> {
        self.sent_date
    }

    /// Sets the sent date.
    pub fn set_sent_date(&mut self, date: DateTime<Utc>) {
        self.sent_date = Some(date);
        self.saved = false;
    }

    /// Returns the `Message-ID` header value.
    pub fn message_id(&self) -> Option<&str> {
        self.header(HEADER_MESSAGE_ID)
    }

    /// Returns the first value of a header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every header in output order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Sets a header, replacing every existing value with the same name.
    ///
    /// The first existing position is kept so re-setting a header does not
    /// reorder the output.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> SmtpResult<()> {
        let name = name.into();
        let value = value.into();
        validate_header(&name, &value)?;
        self.put_header(&name, value);
        self.saved = false;
        Ok(())
    }

    /// Adds a header value without touching existing ones.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> SmtpResult<()> {
        let name = name.into();
        let value = value.into();
        validate_header(&name, &value)?;
        self.headers.push((name, value));
        self.saved = false;
        Ok(())
    }

    /// Removes every value of a header.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.saved = false;
    }

    /// Sets a header produced by the message itself or restored verbatim
    /// from a value it already held.
    fn put_header(&mut self, name: &str, value: String) {
        match self.headers.iter().position(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(pos) => {
                self.headers[pos] = (name.to_string(), value);
                let mut index = 0;
                self.headers.retain(|(n, _)| {
                    let keep = index <= pos || !n.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.headers.push((name.to_string(), value)),
        }
    }

    /// Restores a `Message-ID` read before `save_changes` without dropping
    /// the saved state.
    pub(crate) fn restore_message_id(&mut self, message_id: String) {
        self.put_header(HEADER_MESSAGE_ID, message_id);
    }

    /// Returns true once `save_changes` ran and nothing changed since.
    pub fn is_saved(&self) -> bool {
        self.saved
    }

    /// Materializes derived headers.
    ///
    /// Sets `MIME-Version`, `Content-Type`, `Date` (from the sent date, when
    /// present) and assigns a freshly generated `Message-ID`, overwriting any
    /// previous one. Callers that need to keep an identifier must read it
    /// before and restore it after.
    pub fn save_changes(&mut self) {
        self.put_header(HEADER_MIME_VERSION, "1.0".to_string());
        if self.header(HEADER_CONTENT_TYPE).is_none() {
            let content_type = self.content_type.clone();
            self.put_header(HEADER_CONTENT_TYPE, content_type);
        }
        if let Some(date) = self.sent_date {
            self.put_header(HEADER_DATE, date.to_rfc2822());
        }
        let message_id = self.generate_message_id();
        self.put_header(HEADER_MESSAGE_ID, message_id);
        self.saved = true;
    }

    fn generate_message_id(&self) -> String {
        let domain = self
            .sender()
            .map(Address::domain)
            .filter(|d| !d.is_empty())
            .unwrap_or("localhost");
        format!(
            "<{}.{}@{}>",
            uuid::Uuid::new_v4().simple(),
            Utc::now().timestamp_millis(),
            domain
        )
    }

    /// Renders the message in RFC 5322 form with CRLF line endings.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::with_capacity(self.body.len() + 512);

        let mut write_header = |name: &str, value: &str| {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        };

        // Caller-level headers that have a dedicated field are rendered from
        // the field, custom headers keep their order.
        let is_derived = |name: &str| {
            ["Date", "Message-ID", "MIME-Version", "Content-Type"]
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name))
        };

        if let Some(date) = self.header(HEADER_DATE) {
            write_header(HEADER_DATE, date);
        }
        if !self.from.is_empty() {
            write_header("From", &join_addresses(&self.from));
        }
        if !self.to.is_empty() {
            write_header("To", &join_addresses(&self.to));
        }
        if !self.cc.is_empty() {
            write_header("Cc", &join_addresses(&self.cc));
        }
        if let Some(subject) = &self.subject {
            write_header("Subject", subject);
        }
        if let Some(id) = self.header(HEADER_MESSAGE_ID) {
            write_header(HEADER_MESSAGE_ID, id);
        }
        for (name, value) in self.headers.iter().filter(|(n, _)| !is_derived(n)) {
            write_header(name, value);
        }
        write_header(
            HEADER_MIME_VERSION,
            self.header(HEADER_MIME_VERSION).unwrap_or("1.0"),
        );
        write_header(
            HEADER_CONTENT_TYPE,
            self.header(HEADER_CONTENT_TYPE).unwrap_or(&self.content_type),
        );

        out.push_str("\r\n");
        for line in self.body.lines() {
            out.push_str(line);
            out.push_str("\r\n");
        }

        out.into_bytes()
    }
}

fn validate_header_value(field: &str, value: &str) -> SmtpResult<()> {
    if value.contains(['\r', '\n']) {
        return Err(SmtpError::message_error(
            SmtpErrorKind::InvalidHeader,
            format!("{} must not contain line breaks", field),
        ));
    }
    Ok(())
}

fn validate_header(name: &str, value: &str) -> SmtpResult<()> {
    if name.is_empty() || name.contains(|c: char| c == ':' || c.is_whitespace() || c.is_control()) {
        return Err(SmtpError::message_error(
            SmtpErrorKind::InvalidHeader,
            format!("invalid header {:?}", name),
        ));
    }
    validate_header_value(name, value)
}

// Address fields are public, so names are checked again wherever an
// `Address` enters a message.
fn validate_address(address: &Address) -> SmtpResult<()> {
    match &address.name {
        Some(name) => validate_header_value("display name", name),
        None => Ok(()),
    }
}

fn join_addresses(addresses: &[Address]) -> String {
    addresses
        .iter()
        .map(Address::to_header)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builder for [`MimeMessage`].
#[derive(Debug, Default)]
pub struct MimeMessageBuilder {
    from: Vec<Address>,
    to: Vec<Address>,
    cc: Vec<Address>,
    bcc: Vec<Address>,
    subject: Option<String>,
    headers: Vec<(String, String)>,
    sent_date: Option<DateTime<Utc>>,
    content_type: Option<String>,
    body: String,
}

impl MimeMessageBuilder {
    /// Sets the sender address.
    pub fn from(mut self, address: impl TryInto<Address, Error = SmtpError>) -> SmtpResult<Self> {
        self.from.push(address.try_into()?);
        Ok(self)
    }

    /// Adds a primary recipient.
    pub fn to(mut self, address: impl TryInto<Address, Error = SmtpError>) -> SmtpResult<Self> {
        self.to.push(address.try_into()?);
        Ok(self)
    }

    /// Adds a CC recipient.
    pub fn cc(mut self, address: impl TryInto<Address, Error = SmtpError>) -> SmtpResult<Self> {
        self.cc.push(address.try_into()?);
        Ok(self)
    }

    /// Adds a BCC recipient.
    pub fn bcc(mut self, address: impl TryInto<Address, Error = SmtpError>) -> SmtpResult<Self> {
        self.bcc.push(address.try_into()?);
        Ok(self)
    }

    /// Sets the subject.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets the `Message-ID` header.
    pub fn message_id(self, id: impl Into<String>) -> Self {
        self.header(HEADER_MESSAGE_ID, id)
    }

    /// Adds a custom header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the sent date.
    pub fn sent_date(mut self, date: DateTime<Utc>) -> Self {
        self.sent_date = Some(date);
        self
    }

    /// Sets the body content type (defaults to UTF-8 plain text).
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Sets the pre-encoded body.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Builds the message.
    pub fn build(self) -> SmtpResult<MimeMessage> {
        for (name, value) in &self.headers {
            validate_header(name, value)?;
        }
        if let Some(subject) = &self.subject {
            validate_header_value("Subject", subject)?;
        }
        if let Some(content_type) = &self.content_type {
            validate_header_value(HEADER_CONTENT_TYPE, content_type)?;
        }
        for address in self.from.iter().chain(&self.to).chain(&self.cc).chain(&self.bcc) {
            validate_address(address)?;
        }

        Ok(MimeMessage {
            from: self.from,
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            subject: self.subject,
            headers: self.headers,
            sent_date: self.sent_date,
            content_type: self
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            body: self.body,
            saved: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn message() -> MimeMessage {
        MimeMessage::builder()
            .from("Sender <sender@example.com>").unwrap()
            .to("to@example.com").unwrap()
            .cc("cc@example.com").unwrap()
            .bcc("bcc@example.com").unwrap()
            .subject("Quarterly report")
            .body("Line one\nLine two")
            .build()
            .unwrap()
    }

    #[test]
    fn test_address_parse() {
        let addr = Address::parse("John Doe <john@example.com>").unwrap();
        assert_eq!(addr.email, "john@example.com");
        assert_eq!(addr.name.as_deref(), Some("John Doe"));
        assert_eq!(addr.domain(), "example.com");

        let addr = Address::parse("<bare@example.com>").unwrap();
        assert!(addr.name.is_none());
    }

    #[rstest]
    #[case("")]
    #[case("no-at-sign")]
    #[case("two@@signs.com")]
    #[case("@no-local.com")]
    #[case("no-domain@")]
    #[case("spa ce@example.com")]
    fn test_address_rejects(#[case] input: &str) {
        assert!(Address::new(input).is_err());
    }

    #[test]
    fn test_all_recipients_order() {
        let recipients = message().all_recipients();
        let emails: Vec<_> = recipients.iter().map(Address::email).collect();
        assert_eq!(emails, ["to@example.com", "cc@example.com", "bcc@example.com"]);
    }

    #[test]
    fn test_save_changes_regenerates_message_id() {
        let mut msg = message();
        msg.set_header(HEADER_MESSAGE_ID, "<caller@example.com>").unwrap();

        msg.save_changes();
        let first = msg.message_id().unwrap().to_string();
        assert_ne!(first, "<caller@example.com>");
        assert!(first.ends_with("@example.com>"));

        msg.save_changes();
        assert_ne!(msg.message_id().unwrap(), first);
        assert!(msg.is_saved());
    }

    #[test]
    fn test_save_changes_writes_date_from_sent_date() {
        let mut msg = message();
        msg.save_changes();
        assert!(msg.header("date").is_none());

        let date = Utc::now();
        msg.set_sent_date(date);
        assert!(!msg.is_saved());
        msg.save_changes();
        assert_eq!(msg.header("Date"), Some(date.to_rfc2822().as_str()));
    }

    #[test]
    fn test_set_header_replaces_case_insensitively() {
        let mut msg = message();
        msg.add_header("X-Tag", "a").unwrap();
        msg.add_header("x-tag", "b").unwrap();
        msg.set_header("X-TAG", "c").unwrap();

        let tags: Vec<_> = msg
            .headers()
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("x-tag"))
            .collect();
        assert_eq!(tags.len(), 1);
        assert_eq!(msg.header("x-tag"), Some("c"));
    }

    #[test]
    fn test_to_bytes_omits_bcc() {
        let mut msg = message();
        msg.save_changes();
        let text = String::from_utf8(msg.to_bytes()).unwrap();

        assert!(text.contains("From: Sender <sender@example.com>\r\n"));
        assert!(text.contains("To: to@example.com\r\n"));
        assert!(text.contains("Cc: cc@example.com\r\n"));
        assert!(!text.contains("bcc@example.com"));
        assert!(text.contains("MIME-Version: 1.0\r\n"));
        assert!(text.ends_with("\r\n\r\nLine one\r\nLine two\r\n"));
    }

    #[test]
    fn test_builder_rejects_header_injection() {
        let result = MimeMessage::builder()
            .header("X-Evil", "value\r\nBcc: victim@example.com")
            .build();
        assert!(result.is_err());
    }

    fn injected(text: &str) -> bool {
        text.lines().any(|line| line.starts_with("Bcc:") || line.starts_with("X-Injected:"))
    }

    #[rstest]
    #[case::subject(MimeMessage::builder().subject("Hi\r\nBcc: victim@evil.example"))]
    #[case::content_type(MimeMessage::builder().content_type("text/plain\r\nBcc: victim@evil.example"))]
    #[case::display_name({
        let mut builder = MimeMessage::builder();
        builder.to.push(Address {
            name: Some("Bob\nX-Injected: 1".to_string()),
            email: "bob@example.com".to_string(),
        });
        builder
    })]
    fn test_build_rejects_line_breaks(#[case] builder: MimeMessageBuilder) {
        let err = builder.build().unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidHeader);
    }

    #[test]
    fn test_display_name_rejects_line_breaks() {
        let err = Address::with_name("Bob\r\nX-Injected: 1", "bob@example.com").unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidHeader);
        assert!(Address::parse("\"Bob\r\nX-Injected: 1\" <bob@example.com>").is_err());

        let mut msg = message();
        let forged = Address {
            name: Some("Bob\r\nX-Injected: 1".to_string()),
            email: "bob@example.com".to_string(),
        };
        assert!(msg.add_to(forged).is_err());
        assert!(!injected(&String::from_utf8(msg.to_bytes()).unwrap()));
    }

    #[test]
    fn test_header_setters_reject_line_breaks() {
        let mut msg = message();

        let err = msg.set_header("X-Tag", "a\r\nBcc: victim@evil.example").unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidHeader);
        assert!(msg.add_header("X-Tag", "a\nBcc: victim@evil.example").is_err());
        assert!(msg.add_header("Bad Name", "value").is_err());
        assert!(msg.header("X-Tag").is_none());

        assert!(!injected(&String::from_utf8(msg.to_bytes()).unwrap()));
    }

    #[test]
    fn test_header_edits_clear_saved_state() {
        let mut msg = message();

        msg.save_changes();
        msg.set_header("X-Tag", "a").unwrap();
        assert!(!msg.is_saved());

        msg.save_changes();
        msg.add_header("X-Tag", "b").unwrap();
        assert!(!msg.is_saved());

        msg.save_changes();
        msg.remove_header("X-Tag");
        assert!(!msg.is_saved());

        msg.save_changes();
        msg.restore_message_id("<kept@example.com>".to_string());
        assert!(msg.is_saved());
        assert_eq!(msg.message_id(), Some("<kept@example.com>"));
    }
}
