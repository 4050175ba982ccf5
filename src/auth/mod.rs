//! SASL mechanisms used when a transport authenticates.
//!
//! Supports PLAIN (RFC 4616), LOGIN and XOAUTH2.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};

/// Authentication methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// PLAIN authentication (RFC 4616).
    Plain,
    /// LOGIN authentication (obsolete).
    Login,
    /// Google/Microsoft XOAUTH2.
    XOAuth2,
}

impl AuthMethod {
    /// Returns the SMTP AUTH mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
            AuthMethod::XOAuth2 => "XOAUTH2",
        }
    }

    /// Priority for auto-selection, higher wins.
    pub fn priority(&self) -> u8 {
        match self {
            AuthMethod::XOAuth2 => 3,
            AuthMethod::Plain => 2,
            AuthMethod::Login => 1,
        }
    }

    /// Parses a mechanism from an EHLO `AUTH` capability token.
    pub fn from_capability(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(AuthMethod::Plain),
            "LOGIN" => Some(AuthMethod::Login),
            "XOAUTH2" => Some(AuthMethod::XOAuth2),
            _ => None,
        }
    }

    /// Returns true if this method sends the secret in clear.
    pub fn requires_tls(&self) -> bool {
        matches!(self, AuthMethod::Plain | AuthMethod::Login)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mechanism_name())
    }
}

/// Credentials a transport authenticates with.
#[derive(Clone)]
pub enum Credentials {
    /// Username and password.
    Plain {
        /// Username.
        username: String,
        /// Password.
        password: SecretString,
    },
    /// OAuth2 access token for XOAUTH2.
    XOAuth2 {
        /// Username/email.
        username: String,
        /// Access token.
        access_token: SecretString,
    },
}

impl Credentials {
    /// Creates plain credentials.
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Plain {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    /// Creates XOAUTH2 credentials.
    pub fn xoauth2(username: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self::XOAuth2 {
            username: username.into(),
            access_token: SecretString::new(access_token.into()),
        }
    }

    /// Returns the mechanisms these credentials can drive.
    pub fn compatible_methods(&self) -> &'static [AuthMethod] {
        match self {
            Credentials::Plain { .. } => &[AuthMethod::Plain, AuthMethod::Login],
            Credentials::XOAuth2 { .. } => &[AuthMethod::XOAuth2],
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Plain { username, .. } => f
                .debug_struct("Plain")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Credentials::XOAuth2 { username, .. } => f
                .debug_struct("XOAuth2")
                .field("username", username)
                .field("access_token", &"[REDACTED]")
                .finish(),
        }
    }
}

/// SASL payload helpers.
pub struct Authenticator;

impl Authenticator {
    /// PLAIN initial response: `base64("\0user\0pass")`.
    pub fn plain_initial_response(username: &str, password: &SecretString) -> String {
        BASE64.encode(format!("\0{}\0{}", username, password.expose_secret()))
    }

    /// LOGIN username step.
    pub fn login_username(username: &str) -> String {
        BASE64.encode(username)
    }

    /// LOGIN password step.
    pub fn login_password(password: &SecretString) -> String {
        BASE64.encode(password.expose_secret())
    }

    /// XOAUTH2 initial response.
    pub fn xoauth2_initial_response(username: &str, access_token: &SecretString) -> String {
        BASE64.encode(format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            username,
            access_token.expose_secret()
        ))
    }

    /// Picks the highest priority mechanism both sides support.
    ///
    /// `preferred` wins when the server offers it. Mechanisms that expose the
    /// secret are skipped on plaintext connections.
    pub fn select_method(
        offered: &[AuthMethod],
        credentials: &Credentials,
        preferred: Option<AuthMethod>,
        tls_enabled: bool,
    ) -> SmtpResult<AuthMethod> {
        let usable = |m: &AuthMethod| {
            credentials.compatible_methods().contains(m) && (tls_enabled || !m.requires_tls())
        };

        if let Some(method) = preferred {
            if offered.contains(&method) && usable(&method) {
                return Ok(method);
            }
            return Err(SmtpError::new(
                SmtpErrorKind::AuthMethodNotSupported,
                format!("preferred auth method {} is not usable", method),
            ));
        }

        offered
            .iter()
            .copied()
            .filter(usable)
            .max_by_key(AuthMethod::priority)
            .ok_or_else(|| {
                SmtpError::new(
                    SmtpErrorKind::AuthMethodNotSupported,
                    "No compatible authentication method available",
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_initial_response() {
        let password = SecretString::new("secret".to_string());
        let encoded = Authenticator::plain_initial_response("user", &password);
        assert_eq!(BASE64.decode(encoded).unwrap(), b"\0user\0secret");
    }

    #[test]
    fn test_select_method_prefers_priority() {
        let creds = Credentials::plain("user", "pass");
        let offered = [AuthMethod::Login, AuthMethod::Plain, AuthMethod::XOAuth2];

        let method = Authenticator::select_method(&offered, &creds, None, true).unwrap();
        assert_eq!(method, AuthMethod::Plain);
    }

    #[test]
    fn test_select_method_refuses_cleartext_without_tls() {
        let creds = Credentials::plain("user", "pass");
        let offered = [AuthMethod::Plain, AuthMethod::Login];

        let err = Authenticator::select_method(&offered, &creds, None, false).unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::AuthMethodNotSupported);
    }

    #[test]
    fn test_select_method_honors_preference() {
        let creds = Credentials::plain("user", "pass");
        let offered = [AuthMethod::Plain, AuthMethod::Login];

        let method =
            Authenticator::select_method(&offered, &creds, Some(AuthMethod::Login), true).unwrap();
        assert_eq!(method, AuthMethod::Login);

        assert!(
            Authenticator::select_method(&offered, &creds, Some(AuthMethod::XOAuth2), true)
                .is_err()
        );
    }

    #[test]
    fn test_credentials_debug_redacts() {
        let debug = format!("{:?}", Credentials::xoauth2("user", "token-value"));
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("token-value"));
    }
}
