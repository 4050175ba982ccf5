//! Configuration for pooled SMTP connections.
//!
//! `SmtpConfig` describes the relay, its security and authentication, the
//! default protocol tuning of each transport and the pool limits. A
//! [`Session`] is the shared, read-only view of one configuration that a pool
//! hands to the transports it creates.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{AuthMethod, Credentials};
use crate::errors::{SmtpError, SmtpResult};

/// Default SMTP port (submission with STARTTLS).
pub const DEFAULT_PORT: u16 = 587;

/// Default timeout for connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default timeout for a single command round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// TLS mode for SMTP connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// No TLS.
    None,
    /// Upgrade with STARTTLS when the server offers it.
    #[default]
    StartTls,
    /// Upgrade with STARTTLS, fail if the server does not offer it.
    StartTlsRequired,
    /// TLS from the first byte (port 465).
    Implicit,
}

/// TLS configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// TLS mode.
    #[serde(default)]
    pub mode: TlsMode,
    /// Extra PEM bundle trusted in addition to the web PKI roots.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    /// Server Name Indication override.
    #[serde(default)]
    pub sni_override: Option<String>,
}

/// Connection pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of live connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long a borrower waits for a connection.
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Probe idle connections before handing them out.
    #[serde(default = "default_true")]
    pub test_on_borrow: bool,
    /// Connections discarded by validation before a borrow gives up.
    #[serde(default = "default_max_borrow_attempts")]
    pub max_borrow_attempts: usize,
}

fn default_true() -> bool { true }
fn default_max_connections() -> usize { 5 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(30) }
fn default_max_borrow_attempts() -> usize { 3 }

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            acquire_timeout: default_acquire_timeout(),
            test_on_borrow: true,
            max_borrow_attempts: default_max_borrow_attempts(),
        }
    }
}

/// SMTP relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// SMTP server hostname.
    pub host: String,
    /// SMTP server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// TLS configuration.
    #[serde(default)]
    pub tls: TlsConfig,
    /// Authentication username.
    #[serde(default)]
    pub username: Option<String>,
    /// Authentication password (never serialized).
    #[serde(default, skip_serializing)]
    pub password: Option<SecretString>,
    /// Preferred authentication method.
    #[serde(default)]
    pub auth_method: Option<AuthMethod>,
    /// Connect timeout.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Command timeout.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Client identifier for EHLO.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Probe liveness with RSET instead of NOOP on new transports.
    #[serde(default)]
    pub use_rset: bool,
    /// Deliver to the accepted recipients when some are rejected.
    #[serde(default)]
    pub send_partial: bool,
    /// Connection pool configuration.
    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_port() -> u16 { DEFAULT_PORT }
fn default_connect_timeout() -> Duration { DEFAULT_CONNECT_TIMEOUT }
fn default_command_timeout() -> Duration { DEFAULT_COMMAND_TIMEOUT }

impl SmtpConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> SmtpConfigBuilder {
        SmtpConfigBuilder::default()
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> SmtpResult<Self> {
        let config: SmtpConfig = serde_json::from_str(json)
            .map_err(|e| SmtpError::configuration(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> SmtpResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SmtpError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.host.is_empty() {
            return Err(SmtpError::configuration("Host is required"));
        }
        if self.port == 0 {
            return Err(SmtpError::configuration("Port must be non-zero"));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(SmtpError::configuration(
                "username and password must be set together",
            ));
        }
        if self.pool.max_connections == 0 {
            return Err(SmtpError::configuration("max_connections must be positive"));
        }
        if self.pool.max_borrow_attempts == 0 {
            return Err(SmtpError::configuration("max_borrow_attempts must be positive"));
        }
        Ok(())
    }

    /// Returns the `host:port` pair.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the configured credentials, if any.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(Credentials::Plain {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("localhost")
    }
}

/// Builder for SMTP configuration.
#[derive(Debug, Default)]
pub struct SmtpConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    tls: TlsConfig,
    username: Option<String>,
    password: Option<SecretString>,
    auth_method: Option<AuthMethod>,
    connect_timeout: Option<Duration>,
    command_timeout: Option<Duration>,
    client_id: Option<String>,
    use_rset: bool,
    send_partial: bool,
    pool: PoolConfig,
}

impl SmtpConfigBuilder {
    /// Sets the SMTP server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the SMTP server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets plain credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the preferred authentication method.
    pub fn auth_method(mut self, method: AuthMethod) -> Self {
        self.auth_method = Some(method);
        self
    }

    /// Sets the TLS mode.
    pub fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls.mode = mode;
        self
    }

    /// Sets the TLS configuration.
    pub fn tls(mut self, config: TlsConfig) -> Self {
        self.tls = config;
        self
    }

    /// Sets connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Probes liveness with RSET instead of NOOP.
    pub fn use_rset(mut self, use_rset: bool) -> Self {
        self.use_rset = use_rset;
        self
    }

    /// Delivers to accepted recipients even when others are rejected.
    pub fn send_partial(mut self, send_partial: bool) -> Self {
        self.send_partial = send_partial;
        self
    }

    /// Sets pool configuration.
    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> SmtpResult<SmtpConfig> {
        let config = SmtpConfig {
            host: self.host.ok_or_else(|| SmtpError::configuration("Host is required"))?,
            port: self.port.unwrap_or(DEFAULT_PORT),
            tls: self.tls,
            username: self.username,
            password: self.password,
            auth_method: self.auth_method,
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            command_timeout: self.command_timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT),
            client_id: self.client_id,
            use_rset: self.use_rset,
            send_partial: self.send_partial,
            pool: self.pool,
        };

        config.validate()?;
        Ok(config)
    }
}

/// Shared view of a configuration, owned by a pool.
#[derive(Debug, Clone)]
pub struct Session {
    config: Arc<SmtpConfig>,
}

impl Session {
    /// Creates a session over a validated configuration.
    pub fn new(config: SmtpConfig) -> SmtpResult<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    /// Returns true if both sessions share the same configuration.
    pub fn same_as(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.config, &other.config)
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = SmtpConfig::builder().host("smtp.example.com").build().unwrap();

        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.tls.mode, TlsMode::StartTls);
        assert!(!config.use_rset);
        assert!(config.credentials().is_none());
        assert_eq!(config.client_id(), "localhost");
    }

    #[test]
    fn test_config_validation() {
        assert!(SmtpConfig::builder().build().is_err());

        let result = SmtpConfig::builder()
            .host("smtp.example.com")
            .pool(PoolConfig {
                max_connections: 0,
                ..Default::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_config_from_json() {
        let config = SmtpConfig::from_json(
            r#"{
                "host": "relay.example.com",
                "port": 2525,
                "tls": { "mode": "none" },
                "use_rset": true,
                "pool": { "max_connections": 8, "acquire_timeout": "2s 500ms" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.address(), "relay.example.com:2525");
        assert_eq!(config.tls.mode, TlsMode::None);
        assert!(config.use_rset);
        assert_eq!(config.pool.max_connections, 8);
        assert_eq!(config.pool.acquire_timeout, Duration::from_millis(2500));
        assert!(config.pool.test_on_borrow);
        assert_eq!(config.command_timeout, DEFAULT_COMMAND_TIMEOUT);
    }

    #[test]
    fn test_config_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"host": "relay.example.com", "connect_timeout": "5s"}}"#).unwrap();

        let config = SmtpConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.connect_timeout, Duration::from_secs(5));

        assert!(SmtpConfig::from_json_file("/nonexistent/smtp.json").is_err());
    }

    #[test]
    fn test_password_is_not_serialized() {
        let config = SmtpConfig::builder()
            .host("smtp.example.com")
            .credentials("user", "hunter2")
            .build()
            .unwrap();

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains("\"username\":\"user\""));
    }

    #[test]
    fn test_session_shares_config() {
        let session = Session::new(SmtpConfig::builder().host("a.example.com").build().unwrap())
            .unwrap();
        let clone = session.clone();
        assert!(session.same_as(&clone));
        assert_eq!(clone.config().host, "a.example.com");
    }
}
