//! # Pooled SMTP Connections
//!
//! A connection layer for sending mail through a pool of SMTP sessions:
//! - Leased connections whose `close` returns them to the pool
//! - Message normalization before transmission (sent date, stable `Message-ID`)
//! - RSET or NOOP keep-alive selection per connection
//! - Batch sends that attempt every message and report failures once
//! - Transport listeners mirrored between connection and transport
//! - STARTTLS / implicit TLS and PLAIN, LOGIN, XOAUTH2 authentication
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_smtp_pool::{MimeMessage, SmtpConfig, SmtpPool};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SmtpConfig::builder()
//!         .host("smtp.example.com")
//!         .port(587)
//!         .credentials("user@example.com", "password")
//!         .build()?;
//!
//!     let pool = SmtpPool::from_config(config)?;
//!     let mut connection = pool.borrow_object().await?;
//!
//!     let mut message = MimeMessage::builder()
//!         .from("sender@example.com")?
//!         .to("recipient@example.com")?
//!         .subject("Hello from Rust!")
//!         .body("This is a test email.")
//!         .build()?;
//!
//!     connection.send_message(&mut message).await?;
//!     println!("Sent {:?}", message.message_id());
//!
//!     // Back to the pool; the SMTP session stays open.
//!     connection.close()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod message;

// Protocol layer
pub mod protocol;

// Authentication
pub mod auth;

// Transport layer
pub mod events;
pub mod transport;

// Pooled connections
pub mod connection;
pub mod pool;

// Observability
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use auth::{AuthMethod, Credentials};
pub use config::{PoolConfig, Session, SmtpConfig, SmtpConfigBuilder, TlsConfig, TlsMode};
pub use connection::{ClosableConnection, Connection};
pub use errors::{FailedMessage, MailSendError, SmtpError, SmtpErrorKind, SmtpResult};
pub use events::{TransportEvent, TransportEventKind, TransportListener};
pub use message::{Address, MimeMessage, MimeMessageBuilder};
pub use observability::{MetricsSnapshot, SmtpMetrics};
pub use pool::{
    ObjectPool, PoolStatus, SmtpConnectionPool, SmtpPool, TcpTransportFactory, TransportFactory,
};
pub use transport::{TcpTransport, Transport};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::{SmtpConfig, TlsMode};
    pub use crate::connection::ClosableConnection;
    pub use crate::errors::{MailSendError, SmtpError, SmtpResult};
    pub use crate::events::TransportListener;
    pub use crate::message::{Address, MimeMessage};
    pub use crate::pool::{ObjectPool, SmtpPool};
    pub use crate::transport::Transport;
}
