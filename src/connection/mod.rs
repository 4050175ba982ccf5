//! Pooled connections and their lease handles.
//!
//! A [`Connection`] is the object a pool keeps: one transport plus the state
//! that outlives a single lease. Callers never hold it directly; they get a
//! [`ClosableConnection`], whose `close` hands the connection back to the
//! pool that created it instead of ending the session.

use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::config::Session;
use crate::errors::{FailedMessage, MailSendError, SmtpError, SmtpErrorKind, SmtpResult};
use crate::events::TransportListener;
use crate::message::{Address, MimeMessage};
use crate::observability::{SmtpMetrics, Timer};
use crate::pool::ObjectPool;
use crate::transport::Transport;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A transport owned by a pool.
///
/// Listeners added through the connection are mirrored on the transport so
/// they can be removed again without the caller holding the transport.
pub struct Connection<T: Transport> {
    id: u64,
    transport: T,
    use_rset: bool,
    /// Whether the transport currently has RSET keep-alive enabled by us.
    rset_applied: bool,
    listeners: Vec<Arc<dyn TransportListener>>,
    metrics: Arc<SmtpMetrics>,
}

impl<T: Transport> Connection<T> {
    /// Wraps a freshly opened transport.
    pub fn new(transport: T) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            use_rset: false,
            rset_applied: false,
            listeners: Vec::new(),
            metrics: Arc::new(SmtpMetrics::new()),
        }
    }

    /// Records sends into `metrics` instead of a private collector.
    pub fn with_metrics(mut self, metrics: Arc<SmtpMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Process-unique identifier, stable across leases.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns the transport mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Returns true if sends apply RSET keep-alive to the transport.
    pub fn use_rset(&self) -> bool {
        self.use_rset
    }

    /// Enables or disables RSET keep-alive for subsequent sends.
    pub fn set_rset(&mut self, enabled: bool) {
        self.use_rset = enabled;
    }

    /// Listeners registered through this connection, in insertion order.
    pub fn listeners(&self) -> &[Arc<dyn TransportListener>] {
        &self.listeners
    }

    /// Registers `listener` here and on the transport.
    pub fn add_listener(&mut self, listener: Arc<dyn TransportListener>) {
        self.transport.add_transport_listener(Arc::clone(&listener));
        self.listeners.push(listener);
    }

    /// Unregisters the first registration of `listener` here and on the transport.
    pub fn remove_listener(&mut self, listener: &Arc<dyn TransportListener>) {
        self.transport.remove_transport_listener(listener);
        if let Some(pos) = self.listeners.iter().position(|l| Arc::ptr_eq(l, listener)) {
            self.listeners.remove(pos);
        }
    }

    /// Unregisters every listener added through this connection.
    pub fn clear_listeners(&mut self) {
        for listener in self.listeners.drain(..) {
            self.transport.remove_transport_listener(&listener);
        }
    }

    /// Probes the transport.
    pub async fn is_connected(&mut self) -> bool {
        self.transport.is_connected().await
    }

    /// Ends the transport session. Used by pools when discarding.
    pub async fn close_transport(&mut self) {
        self.transport.close().await;
    }

    /// Normalizes `message` and hands it to the transport.
    ///
    /// The sent date is stamped when missing, then `save_changes` runs; a
    /// `Message-ID` present before the save is restored afterwards. Transport
    /// errors are returned unchanged.
    pub async fn send(&mut self, message: &mut MimeMessage, recipients: &[Address]) -> SmtpResult<()> {
        if message.sent_date().is_none() {
            message.set_sent_date(Utc::now());
        }

        let message_id = message.message_id().map(str::to_owned);
        message.save_changes();
        if let Some(message_id) = message_id {
            message.restore_message_id(message_id);
        }

        self.apply_rset()?;

        let timer = Timer::start("send_message");
        let result = self.transport.send_message(message, recipients).await;
        self.metrics.record_send(result.is_ok(), timer.stop());

        #[cfg(feature = "tracing")]
        match &result {
            Ok(()) => tracing::debug!(
                connection = self.id,
                message_id = ?message.message_id(),
                recipients = recipients.len(),
                "Message sent"
            ),
            Err(e) => tracing::debug!(
                connection = self.id,
                message_id = ?message.message_id(),
                error = %e,
                "Message send failed"
            ),
        }

        result
    }

    /// Pushes the RSET setting to the transport.
    ///
    /// Nothing is sent while RSET was never enabled; disabling after an
    /// enable is applied once.
    fn apply_rset(&mut self) -> SmtpResult<()> {
        if self.use_rset || self.rset_applied {
            self.transport.set_use_rset(self.use_rset)?;
            self.rset_applied = self.use_rset;
        }
        Ok(())
    }
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("use_rset", &self.use_rset)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// A leased connection.
///
/// `close` (or dropping the handle) returns the connection to its pool
/// exactly once. Every operation after that fails with
/// [`SmtpErrorKind::ConnectionReleased`].
pub struct ClosableConnection<T: Transport> {
    inner: Option<Connection<T>>,
    pool: Weak<dyn ObjectPool<T>>,
}

impl<T: Transport> ClosableConnection<T> {
    /// Leases `connection` on behalf of `pool`.
    pub fn new(connection: Connection<T>, pool: Weak<dyn ObjectPool<T>>) -> Self {
        Self {
            inner: Some(connection),
            pool,
        }
    }

    fn connection(&self) -> SmtpResult<&Connection<T>> {
        self.inner.as_ref().ok_or_else(SmtpError::released)
    }

    fn connection_mut(&mut self) -> SmtpResult<&mut Connection<T>> {
        self.inner.as_mut().ok_or_else(SmtpError::released)
    }

    /// Sends `message` to `recipients`.
    ///
    /// Stamps a missing sent date, keeps a caller-supplied `Message-ID` and
    /// applies the RSET setting before transmitting.
    pub async fn send_message_to(
        &mut self,
        message: &mut MimeMessage,
        recipients: &[Address],
    ) -> SmtpResult<()> {
        self.connection_mut()?.send(message, recipients).await
    }

    /// Sends `message` to all of its recipients (To, Cc, Bcc).
    pub async fn send_message(&mut self, message: &mut MimeMessage) -> SmtpResult<()> {
        let recipients = message.all_recipients();
        self.send_message_to(message, &recipients).await
    }

    /// Sends each message to its own recipients, in order.
    ///
    /// A failure does not stop the batch. Failures are reported together
    /// after the last message, keyed by their position in `messages`.
    pub async fn send_messages(&mut self, messages: &mut [MimeMessage]) -> Result<(), MailSendError> {
        let connection = self.connection_mut().map_err(MailSendError::NotAttempted)?;

        let mut failures = Vec::new();
        for (index, message) in messages.iter_mut().enumerate() {
            let recipients = message.all_recipients();
            if let Err(error) = connection.send(message, &recipients).await {
                failures.push(FailedMessage {
                    index,
                    message: message.clone(),
                    error,
                });
            }
        }

        connection.metrics.record_batch(failures.len());

        #[cfg(feature = "tracing")]
        tracing::debug!(
            connection = connection.id,
            messages = messages.len(),
            failed = failures.len(),
            "Batch finished"
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(MailSendError::Failed(failures))
        }
    }

    /// Adds a delivery listener, mirrored on the transport.
    pub fn add_transport_listener(&mut self, listener: Arc<dyn TransportListener>) -> SmtpResult<()> {
        self.connection_mut()?.add_listener(listener);
        Ok(())
    }

    /// Removes a delivery listener from the connection and the transport.
    pub fn remove_transport_listener(&mut self, listener: &Arc<dyn TransportListener>) -> SmtpResult<()> {
        self.connection_mut()?.remove_listener(listener);
        Ok(())
    }

    /// Removes every listener added through this connection.
    pub fn clear_listeners(&mut self) -> SmtpResult<()> {
        self.connection_mut()?.clear_listeners();
        Ok(())
    }

    /// Listeners added through this connection, in insertion order.
    pub fn listeners(&self) -> SmtpResult<&[Arc<dyn TransportListener>]> {
        Ok(self.connection()?.listeners())
    }

    /// Probes the transport. False once the connection was returned.
    pub async fn is_connected(&mut self) -> bool {
        match self.inner.as_mut() {
            Some(connection) => connection.is_connected().await,
            None => false,
        }
    }

    /// Enables or disables RSET keep-alive for subsequent sends.
    pub fn set_rset(&mut self, enabled: bool) -> SmtpResult<()> {
        self.connection_mut()?.set_rset(enabled);
        Ok(())
    }

    /// Returns the connection to its pool. The session stays open.
    pub fn close(&mut self) -> SmtpResult<()> {
        let connection = self.inner.take().ok_or_else(SmtpError::released)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(connection = connection.id, "Returning connection to pool");

        match self.pool.upgrade() {
            Some(pool) => pool.return_object(connection),
            None => Err(SmtpError::pool(
                SmtpErrorKind::PoolUnavailable,
                "owning pool no longer exists",
            )),
        }
    }

    /// Returns true once `close` was called.
    pub fn is_released(&self) -> bool {
        self.inner.is_none()
    }

    /// Returns the underlying transport.
    pub fn transport(&self) -> SmtpResult<&T> {
        Ok(self.connection()?.transport())
    }

    /// Returns the underlying transport mutably.
    pub fn transport_mut(&mut self) -> SmtpResult<&mut T> {
        Ok(self.connection_mut()?.transport_mut())
    }

    /// Returns the session of the owning pool.
    pub fn session(&self) -> SmtpResult<Session> {
        self.pool().map(|pool| pool.session()).ok_or_else(|| {
            SmtpError::pool(SmtpErrorKind::PoolUnavailable, "owning pool no longer exists")
        })
    }

    /// Returns the owning pool, if it is still alive.
    pub fn pool(&self) -> Option<Arc<dyn ObjectPool<T>>> {
        self.pool.upgrade()
    }
}

impl<T: Transport> Drop for ClosableConnection<T> {
    fn drop(&mut self) {
        if self.inner.is_none() {
            return;
        }
        if let Err(_e) = self.close() {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_e, "Dropped connection could not be returned to its pool");
        }
    }
}

impl<T: Transport> fmt::Debug for ClosableConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosableConnection")
            .field("connection", &self.inner)
            .field("pool_alive", &(self.pool.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{simple_message, MockTransport, RecordingPool};

    fn lease(pool: &Arc<RecordingPool<MockTransport>>, transport: MockTransport) -> ClosableConnection<MockTransport> {
        let pool: Arc<dyn ObjectPool<MockTransport>> = pool.clone();
        ClosableConnection::new(Connection::new(transport), Arc::downgrade(&pool))
    }

    #[tokio::test]
    async fn test_rset_disable_is_applied_once() {
        let pool = RecordingPool::new();
        let transport = MockTransport::new();
        let mut connection = lease(&pool, transport.clone());

        connection.send_message(&mut simple_message()).await.unwrap();
        assert!(transport.rset_calls().is_empty());

        connection.set_rset(true).unwrap();
        connection.send_message(&mut simple_message()).await.unwrap();
        connection.set_rset(false).unwrap();
        connection.send_message(&mut simple_message()).await.unwrap();
        connection.send_message(&mut simple_message()).await.unwrap();

        assert_eq!(transport.rset_calls(), vec![true, false]);
    }

    #[tokio::test]
    async fn test_rset_unsupported_fails_before_transmission() {
        let pool = RecordingPool::new();
        let transport = MockTransport::new().without_rset_support();
        let mut connection = lease(&pool, transport.clone());

        connection.set_rset(true).unwrap();
        let err = connection.send_message(&mut simple_message()).await.unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::ExtensionNotSupported);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_drop_returns_connection() {
        let pool = RecordingPool::new();
        {
            let _connection = lease(&pool, MockTransport::new());
        }
        assert_eq!(pool.returned_count(), 1);
    }

    #[tokio::test]
    async fn test_close_without_pool() {
        let pool = RecordingPool::new();
        let mut connection = lease(&pool, MockTransport::new());
        drop(pool);

        let err = connection.close().unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::PoolUnavailable);
        assert!(connection.is_released());
        assert!(connection.session().is_err());
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let pool = RecordingPool::new();
        let mut connection = lease(&pool, MockTransport::new());
        connection.close().unwrap();

        assert_eq!(connection.set_rset(true).unwrap_err().kind(), SmtpErrorKind::ConnectionReleased);
        assert_eq!(connection.transport().unwrap_err().kind(), SmtpErrorKind::ConnectionReleased);
        assert!(!connection.is_connected().await);

        let mut batch = vec![simple_message()];
        match connection.send_messages(&mut batch).await {
            Err(MailSendError::NotAttempted(e)) => {
                assert_eq!(e.kind(), SmtpErrorKind::ConnectionReleased)
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(connection.session().is_ok());
    }
}
