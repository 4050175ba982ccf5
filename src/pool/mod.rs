//! Connection pooling.
//!
//! [`ObjectPool`] is the narrow seam a leased connection sees: it can only
//! give itself back and look up the session. [`SmtpConnectionPool`] is the
//! default implementation, keeping idle connections in a
//! `deadpool::unmanaged` pool and opening new transports through a
//! [`TransportFactory`].

use async_trait::async_trait;
use deadpool::unmanaged::{Object, Pool};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::auth::Credentials;
use crate::config::{Session, SmtpConfig};
use crate::connection::{ClosableConnection, Connection};
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::observability::SmtpMetrics;
use crate::transport::{TcpTransport, Transport};

/// The pool operations a leased connection relies on.
pub trait ObjectPool<T: Transport>: Send + Sync {
    /// Takes back a connection that was leased from this pool.
    fn return_object(&self, connection: Connection<T>) -> SmtpResult<()>;

    /// Returns the session transports of this pool are opened with.
    fn session(&self) -> Session;
}

/// Opens transports for a pool.
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    /// Transport type produced.
    type Transport: Transport;

    /// Opens a new, ready to use transport.
    async fn create(&self, session: &Session) -> SmtpResult<Self::Transport>;
}

/// Opens [`TcpTransport`]s.
#[derive(Debug, Default, Clone)]
pub struct TcpTransportFactory {
    credentials: Option<Credentials>,
}

impl TcpTransportFactory {
    /// Creates a factory using the credentials of the session configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Authenticates with `credentials` instead of the configured ones.
    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            credentials: Some(credentials),
        }
    }
}

#[async_trait]
impl TransportFactory for TcpTransportFactory {
    type Transport = TcpTransport;

    async fn create(&self, session: &Session) -> SmtpResult<TcpTransport> {
        TcpTransport::connect(session.config(), self.credentials.as_ref()).await
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Upper bound on live connections.
    pub max_connections: usize,
    /// Connections that exist, idle or leased.
    pub live: usize,
    /// Connections waiting to be leased.
    pub idle: usize,
}

/// Bounded pool of SMTP connections.
pub struct SmtpConnectionPool<F: TransportFactory> {
    factory: F,
    session: Session,
    idle: Pool<Connection<F::Transport>>,
    live: AtomicUsize,
    closed: AtomicBool,
    metrics: Arc<SmtpMetrics>,
}

/// How often a waiting borrower re-checks for a free slot. Slots freed by
/// eviction or a failed connect do not wake `Pool::get`.
const SLOT_RECHECK_INTERVAL: Duration = Duration::from_millis(25);

/// Outcome of waiting for capacity.
enum Acquired<T: Transport> {
    Idle(Connection<T>),
    Slot,
}

/// Pool of [`TcpTransport`] connections.
pub type SmtpPool = SmtpConnectionPool<TcpTransportFactory>;

impl SmtpPool {
    /// Creates a TCP pool for `config`.
    pub fn from_config(config: SmtpConfig) -> SmtpResult<Arc<Self>> {
        Self::new(TcpTransportFactory::new(), config)
    }
}

impl<F: TransportFactory> SmtpConnectionPool<F> {
    /// Creates an empty pool. Transports are opened on demand.
    pub fn new(factory: F, config: SmtpConfig) -> SmtpResult<Arc<Self>> {
        let session = Session::new(config)?;
        let max_connections = session.config().pool.max_connections;

        Ok(Arc::new(Self {
            factory,
            session,
            idle: Pool::new(max_connections),
            live: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            metrics: Arc::new(SmtpMetrics::new()),
        }))
    }

    /// Leases a connection.
    ///
    /// Idle connections are preferred. A new transport is opened while fewer
    /// than `max_connections` exist; otherwise the call waits up to
    /// `acquire_timeout` for a return or a freed slot. With `test_on_borrow`, idle
    /// connections are probed first and discarded when dead.
    pub async fn borrow_object(self: &Arc<Self>) -> SmtpResult<ClosableConnection<F::Transport>> {
        let pool_config = &self.session.config().pool;
        let mut discarded = 0;

        loop {
            if self.is_closed() {
                return Err(SmtpError::pool(SmtpErrorKind::PoolClosed, "pool is shut down"));
            }

            let mut connection = match self.idle.try_get() {
                Ok(object) => Object::take(object),
                Err(_) if self.try_reserve() => {
                    let connection = self.create_connection().await?;
                    return Ok(self.lease(connection));
                }
                Err(_) => match self.wait_for_capacity(pool_config.acquire_timeout).await? {
                    Acquired::Idle(connection) => connection,
                    Acquired::Slot => {
                        let connection = self.create_connection().await?;
                        return Ok(self.lease(connection));
                    }
                },
            };

            if pool_config.test_on_borrow && !connection.is_connected().await {
                #[cfg(feature = "tracing")]
                tracing::debug!(connection = connection.id(), "Evicting dead connection");

                self.evict(connection).await;
                discarded += 1;
                if discarded >= pool_config.max_borrow_attempts {
                    return Err(SmtpError::pool(
                        SmtpErrorKind::ConnectionUnhealthy,
                        format!("{} pooled connections failed validation", discarded),
                    ));
                }
                continue;
            }

            return Ok(self.lease(connection));
        }
    }

    /// Returns the occupancy of the pool.
    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            max_connections: self.session.config().pool.max_connections,
            live: self.live.load(Ordering::SeqCst),
            idle: self.idle.status().size,
        }
    }

    /// Returns the metrics shared by the pool and its connections.
    pub fn metrics(&self) -> &Arc<SmtpMetrics> {
        &self.metrics
    }

    /// Returns true after `shutdown`.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes every idle connection and refuses further borrows.
    ///
    /// Connections still leased are discarded when they come back.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        while let Ok(connection) = self.idle.try_remove() {
            self.evict(connection).await;
        }
        self.idle.close();

        #[cfg(feature = "tracing")]
        tracing::info!(live = self.live.load(Ordering::SeqCst), "SMTP pool shut down");
    }

    /// Waits for a returned connection or a free slot, whichever comes first.
    async fn wait_for_capacity(&self, acquire_timeout: Duration) -> SmtpResult<Acquired<F::Transport>> {
        let deadline = Instant::now() + acquire_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SmtpError::pool(
                    SmtpErrorKind::AcquireTimeout,
                    format!("no connection available within {:?}", acquire_timeout),
                ));
            }

            match tokio::time::timeout(remaining.min(SLOT_RECHECK_INTERVAL), self.idle.get()).await {
                Ok(Ok(object)) => return Ok(Acquired::Idle(Object::take(object))),
                Ok(Err(_)) => {
                    return Err(SmtpError::pool(SmtpErrorKind::PoolClosed, "pool is shut down"))
                }
                Err(_) if self.is_closed() => {
                    return Err(SmtpError::pool(SmtpErrorKind::PoolClosed, "pool is shut down"))
                }
                Err(_) if self.try_reserve() => return Ok(Acquired::Slot),
                Err(_) => {}
            }
        }
    }

    fn try_reserve(&self) -> bool {
        let max = self.session.config().pool.max_connections;
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < max).then_some(live + 1)
            })
            .is_ok()
    }

    async fn create_connection(&self) -> SmtpResult<Connection<F::Transport>> {
        match self.factory.create(&self.session).await {
            Ok(transport) => {
                self.metrics.record_connection_created();
                let connection = Connection::new(transport).with_metrics(Arc::clone(&self.metrics));

                #[cfg(feature = "tracing")]
                tracing::debug!(connection = connection.id(), "Opened pooled connection");

                Ok(connection)
            }
            Err(e) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn lease(self: &Arc<Self>, connection: Connection<F::Transport>) -> ClosableConnection<F::Transport> {
        self.metrics.record_connection_leased();
        let pool: Arc<dyn ObjectPool<F::Transport>> = self.clone();
        ClosableConnection::new(connection, Arc::downgrade(&pool))
    }

    async fn evict(&self, mut connection: Connection<F::Transport>) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.metrics.record_connection_destroyed();
        connection.close_transport().await;
    }

    /// Discards a connection outside of an async context.
    fn destroy(&self, mut connection: Connection<F::Transport>) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.metrics.record_connection_destroyed();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { connection.close_transport().await });
        }
    }
}

impl<F: TransportFactory> ObjectPool<F::Transport> for SmtpConnectionPool<F> {
    fn return_object(&self, mut connection: Connection<F::Transport>) -> SmtpResult<()> {
        self.metrics.record_connection_returned();
        // The next borrower must not receive this caller's delivery events.
        connection.clear_listeners();

        if self.is_closed() {
            self.destroy(connection);
            return Ok(());
        }

        if let Err((connection, _e)) = self.idle.try_add(connection) {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %_e, "Could not re-idle connection, discarding");

            self.destroy(connection);
        }
        Ok(())
    }

    fn session(&self) -> Session {
        self.session.clone()
    }
}

impl<F: TransportFactory> fmt::Debug for SmtpConnectionPool<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConnectionPool")
            .field("host", &self.session.config().host)
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{test_config, MockTransportFactory};

    #[tokio::test]
    async fn test_reuses_idle_connection() {
        let factory = MockTransportFactory::new();
        let pool = SmtpConnectionPool::new(factory.clone(), test_config()).unwrap();

        let mut first = pool.borrow_object().await.unwrap();
        first.close().unwrap();
        let _second = pool.borrow_object().await.unwrap();

        assert_eq!(factory.created(), 1);
        assert_eq!(pool.status().live, 1);
    }

    #[tokio::test]
    async fn test_factory_failure_releases_slot() {
        let factory = MockTransportFactory::new();
        factory.fail_next_create();
        let pool = SmtpConnectionPool::new(factory.clone(), test_config()).unwrap();

        assert!(pool.borrow_object().await.is_err());
        assert_eq!(pool.status().live, 0);
        assert!(pool.borrow_object().await.is_ok());
    }

    #[tokio::test]
    async fn test_waiting_borrower_takes_slot_of_failed_connect() {
        let mut config = test_config();
        config.pool.max_connections = 1;
        config.pool.acquire_timeout = Duration::from_secs(5);

        let factory = MockTransportFactory::new();
        factory.fail_next_create();
        factory.delay_next_create(Duration::from_millis(100));
        let pool = SmtpConnectionPool::new(factory.clone(), config).unwrap();

        let failing = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.borrow_object().await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.status().live, 1);

        let started = Instant::now();
        let connection = pool.borrow_object().await;
        assert!(connection.is_ok());
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(failing.await.unwrap().is_err());
        assert_eq!(factory.created(), 1);
    }
}
