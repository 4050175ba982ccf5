//! Tests for the connection pool.

use integrations_smtp_pool::events::TransportListener;
use integrations_smtp_pool::mocks::{simple_message, test_config, MockTransportFactory, RecordingListener};
use integrations_smtp_pool::{
    ObjectPool, PoolConfig, SmtpConfig, SmtpConnectionPool, SmtpErrorKind, Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn config_with(pool: PoolConfig) -> SmtpConfig {
    let mut config = test_config();
    config.pool = pool;
    config
}

#[tokio::test]
async fn test_borrow_creates_connections_up_to_limit() {
    let factory = MockTransportFactory::new();
    let pool = SmtpConnectionPool::new(factory.clone(), test_config()).unwrap();

    let _a = assert_ok!(pool.borrow_object().await);
    let _b = assert_ok!(pool.borrow_object().await);
    assert_eq!(factory.created(), 2);
    assert_eq!(pool.status().live, 2);

    let err = assert_err!(pool.borrow_object().await);
    assert_eq!(err.kind(), SmtpErrorKind::AcquireTimeout);
    assert_eq!(factory.created(), 2);
}

#[tokio::test]
async fn test_close_makes_connection_idle_without_disconnecting() {
    let factory = MockTransportFactory::new();
    let pool = SmtpConnectionPool::new(factory.clone(), test_config()).unwrap();

    let mut connection = pool.borrow_object().await.unwrap();
    assert_ok!(connection.send_message(&mut simple_message()).await);
    assert_ok!(connection.close());

    let status = pool.status();
    assert_eq!(status.live, 1);
    assert_eq!(status.idle, 1);
    assert_eq!(factory.transports()[0].close_count(), 0);

    let snapshot = pool.metrics().snapshot();
    assert_eq!(snapshot.messages_sent, 1);
    assert_eq!(snapshot.outstanding_leases(), 0);
}

#[tokio::test]
async fn test_dropped_lease_is_returned() {
    let pool = SmtpConnectionPool::new(MockTransportFactory::new(), test_config()).unwrap();

    {
        let _connection = pool.borrow_object().await.unwrap();
        assert_eq!(pool.status().idle, 0);
    }

    assert_eq!(pool.status().idle, 1);
    assert_eq!(pool.metrics().snapshot().connections_returned, 1);
}

#[tokio::test]
async fn test_waiting_borrower_gets_returned_connection() {
    let config = config_with(PoolConfig {
        max_connections: 1,
        acquire_timeout: Duration::from_secs(2),
        ..Default::default()
    });
    let factory = MockTransportFactory::new();
    let pool = SmtpConnectionPool::new(factory.clone(), config).unwrap();

    let mut first = pool.borrow_object().await.unwrap();
    let returner = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        first.close()
    });

    let _second = assert_ok!(pool.borrow_object().await);
    assert_ok!(returner.await.unwrap());
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn test_return_clears_listeners() {
    let factory = MockTransportFactory::new();
    let pool = SmtpConnectionPool::new(factory.clone(), test_config()).unwrap();
    let listener: Arc<dyn TransportListener> = RecordingListener::new();

    let mut connection = pool.borrow_object().await.unwrap();
    connection.add_transport_listener(listener.clone()).unwrap();
    connection.close().unwrap();

    let transports = factory.transports();
    assert!(!transports[0].is_listener_registered(&listener));

    let again = pool.borrow_object().await.unwrap();
    assert!(again.listeners().unwrap().is_empty());
}

#[tokio::test]
async fn test_dead_idle_connection_is_replaced() {
    let factory = MockTransportFactory::new();
    let pool = SmtpConnectionPool::new(factory.clone(), test_config()).unwrap();

    pool.borrow_object().await.unwrap().close().unwrap();
    factory.transports()[0].disconnect();

    let mut connection = pool.borrow_object().await.unwrap();
    assert!(connection.is_connected().await);

    assert_eq!(factory.created(), 2);
    assert_eq!(factory.transports()[0].close_count(), 1);
    assert_eq!(pool.status().live, 1);
    assert_eq!(pool.metrics().snapshot().connections_destroyed, 1);
}

#[tokio::test]
async fn test_validation_gives_up_after_max_attempts() {
    let config = config_with(PoolConfig {
        max_connections: 2,
        max_borrow_attempts: 1,
        ..Default::default()
    });
    let factory = MockTransportFactory::new();
    let pool = SmtpConnectionPool::new(factory.clone(), config).unwrap();

    let mut a = pool.borrow_object().await.unwrap();
    let mut b = pool.borrow_object().await.unwrap();
    a.close().unwrap();
    b.close().unwrap();
    for transport in factory.transports() {
        transport.disconnect();
    }

    let err = assert_err!(pool.borrow_object().await);
    assert_eq!(err.kind(), SmtpErrorKind::ConnectionUnhealthy);
}

#[tokio::test]
async fn test_validation_can_be_disabled() {
    let config = config_with(PoolConfig {
        test_on_borrow: false,
        ..Default::default()
    });
    let factory = MockTransportFactory::new();
    let pool = SmtpConnectionPool::new(factory.clone(), config).unwrap();

    pool.borrow_object().await.unwrap().close().unwrap();
    let _connection = pool.borrow_object().await.unwrap();

    assert_eq!(factory.transports()[0].probe_count(), 0);
}

#[tokio::test]
async fn test_shutdown_closes_idle_and_refuses_borrows() {
    let factory = MockTransportFactory::new();
    let pool = SmtpConnectionPool::new(factory.clone(), test_config()).unwrap();

    let mut idle = pool.borrow_object().await.unwrap();
    let mut leased = pool.borrow_object().await.unwrap();
    idle.close().unwrap();

    pool.shutdown().await;
    assert!(pool.is_closed());
    assert_eq!(factory.transports()[0].close_count(), 1);

    let err = assert_err!(pool.borrow_object().await);
    assert_eq!(err.kind(), SmtpErrorKind::PoolClosed);

    assert_ok!(leased.close());
    assert_eq!(pool.status().live, 0);
    assert_eq!(pool.metrics().snapshot().connections_destroyed, 2);
}

#[tokio::test]
async fn test_lease_sees_pool_session() {
    let pool = SmtpConnectionPool::new(MockTransportFactory::new(), test_config()).unwrap();
    let connection = pool.borrow_object().await.unwrap();

    let session = connection.session().unwrap();
    assert!(session.same_as(&pool.session()));
    assert_eq!(session.config().host, "smtp.test.local");
}

#[tokio::test]
async fn test_lease_outliving_pool() {
    let pool = SmtpConnectionPool::new(MockTransportFactory::new(), test_config()).unwrap();
    let mut connection = pool.borrow_object().await.unwrap();
    drop(pool);

    assert!(connection.pool().is_none());
    let err = assert_err!(connection.close());
    assert_eq!(err.kind(), SmtpErrorKind::PoolUnavailable);
}

#[test]
fn test_invalid_pool_config_rejected() {
    let config = config_with(PoolConfig {
        max_connections: 0,
        ..Default::default()
    });
    assert!(SmtpConnectionPool::new(MockTransportFactory::new(), config).is_err());
}
