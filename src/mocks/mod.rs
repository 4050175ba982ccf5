//! Mock implementations for testing.
//!
//! Test doubles for the transport, transport factory, pool and listener
//! seams. Clones of a mock share their recorder, so a test can keep a handle
//! while the code under test owns another.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{PoolConfig, Session, SmtpConfig, TlsMode};
use crate::connection::Connection;
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::events::{ListenerRegistry, TransportEvent, TransportEventKind, TransportListener};
use crate::message::{Address, MimeMessage};
use crate::pool::{ObjectPool, TransportFactory};
use crate::transport::Transport;

/// A message as the mock transport received it.
#[derive(Debug, Clone)]
pub struct SentMessage {
    /// Message snapshot at transmission time.
    pub message: MimeMessage,
    /// Envelope recipients.
    pub recipients: Vec<Address>,
    /// RSET keep-alive setting in effect during the send.
    pub use_rset: bool,
}

#[derive(Debug)]
struct MockState {
    sent: Vec<SentMessage>,
    rset_calls: Vec<bool>,
    use_rset: bool,
    rset_supported: bool,
    failing_recipients: Vec<String>,
    fail_next: VecDeque<SmtpError>,
    connected: bool,
    probes: usize,
    closes: usize,
    listeners: ListenerRegistry,
}

/// Mock transport recording every interaction.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Creates a connected mock that accepts every message.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                sent: Vec::new(),
                rset_calls: Vec::new(),
                use_rset: false,
                rset_supported: true,
                failing_recipients: Vec::new(),
                fail_next: VecDeque::new(),
                connected: true,
                probes: 0,
                closes: 0,
                listeners: ListenerRegistry::new(),
            })),
        }
    }

    /// Makes `set_use_rset` fail like a transport without the extension.
    pub fn without_rset_support(self) -> Self {
        self.state.lock().unwrap().rset_supported = false;
        self
    }

    /// Rejects every message addressed to `email`.
    pub fn fail_recipient(&self, email: &str) -> &Self {
        self.state
            .lock()
            .unwrap()
            .failing_recipients
            .push(email.to_ascii_lowercase());
        self
    }

    /// Fails the next send with `error`.
    pub fn fail_next_with(&self, error: SmtpError) -> &Self {
        self.state.lock().unwrap().fail_next.push_back(error);
        self
    }

    /// Makes liveness probes fail from now on.
    pub fn disconnect(&self) {
        self.state.lock().unwrap().connected = false;
    }

    /// Returns every send attempt, in order.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Returns the values passed to `set_use_rset`, in order.
    pub fn rset_calls(&self) -> Vec<bool> {
        self.state.lock().unwrap().rset_calls.clone()
    }

    /// Returns the number of liveness probes.
    pub fn probe_count(&self) -> usize {
        self.state.lock().unwrap().probes
    }

    /// Returns how often the session was closed.
    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.state.lock().unwrap().listeners.len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn is_connected(&mut self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.probes += 1;
        state.connected
    }

    async fn send_message(
        &mut self,
        message: &MimeMessage,
        recipients: &[Address],
    ) -> SmtpResult<()> {
        let (result, listeners) = {
            let mut state = self.state.lock().unwrap();
            let use_rset = state.use_rset;
            state.sent.push(SentMessage {
                message: message.clone(),
                recipients: recipients.to_vec(),
                use_rset,
            });

            let invalid: Vec<Address> = recipients
                .iter()
                .filter(|r| state.failing_recipients.contains(&r.email().to_ascii_lowercase()))
                .cloned()
                .collect();

            let result = if !invalid.is_empty() {
                Err((
                    SmtpError::from_smtp_response(550, "Mailbox unavailable"),
                    invalid,
                ))
            } else if let Some(error) = state.fail_next.pop_front() {
                Err((error, Vec::new()))
            } else {
                Ok(())
            };
            (result, state.listeners.clone())
        };

        let message_id = message.message_id().map(str::to_owned);
        match result {
            Ok(()) => {
                let mut event = TransportEvent::new(TransportEventKind::Delivered, message_id);
                event.valid_sent = recipients.to_vec();
                listeners.notify(&event);
                Ok(())
            }
            Err((error, invalid)) => {
                let mut event = TransportEvent::new(TransportEventKind::NotDelivered, message_id);
                event.valid_unsent = recipients
                    .iter()
                    .filter(|r| !invalid.contains(*r))
                    .cloned()
                    .collect();
                event.invalid = invalid;
                listeners.notify(&event);
                Err(error)
            }
        }
    }

    fn add_transport_listener(&mut self, listener: Arc<dyn TransportListener>) {
        self.state.lock().unwrap().listeners.add(listener);
    }

    fn remove_transport_listener(&mut self, listener: &Arc<dyn TransportListener>) {
        self.state.lock().unwrap().listeners.remove(listener);
    }

    fn is_listener_registered(&self, listener: &Arc<dyn TransportListener>) -> bool {
        self.state.lock().unwrap().listeners.contains(listener)
    }

    fn set_use_rset(&mut self, use_rset: bool) -> SmtpResult<()> {
        let mut state = self.state.lock().unwrap();
        if !state.rset_supported {
            return Err(SmtpError::new(
                SmtpErrorKind::ExtensionNotSupported,
                "mock transport without RSET support",
            ));
        }
        state.rset_calls.push(use_rset);
        state.use_rset = use_rset;
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.closes += 1;
        state.connected = false;
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    created: Vec<MockTransport>,
    fail_next: bool,
    delay_next: Option<Duration>,
}

/// Factory handing out [`MockTransport`]s.
#[derive(Debug, Clone, Default)]
pub struct MockTransportFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl MockTransportFactory {
    /// Creates a new factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `create` call.
    pub fn fail_next_create(&self) {
        self.state.lock().unwrap().fail_next = true;
    }

    /// Delays the next `create` call, successful or not.
    pub fn delay_next_create(&self, delay: Duration) {
        self.state.lock().unwrap().delay_next = Some(delay);
    }

    /// Returns the number of transports created.
    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created.len()
    }

    /// Returns handles to every transport created, in order.
    pub fn transports(&self) -> Vec<MockTransport> {
        self.state.lock().unwrap().created.clone()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    type Transport = MockTransport;

    async fn create(&self, _session: &Session) -> SmtpResult<MockTransport> {
        let delay = self.state.lock().unwrap().delay_next.take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next) {
            return Err(SmtpError::connection("mock connect failure"));
        }
        let transport = MockTransport::new();
        state.created.push(transport.clone());
        Ok(transport)
    }
}

/// Pool that keeps every returned connection for inspection.
pub struct RecordingPool<T: Transport> {
    session: Session,
    returned: Mutex<Vec<Connection<T>>>,
}

impl<T: Transport> RecordingPool<T> {
    /// Creates a pool over [`test_config`].
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            session: Session::new(test_config()).expect("test configuration is valid"),
            returned: Mutex::new(Vec::new()),
        })
    }

    /// Returns how many connections were returned.
    pub fn returned_count(&self) -> usize {
        self.returned.lock().unwrap().len()
    }

    /// Takes the returned connections.
    pub fn take_returned(&self) -> Vec<Connection<T>> {
        std::mem::take(&mut *self.returned.lock().unwrap())
    }
}

impl<T: Transport> ObjectPool<T> for RecordingPool<T> {
    fn return_object(&self, connection: Connection<T>) -> SmtpResult<()> {
        self.returned.lock().unwrap().push(connection);
        Ok(())
    }

    fn session(&self) -> Session {
        self.session.clone()
    }
}

/// Listener recording every event it receives.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<TransportEvent>>,
}

impl RecordingListener {
    /// Creates a new listener.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the received events, in order.
    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Returns how many events of `kind` were received.
    pub fn count(&self, kind: TransportEventKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

impl TransportListener for RecordingListener {
    fn message_delivered(&self, event: &TransportEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn message_not_delivered(&self, event: &TransportEvent) {
        self.events.lock().unwrap().push(event.clone());
    }

    fn message_partially_delivered(&self, event: &TransportEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Configuration pointing at an unreachable test relay.
pub fn test_config() -> SmtpConfig {
    SmtpConfig::builder()
        .host("smtp.test.local")
        .port(2525)
        .tls_mode(TlsMode::None)
        .pool(PoolConfig {
            max_connections: 2,
            acquire_timeout: Duration::from_millis(100),
            test_on_borrow: true,
            max_borrow_attempts: 3,
        })
        .build()
        .expect("test configuration is valid")
}

/// Creates a message from `sender@example.com` to `to`.
pub fn message_to(to: &str) -> MimeMessage {
    MimeMessage::builder()
        .from("Sender <sender@example.com>")
        .and_then(|b| b.to(to))
        .map(|b| b.subject("Test Email").body("This is a test email."))
        .and_then(|b| b.build())
        .expect("fixture addresses are valid")
}

/// Creates a message to `recipient@example.com`.
pub fn simple_message() -> MimeMessage {
    message_to("recipient@example.com")
}
