//! Transport delivery events and listener bookkeeping.

use std::fmt;
use std::sync::Arc;

use crate::message::Address;

/// Outcome reported to listeners after a transport send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEventKind {
    /// Every recipient accepted the message.
    Delivered,
    /// The message was not delivered to anyone.
    NotDelivered,
    /// Some recipients accepted the message, others rejected it.
    PartiallyDelivered,
}

/// Details of one send attempt.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    /// Outcome of the attempt.
    pub kind: TransportEventKind,
    /// `Message-ID` of the message as transmitted.
    pub message_id: Option<String>,
    /// Recipients the message was delivered to.
    pub valid_sent: Vec<Address>,
    /// Accepted recipients the message was not delivered to.
    pub valid_unsent: Vec<Address>,
    /// Recipients the server rejected.
    pub invalid: Vec<Address>,
}

impl TransportEvent {
    /// Creates an event with empty address lists.
    pub fn new(kind: TransportEventKind, message_id: Option<String>) -> Self {
        Self {
            kind,
            message_id,
            valid_sent: Vec::new(),
            valid_unsent: Vec::new(),
            invalid: Vec::new(),
        }
    }
}

/// Observer of transport send outcomes.
///
/// Every callback has an empty default so listeners only implement what
/// they care about.
pub trait TransportListener: Send + Sync {
    /// Called after a message was delivered to every recipient.
    fn message_delivered(&self, _event: &TransportEvent) {}

    /// Called after a message could not be delivered.
    fn message_not_delivered(&self, _event: &TransportEvent) {}

    /// Called after a message reached only part of its recipients.
    fn message_partially_delivered(&self, _event: &TransportEvent) {}
}

/// Ordered set of listeners keyed by `Arc` identity.
///
/// Adding the same listener twice registers it twice; removal drops the
/// first occurrence only.
#[derive(Default, Clone)]
pub struct ListenerRegistry {
    listeners: Vec<Arc<dyn TransportListener>>,
}

impl ListenerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn add(&mut self, listener: Arc<dyn TransportListener>) {
        self.listeners.push(listener);
    }

    /// Unregisters the first occurrence of `listener`. Returns true if found.
    pub fn remove(&mut self, listener: &Arc<dyn TransportListener>) -> bool {
        match self.listeners.iter().position(|l| Arc::ptr_eq(l, listener)) {
            Some(pos) => {
                self.listeners.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Returns true if `listener` is registered at least once.
    pub fn contains(&self, listener: &Arc<dyn TransportListener>) -> bool {
        self.listeners.iter().any(|l| Arc::ptr_eq(l, listener))
    }

    /// Removes every listener.
    pub fn clear(&mut self) {
        self.listeners.clear();
    }

    /// Returns the number of registrations.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Iterates over registrations in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn TransportListener>> {
        self.listeners.iter()
    }

    /// Dispatches `event` to every registered listener.
    pub fn notify(&self, event: &TransportEvent) {
        for listener in &self.listeners {
            match event.kind {
                TransportEventKind::Delivered => listener.message_delivered(event),
                TransportEventKind::NotDelivered => listener.message_not_delivered(event),
                TransportEventKind::PartiallyDelivered => {
                    listener.message_partially_delivered(event)
                }
            }
        }
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        delivered: AtomicUsize,
        failed: AtomicUsize,
    }

    impl TransportListener for Counter {
        fn message_delivered(&self, _event: &TransportEvent) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }

        fn message_not_delivered(&self, _event: &TransportEvent) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_identity_and_first_occurrence_removal() {
        let a: Arc<dyn TransportListener> = Arc::new(Counter::default());
        let b: Arc<dyn TransportListener> = Arc::new(Counter::default());
        let mut registry = ListenerRegistry::new();

        registry.add(a.clone());
        registry.add(a.clone());
        assert!(registry.contains(&a));
        assert!(!registry.contains(&b));
        assert!(!registry.remove(&b));

        assert!(registry.remove(&a));
        assert!(registry.contains(&a));
        assert!(registry.remove(&a));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_notify_dispatches_by_kind() {
        let counter = Arc::new(Counter::default());
        let mut registry = ListenerRegistry::new();
        registry.add(counter.clone());

        registry.notify(&TransportEvent::new(TransportEventKind::Delivered, None));
        registry.notify(&TransportEvent::new(TransportEventKind::NotDelivered, None));
        registry.notify(&TransportEvent::new(TransportEventKind::PartiallyDelivered, None));

        assert_eq!(counter.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(counter.failed.load(Ordering::SeqCst), 1);
    }
}
