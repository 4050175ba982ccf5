//! Counters for pooled sends.
//!
//! One `SmtpMetrics` is shared by a pool and every connection it creates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Send and pool counters.
#[derive(Debug, Default)]
pub struct SmtpMetrics {
    /// Messages accepted by the transport.
    pub messages_sent: AtomicU64,
    /// Messages the transport failed to send.
    pub messages_failed: AtomicU64,
    /// Batches where every message was sent.
    pub batches_sent: AtomicU64,
    /// Batches with at least one failed message.
    pub batches_failed: AtomicU64,
    /// Transports opened by a pool.
    pub connections_created: AtomicU64,
    /// Connections handed out to callers.
    pub connections_leased: AtomicU64,
    /// Connections given back by callers.
    pub connections_returned: AtomicU64,
    /// Connections discarded by pool policy.
    pub connections_destroyed: AtomicU64,
    /// Cumulative transport time spent in sends, in microseconds.
    pub send_time_us: AtomicU64,
}

impl SmtpMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of a single send.
    pub fn record_send(&self, success: bool, duration: Duration) {
        if success {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.messages_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.send_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Records the outcome of a batch.
    pub fn record_batch(&self, failures: usize) {
        if failures == 0 {
            self.batches_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.batches_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a newly created connection.
    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a lease.
    pub fn record_connection_leased(&self) {
        self.connections_leased.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a return.
    pub fn record_connection_returned(&self) {
        self.connections_returned.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a discarded connection.
    pub fn record_connection_destroyed(&self) {
        self.connections_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_leased: self.connections_leased.load(Ordering::Relaxed),
            connections_returned: self.connections_returned.load(Ordering::Relaxed),
            connections_destroyed: self.connections_destroyed.load(Ordering::Relaxed),
            send_time: Duration::from_micros(self.send_time_us.load(Ordering::Relaxed)),
        }
    }

    /// Resets all metrics.
    pub fn reset(&self) {
        for counter in [
            &self.messages_sent,
            &self.messages_failed,
            &self.batches_sent,
            &self.batches_failed,
            &self.connections_created,
            &self.connections_leased,
            &self.connections_returned,
            &self.connections_destroyed,
            &self.send_time_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// Messages accepted by the transport.
    pub messages_sent: u64,
    /// Messages the transport failed to send.
    pub messages_failed: u64,
    /// Batches where every message was sent.
    pub batches_sent: u64,
    /// Batches with at least one failed message.
    pub batches_failed: u64,
    /// Transports opened by a pool.
    pub connections_created: u64,
    /// Connections handed out to callers.
    pub connections_leased: u64,
    /// Connections given back by callers.
    pub connections_returned: u64,
    /// Connections discarded by pool policy.
    pub connections_destroyed: u64,
    /// Cumulative transport time spent in sends.
    pub send_time: Duration,
}

impl MetricsSnapshot {
    /// Returns the message success rate.
    pub fn success_rate(&self) -> f64 {
        let total = self.messages_sent + self.messages_failed;
        if total == 0 {
            1.0
        } else {
            self.messages_sent as f64 / total as f64
        }
    }

    /// Returns the average transport time per send.
    pub fn average_send_time(&self) -> Duration {
        let total = self.messages_sent + self.messages_failed;
        if total == 0 {
            Duration::ZERO
        } else {
            self.send_time / total as u32
        }
    }

    /// Returns leases not yet returned.
    pub fn outstanding_leases(&self) -> u64 {
        self.connections_leased
            .saturating_sub(self.connections_returned)
    }
}

/// Timer for measuring operation duration.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    /// Creates and starts a new timer.
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Returns the elapsed time.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stops the timer and returns the duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();

        #[cfg(feature = "tracing")]
        tracing::trace!(
            timer = self.name,
            duration_ms = elapsed.as_millis() as u64,
            "Timer stopped"
        );

        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_snapshot() {
        let metrics = SmtpMetrics::new();
        metrics.record_send(true, Duration::from_millis(10));
        metrics.record_send(true, Duration::from_millis(20));
        metrics.record_send(false, Duration::from_millis(30));
        metrics.record_batch(1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.messages_failed, 1);
        assert_eq!(snapshot.batches_failed, 1);
        assert_eq!(snapshot.average_send_time(), Duration::from_millis(20));
        assert!((snapshot.success_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_outstanding_leases_and_reset() {
        let metrics = SmtpMetrics::new();
        metrics.record_connection_leased();
        metrics.record_connection_leased();
        metrics.record_connection_returned();
        assert_eq!(metrics.snapshot().outstanding_leases(), 1);

        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_leased, 0);
        assert_eq!(snapshot.success_rate(), 1.0);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start("test");
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.elapsed() >= Duration::from_millis(5));
        assert!(timer.stop() >= Duration::from_millis(5));
    }
}
