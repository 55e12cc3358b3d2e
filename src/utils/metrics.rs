//! Observability and Metrics
//!
//! Counters for the gateway's framing, packet and session activity.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Global metrics collector for gateway operations
#[derive(Debug)]
pub struct Metrics {
    /// Frames written toward the serial link
    pub frames_encoded: AtomicU64,
    /// Frames that passed integrity checks
    pub frames_decoded: AtomicU64,
    /// Frames discarded for bad CRC or framing
    pub frames_rejected: AtomicU64,
    /// IPv6 packets handed to the outbound transport
    pub packets_sent: AtomicU64,
    /// Total bytes handed to the outbound transport
    pub bytes_sent: AtomicU64,
    /// Outbound sends that failed
    pub send_failures: AtomicU64,
    /// Inbound packets that failed to parse
    pub inbound_rejected: AtomicU64,
    /// Replies delivered to a pending request
    pub replies_matched: AtomicU64,
    /// Replies dropped for lack of a pending request
    pub replies_unmatched: AtomicU64,
    /// Completed registrations
    pub registrations: AtomicU64,
    /// Telemetry reports sent
    pub reports_sent: AtomicU64,
    /// Telemetry cycles skipped for lack of neighbor data
    pub reports_skipped: AtomicU64,
    /// Requests abandoned after their reply timer expired
    pub reply_timeouts: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            frames_encoded: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
            frames_rejected: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            inbound_rejected: AtomicU64::new(0),
            replies_matched: AtomicU64::new(0),
            replies_unmatched: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
            reports_sent: AtomicU64::new(0),
            reports_skipped: AtomicU64::new(0),
            reply_timeouts: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn frame_encoded(&self) {
        self.frames_encoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet handed to the transport
    pub fn packet_sent(&self, byte_count: u64) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inbound_rejected(&self) {
        self.inbound_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_matched(&self) {
        self.replies_matched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_unmatched(&self) {
        self.replies_unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn registration(&self) {
        self.registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report_sent(&self) {
        self.reports_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report_skipped(&self) {
        self.reports_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reply_timeout(&self) {
        self.reply_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            inbound_rejected: self.inbound_rejected.load(Ordering::Relaxed),
            replies_matched: self.replies_matched.load(Ordering::Relaxed),
            replies_unmatched: self.replies_unmatched.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            reports_sent: self.reports_sent.load(Ordering::Relaxed),
            reports_skipped: self.reports_skipped.load(Ordering::Relaxed),
            reply_timeouts: self.reply_timeouts.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            frames_encoded = snapshot.frames_encoded,
            frames_decoded = snapshot.frames_decoded,
            frames_rejected = snapshot.frames_rejected,
            packets_sent = snapshot.packets_sent,
            bytes_sent = snapshot.bytes_sent,
            send_failures = snapshot.send_failures,
            inbound_rejected = snapshot.inbound_rejected,
            replies_matched = snapshot.replies_matched,
            replies_unmatched = snapshot.replies_unmatched,
            registrations = snapshot.registrations,
            reports_sent = snapshot.reports_sent,
            reports_skipped = snapshot.reports_skipped,
            reply_timeouts = snapshot.reply_timeouts,
            uptime_seconds = snapshot.uptime_seconds,
            "Gateway metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub frames_encoded: u64,
    pub frames_decoded: u64,
    pub frames_rejected: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub inbound_rejected: u64,
    pub replies_matched: u64,
    pub replies_unmatched: u64,
    pub registrations: u64,
    pub reports_sent: u64,
    pub reports_skipped: u64,
    pub reply_timeouts: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Get the global metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}
