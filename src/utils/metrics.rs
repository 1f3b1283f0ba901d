//! Observability and Metrics
//!
//! Per-connection counters for frames, commands and the decode cache.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for one connection
#[derive(Debug)]
pub struct Metrics {
    /// Frames handed to the transport
    pub frames_sent: AtomicU64,
    /// Frames received from the transport
    pub frames_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Inbound frames that failed to decode into a packet
    pub bad_frames: AtomicU64,
    /// Packets with no bound handler
    pub unhandled_packets: AtomicU64,
    /// Handler invocations that returned an error
    pub handler_errors: AtomicU64,
    /// Outbound packets dropped because the session was not running
    pub dropped_sends: AtomicU64,
    /// Inbound events discarded because the application queue was full
    pub dropped_inbound: AtomicU64,
    /// Commands issued
    pub commands_issued: AtomicU64,
    /// Commands resolved with an ok status
    pub commands_succeeded: AtomicU64,
    /// Commands resolved with a failure
    pub commands_failed: AtomicU64,
    /// Commands whose caller stopped waiting
    pub commands_timed_out: AtomicU64,
    /// Responses for unknown or expired command ids
    pub orphan_responses: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bad_frames: AtomicU64::new(0),
            unhandled_packets: AtomicU64::new(0),
            handler_errors: AtomicU64::new(0),
            dropped_sends: AtomicU64::new(0),
            dropped_inbound: AtomicU64::new(0),
            commands_issued: AtomicU64::new(0),
            commands_succeeded: AtomicU64::new(0),
            commands_failed: AtomicU64::new(0),
            commands_timed_out: AtomicU64::new(0),
            orphan_responses: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a frame sent
    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a frame received
    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn bad_frame(&self) {
        self.bad_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unhandled_packet(&self) {
        self.unhandled_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped_send(&self) {
        self.dropped_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inbound_dropped(&self) {
        self.dropped_inbound.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_issued(&self) {
        self.commands_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_succeeded(&self) {
        self.commands_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_failed(&self) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_timed_out(&self) {
        self.commands_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn orphan_response(&self) {
        self.orphan_responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bad_frames: self.bad_frames.load(Ordering::Relaxed),
            unhandled_packets: self.unhandled_packets.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            dropped_sends: self.dropped_sends.load(Ordering::Relaxed),
            dropped_inbound: self.dropped_inbound.load(Ordering::Relaxed),
            commands_issued: self.commands_issued.load(Ordering::Relaxed),
            commands_succeeded: self.commands_succeeded.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            commands_timed_out: self.commands_timed_out.load(Ordering::Relaxed),
            orphan_responses: self.orphan_responses.load(Ordering::Relaxed),
            decode_cache_hits: 0,
            decode_cache_misses: 0,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        self.snapshot().log();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bad_frames: u64,
    pub unhandled_packets: u64,
    pub handler_errors: u64,
    pub dropped_sends: u64,
    pub dropped_inbound: u64,
    pub commands_issued: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    pub commands_timed_out: u64,
    pub orphan_responses: u64,
    pub decode_cache_hits: u64,
    pub decode_cache_misses: u64,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    pub fn log(&self) {
        info!(
            frames_sent = self.frames_sent,
            frames_received = self.frames_received,
            bytes_sent = self.bytes_sent,
            bytes_received = self.bytes_received,
            bad_frames = self.bad_frames,
            unhandled_packets = self.unhandled_packets,
            handler_errors = self.handler_errors,
            dropped_sends = self.dropped_sends,
            dropped_inbound = self.dropped_inbound,
            commands_issued = self.commands_issued,
            commands_succeeded = self.commands_succeeded,
            commands_failed = self.commands_failed,
            commands_timed_out = self.commands_timed_out,
            orphan_responses = self.orphan_responses,
            decode_cache_hits = self.decode_cache_hits,
            decode_cache_misses = self.decode_cache_misses,
            uptime_seconds = self.uptime_seconds,
            "Connection metrics snapshot"
        );
    }
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}
