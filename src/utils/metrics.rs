//! Observability and Metrics
//!
//! This module provides metrics collection and observability features
//! for monitoring protocol performance and health.
//!
//! Uses atomic counters for thread-safe metrics collection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector shared by connections and listeners
#[derive(Debug)]
pub struct Metrics {
    /// Total connections established
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Total bulks sent
    pub bulks_sent: AtomicU64,
    /// Total bulks received
    pub bulks_received: AtomicU64,
    /// Total bytes written to sockets
    pub bytes_sent: AtomicU64,
    /// Total bytes read from sockets
    pub bytes_received: AtomicU64,
    /// Heartbeats (`alive`/`ping`) sent
    pub heartbeats_sent: AtomicU64,
    /// Heartbeats (`alive`/`ping`) received
    pub heartbeats_received: AtomicU64,
    /// Responses that referenced an unknown request id
    pub correlation_misses: AtomicU64,
    /// Data requests resolved from the cache without touching the wire
    pub cache_hits: AtomicU64,
    /// Connections closed by lease expiry
    pub lease_expiries: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            bulks_sent: AtomicU64::new(0),
            bulks_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            heartbeats_received: AtomicU64::new(0),
            correlation_misses: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            lease_expiries: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a new connection
    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed
    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a bulk written to the socket
    pub fn bulk_sent(&self, byte_count: u64) {
        self.bulks_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a bulk read off the socket
    pub fn bulk_received(&self, byte_count: u64) {
        self.bulks_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    /// Record a heartbeat sent
    pub fn heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a heartbeat received
    pub fn heartbeat_received(&self) {
        self.heartbeats_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a response with no matching outstanding request
    pub fn correlation_miss(&self) {
        self.correlation_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request served from the cache
    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection closed because its lease expired
    pub fn lease_expired(&self) {
        self.lease_expiries.fetch_add(1, Ordering::Relaxed);
    }

    /// Uptime since this collector was created
    pub fn uptime(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    /// Take a point-in-time snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            bulks_sent: self.bulks_sent.load(Ordering::Relaxed),
            bulks_received: self.bulks_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_received: self.heartbeats_received.load(Ordering::Relaxed),
            correlation_misses: self.correlation_misses.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            lease_expiries: self.lease_expiries.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log a summary of the current counters at info level
    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            connections_active = s.connections_active,
            connections_total = s.connections_total,
            bulks_sent = s.bulks_sent,
            bulks_received = s.bulks_received,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            correlation_misses = s.correlation_misses,
            uptime_secs = s.uptime_secs,
            "protocol metrics"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub bulks_sent: u64,
    pub bulks_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub correlation_misses: u64,
    pub cache_hits: u64,
    pub lease_expiries: u64,
    pub uptime_secs: u64,
}
