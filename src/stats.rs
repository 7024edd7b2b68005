//! Statistics tracking for the resolver.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters. They only ever grow, wrapping on overflow.
pub struct Stats {
    connections_opened: AtomicU64,
    connect_failures: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    queries_sent: AtomicU64,
    answers_received: AtomicU64,
    records_received: AtomicU64,
    transfers_requested: AtomicU64,
    transfers_completed: AtomicU64,
    transfers_denied: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            connections_opened: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            queries_sent: AtomicU64::new(0),
            answers_received: AtomicU64::new(0),
            records_received: AtomicU64::new(0),
            transfers_requested: AtomicU64::new(0),
            transfers_completed: AtomicU64::new(0),
            transfers_denied: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_connect(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.queries_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_bytes_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// A message passed validation.
    pub(crate) fn record_answer(&self, records: usize) {
        self.answers_received.fetch_add(1, Ordering::Relaxed);
        self.records_received
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_transfer_requested(&self) {
        self.transfers_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transfer_completed(&self) {
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transfer_denied(&self) {
        self.transfers_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            queries_sent: self.queries_sent.load(Ordering::Relaxed),
            answers_received: self.answers_received.load(Ordering::Relaxed),
            records_received: self.records_received.load(Ordering::Relaxed),
            transfers_requested: self.transfers_requested.load(Ordering::Relaxed),
            transfers_completed: self.transfers_completed.load(Ordering::Relaxed),
            transfers_denied: self.transfers_denied.load(Ordering::Relaxed),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_opened: u64,
    pub connect_failures: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub queries_sent: u64,
    pub answers_received: u64,
    pub records_received: u64,
    pub transfers_requested: u64,
    pub transfers_completed: u64,
    pub transfers_denied: u64,
}
