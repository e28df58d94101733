//! # Transport Statistics
//!
//! Aggregate counters for a running node, exposed to `courier status` and
//! suitable for periodic logging. All fields are plain `u64`s updated with
//! `Relaxed` atomics on the tick thread — there is only one writer, so
//! ordering beyond visibility is not needed.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// A point-in-time snapshot, serializable for `courier status --json` or
/// structured log lines.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub chunks_sent: u64,
    pub chunks_retransmitted: u64,
    pub bundles_delivered: u64,
    pub bundles_expired: u64,
    pub duplicate_chunks: u64,
    pub fec_recoveries: u64,
    pub datagrams_dropped: u64,
    pub custody_records_held: u64,
    pub custody_records_failed: u64,
}

/// Running counters, cheap to share behind an `Arc` across the reader
/// thread and the tick thread.
#[derive(Default)]
pub struct TransportStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    chunks_sent: AtomicU64,
    chunks_retransmitted: AtomicU64,
    bundles_delivered: AtomicU64,
    bundles_expired: AtomicU64,
    duplicate_chunks: AtomicU64,
    fec_recoveries: AtomicU64,
    datagrams_dropped: AtomicU64,
    custody_records_held: AtomicU64,
    custody_records_failed: AtomicU64,
}

impl TransportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_chunk_sent(&self, bytes: usize) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_chunk_retransmitted(&self) {
        self.chunks_retransmitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_chunk_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_duplicate_chunk(&self) {
        self.duplicate_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fec_recovery(&self) {
        self.fec_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bundle_delivered(&self) {
        self.bundles_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bundle_expired(&self) {
        self.bundles_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_datagram_dropped(&self) {
        self.datagrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Overwrites the dropped-datagram count from the I/O layer's own
    /// counter, which is the source of truth for reader-thread drops.
    pub fn record_datagram_dropped_total(&self, total: u64) {
        self.datagrams_dropped.store(total, Ordering::Relaxed);
    }

    pub fn set_custody_counts(&self, held: u64, failed: u64) {
        self.custody_records_held.store(held, Ordering::Relaxed);
        self.custody_records_failed.store(failed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_retransmitted: self.chunks_retransmitted.load(Ordering::Relaxed),
            bundles_delivered: self.bundles_delivered.load(Ordering::Relaxed),
            bundles_expired: self.bundles_expired.load(Ordering::Relaxed),
            duplicate_chunks: self.duplicate_chunks.load(Ordering::Relaxed),
            fec_recoveries: self.fec_recoveries.load(Ordering::Relaxed),
            datagrams_dropped: self.datagrams_dropped.load(Ordering::Relaxed),
            custody_records_held: self.custody_records_held.load(Ordering::Relaxed),
            custody_records_failed: self.custody_records_failed.load(Ordering::Relaxed),
        }
    }
}
