use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic progress counters, shared by every job and thread of a run.
///
/// Counters are updated with relaxed fetch-adds; they are individually
/// monotonic but not transactionally coherent across each other.
#[derive(Debug, Default)]
pub struct Stats {
    pub total_collections: AtomicU64,
    pub total_batches: AtomicU64,
    /// Bytes received from the server (before transport decompression).
    pub total_received: AtomicU64,
    /// Bytes handed to output files (before storage compression).
    pub total_written: AtomicU64,
}

impl Stats {
    pub fn add_collection(&self) {
        self.total_collections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_batch(&self) {
        self.total_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: u64) {
        self.total_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_written(&self, bytes: u64) {
        self.total_written.fetch_add(bytes, Ordering::Relaxed);
    }
}
