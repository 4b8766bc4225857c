//! Counters the core increments. Exporting them to an inspect/telemetry
//! channel is the host's problem (§1); the host constructs one `Metrics`
//! and passes it in at mount time so there is no global collector.

use core::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub blocks_allocated: AtomicU64,
    pub blocks_freed: AtomicU64,
    pub blobs_readable: AtomicU64,
    pub blobs_errored: AtomicU64,
    pub integrity_errors: AtomicU64,
    pub journal_commits: AtomicU64,
    pub bytes_decompressed: AtomicU64,
    pub bytes_compressed_written: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_blocks_allocated(&self, n: u64) {
        self.blocks_allocated.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_blocks_freed(&self, n: u64) {
        self.blocks_freed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_blobs_readable(&self) {
        self.blobs_readable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blobs_errored(&self) {
        self.blobs_errored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_integrity_errors(&self) {
        self.integrity_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_journal_commits(&self) {
        self.journal_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_decompressed(&self, n: u64) {
        self.bytes_decompressed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_compressed_written(&self, n: u64) {
        self.bytes_compressed_written.fetch_add(n, Ordering::Relaxed);
    }
}
