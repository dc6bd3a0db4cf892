//! # Run State Module
//!
//! Counters shared by every job of one run, plus the run's cancellation token.
//! Workers run on a multi-threaded runtime, so every counter is atomic and each
//! settled item updates them exactly once.

use crate::progress::SummaryReport;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct RunState {
    total: usize,
    processed: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    total_original_bytes: AtomicU64,
    total_compressed_bytes: AtomicU64,
    cancel: CancellationToken,
    started: Instant,
}

impl RunState {
    pub fn new(total: usize, cancel: CancellationToken) -> Self {
        Self {
            total,
            processed: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            total_original_bytes: AtomicU64::new(0),
            total_compressed_bytes: AtomicU64::new(0),
            cancel,
            started: Instant::now(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Record a settled success; returns the processed count including it
    pub fn record_success(&self, original_bytes: u64, compressed_bytes: u64) -> usize {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
        self.add_bytes(original_bytes, compressed_bytes);
        self.processed.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Record a settled failure. `written_bytes` is what ended up at the
    /// destination (the copied original, or 0 when nothing was written).
    pub fn record_failure(&self, original_bytes: u64, written_bytes: u64) -> usize {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.add_bytes(original_bytes, written_bytes);
        self.processed.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn add_bytes(&self, original_bytes: u64, compressed_bytes: u64) {
        self.total_original_bytes.fetch_add(original_bytes, Ordering::SeqCst);
        self.total_compressed_bytes.fetch_add(compressed_bytes, Ordering::SeqCst);
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn summary(&self) -> SummaryReport {
        SummaryReport {
            total: self.total,
            processed: self.processed(),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            total_original_bytes: self.total_original_bytes.load(Ordering::SeqCst),
            total_compressed_bytes: self.total_compressed_bytes.load(Ordering::SeqCst),
            elapsed: self.started.elapsed(),
            cancelled: self.is_cancel_requested() && self.processed() < self.total,
        }
    }
}
