//! Run counters, summarized once at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

use crate::checksum::ChecksumOutcome;
use crate::transfer::TransferOutcome;

#[derive(Debug, Default)]
pub struct RunMetrics {
    checksummed: AtomicU64,
    bytes_checksummed: AtomicU64,
    uploaded: AtomicU64,
    copied: AtomicU64,
    staged: AtomicU64,
    streamed: AtomicU64,
    deduplicated: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub checksummed: u64,
    pub bytes_checksummed: u64,
    pub uploaded: u64,
    pub copied: u64,
    pub staged: u64,
    pub streamed: u64,
    pub deduplicated: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl RunMetrics {
    pub fn record_checksum(&self, outcome: ChecksumOutcome) {
        if let ChecksumOutcome::Computed { bytes } = outcome {
            self.checksummed.fetch_add(1, Ordering::Relaxed);
            self.bytes_checksummed.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    pub fn record_transfer(&self, outcome: TransferOutcome) {
        let counter = match outcome {
            TransferOutcome::AlreadyPresent => &self.skipped,
            TransferOutcome::Deduplicated => &self.deduplicated,
            TransferOutcome::Uploaded => &self.uploaded,
            TransferOutcome::Copied => &self.copied,
            TransferOutcome::Staged => &self.staged,
            TransferOutcome::Streamed => &self.streamed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            checksummed: get(&self.checksummed),
            bytes_checksummed: get(&self.bytes_checksummed),
            uploaded: get(&self.uploaded),
            copied: get(&self.copied),
            staged: get(&self.staged),
            streamed: get(&self.streamed),
            deduplicated: get(&self.deduplicated),
            skipped: get(&self.skipped),
            failed: get(&self.failed),
        }
    }

    pub fn emit_summary(&self) {
        let s = self.snapshot();
        info!(
            checksummed = s.checksummed,
            bytes_checksummed = s.bytes_checksummed,
            uploaded = s.uploaded,
            copied = s.copied,
            staged = s.staged,
            streamed = s.streamed,
            deduplicated = s.deduplicated,
            skipped = s.skipped,
            failed = s.failed,
            "run summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_land_in_their_counters() {
        let m = RunMetrics::default();
        m.record_checksum(ChecksumOutcome::Computed { bytes: 10 });
        m.record_checksum(ChecksumOutcome::AlreadyPresent);
        m.record_transfer(TransferOutcome::Uploaded);
        m.record_transfer(TransferOutcome::Deduplicated);
        m.record_transfer(TransferOutcome::AlreadyPresent);
        m.record_failure();

        let s = m.snapshot();
        assert_eq!((s.checksummed, s.bytes_checksummed), (1, 10));
        assert_eq!((s.uploaded, s.deduplicated, s.skipped, s.failed), (1, 1, 1, 1));
        assert_eq!(s.copied + s.staged + s.streamed, 0);
    }
}
