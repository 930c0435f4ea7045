//! Core metrics
//!
//! Lock-free counters bumped on the hot paths, snapshotted on demand.
//! Transport-layer failures surface here instead of propagating upward.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter registry shared across the core
#[derive(Default)]
pub struct MetricsRegistry {
    pub frames_decoded: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub checksum_failures: AtomicU64,
    pub total_mismatches: AtomicU64,
    pub duplicates_dropped: AtomicU64,
    pub reassembly_completed: AtomicU64,
    pub reassembly_failures: AtomicU64,
    pub reassembly_evictions: AtomicU64,
    pub submitted: AtomicU64,
    pub submit_transient_failures: AtomicU64,
    pub submit_permanent_failures: AtomicU64,
    pub relayed: AtomicU64,
    pub frames_sent: AtomicU64,
    pub ble_send_failures: AtomicU64,
    pub confirmations_received: AtomicU64,
    pub snapshots_saved: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Copy-on-read snapshot of every counter
    pub fn snapshot(&self) -> CoreMetrics {
        CoreMetrics {
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            checksum_failures: self.checksum_failures.load(Ordering::Relaxed),
            total_mismatches: self.total_mismatches.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            reassembly_completed: self.reassembly_completed.load(Ordering::Relaxed),
            reassembly_failures: self.reassembly_failures.load(Ordering::Relaxed),
            reassembly_evictions: self.reassembly_evictions.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            submit_transient_failures: self.submit_transient_failures.load(Ordering::Relaxed),
            submit_permanent_failures: self.submit_permanent_failures.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            ble_send_failures: self.ble_send_failures.load(Ordering::Relaxed),
            confirmations_received: self.confirmations_received.load(Ordering::Relaxed),
            snapshots_saved: self.snapshots_saved.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time metrics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreMetrics {
    pub frames_decoded: u64,
    pub malformed_frames: u64,
    pub checksum_failures: u64,
    pub total_mismatches: u64,
    pub duplicates_dropped: u64,
    pub reassembly_completed: u64,
    pub reassembly_failures: u64,
    pub reassembly_evictions: u64,
    pub submitted: u64,
    pub submit_transient_failures: u64,
    pub submit_permanent_failures: u64,
    pub relayed: u64,
    pub frames_sent: u64,
    pub ble_send_failures: u64,
    pub confirmations_received: u64,
    pub snapshots_saved: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let registry = MetricsRegistry::new();
        MetricsRegistry::bump(&registry.frames_decoded);
        MetricsRegistry::bump(&registry.frames_decoded);
        MetricsRegistry::add(&registry.frames_sent, 7);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.frames_decoded, 2);
        assert_eq!(snapshot.frames_sent, 7);
        assert_eq!(snapshot.submitted, 0);
    }
}
