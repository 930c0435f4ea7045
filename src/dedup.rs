//! Dedup ledger
//!
//! Time-bounded set of recently seen transaction IDs and submitted
//! transaction hashes. Prevents relay loops and duplicate submissions, and
//! is persisted so dedup survives restarts.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::codec::{self, TxId};

/// Default retention window (24 hours, milliseconds)
pub const DEFAULT_DEDUP_TTL_MS: u64 = 86_400_000;

/// One persisted ledger entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupEntry {
    /// Hex-encoded SHA-256
    pub hash: String,
    pub first_seen_ms: u64,
}

/// Time-bounded hash ledger with a parallel timestamp index for purging
pub struct DedupLedger {
    entries: HashMap<TxId, u64>,
    by_time: BTreeMap<u64, Vec<TxId>>,
    ttl_ms: u64,
}

impl DedupLedger {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            entries: HashMap::new(),
            by_time: BTreeMap::new(),
            ttl_ms,
        }
    }

    /// Record a transaction ID. Re-marking an already present hash keeps the
    /// original first-seen time.
    pub fn mark_seen(&mut self, id: TxId, now_ms: u64) {
        if self.entries.contains_key(&id) {
            return;
        }
        self.entries.insert(id, now_ms);
        self.by_time.entry(now_ms).or_default().push(id);
    }

    pub fn seen(&self, id: &TxId) -> bool {
        self.entries.contains_key(id)
    }

    /// Record a submitted transaction, keyed by the hash of its exact bytes.
    /// Returns the hash so callers can log it.
    pub fn mark_submitted(&mut self, tx_bytes: &[u8], now_ms: u64) -> TxId {
        let hash = codec::tx_id(tx_bytes);
        self.mark_seen(hash, now_ms);
        hash
    }

    pub fn submitted(&self, tx_bytes: &[u8]) -> bool {
        self.seen(&codec::tx_id(tx_bytes))
    }

    /// Drop every entry older than the retention window. Returns the number
    /// of entries removed.
    pub fn purge(&mut self, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(self.ttl_ms);
        let expired: Vec<u64> = self.by_time.range(..cutoff).map(|(&ts, _)| ts).collect();

        let mut removed = 0;
        for ts in expired {
            if let Some(ids) = self.by_time.remove(&ts) {
                for id in ids {
                    self.entries.remove(&id);
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::debug!(
                "purged {} dedup entries older than {}ms",
                removed,
                self.ttl_ms
            );
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot for persistence
    pub fn entries(&self) -> Vec<DedupEntry> {
        self.entries
            .iter()
            .map(|(id, &ts)| DedupEntry {
                hash: hex::encode(id),
                first_seen_ms: ts,
            })
            .collect()
    }

    /// Rebuild from a persisted snapshot. Entries that no longer parse are
    /// skipped.
    pub fn restore(&mut self, entries: Vec<DedupEntry>) {
        for entry in entries {
            if let Ok(bytes) = hex::decode(&entry.hash) {
                if bytes.len() == 32 {
                    let mut id = [0u8; 32];
                    id.copy_from_slice(&bytes);
                    self.mark_seen(id, entry.first_seen_ms);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_check() {
        let mut ledger = DedupLedger::new(DEFAULT_DEDUP_TTL_MS);
        let id = codec::tx_id(b"payload");

        assert!(!ledger.seen(&id));
        ledger.mark_seen(id, 1_000);
        assert!(ledger.seen(&id));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_remark_keeps_first_seen() {
        let mut ledger = DedupLedger::new(10_000);
        let id = codec::tx_id(b"payload");

        ledger.mark_seen(id, 1_000);
        ledger.mark_seen(id, 9_000);

        // still anchored to the first sighting, so it expires on schedule
        assert_eq!(ledger.purge(12_000), 1);
        assert!(!ledger.seen(&id));
    }

    #[test]
    fn test_purge_respects_ttl() {
        let mut ledger = DedupLedger::new(10_000);
        let old = codec::tx_id(b"old");
        let young = codec::tx_id(b"young");

        ledger.mark_seen(old, 0);
        ledger.mark_seen(young, 8_000);

        assert_eq!(ledger.purge(11_000), 1);
        assert!(!ledger.seen(&old));
        assert!(ledger.seen(&young));
    }

    #[test]
    fn test_submitted_hash() {
        let mut ledger = DedupLedger::new(DEFAULT_DEDUP_TTL_MS);
        let bytes = b"signed transaction bytes".to_vec();

        assert!(!ledger.submitted(&bytes));
        let hash = ledger.mark_submitted(&bytes, 5);
        assert!(ledger.submitted(&bytes));
        assert_eq!(hash, codec::tx_id(&bytes));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut ledger = DedupLedger::new(DEFAULT_DEDUP_TTL_MS);
        ledger.mark_seen(codec::tx_id(b"a"), 100);
        ledger.mark_seen(codec::tx_id(b"b"), 200);

        let mut restored = DedupLedger::new(DEFAULT_DEDUP_TTL_MS);
        restored.restore(ledger.entries());

        assert_eq!(restored.len(), 2);
        assert!(restored.seen(&codec::tx_id(b"a")));
        assert!(restored.seen(&codec::tx_id(b"b")));
    }
}
