//! Fragment reassembly buffer
//!
//! Holds partial transactions keyed by transaction ID until every fragment
//! has arrived, times out stale sets, and evicts the oldest set when the
//! buffer overflows.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{self, Fragment, FragmentType, TxId};

/// Default cap on concurrently incomplete sets
pub const DEFAULT_MAX_INCOMPLETE: usize = 128;

/// Default idle timeout for an incomplete set (milliseconds)
pub const DEFAULT_REASSEMBLY_TTL_MS: u64 = 60_000;

/// Per-transaction reassembly state
#[derive(Debug)]
struct ReassemblySet {
    total: u16,
    fragment_type: FragmentType,
    buffers: Vec<Option<Vec<u8>>>,
    received: u16,
    first_seen_ms: u64,
    last_seen_ms: u64,
    total_bytes: usize,
}

impl ReassemblySet {
    fn new(total: u16, fragment_type: FragmentType, now_ms: u64) -> Self {
        Self {
            total,
            fragment_type,
            buffers: vec![None; total as usize],
            received: 0,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            total_bytes: 0,
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.total
    }

    fn assemble(self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.total_bytes);
        for buffer in self.buffers.into_iter().flatten() {
            bytes.extend_from_slice(&buffer);
        }
        bytes
    }
}

/// Snapshot of one incomplete set, for observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassemblyInfo {
    pub tx_id: String,
    pub received: u16,
    pub total: u16,
    pub total_bytes: usize,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
}

/// Outcome of accepting a fragment
#[derive(Debug)]
pub struct AcceptOutcome {
    /// Reassembled payload plus its kind, set when this fragment completed the set
    pub completed: Option<(Vec<u8>, FragmentType)>,
    /// Number of sets evicted to make room
    pub evicted: usize,
}

/// Reassembly errors. These are absorbed at the transport boundary and
/// surface only as metrics.
#[derive(Debug, Clone, Error)]
pub enum ReassemblyError {
    #[error("fragment total {got} disagrees with established total {expected}")]
    TotalMismatch { expected: u16, got: u16 },

    #[error("duplicate fragment {index} with differing payload")]
    DuplicateMismatch { index: u16 },

    #[error("completed set failed hash verification")]
    HashMismatch,
}

/// Buffer of partially received transactions
pub struct ReassemblyBuffer {
    sets: HashMap<TxId, ReassemblySet>,
    max_incomplete: usize,
    ttl_ms: u64,
}

impl ReassemblyBuffer {
    pub fn new(max_incomplete: usize, ttl_ms: u64) -> Self {
        Self {
            sets: HashMap::new(),
            max_incomplete,
            ttl_ms,
        }
    }

    /// Accept one fragment.
    ///
    /// Idempotent per `(tx_id, index)`: a duplicate with an identical payload
    /// is a no-op, a duplicate with a differing payload is rejected without
    /// disturbing the set. A fragment whose `total` disagrees with the
    /// first-seen total for its transaction is rejected the same way.
    ///
    /// Returns the reassembled bytes when the set becomes complete; the set
    /// is removed in the same step.
    pub fn accept(
        &mut self,
        fragment: Fragment,
        now_ms: u64,
    ) -> Result<AcceptOutcome, ReassemblyError> {
        let mut evicted = 0;

        if !self.sets.contains_key(&fragment.tx_id) && self.sets.len() >= self.max_incomplete {
            evicted = self.evict_oldest();
        }

        let set = self
            .sets
            .entry(fragment.tx_id)
            .or_insert_with(|| ReassemblySet::new(fragment.total, fragment.fragment_type, now_ms));

        if set.total != fragment.total || fragment.index >= set.total {
            return Err(ReassemblyError::TotalMismatch {
                expected: set.total,
                got: fragment.total,
            });
        }

        let slot = &mut set.buffers[fragment.index as usize];
        match slot {
            Some(existing) => {
                if *existing != fragment.payload {
                    return Err(ReassemblyError::DuplicateMismatch {
                        index: fragment.index,
                    });
                }
                // identical duplicate, refresh the idle clock only
                set.last_seen_ms = now_ms;
            }
            None => {
                set.total_bytes += fragment.payload.len();
                *slot = Some(fragment.payload);
                set.received += 1;
                set.last_seen_ms = now_ms;
            }
        }

        if set.is_complete() {
            let set = self
                .sets
                .remove(&fragment.tx_id)
                .expect("complete set present");
            let fragment_type = set.fragment_type;
            let bytes = set.assemble();
            if codec::tx_id(&bytes) != fragment.tx_id {
                return Err(ReassemblyError::HashMismatch);
            }
            tracing::debug!(
                "reassembled {} ({} bytes, {} fragments)",
                codec::short_id(&fragment.tx_id),
                bytes.len(),
                fragment.total
            );
            return Ok(AcceptOutcome {
                completed: Some((bytes, fragment_type)),
                evicted,
            });
        }

        Ok(AcceptOutcome {
            completed: None,
            evicted,
        })
    }

    /// Drop sets idle beyond the TTL. Returns the number of sets dropped.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let ttl = self.ttl_ms;
        let before = self.sets.len();
        self.sets.retain(|id, set| {
            let stale = now_ms.saturating_sub(set.last_seen_ms) > ttl;
            if stale {
                tracing::debug!(
                    "dropping stale set {} ({}/{} fragments)",
                    codec::short_id(id),
                    set.received,
                    set.total
                );
            }
            !stale
        });
        before - self.sets.len()
    }

    fn evict_oldest(&mut self) -> usize {
        let oldest = self
            .sets
            .iter()
            .min_by_key(|(_, set)| set.first_seen_ms)
            .map(|(id, _)| *id);
        match oldest {
            Some(id) => {
                self.sets.remove(&id);
                tracing::warn!(
                    "reassembly buffer full ({}), evicted oldest set {}",
                    self.max_incomplete,
                    codec::short_id(&id)
                );
                1
            }
            None => 0,
        }
    }

    /// Observability snapshot of every incomplete set
    pub fn info(&self) -> Vec<ReassemblyInfo> {
        self.sets
            .iter()
            .map(|(id, set)| ReassemblyInfo {
                tx_id: hex::encode(id),
                received: set.received,
                total: set.total,
                total_bytes: set.total_bytes,
                first_seen_ms: set.first_seen_ms,
                last_seen_ms: set.last_seen_ms,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
