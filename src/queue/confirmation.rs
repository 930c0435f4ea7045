//! Confirmation relay queue
//!
//! FIFO of submission outcomes waiting to be fragmented back through the
//! mesh toward the transaction originator, with hop counting and TTL
//! management.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Outcome of a submission attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConfirmationStatus {
    Success { signature: String },
    Failed { reason: String },
}

/// Submission outcome relayed back to the origin device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confirmation {
    /// Hex-encoded ID of the confirmed transaction
    pub tx_id: String,
    pub status: ConfirmationStatus,
    pub timestamp_ms: u64,
    /// Mesh hops traversed so far
    pub relay_count: u8,
    /// Hop budget
    pub max_hops: u8,
}

impl Confirmation {
    pub fn success(tx_id: String, signature: String, now_ms: u64) -> Self {
        Self::new(tx_id, ConfirmationStatus::Success { signature }, now_ms)
    }

    pub fn failure(tx_id: String, reason: String, now_ms: u64) -> Self {
        Self::new(tx_id, ConfirmationStatus::Failed { reason }, now_ms)
    }

    fn new(tx_id: String, status: ConfirmationStatus, now_ms: u64) -> Self {
        Self {
            tx_id,
            status,
            timestamp_ms: now_ms,
            relay_count: 0,
            max_hops: 5,
        }
    }

    pub fn has_exceeded_hops(&self) -> bool {
        self.relay_count >= self.max_hops
    }

    /// Charge one relay hop. Returns false once the budget is spent.
    pub fn increment_relay(&mut self) -> bool {
        if self.has_exceeded_hops() {
            return false;
        }
        self.relay_count += 1;
        true
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.timestamp_ms)
    }

    pub fn is_expired(&self, now_ms: u64, ttl_ms: u64) -> bool {
        self.age_ms(now_ms) > ttl_ms
    }
}

/// FIFO confirmation queue
pub struct ConfirmationQueue {
    pending: VecDeque<Confirmation>,
    max_size: usize,
    ttl_ms: u64,
}

impl ConfirmationQueue {
    pub fn new() -> Self {
        Self::with_capacity(500)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            max_size,
            ttl_ms: 3_600_000,
        }
    }

    /// Push a confirmation, dropping the oldest one when full. Hop-exhausted
    /// confirmations are refused.
    pub fn push(&mut self, confirmation: Confirmation) -> Result<(), ConfirmationError> {
        if confirmation.has_exceeded_hops() {
            return Err(ConfirmationError::MaxHopsExceeded {
                tx_id: confirmation.tx_id,
                hops: confirmation.relay_count,
            });
        }

        if self.pending.len() >= self.max_size {
            if let Some(dropped) = self.pending.pop_front() {
                tracing::warn!(
                    "confirmation queue full ({}), dropped oldest for tx {}",
                    self.max_size,
                    &dropped.tx_id[..dropped.tx_id.len().min(8)]
                );
            }
        }

        self.pending.push_back(confirmation);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Confirmation> {
        self.pending.pop_front()
    }

    pub fn peek(&self) -> Option<&Confirmation> {
        self.pending.front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Drop expired confirmations. Returns the number removed.
    pub fn cleanup_expired(&mut self, now_ms: u64) -> usize {
        let ttl = self.ttl_ms;
        let before = self.pending.len();
        self.pending.retain(|conf| !conf.is_expired(now_ms, ttl));
        before - self.pending.len()
    }

    /// All pending confirmations in order, for persistence
    pub fn items(&self) -> impl Iterator<Item = &Confirmation> {
        self.pending.iter()
    }
}

impl Default for ConfirmationQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Confirmation queue errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfirmationError {
    #[error("confirmation for tx {tx_id} exceeded its hop budget ({hops})")]
    MaxHopsExceeded { tx_id: String, hops: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmation(seed: u8) -> Confirmation {
        Confirmation::success(format!("{seed:064x}"), format!("sig{seed}"), 1_000)
    }

    #[test]
    fn test_fifo_ordering() {
        let mut queue = ConfirmationQueue::new();
        queue.push(confirmation(1)).unwrap();
        queue.push(confirmation(2)).unwrap();
        queue.push(confirmation(3)).unwrap();

        assert_eq!(queue.pop().unwrap().tx_id, format!("{:064x}", 1));
        assert_eq!(queue.pop().unwrap().tx_id, format!("{:064x}", 2));
        assert_eq!(queue.pop().unwrap().tx_id, format!("{:064x}", 3));
    }

    #[test]
    fn test_hop_budget() {
        let mut conf = confirmation(1);
        conf.max_hops = 2;

        assert!(conf.increment_relay());
        assert!(conf.increment_relay());
        assert!(conf.has_exceeded_hops());
        assert!(!conf.increment_relay());
        assert_eq!(conf.relay_count, 2);
    }

    #[test]
    fn test_push_refuses_exhausted_hops() {
        let mut queue = ConfirmationQueue::new();
        let mut conf = confirmation(1);
        conf.relay_count = conf.max_hops;

        assert!(matches!(
            queue.push(conf),
            Err(ConfirmationError::MaxHopsExceeded { .. })
        ));
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let mut queue = ConfirmationQueue::with_capacity(2);
        queue.push(confirmation(1)).unwrap();
        queue.push(confirmation(2)).unwrap();
        queue.push(confirmation(3)).unwrap();

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().tx_id, format!("{:064x}", 2));
    }

    #[test]
    fn test_cleanup_expired() {
        let mut queue = ConfirmationQueue::new();
        let mut old = confirmation(1);
        old.timestamp_ms = 0;
        queue.push(old).unwrap();
        queue.push(confirmation(2)).unwrap();

        let removed = queue.cleanup_expired(3_700_000);
        assert_eq!(removed, 1);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_status_round_trips_through_json() {
        let conf = Confirmation::failure("ab".into(), "nonce expired".into(), 7);
        let json = serde_json::to_string(&conf).unwrap();
        let back: Confirmation = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back.status,
            ConfirmationStatus::Failed { ref reason } if reason == "nonce expired"
        ));
        assert_eq!(back.timestamp_ms, 7);
    }
}
