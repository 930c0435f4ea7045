//! Outbound transmission queue
//!
//! Priority-banded FIFO of transactions awaiting BLE transmission, with
//! per-transaction deduplication. Fragments are computed once at enqueue time
//! and cached on the item so retransmission never re-fragments.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};

use crate::codec::{self, Fragment, TxId};

/// Transmission priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// User-initiated transactions, drained first
    High,
    /// Regular transactions
    Normal,
    /// Background relay traffic
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Transaction awaiting BLE transmission
#[derive(Debug, Clone)]
pub struct OutboundItem {
    pub tx_id: TxId,
    /// Exact bytes as they will travel the mesh
    pub original_bytes: Vec<u8>,
    /// Wire fragments, cached at enqueue time
    pub fragments: Vec<Fragment>,
    pub priority: Priority,
    pub created_at_ms: u64,
    /// Transmission failures so far
    pub retry_count: u8,
}

impl OutboundItem {
    pub fn new(
        original_bytes: Vec<u8>,
        fragments: Vec<Fragment>,
        priority: Priority,
        now_ms: u64,
    ) -> Self {
        Self {
            tx_id: codec::tx_id(&original_bytes),
            original_bytes,
            fragments,
            priority,
            created_at_ms: now_ms,
            retry_count: 0,
        }
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }

    /// Re-fragment for a smaller MTU. Cached fragments for the old size are
    /// replaced wholesale.
    pub fn refragment(&mut self, max_payload: usize) -> Result<(), codec::CodecError> {
        self.fragments = codec::fragment(&self.original_bytes, max_payload)?;
        Ok(())
    }
}

/// Priority-banded outbound queue with deduplication
pub struct OutboundQueue {
    high: VecDeque<OutboundItem>,
    normal: VecDeque<OutboundItem>,
    low: VecDeque<OutboundItem>,
    dedup: HashSet<TxId>,
    max_size: usize,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            low: VecDeque::new(),
            dedup: HashSet::new(),
            max_size,
        }
    }

    /// Push an item. Pushing a transaction that is already queued is a no-op
    /// reported as `Duplicate`. A full queue makes room by dropping the
    /// oldest low-priority item; if none exists the push fails.
    pub fn push(&mut self, item: OutboundItem) -> Result<(), QueueError> {
        if self.dedup.contains(&item.tx_id) {
            return Err(QueueError::Duplicate(hex::encode(item.tx_id)));
        }

        if self.len() >= self.max_size {
            match self.low.pop_front() {
                Some(dropped) => {
                    self.dedup.remove(&dropped.tx_id);
                    tracing::warn!(
                        "outbound queue full ({}), dropped low priority tx {}",
                        self.max_size,
                        codec::short_id(&dropped.tx_id)
                    );
                }
                None => return Err(QueueError::QueueFull(self.max_size)),
            }
        }

        self.dedup.insert(item.tx_id);
        tracing::debug!(
            "queued tx {} at {:?} (queue size {})",
            codec::short_id(&item.tx_id),
            item.priority,
            self.len() + 1
        );

        self.band_mut(item.priority).push_back(item);
        Ok(())
    }

    /// Pop the next item: High before Normal before Low, FIFO within a band.
    pub fn pop(&mut self) -> Option<OutboundItem> {
        let item = self
            .high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front());

        if let Some(ref item) = item {
            self.dedup.remove(&item.tx_id);
        }
        item
    }

    /// Return an item to the front of its band, preserving FIFO for a partial
    /// drain or a failed send.
    pub fn push_front(&mut self, item: OutboundItem) {
        self.dedup.insert(item.tx_id);
        self.band_mut(item.priority).push_front(item);
    }

    fn band_mut(&mut self, priority: Priority) -> &mut VecDeque<OutboundItem> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    pub fn contains(&self, tx_id: &TxId) -> bool {
        self.dedup.contains(tx_id)
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_band(&self, priority: Priority) -> usize {
        match priority {
            Priority::High => self.high.len(),
            Priority::Normal => self.normal.len(),
            Priority::Low => self.low.len(),
        }
    }

    pub fn peek(&self) -> Option<&OutboundItem> {
        self.high
            .front()
            .or_else(|| self.normal.front())
            .or_else(|| self.low.front())
    }

    pub fn clear(&mut self) {
        self.high.clear();
        self.normal.clear();
        self.low.clear();
        self.dedup.clear();
    }

    /// Drop items older than `max_age_ms`. Returns the number removed.
    pub fn cleanup_stale(&mut self, now_ms: u64, max_age_ms: u64) -> usize {
        let mut removed = 0;
        for band in [&mut self.high, &mut self.normal, &mut self.low] {
            let before = band.len();
            band.retain(|item| item.age_ms(now_ms) < max_age_ms);
            removed += before - band.len();
        }

        if removed > 0 {
            self.dedup.clear();
            let high = self.high.iter();
            let rest = self.normal.iter().chain(self.low.iter());
            let ids: Vec<TxId> = high.chain(rest).map(|item| item.tx_id).collect();
            self.dedup.extend(ids);
            tracing::info!("dropped {} stale outbound transactions", removed);
        }
        removed
    }

    /// Re-fragment every queued item whose fragments no longer fit the given
    /// payload budget. Returns the number of items updated.
    pub fn refragment_all(&mut self, max_payload: usize) -> usize {
        let mut updated = 0;
        for band in [&mut self.high, &mut self.normal, &mut self.low] {
            for item in band.iter_mut() {
                let oversized = item.fragments.iter().any(|f| f.payload.len() > max_payload);
                if oversized && item.refragment(max_payload).is_ok() {
                    updated += 1;
                }
            }
        }
        updated
    }

    /// All queued items in drain order, for persistence
    pub fn items(&self) -> impl Iterator<Item = &OutboundItem> {
        self.high
            .iter()
            .chain(self.normal.iter())
            .chain(self.low.iter())
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Queue operation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("transaction {0} already queued")]
    Duplicate(String),

    #[error("queue is full (max size {0})")]
    QueueFull(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(seed: u8, priority: Priority) -> OutboundItem {
        let bytes = vec![seed; 40];
        let fragments = codec::fragment(&bytes, 30).unwrap();
        OutboundItem::new(bytes, fragments, priority, 0)
    }

    #[test]
    fn test_push_pop_single() {
        let mut queue = OutboundQueue::new();
        let tx = item(1, Priority::Normal);
        let id = tx.tx_id;

        queue.push(tx).unwrap();
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(&id));

        let popped = queue.pop().unwrap();
        assert_eq!(popped.tx_id, id);
        assert!(queue.is_empty());
        assert!(!queue.contains(&id));
    }

    #[test]
    fn test_priority_ordering() {
        let mut queue = OutboundQueue::new();
        queue.push(item(1, Priority::Low)).unwrap();
        queue.push(item(2, Priority::Normal)).unwrap();
        queue.push(item(3, Priority::High)).unwrap();

        assert_eq!(queue.pop().unwrap().priority, Priority::High);
        assert_eq!(queue.pop().unwrap().priority, Priority::Normal);
        assert_eq!(queue.pop().unwrap().priority, Priority::Low);
    }

    #[test]
    fn test_high_pushed_after_low_pops_first() {
        let mut queue = OutboundQueue::new();
        queue.push(item(1, Priority::Low)).unwrap();
        queue.push(item(2, Priority::Low)).unwrap();
        queue.push(item(3, Priority::High)).unwrap();

        assert_eq!(queue.pop().unwrap().priority, Priority::High);
    }

    #[test]
    fn test_fifo_within_band() {
        let mut queue = OutboundQueue::new();
        let first = item(1, Priority::Normal);
        let second = item(2, Priority::Normal);
        let first_id = first.tx_id;
        let second_id = second.tx_id;

        queue.push(first).unwrap();
        queue.push(second).unwrap();

        assert_eq!(queue.pop().unwrap().tx_id, first_id);
        assert_eq!(queue.pop().unwrap().tx_id, second_id);
    }

    #[test]
    fn test_duplicate_push_is_rejected() {
        let mut queue = OutboundQueue::new();
        queue.push(item(1, Priority::Normal)).unwrap();
        assert!(matches!(
            queue.push(item(1, Priority::Normal)),
            Err(QueueError::Duplicate(_))
        ));
        assert_eq!(queue.len(), 1);

        // exactly one item drains
        assert!(queue.pop().is_some());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_full_queue_drops_low_priority() {
        let mut queue = OutboundQueue::with_capacity(2);
        let low = item(1, Priority::Low);
        let low_id = low.tx_id;

        queue.push(low).unwrap();
        queue.push(item(2, Priority::High)).unwrap();
        queue.push(item(3, Priority::High)).unwrap();

        assert!(!queue.contains(&low_id));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_full_queue_errors_without_low_band() {
        let mut queue = OutboundQueue::with_capacity(2);
        queue.push(item(1, Priority::High)).unwrap();
        queue.push(item(2, Priority::High)).unwrap();

        assert!(matches!(
            queue.push(item(3, Priority::High)),
            Err(QueueError::QueueFull(2))
        ));
    }

    #[test]
    fn test_push_front_preserves_order() {
        let mut queue = OutboundQueue::new();
        queue.push(item(1, Priority::Normal)).unwrap();
        queue.push(item(2, Priority::Normal)).unwrap();

        let head = queue.pop().unwrap();
        let head_id = head.tx_id;
        queue.push_front(head);

        assert_eq!(queue.pop().unwrap().tx_id, head_id);
    }

    #[test]
    fn test_cleanup_stale() {
        let mut queue = OutboundQueue::new();
        let mut old = item(1, Priority::Normal);
        old.created_at_ms = 0;
        let old_id = old.tx_id;
        let mut fresh = item(2, Priority::Normal);
        fresh.created_at_ms = 90_000;
        let fresh_id = fresh.tx_id;

        queue.push(old).unwrap();
        queue.push(fresh).unwrap();

        let removed = queue.cleanup_stale(100_000, 50_000);
        assert_eq!(removed, 1);
        assert!(!queue.contains(&old_id));
        assert!(queue.contains(&fresh_id));
    }

    #[test]
    fn test_refragment_for_smaller_mtu() {
        let mut tx = item(9, Priority::Normal);
        assert_eq!(tx.fragments.len(), 2);
        tx.refragment(10).unwrap();
        assert_eq!(tx.fragments.len(), 4);
        assert_eq!(tx.fragments[0].tx_id, tx.tx_id);
    }

    #[test]
    fn test_len_band() {
        let mut queue = OutboundQueue::new();
        queue.push(item(1, Priority::High)).unwrap();
        queue.push(item(2, Priority::Normal)).unwrap();
        queue.push(item(3, Priority::Normal)).unwrap();

        assert_eq!(queue.len_band(Priority::High), 1);
        assert_eq!(queue.len_band(Priority::Normal), 2);
        assert_eq!(queue.len_band(Priority::Low), 0);
    }
}
