//! Retry queue with exponential backoff
//!
//! Schedules failed submissions by `not_before_ms` using a time-ordered map.
//! Backoff doubles per attempt with uniform jitter and a hard ceiling; items
//! that exhaust their attempts move to a bounded permanent-failure log for
//! operator review.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use crate::codec::{self, TxId};

/// Default backoff base (milliseconds)
pub const DEFAULT_RETRY_BASE_MS: u64 = 30_000;

/// Default backoff ceiling (milliseconds)
pub const DEFAULT_RETRY_CEILING_MS: u64 = 3_600_000;

/// Default attempt cap before an item is written off
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Retention cap for the permanent-failure log
const FAILURE_LOG_CAP: usize = 256;

/// Failed submission awaiting another attempt
#[derive(Debug, Clone)]
pub struct RetryItem {
    pub tx_id: TxId,
    pub tx_bytes: Vec<u8>,
    /// Submission attempts made so far
    pub attempt_count: u32,
    pub last_error: String,
    /// Earliest eligible retry time
    pub not_before_ms: u64,
    pub created_at_ms: u64,
}

impl RetryItem {
    pub fn new(tx_bytes: Vec<u8>, error: String, now_ms: u64) -> Self {
        Self {
            tx_id: codec::tx_id(&tx_bytes),
            tx_bytes,
            attempt_count: 0,
            last_error: error,
            not_before_ms: now_ms,
            created_at_ms: now_ms,
        }
    }

    pub fn is_ready(&self, now_ms: u64) -> bool {
        now_ms >= self.not_before_ms
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }
}

/// Submission written off after exhausting its attempts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermanentFailure {
    pub tx_id: String,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at_ms: u64,
}

/// Retry queue errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetryError {
    #[error("transaction {tx_id} exhausted its {max_attempts} attempts")]
    AttemptsExhausted { tx_id: String, max_attempts: u32 },
}

/// Time-ordered retry queue
pub struct RetryQueue {
    /// Keyed by (not_before_ms, insertion seq) so equal deadlines never collide
    items: BTreeMap<(u64, u64), RetryItem>,
    seq: u64,
    max_attempts: u32,
    base_ms: u64,
    ceiling_ms: u64,
    failures: VecDeque<PermanentFailure>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::with_config(
            DEFAULT_MAX_ATTEMPTS,
            DEFAULT_RETRY_BASE_MS,
            DEFAULT_RETRY_CEILING_MS,
        )
    }

    pub fn with_config(max_attempts: u32, base_ms: u64, ceiling_ms: u64) -> Self {
        Self {
            items: BTreeMap::new(),
            seq: 0,
            max_attempts,
            base_ms,
            ceiling_ms,
            failures: VecDeque::new(),
        }
    }

    /// Backoff delay for the n-th failure: `min(base * 2^(n-1) + jitter, ceiling)`
    /// with jitter uniform in `[0, base)`. The first retry therefore lands in
    /// `[base, 2*base)` after the failure.
    pub fn backoff_ms(&self, attempt_count: u32) -> u64 {
        let exponent = attempt_count.saturating_sub(1).min(20);
        let deterministic = self.base_ms.saturating_mul(1u64 << exponent);
        if deterministic >= self.ceiling_ms {
            return self.ceiling_ms;
        }
        let jitter = rand::thread_rng().gen_range(0..self.base_ms.max(1));
        deterministic.saturating_add(jitter).min(self.ceiling_ms)
    }

    /// Record a failed attempt and schedule the next one.
    ///
    /// Increments the attempt counter; when the cap is reached the item moves
    /// to the permanent-failure log and `AttemptsExhausted` is returned.
    pub fn schedule(&mut self, mut item: RetryItem, now_ms: u64) -> Result<u64, RetryError> {
        item.attempt_count += 1;

        if item.attempt_count > self.max_attempts {
            let tx_id = hex::encode(item.tx_id);
            tracing::warn!(
                "tx {} failed permanently after {} attempts: {}",
                codec::short_id(&item.tx_id),
                item.attempt_count - 1,
                item.last_error
            );
            self.record_failure(PermanentFailure {
                tx_id: tx_id.clone(),
                attempts: item.attempt_count - 1,
                last_error: item.last_error,
                failed_at_ms: now_ms,
            });
            return Err(RetryError::AttemptsExhausted {
                tx_id,
                max_attempts: self.max_attempts,
            });
        }

        item.not_before_ms = now_ms + self.backoff_ms(item.attempt_count);
        tracing::debug!(
            "retry {}/{} for tx {} in {}ms",
            item.attempt_count,
            self.max_attempts,
            codec::short_id(&item.tx_id),
            item.not_before_ms - now_ms
        );

        let not_before = item.not_before_ms;
        self.insert(item);
        Ok(not_before)
    }

    /// Re-insert an item without charging an attempt, delayed by one base
    /// period. Used when the device is offline and submitting is pointless.
    pub fn defer(&mut self, mut item: RetryItem, now_ms: u64) {
        item.not_before_ms = now_ms + self.base_ms;
        self.insert(item);
    }

    /// Restore a persisted item with its schedule intact
    pub fn restore(&mut self, item: RetryItem) {
        self.insert(item);
    }

    fn insert(&mut self, item: RetryItem) {
        let key = (item.not_before_ms, self.seq);
        self.seq += 1;
        self.items.insert(key, item);
    }

    /// Pop the earliest item whose deadline has passed
    pub fn pop_ready(&mut self, now_ms: u64) -> Option<RetryItem> {
        let key = match self.items.keys().next() {
            Some(&(not_before, seq)) if not_before <= now_ms => (not_before, seq),
            _ => return None,
        };
        self.items.remove(&key)
    }

    /// Deadline of the earliest scheduled item
    pub fn next_ready_at(&self) -> Option<u64> {
        self.items.keys().next().map(|&(not_before, _)| not_before)
    }

    pub fn ready_count(&self, now_ms: u64) -> usize {
        self.items
            .keys()
            .take_while(|&&(not_before, _)| not_before <= now_ms)
            .count()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop items older than `max_age_ms`, writing them off as permanent
    /// failures. Returns the number removed.
    pub fn cleanup_expired(&mut self, now_ms: u64, max_age_ms: u64) -> usize {
        let expired: Vec<(u64, u64)> = self
            .items
            .iter()
            .filter(|(_, item)| item.age_ms(now_ms) > max_age_ms)
            .map(|(&key, _)| key)
            .collect();

        let count = expired.len();
        for key in expired {
            if let Some(item) = self.items.remove(&key) {
                self.record_failure(PermanentFailure {
                    tx_id: hex::encode(item.tx_id),
                    attempts: item.attempt_count,
                    last_error: format!("expired after {}ms: {}", max_age_ms, item.last_error),
                    failed_at_ms: now_ms,
                });
            }
        }
        count
    }

    fn record_failure(&mut self, failure: PermanentFailure) {
        if self.failures.len() >= FAILURE_LOG_CAP {
            self.failures.pop_front();
        }
        self.failures.push_back(failure);
    }

    /// Permanent-failure log, oldest first
    pub fn failures(&self) -> impl Iterator<Item = &PermanentFailure> {
        self.failures.iter()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    pub fn restore_failures(&mut self, failures: Vec<PermanentFailure>) {
        for failure in failures {
            self.record_failure(failure);
        }
    }

    pub fn average_attempts(&self) -> f32 {
        if self.items.is_empty() {
            return 0.0;
        }
        let total: u32 = self.items.values().map(|item| item.attempt_count).sum();
        total as f32 / self.items.len() as f32
    }

    /// All scheduled items, for persistence
    pub fn items(&self) -> impl Iterator<Item = &RetryItem> {
        self.items.values()
    }
}

impl Default for RetryQueue {
    fn default() -> Self {
        Self::new()
    }
}
