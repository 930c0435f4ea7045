//! Queue set for the relay engine
//!
//! Four queues behind one manager: priority outbound, backoff retry,
//! confirmation relay, and received transactions awaiting submit-or-relay.
//! Every mutation marks the manager dirty so the debounced autosaver knows
//! there is something worth snapshotting.

pub mod confirmation;
pub mod outbound;
pub mod received;
pub mod retry;

pub use confirmation::{Confirmation, ConfirmationError, ConfirmationQueue, ConfirmationStatus};
pub use outbound::{OutboundItem, OutboundQueue, Priority, QueueError};
pub use received::{ReceivedItem, ReceivedQueue};
pub use retry::{PermanentFailure, RetryError, RetryItem, RetryQueue};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// All queues, internally synchronized.
///
/// Locks are held only for short critical sections and never across an await;
/// the event worker is the sole drainer, producers only push.
pub struct QueueManager {
    pub outbound: Mutex<OutboundQueue>,
    pub retries: Mutex<RetryQueue>,
    pub confirmations: Mutex<ConfirmationQueue>,
    pub received: Mutex<ReceivedQueue>,
    dirty: AtomicBool,
}

impl QueueManager {
    pub fn new(
        outbound: OutboundQueue,
        retries: RetryQueue,
        confirmations: ConfirmationQueue,
        received: ReceivedQueue,
    ) -> Self {
        Self {
            outbound: Mutex::new(outbound),
            retries: Mutex::new(retries),
            confirmations: Mutex::new(confirmations),
            received: Mutex::new(received),
            dirty: AtomicBool::new(false),
        }
    }

    /// Flag that queue state changed since the last snapshot
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Consume the dirty flag; true when a save is warranted
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Current queue depths
    pub fn sizes(&self) -> QueueSizes {
        let outbound = self.outbound.lock();
        let retries = self.retries.lock();
        QueueSizes {
            outbound_high: outbound.len_band(Priority::High),
            outbound_normal: outbound.len_band(Priority::Normal),
            outbound_low: outbound.len_band(Priority::Low),
            retry: retries.len(),
            retry_failures: retries.failure_count(),
            confirmation: self.confirmations.lock().len(),
            received: self.received.lock().len(),
        }
    }

    /// Coarse health signal derived from queue depths
    pub fn health(&self) -> HealthStatus {
        let sizes = self.sizes();
        let outbound_total = sizes.outbound_high + sizes.outbound_normal + sizes.outbound_low;

        let mut warnings = Vec::new();
        if outbound_total > 100 {
            warnings.push(format!("outbound queue at {outbound_total} items"));
        }
        if sizes.retry > 50 {
            warnings.push(format!("retry queue at {} items", sizes.retry));
        }
        if sizes.retry_failures > 0 {
            warnings.push(format!(
                "{} transactions in the permanent-failure log",
                sizes.retry_failures
            ));
        }

        if warnings.is_empty() {
            HealthStatus::Healthy
        } else if outbound_total > 500 || sizes.retry > 200 {
            HealthStatus::Critical(warnings)
        } else {
            HealthStatus::Warning(warnings)
        }
    }
}

/// Queue depth snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSizes {
    pub outbound_high: usize,
    pub outbound_normal: usize,
    pub outbound_low: usize,
    pub retry: usize,
    pub retry_failures: usize,
    pub confirmation: usize,
    pub received: usize,
}

impl QueueSizes {
    pub fn outbound_total(&self) -> usize {
        self.outbound_high + self.outbound_normal + self.outbound_low
    }
}

/// Queue health status
#[derive(Debug, Clone)]
pub enum HealthStatus {
    Healthy,
    Warning(Vec<String>),
    Critical(Vec<String>),
}
