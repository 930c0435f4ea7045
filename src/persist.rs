//! Persistence layer
//!
//! Serializes the entire relay state (queues, dedup ledger, offline bundle)
//! into a single versioned JSON snapshot. Writes are atomic: temp file in the
//! same directory, fsync, rename over the target. A debounced autosaver keeps
//! disk traffic bounded; `force_save` paths bypass the debounce on shutdown.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec;
use crate::dedup::{DedupEntry, DedupLedger};
use crate::nonce::OfflineBundle;
use crate::queue::{
    Confirmation, ConfirmationQueue, OutboundItem, OutboundQueue, PermanentFailure, Priority,
    QueueManager, ReceivedItem, ReceivedQueue, RetryItem, RetryQueue,
};

/// Current snapshot schema version. Unknown versions fail to load rather
/// than silently migrating.
pub const SNAPSHOT_VERSION: u32 = 1;

const SNAPSHOT_FILE: &str = "solmesh_state.json";
const TEMP_FILE: &str = "solmesh_state.tmp";
const RENAME_RETRIES: u32 = 3;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("snapshot schema version {found} not supported (expected {supported})")]
    SchemaVersion { found: u32, supported: u32 },

    #[error("corrupted snapshot: {0}")]
    Corrupted(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OutboundItemPersist {
    tx_id: String,
    /// base64 of the exact mesh bytes; fragments are rebuilt on load
    original_bytes: String,
    priority: Priority,
    created_at_ms: u64,
    retry_count: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RetryItemPersist {
    tx_id: String,
    tx_bytes: String,
    attempt_count: u32,
    last_error: String,
    not_before_ms: u64,
    created_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReceivedItemPersist {
    tx_bytes: String,
    received_at_ms: u64,
    self_originated: bool,
}

/// One versioned record covering every durable structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    version: u32,
    saved_at_ms: u64,
    outbound: Vec<OutboundItemPersist>,
    retry: Vec<RetryItemPersist>,
    retry_failures: Vec<PermanentFailure>,
    confirmation: Vec<Confirmation>,
    received: Vec<ReceivedItemPersist>,
    dedup: Vec<DedupEntry>,
    offline_bundle: OfflineBundle,
}

impl Snapshot {
    /// Capture the current state of every durable structure
    pub fn capture(
        queues: &QueueManager,
        dedup: &DedupLedger,
        offline_bundle: OfflineBundle,
        now_ms: u64,
    ) -> Self {
        let outbound = queues
            .outbound
            .lock()
            .items()
            .map(|item| OutboundItemPersist {
                tx_id: hex::encode(item.tx_id),
                original_bytes: BASE64.encode(&item.original_bytes),
                priority: item.priority,
                created_at_ms: item.created_at_ms,
                retry_count: item.retry_count,
            })
            .collect();

        let retries = queues.retries.lock();
        let retry = retries
            .items()
            .map(|item| RetryItemPersist {
                tx_id: hex::encode(item.tx_id),
                tx_bytes: BASE64.encode(&item.tx_bytes),
                attempt_count: item.attempt_count,
                last_error: item.last_error.clone(),
                not_before_ms: item.not_before_ms,
                created_at_ms: item.created_at_ms,
            })
            .collect();
        let retry_failures = retries.failures().cloned().collect();
        drop(retries);

        let confirmation = queues.confirmations.lock().items().cloned().collect();

        let received = queues
            .received
            .lock()
            .items()
            .map(|item| ReceivedItemPersist {
                tx_bytes: BASE64.encode(&item.tx_bytes),
                received_at_ms: item.received_at_ms,
                self_originated: item.self_originated,
            })
            .collect();

        Self {
            version: SNAPSHOT_VERSION,
            saved_at_ms: now_ms,
            outbound,
            retry,
            retry_failures,
            confirmation,
            received,
            dedup: dedup.entries(),
            offline_bundle,
        }
    }

    /// Rebuild runtime state from this snapshot. Entries that no longer
    /// decode are skipped rather than failing the whole load.
    pub fn restore(
        self,
        outbound: &mut OutboundQueue,
        retries: &mut RetryQueue,
        confirmations: &mut ConfirmationQueue,
        received: &mut ReceivedQueue,
        dedup: &mut DedupLedger,
        max_payload: usize,
    ) -> OfflineBundle {
        for item in self.outbound {
            let bytes = match BASE64.decode(&item.original_bytes) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("skipping undecodable outbound item {}: {e}", item.tx_id);
                    continue;
                }
            };
            let fragments = match codec::fragment(&bytes, max_payload) {
                Ok(fragments) => fragments,
                Err(e) => {
                    tracing::warn!("skipping unfragmentable outbound item {}: {e}", item.tx_id);
                    continue;
                }
            };
            let mut restored = OutboundItem::new(bytes, fragments, item.priority, item.created_at_ms);
            restored.retry_count = item.retry_count;
            let _ = outbound.push(restored);
        }

        for item in self.retry {
            if let Ok(bytes) = BASE64.decode(&item.tx_bytes) {
                retries.restore(RetryItem {
                    tx_id: codec::tx_id(&bytes),
                    tx_bytes: bytes,
                    attempt_count: item.attempt_count,
                    last_error: item.last_error,
                    not_before_ms: item.not_before_ms,
                    created_at_ms: item.created_at_ms,
                });
            }
        }
        retries.restore_failures(self.retry_failures);

        for confirmation in self.confirmation {
            let _ = confirmations.push(confirmation);
        }

        for item in self.received {
            if let Ok(bytes) = BASE64.decode(&item.tx_bytes) {
                let _ = received.push(ReceivedItem {
                    tx_id: codec::tx_id(&bytes),
                    tx_bytes: bytes,
                    received_at_ms: item.received_at_ms,
                    self_originated: item.self_originated,
                });
            }
        }

        dedup.restore(self.dedup);

        self.offline_bundle
    }

    pub fn saved_at_ms(&self) -> u64 {
        self.saved_at_ms
    }
}

/// Atomic snapshot store with debounced saving
pub struct PersistentStore {
    dir: PathBuf,
    last_save: Mutex<Option<Instant>>,
}

impl PersistentStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir)
                .map_err(|e| StorageError::Io(format!("create storage directory: {e}")))?;
        }
        Ok(Self {
            dir,
            last_save: Mutex::new(None),
        })
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    fn temp_path(&self) -> PathBuf {
        self.dir.join(TEMP_FILE)
    }

    /// Write the snapshot atomically: temp file, fsync, rename. The rename
    /// is retried a bounded number of times; after that the failure is
    /// reported and in-memory state remains authoritative until the next
    /// successful save.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let json = serde_json::to_string(snapshot)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path)
                .map_err(|e| StorageError::Io(format!("create temp file: {e}")))?;
            file.write_all(json.as_bytes())
                .map_err(|e| StorageError::Io(format!("write temp file: {e}")))?;
            file.sync_all()
                .map_err(|e| StorageError::Io(format!("sync temp file: {e}")))?;
        }

        let target = self.snapshot_path();
        let mut last_err = None;
        for attempt in 1..=RENAME_RETRIES {
            match fs::rename(&temp_path, &target) {
                Ok(()) => {
                    *self.last_save.lock() = Some(Instant::now());
                    tracing::debug!("saved snapshot to {}", target.display());
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("snapshot rename attempt {attempt}/{RENAME_RETRIES} failed: {e}");
                    last_err = Some(e);
                }
            }
        }

        Err(StorageError::Io(format!(
            "snapshot rename failed after {RENAME_RETRIES} attempts: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Save only when the debounce window has elapsed. Returns true when a
    /// save happened.
    pub fn save_if_due(
        &self,
        snapshot: &Snapshot,
        debounce: Duration,
    ) -> Result<bool, StorageError> {
        {
            let last_save = self.last_save.lock();
            if let Some(last) = *last_save {
                if last.elapsed() < debounce {
                    return Ok(false);
                }
            }
        }
        self.save(snapshot)?;
        Ok(true)
    }

    /// Load the snapshot. A missing file is a fresh start; an unknown schema
    /// version aborts rather than auto-migrating.
    pub fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        let path = self.snapshot_path();
        if !path.exists() {
            tracing::debug!("no snapshot at {}, starting fresh", path.display());
            return Ok(None);
        }

        let json = fs::read_to_string(&path)
            .map_err(|e| StorageError::Io(format!("read snapshot: {e}")))?;

        // peek at the version before committing to the full schema
        let probe: serde_json::Value = serde_json::from_str(&json)
            .map_err(|e| StorageError::Corrupted(e.to_string()))?;
        let found = probe
            .get("version")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| StorageError::Corrupted("snapshot has no version field".into()))?
            as u32;
        if found != SNAPSHOT_VERSION {
            return Err(StorageError::SchemaVersion {
                found,
                supported: SNAPSHOT_VERSION,
            });
        }

        let snapshot: Snapshot = serde_json::from_str(&json)
            .map_err(|e| StorageError::Corrupted(e.to_string()))?;
        tracing::info!(
            "loaded snapshot: {} outbound, {} retry, {} received, {} dedup entries",
            snapshot.outbound.len(),
            snapshot.retry.len(),
            snapshot.received.len(),
            snapshot.dedup.len()
        );
        Ok(Some(snapshot))
    }
}
