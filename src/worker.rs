//! Event worker
//!
//! One cooperative task multiplexes every queue through a bounded MPSC
//! channel plus a timeout tick. Producers (app enqueue, BLE inbound, network
//! callbacks) only push into internally synchronized queues and send events;
//! the worker is the sole drainer and owns the item state machines. No lock
//! is held across an await.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::adapters::{BleTransport, ChainRpc, Clock, NetworkSensor, WalletSigner};
use crate::codec::{self, Fragment, FragmentType};
use crate::config::CoreConfig;
use crate::dedup::DedupLedger;
use crate::metrics::MetricsRegistry;
use crate::nonce::NonceStore;
use crate::peers::PeerRegistry;
use crate::persist::{PersistentStore, Snapshot};
use crate::queue::{
    Confirmation, OutboundItem, Priority, QueueManager, ReceivedItem, RetryError, RetryItem,
};
use crate::reassembly::ReassemblyBuffer;
use crate::relay::{self, RelayDecision, SubmitOutcome};

/// Events multiplexed through the worker channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkEvent {
    OutboundReady,
    ReceivedReady,
    RetryReady,
    ConfirmationReady,
    Cleanup,
    Shutdown,
}

/// Batch caps per event, bounding how long one event monopolizes the worker
const OUTBOUND_BATCH: usize = 10;
const RECEIVED_BATCH: usize = 5;
const CONFIRMATION_BATCH: usize = 10;

/// Transmission retries per outbound item before it is dropped
const MAX_SEND_RETRIES: u8 = 3;

/// Encoded frames buffered for host pull
const FRAME_BUFFER_CAP: usize = 1024;

/// Shutdown drain grace
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Buffer of encoded frames awaiting the host's BLE sender.
///
/// The worker is the single producer; `pop_next_frame` on the core is a pure
/// pop and never touches the queues.
pub(crate) struct FrameBuffer {
    frames: VecDeque<Vec<u8>>,
    max_frames: usize,
}

impl FrameBuffer {
    pub(crate) fn new() -> Self {
        Self {
            frames: VecDeque::new(),
            max_frames: FRAME_BUFFER_CAP,
        }
    }

    pub(crate) fn has_room_for(&self, count: usize) -> bool {
        self.frames.len() + count <= self.max_frames
    }

    pub(crate) fn push(&mut self, frame: Vec<u8>) {
        self.frames.push_back(frame);
    }

    /// Next frame if it fits the caller's budget; otherwise left in place
    pub(crate) fn pop(&mut self, max_len: usize) -> Option<Vec<u8>> {
        match self.frames.front() {
            Some(frame) if frame.len() <= max_len => self.frames.pop_front(),
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }
}

/// State shared between the core facade and the worker task
pub(crate) struct Shared {
    pub config: CoreConfig,
    /// Active fragment payload budget; shrinks when the BLE MTU does
    pub max_payload: AtomicUsize,
    pub queues: QueueManager,
    pub reassembly: Mutex<ReassemblyBuffer>,
    pub dedup: Mutex<DedupLedger>,
    pub frames: Mutex<FrameBuffer>,
    /// Confirmations addressed to this device, drained by the host
    pub inbox: Mutex<VecDeque<Confirmation>>,
    pub peers: Mutex<PeerRegistry>,
    pub metrics: MetricsRegistry,
    pub store: Option<PersistentStore>,
    pub nonces: NonceStore,
    pub ble: Option<Arc<dyn BleTransport>>,
    pub network: Arc<dyn NetworkSensor>,
    pub signer: Option<Arc<dyn WalletSigner>>,
    pub rpc: Option<Arc<dyn ChainRpc>>,
    pub clock: Arc<dyn Clock>,
    pub events: mpsc::Sender<WorkEvent>,
}

impl Shared {
    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) fn max_payload(&self) -> usize {
        self.max_payload.load(Ordering::Relaxed)
    }

    /// Best-effort event send; a full channel is fine because the timeout
    /// tick re-discovers pending work
    pub(crate) fn notify(&self, event: WorkEvent) {
        let _ = self.events.try_send(event);
    }

    pub(crate) fn capture_snapshot(&self) -> Snapshot {
        Snapshot::capture(
            &self.queues,
            &self.dedup.lock(),
            self.nonces.bundle_snapshot(),
            self.now_ms(),
        )
    }
}

/// Run the worker until shutdown. Spawned once at init.
pub(crate) async fn run(shared: Arc<Shared>, mut rx: mpsc::Receiver<WorkEvent>) {
    let mut tick = tokio::time::interval(Duration::from_millis(
        shared.config.worker_timeout_ms.max(1),
    ));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await; // the first tick fires immediately; skip it

    tracing::info!(
        "event worker started (tick every {}ms)",
        shared.config.worker_timeout_ms
    );

    loop {
        let event = tokio::select! {
            received = rx.recv() => match received {
                Some(event) => event,
                None => break,
            },
            _ = tick.tick() => WorkEvent::Cleanup,
        };

        if event == WorkEvent::Shutdown {
            drain_on_shutdown(&shared, &mut rx).await;
            force_save(&shared).await;
            break;
        }

        handle_event(&shared, event).await;
        autosave_if_dirty(&shared).await;
    }

    tracing::info!("event worker stopped");
}

async fn handle_event(shared: &Arc<Shared>, event: WorkEvent) {
    match event {
        WorkEvent::OutboundReady => {
            let progressed = process_outbound(shared).await;
            // re-arm so one event drains the queue without monopolizing the
            // worker; only when progress was made, to avoid spinning while
            // the frame buffer is full
            if progressed && !shared.queues.outbound.lock().is_empty() {
                shared.notify(WorkEvent::OutboundReady);
            }
        }
        WorkEvent::ReceivedReady => {
            process_received(shared).await;
            if !shared.queues.received.lock().is_empty() {
                shared.notify(WorkEvent::ReceivedReady);
            }
        }
        WorkEvent::RetryReady => process_retries(shared).await,
        WorkEvent::ConfirmationReady => process_confirmations(shared).await,
        WorkEvent::Cleanup => cleanup(shared).await,
        WorkEvent::Shutdown => {}
    }
}

enum EmitResult {
    Sent(usize),
    BufferFull,
    SendFailed,
}

/// Move one fragment set onto the wire: through the BLE adapter when one is
/// configured, into the frame buffer for host pull otherwise.
async fn emit_fragments(shared: &Arc<Shared>, fragments: &[Fragment]) -> EmitResult {
    if let Some(ble) = &shared.ble {
        for fragment in fragments {
            let frame = codec::encode(fragment);
            if let Err(e) = ble.send(&frame).await {
                tracing::warn!("BLE send failed: {e}");
                MetricsRegistry::bump(&shared.metrics.ble_send_failures);
                return EmitResult::SendFailed;
            }
        }
        MetricsRegistry::add(&shared.metrics.frames_sent, fragments.len() as u64);
        return EmitResult::Sent(fragments.len());
    }

    let mut buffer = shared.frames.lock();
    if !buffer.has_room_for(fragments.len()) {
        return EmitResult::BufferFull;
    }
    for fragment in fragments {
        buffer.push(codec::encode(fragment));
    }
    MetricsRegistry::add(&shared.metrics.frames_sent, fragments.len() as u64);
    EmitResult::Sent(fragments.len())
}

/// Drain up to one batch of outbound items. Returns true when at least one
/// item was fully emitted.
async fn process_outbound(shared: &Arc<Shared>) -> bool {
    let mut progressed = false;

    for _ in 0..OUTBOUND_BATCH {
        let item = match shared.queues.outbound.lock().pop() {
            Some(item) => item,
            None => break,
        };

        match emit_fragments(shared, &item.fragments).await {
            EmitResult::Sent(_) => {
                tracing::debug!(
                    "transmitted tx {} ({} fragments)",
                    codec::short_id(&item.tx_id),
                    item.fragments.len()
                );
                shared.queues.mark_dirty();
                progressed = true;
            }
            EmitResult::BufferFull => {
                shared.queues.outbound.lock().push_front(item);
                break;
            }
            EmitResult::SendFailed => {
                let mut item = item;
                item.retry_count += 1;
                if item.retry_count <= MAX_SEND_RETRIES {
                    shared.queues.outbound.lock().push_front(item);
                } else {
                    tracing::warn!(
                        "dropping tx {} after {} failed transmissions",
                        codec::short_id(&item.tx_id),
                        item.retry_count
                    );
                    shared.queues.mark_dirty();
                }
                break;
            }
        }
    }

    progressed
}

/// Apply the submit-or-relay policy to one batch of received transactions
async fn process_received(shared: &Arc<Shared>) {
    for _ in 0..RECEIVED_BATCH {
        let item = match shared.queues.received.lock().pop() {
            Some(item) => item,
            None => break,
        };
        shared.queues.mark_dirty();
        handle_received_item(shared, item).await;
    }
}

async fn handle_received_item(shared: &Arc<Shared>, item: ReceivedItem) {
    let decision = relay::decide(shared.network.as_ref(), shared.rpc.as_deref());

    match (decision, shared.rpc.as_ref()) {
        (RelayDecision::Submit, Some(rpc)) => {
            match relay::submit(rpc.as_ref(), &item.tx_bytes).await {
                SubmitOutcome::Submitted(signature) => {
                    let now_ms = shared.now_ms();
                    shared.dedup.lock().mark_submitted(&item.tx_bytes, now_ms);
                    MetricsRegistry::bump(&shared.metrics.submitted);

                    let confirmation =
                        Confirmation::success(hex::encode(item.tx_id), signature, now_ms);
                    if item.self_originated {
                        // local originator observes the outcome directly
                        shared.inbox.lock().push_back(confirmation);
                    } else {
                        queue_confirmation(shared, confirmation);
                    }
                }
                SubmitOutcome::Transient(reason) => {
                    MetricsRegistry::bump(&shared.metrics.submit_transient_failures);
                    schedule_retry(
                        shared,
                        RetryItem::new(item.tx_bytes, reason, shared.now_ms()),
                    );
                }
                SubmitOutcome::Permanent(reason) => {
                    MetricsRegistry::bump(&shared.metrics.submit_permanent_failures);
                    let confirmation =
                        Confirmation::failure(hex::encode(item.tx_id), reason, shared.now_ms());
                    if item.self_originated {
                        shared.inbox.lock().push_back(confirmation);
                    } else {
                        queue_confirmation(shared, confirmation);
                    }
                }
            }
        }
        _ => relay_onward(shared, item),
    }
}

/// Re-fragment a received transaction into the outbound queue so it keeps
/// propagating across the mesh
fn relay_onward(shared: &Arc<Shared>, item: ReceivedItem) {
    let fragments = match codec::fragment(&item.tx_bytes, shared.max_payload()) {
        Ok(fragments) => fragments,
        Err(e) => {
            tracing::warn!(
                "cannot re-fragment tx {} for relay: {e}",
                codec::short_id(&item.tx_id)
            );
            return;
        }
    };

    let outbound = OutboundItem::new(
        item.tx_bytes,
        fragments,
        Priority::Normal,
        shared.now_ms(),
    );
    match shared.queues.outbound.lock().push(outbound) {
        Ok(()) => {
            MetricsRegistry::bump(&shared.metrics.relayed);
            shared.queues.mark_dirty();
            shared.notify(WorkEvent::OutboundReady);
        }
        Err(_) => {
            MetricsRegistry::bump(&shared.metrics.duplicates_dropped);
        }
    }
}

fn queue_confirmation(shared: &Arc<Shared>, confirmation: Confirmation) {
    if shared
        .queues
        .confirmations
        .lock()
        .push(confirmation)
        .is_ok()
    {
        shared.queues.mark_dirty();
        shared.notify(WorkEvent::ConfirmationReady);
    }
}

fn schedule_retry(shared: &Arc<Shared>, item: RetryItem) {
    let tx_id = item.tx_id;
    let now_ms = shared.now_ms();
    match shared.queues.retries.lock().schedule(item, now_ms) {
        Ok(_) => shared.queues.mark_dirty(),
        Err(RetryError::AttemptsExhausted { .. }) => {
            MetricsRegistry::bump(&shared.metrics.submit_permanent_failures);
            shared.queues.mark_dirty();
            queue_confirmation(
                shared,
                Confirmation::failure(
                    hex::encode(tx_id),
                    "retry attempts exhausted".into(),
                    now_ms,
                ),
            );
        }
    }
}

/// Drain every retry item whose deadline has passed
async fn process_retries(shared: &Arc<Shared>) {
    loop {
        let item = {
            let now_ms = shared.now_ms();
            shared.queues.retries.lock().pop_ready(now_ms)
        };
        let item = match item {
            Some(item) => item,
            None => break,
        };
        shared.queues.mark_dirty();

        let decision = relay::decide(shared.network.as_ref(), shared.rpc.as_deref());
        match (decision, shared.rpc.as_ref()) {
            (RelayDecision::Submit, Some(rpc)) => {
                match relay::submit(rpc.as_ref(), &item.tx_bytes).await {
                    SubmitOutcome::Submitted(signature) => {
                        let now_ms = shared.now_ms();
                        shared.dedup.lock().mark_submitted(&item.tx_bytes, now_ms);
                        MetricsRegistry::bump(&shared.metrics.submitted);
                        queue_confirmation(
                            shared,
                            Confirmation::success(hex::encode(item.tx_id), signature, now_ms),
                        );
                    }
                    SubmitOutcome::Transient(reason) => {
                        MetricsRegistry::bump(&shared.metrics.submit_transient_failures);
                        let mut item = item;
                        item.last_error = reason;
                        schedule_retry(shared, item);
                    }
                    SubmitOutcome::Permanent(reason) => {
                        MetricsRegistry::bump(&shared.metrics.submit_permanent_failures);
                        queue_confirmation(
                            shared,
                            Confirmation::failure(hex::encode(item.tx_id), reason, shared.now_ms()),
                        );
                    }
                }
            }
            _ => {
                // offline: submitting is pointless, park it for one base period
                let now_ms = shared.now_ms();
                shared.queues.retries.lock().defer(item, now_ms);
                break;
            }
        }
    }
}

/// Fragment queued confirmations as control payloads and put them on the wire
async fn process_confirmations(shared: &Arc<Shared>) {
    for _ in 0..CONFIRMATION_BATCH {
        let confirmation = match shared.queues.confirmations.lock().pop() {
            Some(confirmation) => confirmation,
            None => break,
        };
        shared.queues.mark_dirty();

        let payload = match serde_json::to_vec(&confirmation) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("confirmation serialization failed: {e}");
                continue;
            }
        };
        let fragments = match codec::fragment_typed(
            &payload,
            shared.max_payload(),
            FragmentType::Control,
        ) {
            Ok(fragments) => fragments,
            Err(e) => {
                tracing::warn!("confirmation fragmentation failed: {e}");
                continue;
            }
        };

        // our own control payload must not loop back through us
        let control_id = codec::tx_id(&payload);
        let now_ms = shared.now_ms();
        shared.dedup.lock().mark_seen(control_id, now_ms);

        match emit_fragments(shared, &fragments).await {
            EmitResult::Sent(_) => {}
            EmitResult::BufferFull | EmitResult::SendFailed => {
                let _ = shared.queues.confirmations.lock().push(confirmation);
                break;
            }
        }
    }
}

/// Periodic housekeeping: sweep reassembly, purge dedup, expire retries and
/// confirmations, wake any ready work, save when dirty
async fn cleanup(shared: &Arc<Shared>) {
    let now_ms = shared.now_ms();

    let swept = shared.reassembly.lock().sweep(now_ms);
    if swept > 0 {
        MetricsRegistry::add(&shared.metrics.reassembly_failures, swept as u64);
    }

    shared.dedup.lock().purge(now_ms);

    {
        let mut retries = shared.queues.retries.lock();
        if retries.cleanup_expired(now_ms, shared.config.retry_retention_ms) > 0 {
            shared.queues.mark_dirty();
        }
        if retries.ready_count(now_ms) > 0 {
            shared.notify(WorkEvent::RetryReady);
        }
    }

    if shared.queues.confirmations.lock().cleanup_expired(now_ms) > 0 {
        shared.queues.mark_dirty();
    }

    shared.peers.lock().prune(now_ms);

    if !shared.queues.outbound.lock().is_empty() {
        shared.notify(WorkEvent::OutboundReady);
    }
    if !shared.queues.received.lock().is_empty() {
        shared.notify(WorkEvent::ReceivedReady);
    }
}

/// Debounced autosave, dispatched off the worker so the event loop never
/// blocks on disk
async fn autosave_if_dirty(shared: &Arc<Shared>) {
    if shared.store.is_none() || !shared.queues.take_dirty() {
        return;
    }

    let snapshot = shared.capture_snapshot();
    let debounce = Duration::from_millis(shared.config.autosave_debounce_ms);
    let task_shared = Arc::clone(shared);

    let result = tokio::task::spawn_blocking(move || {
        task_shared
            .store
            .as_ref()
            .map(|store| store.save_if_due(&snapshot, debounce))
    })
    .await;

    match result {
        Ok(Some(Ok(true))) => {
            MetricsRegistry::bump(&shared.metrics.snapshots_saved);
        }
        Ok(Some(Ok(false))) => {
            // debounced: keep the dirty flag so a later event retries
            shared.queues.mark_dirty();
        }
        Ok(Some(Err(e))) => {
            tracing::error!("snapshot save failed: {e}");
            shared.queues.mark_dirty();
        }
        Ok(None) => {}
        Err(e) => tracing::error!("snapshot task panicked: {e}"),
    }
}

/// Bypass the debounce; used on shutdown and by the host's force_save
pub(crate) async fn force_save(shared: &Arc<Shared>) {
    if shared.store.is_none() {
        return;
    }

    let snapshot = shared.capture_snapshot();
    let task_shared = Arc::clone(shared);
    let result = tokio::task::spawn_blocking(move || {
        task_shared
            .store
            .as_ref()
            .map(|store| store.save(&snapshot))
    })
    .await;

    match result {
        Ok(Some(Ok(()))) => {
            MetricsRegistry::bump(&shared.metrics.snapshots_saved);
            shared.queues.take_dirty();
            tracing::info!("forced snapshot save");
        }
        Ok(Some(Err(e))) => tracing::error!("forced save failed: {e}"),
        Ok(None) => {}
        Err(e) => tracing::error!("forced save task panicked: {e}"),
    }
}

/// Handle whatever is still queued within the grace window, then return so
/// the caller can force a final save
async fn drain_on_shutdown(shared: &Arc<Shared>, rx: &mut mpsc::Receiver<WorkEvent>) {
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while tokio::time::Instant::now() < deadline {
        match rx.try_recv() {
            Ok(WorkEvent::Shutdown) => continue,
            Ok(event) => handle_event(shared, event).await,
            Err(_) => break,
        }
    }
}
