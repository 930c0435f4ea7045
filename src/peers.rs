//! Mesh peer registry
//!
//! Tracks nearby relay peers reported by the host's BLE layer: signal
//! quality, connection state, and retry bookkeeping. Peers not seen within
//! the timeout are pruned on the worker's cleanup tick. The registry informs
//! connection policy and observability; the GATT plumbing itself stays in
//! the host.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Target simultaneous connections for good mesh coverage
pub const TARGET_CONNECTIONS: usize = 5;

/// Hard cap on simultaneous connections
pub const MAX_CONNECTIONS: usize = 8;

/// Drop peers not seen for this long (milliseconds)
pub const PEER_TIMEOUT_MS: u64 = 30_000;

/// Wait between connection attempts to the same peer (milliseconds)
pub const RETRY_DELAY_MS: u64 = 5_000;

/// Connection attempts before a peer is left alone
pub const MAX_CONNECT_ATTEMPTS: u32 = 3;

/// RSSI threshold for a good link
pub const GOOD_RSSI_THRESHOLD: i16 = -70;

/// RSSI threshold below which a peer is not worth connecting
pub const MIN_RSSI_THRESHOLD: i16 = -90;

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    Discovered,
    Connecting,
    Connected,
    Disconnected,
}

/// One known mesh peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Host-assigned peer identifier (typically the BLE address)
    pub peer_id: String,
    pub rssi: i16,
    pub state: PeerState,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    pub connection_attempts: u32,
    pub last_attempt_ms: Option<u64>,
}

impl PeerInfo {
    fn new(peer_id: String, rssi: i16, now_ms: u64) -> Self {
        Self {
            peer_id,
            rssi,
            state: PeerState::Discovered,
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
            connection_attempts: 0,
            last_attempt_ms: None,
        }
    }

    pub fn has_good_signal(&self) -> bool {
        self.rssi >= GOOD_RSSI_THRESHOLD
    }

    pub fn has_acceptable_signal(&self) -> bool {
        self.rssi >= MIN_RSSI_THRESHOLD
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.state != PeerState::Connected
            && now_ms.saturating_sub(self.last_seen_ms) > PEER_TIMEOUT_MS
    }

    /// Whether another connection attempt is worthwhile
    pub fn can_retry(&self, now_ms: u64) -> bool {
        if self.connection_attempts >= MAX_CONNECT_ATTEMPTS {
            return false;
        }
        match self.last_attempt_ms {
            Some(last) => now_ms.saturating_sub(last) > RETRY_DELAY_MS,
            None => true,
        }
    }
}

/// Registry of every peer this node has heard from recently
pub struct PeerRegistry {
    peers: HashMap<String, PeerInfo>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Record a discovery or advertisement sighting. Known peers get their
    /// signal and last-seen refreshed.
    pub fn mark_seen(&mut self, peer_id: &str, rssi: i16, now_ms: u64) {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.rssi = rssi;
                peer.last_seen_ms = now_ms;
            }
            None => {
                tracing::debug!("discovered peer {peer_id} (rssi {rssi})");
                self.peers
                    .insert(peer_id.to_string(), PeerInfo::new(peer_id.to_string(), rssi, now_ms));
            }
        }
    }

    /// Record a connection attempt
    pub fn mark_connecting(&mut self, peer_id: &str, now_ms: u64) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.state = PeerState::Connecting;
            peer.connection_attempts += 1;
            peer.last_attempt_ms = Some(now_ms);
        }
    }

    /// Record a successful connection, resetting the retry budget
    pub fn mark_connected(&mut self, peer_id: &str, now_ms: u64) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.state = PeerState::Connected;
            peer.last_seen_ms = now_ms;
            peer.connection_attempts = 0;
            peer.last_attempt_ms = None;
            tracing::info!("connected to peer {peer_id}");
        }
    }

    pub fn mark_disconnected(&mut self, peer_id: &str, now_ms: u64) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.state = PeerState::Disconnected;
            peer.last_seen_ms = now_ms;
        }
    }

    /// The best peer to connect to next: acceptable signal, retry budget
    /// left, strongest signal first. None while at the connection target.
    pub fn next_candidate(&self, now_ms: u64) -> Option<&PeerInfo> {
        if self.connected_count() >= TARGET_CONNECTIONS {
            return None;
        }
        self.peers
            .values()
            .filter(|peer| {
                matches!(peer.state, PeerState::Discovered | PeerState::Disconnected)
                    && peer.has_acceptable_signal()
                    && peer.can_retry(now_ms)
            })
            .max_by_key(|peer| peer.rssi)
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|peer| peer.state == PeerState::Connected)
            .count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop unconnected peers not seen within the timeout. Returns the
    /// number pruned.
    pub fn prune(&mut self, now_ms: u64) -> usize {
        let before = self.peers.len();
        self.peers.retain(|peer_id, peer| {
            let expired = peer.is_expired(now_ms);
            if expired {
                tracing::debug!("pruning silent peer {peer_id}");
            }
            !expired
        });
        before - self.peers.len()
    }

    /// Snapshot of every known peer
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers.values().cloned().collect()
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
