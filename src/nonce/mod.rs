//! Durable-nonce bundle store
//!
//! Caches on-chain nonce accounts so transactions can be built offline with a
//! blockhash that stays valid until the nonce advances. Provisioning happens
//! while online: batched nonce-create transactions are emitted unsigned, and
//! after external submission the accounts are fetched and cached. Each cached
//! nonce is consumed by exactly one transaction until refreshed.

use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

use crate::adapters::{ChainRpc, Clock, RpcError};
use crate::transaction::{TransactionBuilder, TransactionError, UnsignedNonceBatch};

/// Size of a nonce account's on-chain data
pub fn nonce_account_size() -> usize {
    solana_sdk::nonce::State::size()
}

/// One cached durable-nonce account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedNonce {
    /// Nonce account pubkey, base58
    pub nonce_account: String,
    /// Nonce authority pubkey, base58
    pub authority: String,
    /// Stored blockhash, valid until the account advances
    pub blockhash: String,
    /// Fee per signature at cache time (lamports)
    pub lamports_per_signature: u64,
    pub cached_at_ms: u64,
    /// Consumed by a transaction and not yet refreshed
    #[serde(default)]
    pub used: bool,
}

/// Persisted set of cached nonces plus metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfflineBundle {
    pub nonces: Vec<CachedNonce>,
    /// Transactions this bundle can still back
    pub max_transactions: usize,
    pub created_at_ms: u64,
}

impl OfflineBundle {
    pub fn new(now_ms: u64) -> Self {
        Self {
            nonces: Vec::new(),
            max_transactions: 0,
            created_at_ms: now_ms,
        }
    }

    /// Insert a nonce, replacing any existing entry for the same account so
    /// each account appears at most once
    pub fn add(&mut self, mut nonce: CachedNonce) {
        nonce.used = false;
        if let Some(existing) = self
            .nonces
            .iter_mut()
            .find(|n| n.nonce_account == nonce.nonce_account)
        {
            *existing = nonce;
        } else {
            self.nonces.push(nonce);
        }
        self.max_transactions = self.nonces.len();
    }

    /// Nonces not yet consumed
    pub fn available(&self) -> usize {
        self.nonces.iter().filter(|n| !n.used).count()
    }

    pub fn total(&self) -> usize {
        self.nonces.len()
    }

    /// First unused nonce in insertion order, consumed on the spot
    fn take_available(&mut self) -> Option<CachedNonce> {
        let slot = self.nonces.iter_mut().find(|n| !n.used)?;
        slot.used = true;
        Some(slot.clone())
    }

    /// Save to a standalone JSON file (used nonces included, so a later
    /// refresh can revive them)
    pub fn save_to_file(&self, path: &str) -> Result<(), NonceError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| NonceError::Serialization(e.to_string()))?;
        std::fs::write(path, json).map_err(|e| NonceError::Io(e.to_string()))?;
        Ok(())
    }

    pub fn load_from_file(path: &str) -> Result<Self, NonceError> {
        let json = std::fs::read_to_string(path).map_err(|e| NonceError::Io(e.to_string()))?;
        serde_json::from_str(&json).map_err(|e| NonceError::Serialization(e.to_string()))
    }
}

/// Nonce store errors
#[derive(Debug, Clone, Error)]
pub enum NonceError {
    #[error("no unused nonce available")]
    Unavailable,

    #[error("RPC adapter not configured")]
    RpcUnavailable,

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("invalid public key: {0}")]
    InvalidPubkey(String),

    #[error("transaction build failed: {0}")]
    Build(#[from] TransactionError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

/// Store of cached durable nonces, synchronized for concurrent pickers
pub struct NonceStore {
    bundle: Mutex<OfflineBundle>,
    rpc: Option<Arc<dyn ChainRpc>>,
    clock: Arc<dyn Clock>,
    builder: TransactionBuilder,
}

impl NonceStore {
    pub fn new(rpc: Option<Arc<dyn ChainRpc>>, clock: Arc<dyn Clock>) -> Self {
        let now_ms = clock.now_ms();
        Self {
            bundle: Mutex::new(OfflineBundle::new(now_ms)),
            rpc,
            clock,
            builder: TransactionBuilder::new(),
        }
    }

    fn rpc(&self) -> Result<&Arc<dyn ChainRpc>, NonceError> {
        self.rpc.as_ref().ok_or(NonceError::RpcUnavailable)
    }

    /// Emit unsigned nonce-create transactions for `count` fresh accounts,
    /// batched up to five per transaction. The payer signs each batch
    /// externally, then the ephemeral keypairs co-sign, and after submission
    /// the caller runs [`cache`] on the new pubkeys.
    ///
    /// [`cache`]: NonceStore::cache
    pub async fn prepare(
        &self,
        count: usize,
        payer_pubkey: &str,
    ) -> Result<Vec<UnsignedNonceBatch>, NonceError> {
        let rpc = self.rpc()?;
        let rent = rpc.rent_exempt_minimum(nonce_account_size()).await?;
        let blockhash = rpc.latest_blockhash().await?;

        tracing::info!(
            "preparing {} nonce accounts (rent {} lamports each)",
            count,
            rent
        );

        Ok(self
            .builder
            .unsigned_nonce_create(payer_pubkey, count, rent, &blockhash)?)
    }

    /// Fetch the on-chain state of submitted nonce accounts and cache them
    /// as available. Returns the number cached.
    pub async fn cache(&self, nonce_pubkeys: &[String]) -> Result<usize, NonceError> {
        let rpc = self.rpc()?;
        let mut fetched = Vec::with_capacity(nonce_pubkeys.len());

        for pubkey_str in nonce_pubkeys {
            let pubkey = Pubkey::from_str(pubkey_str)
                .map_err(|e| NonceError::InvalidPubkey(format!("{pubkey_str}: {e}")))?;
            let state = rpc.get_nonce(&pubkey).await?;
            fetched.push(CachedNonce {
                nonce_account: pubkey_str.clone(),
                authority: state.authority,
                blockhash: state.blockhash,
                lamports_per_signature: state.lamports_per_signature,
                cached_at_ms: self.clock.now_ms(),
                used: false,
            });
        }

        let count = fetched.len();
        let mut bundle = self.bundle.lock();
        for nonce in fetched {
            tracing::debug!("cached nonce account {}", nonce.nonce_account);
            bundle.add(nonce);
        }
        Ok(count)
    }

    /// Atomically select an unused nonce and mark it consumed.
    ///
    /// Exactly-once: until a refresh re-enables it, no later call can return
    /// the same account.
    pub fn pick_available(&self) -> Result<CachedNonce, NonceError> {
        let mut bundle = self.bundle.lock();
        let nonce = bundle.take_available().ok_or(NonceError::Unavailable)?;
        tracing::debug!(
            "picked nonce {} ({} remaining)",
            nonce.nonce_account,
            bundle.available()
        );
        Ok(nonce)
    }

    /// Return a picked nonce unconsumed, for build failures after a pick
    pub fn release(&self, nonce_account: &str) {
        let mut bundle = self.bundle.lock();
        if let Some(nonce) = bundle
            .nonces
            .iter_mut()
            .find(|n| n.nonce_account == nonce_account)
        {
            nonce.used = false;
        }
    }

    /// Re-read every cached account from chain: update blockhash and fee,
    /// clear the used flag, and drop accounts whose authority changed.
    /// Returns the number of nonces refreshed.
    pub async fn refresh_all(&self) -> Result<usize, NonceError> {
        let rpc = self.rpc()?;
        let accounts: Vec<(String, String)> = {
            let bundle = self.bundle.lock();
            bundle
                .nonces
                .iter()
                .map(|n| (n.nonce_account.clone(), n.authority.clone()))
                .collect()
        };

        let mut refreshed = Vec::new();
        let mut dropped = Vec::new();
        for (account, cached_authority) in accounts {
            let pubkey = Pubkey::from_str(&account)
                .map_err(|e| NonceError::InvalidPubkey(format!("{account}: {e}")))?;
            match rpc.get_nonce(&pubkey).await {
                Ok(state) => {
                    if state.authority != cached_authority {
                        tracing::warn!(
                            "nonce {} authority changed ({} -> {}), dropping",
                            account,
                            cached_authority,
                            state.authority
                        );
                        dropped.push(account);
                    } else {
                        refreshed.push((account, state));
                    }
                }
                Err(RpcError::Permanent(reason)) => {
                    tracing::warn!("nonce {} unusable ({reason}), dropping", account);
                    dropped.push(account);
                }
                Err(err @ RpcError::Transient(_)) => return Err(err.into()),
            }
        }

        let now_ms = self.clock.now_ms();
        let mut bundle = self.bundle.lock();
        bundle.nonces.retain(|n| !dropped.contains(&n.nonce_account));
        let mut count = 0;
        for (account, state) in refreshed {
            if let Some(nonce) = bundle
                .nonces
                .iter_mut()
                .find(|n| n.nonce_account == account)
            {
                nonce.blockhash = state.blockhash;
                nonce.lamports_per_signature = state.lamports_per_signature;
                nonce.cached_at_ms = now_ms;
                nonce.used = false;
                count += 1;
            }
        }
        bundle.max_transactions = bundle.nonces.len();

        tracing::info!("refreshed {} nonce accounts, {} available", count, bundle.available());
        Ok(count)
    }

    /// Rewrite an unsigned transaction's nonce blockhash with the latest
    /// cached value for the nonce account it references.
    pub fn refresh_blockhash_in(&self, base64_tx: &str) -> Result<String, NonceError> {
        let signers = self.builder.required_signers(base64_tx)?;
        // the advance-nonce instruction references the account first; find a
        // cached nonce whose authority is among the signers
        let bundle = self.bundle.lock();
        let nonce = bundle
            .nonces
            .iter()
            .find(|n| signers.contains(&n.authority))
            .ok_or(NonceError::Unavailable)?;
        Ok(self
            .builder
            .refresh_nonce_blockhash(base64_tx, &nonce.blockhash)?)
    }

    pub fn available(&self) -> usize {
        self.bundle.lock().available()
    }

    pub fn total(&self) -> usize {
        self.bundle.lock().total()
    }

    /// Snapshot for persistence
    pub fn bundle_snapshot(&self) -> OfflineBundle {
        self.bundle.lock().clone()
    }

    /// Restore a persisted bundle, preserving consumed flags
    pub fn restore(&self, bundle: OfflineBundle) {
        *self.bundle.lock() = bundle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{NonceState, SystemClock};
    use async_trait::async_trait;
    use solana_sdk::signature::{Keypair, Signer};
    use std::collections::HashMap;
    use std::collections::HashSet;

    struct FakeRpc {
        states: Mutex<HashMap<String, NonceState>>,
    }

    impl FakeRpc {
        fn new() -> Self {
            Self {
                states: Mutex::new(HashMap::new()),
            }
        }

        fn set(&self, account: &str, state: NonceState) {
            self.states.lock().insert(account.to_string(), state);
        }
    }

    #[async_trait]
    impl ChainRpc for FakeRpc {
        async fn submit(&self, _tx_bytes: &[u8]) -> Result<String, RpcError> {
            Ok("sig".into())
        }

        async fn get_nonce(&self, nonce_account: &Pubkey) -> Result<NonceState, RpcError> {
            self.states
                .lock()
                .get(&nonce_account.to_string())
                .cloned()
                .ok_or_else(|| RpcError::Permanent("account not found".into()))
        }

        async fn latest_blockhash(&self) -> Result<String, RpcError> {
            Ok(solana_sdk::hash::Hash::new_unique().to_string())
        }

        async fn rent_exempt_minimum(&self, _data_len: usize) -> Result<u64, RpcError> {
            Ok(1_500_000)
        }
    }

    fn state(authority: &str) -> NonceState {
        NonceState {
            authority: authority.to_string(),
            blockhash: solana_sdk::hash::Hash::new_unique().to_string(),
            lamports_per_signature: 5_000,
        }
    }

    fn store_with(rpc: Arc<FakeRpc>) -> NonceStore {
        NonceStore::new(Some(rpc), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_cache_and_pick() {
        let rpc = Arc::new(FakeRpc::new());
        let account = Keypair::new().pubkey().to_string();
        rpc.set(&account, state("auth"));

        let store = store_with(rpc);
        assert_eq!(store.cache(&[account.clone()]).await.unwrap(), 1);
        assert_eq!(store.available(), 1);

        let picked = store.pick_available().unwrap();
        assert_eq!(picked.nonce_account, account);
        assert!(picked.used);
        assert_eq!(store.available(), 0);
        assert!(matches!(
            store.pick_available(),
            Err(NonceError::Unavailable)
        ));
    }

    #[tokio::test]
    async fn test_pick_exclusivity() {
        let rpc = Arc::new(FakeRpc::new());
        let accounts: Vec<String> = (0..5)
            .map(|_| {
                let account = Keypair::new().pubkey().to_string();
                rpc.set(&account, state("auth"));
                account
            })
            .collect();

        let store = store_with(rpc);
        store.cache(&accounts).await.unwrap();

        let mut picked = HashSet::new();
        while let Ok(nonce) = store.pick_available() {
            assert!(picked.insert(nonce.nonce_account), "nonce returned twice");
        }
        assert_eq!(picked.len(), 5);
    }

    #[tokio::test]
    async fn test_release_returns_nonce() {
        let rpc = Arc::new(FakeRpc::new());
        let account = Keypair::new().pubkey().to_string();
        rpc.set(&account, state("auth"));

        let store = store_with(rpc);
        store.cache(&[account.clone()]).await.unwrap();

        let picked = store.pick_available().unwrap();
        store.release(&picked.nonce_account);
        assert_eq!(store.available(), 1);
    }

    #[tokio::test]
    async fn test_refresh_reenables_used_nonces() {
        let rpc = Arc::new(FakeRpc::new());
        let account = Keypair::new().pubkey().to_string();
        rpc.set(&account, state("auth"));

        let store = store_with(rpc.clone());
        store.cache(&[account.clone()]).await.unwrap();
        let before = store.pick_available().unwrap();
        assert_eq!(store.available(), 0);

        // the chain advanced the nonce
        rpc.set(&account, state("auth"));
        assert_eq!(store.refresh_all().await.unwrap(), 1);
        assert_eq!(store.available(), 1);

        let after = store.pick_available().unwrap();
        assert_ne!(before.blockhash, after.blockhash);
    }

    #[tokio::test]
    async fn test_refresh_drops_changed_authority() {
        let rpc = Arc::new(FakeRpc::new());
        let account = Keypair::new().pubkey().to_string();
        rpc.set(&account, state("auth"));

        let store = store_with(rpc.clone());
        store.cache(&[account.clone()]).await.unwrap();

        rpc.set(&account, state("someone-else"));
        assert_eq!(store.refresh_all().await.unwrap(), 0);
        assert_eq!(store.total(), 0);
    }

    #[tokio::test]
    async fn test_prepare_emits_batches() {
        let rpc = Arc::new(FakeRpc::new());
        let store = store_with(rpc);
        let payer = Keypair::new().pubkey().to_string();

        let batches = store.prepare(7, &payer).await.unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].nonce_pubkeys.len(), 5);
        assert_eq!(batches[1].nonce_pubkeys.len(), 2);
    }

    #[test]
    fn test_store_without_rpc() {
        let store = NonceStore::new(None, Arc::new(SystemClock));
        assert!(matches!(
            store.pick_available(),
            Err(NonceError::Unavailable)
        ));
    }

    #[test]
    fn test_bundle_add_replaces_duplicates() {
        let mut bundle = OfflineBundle::new(0);
        let account = Keypair::new().pubkey().to_string();

        bundle.add(CachedNonce {
            nonce_account: account.clone(),
            authority: "a".into(),
            blockhash: "h1".into(),
            lamports_per_signature: 1,
            cached_at_ms: 0,
            used: false,
        });
        bundle.add(CachedNonce {
            nonce_account: account,
            authority: "a".into(),
            blockhash: "h2".into(),
            lamports_per_signature: 1,
            cached_at_ms: 0,
            used: false,
        });

        assert_eq!(bundle.total(), 1);
        assert_eq!(bundle.nonces[0].blockhash, "h2");
    }

    #[test]
    fn test_bundle_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.json");
        let path = path.to_str().unwrap();

        let mut bundle = OfflineBundle::new(10);
        bundle.add(CachedNonce {
            nonce_account: Keypair::new().pubkey().to_string(),
            authority: "a".into(),
            blockhash: "h".into(),
            lamports_per_signature: 5_000,
            cached_at_ms: 10,
            used: false,
        });

        bundle.save_to_file(path).unwrap();
        let loaded = OfflineBundle::load_from_file(path).unwrap();
        assert_eq!(loaded.total(), 1);
        assert_eq!(loaded.available(), 1);
    }
}
