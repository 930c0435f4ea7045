//! Restart survival: queues, dedup, and the nonce bundle come back from the
//! snapshot after a clean shutdown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};

use solmesh::adapters::{
    Adapters, ChainRpc, NonceState, RpcError, StaticNetworkSensor, SystemClock,
};
use solmesh::codec;
use solmesh::config::CoreConfig;
use solmesh::SolMeshCore;

struct TransientRpc {
    calls: AtomicUsize,
    authority: String,
}

#[async_trait]
impl ChainRpc for TransientRpc {
    async fn submit(&self, _tx_bytes: &[u8]) -> Result<String, RpcError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RpcError::Transient("gateway saturated".into()))
    }

    async fn get_nonce(&self, _nonce_account: &Pubkey) -> Result<NonceState, RpcError> {
        Ok(NonceState {
            authority: self.authority.clone(),
            blockhash: solana_sdk::hash::Hash::new_unique().to_string(),
            lamports_per_signature: 5_000,
        })
    }

    async fn latest_blockhash(&self) -> Result<String, RpcError> {
        Ok(solana_sdk::hash::Hash::new_unique().to_string())
    }

    async fn rent_exempt_minimum(&self, _data_len: usize) -> Result<u64, RpcError> {
        Ok(1_500_000)
    }
}

fn config_with_storage(dir: &std::path::Path) -> CoreConfig {
    CoreConfig {
        enable_logging: false,
        storage_directory: Some(dir.to_path_buf()),
        ..Default::default()
    }
}

fn online_adapters(rpc: Arc<TransientRpc>) -> Adapters {
    Adapters {
        ble: None,
        network: Arc::new(StaticNetworkSensor(true)),
        signer: None,
        rpc: Some(rpc),
        clock: Arc::new(SystemClock),
    }
}

fn feed_frames(core: &SolMeshCore, payload: &[u8]) {
    for fragment in codec::fragment(payload, 200).unwrap() {
        core.push_inbound(&codec::encode(&fragment));
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_retry_and_dedup_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let authority = Keypair::new().pubkey().to_string();
    let tx_bytes = vec![0x42u8; 220];

    // first life: a transient failure parks the transaction in retry
    {
        let rpc = Arc::new(TransientRpc {
            calls: AtomicUsize::new(0),
            authority: authority.clone(),
        });
        let core = SolMeshCore::init(config_with_storage(dir.path()), online_adapters(rpc.clone()))
            .await
            .unwrap();

        feed_frames(&core, &tx_bytes);
        settle().await;

        assert_eq!(rpc.calls.load(Ordering::SeqCst), 1);
        assert_eq!(core.queue_sizes().retry, 1);

        // shutdown forces the final save
        core.shutdown().await;
    }

    // second life: the retry item and dedup entry come back
    {
        let rpc = Arc::new(TransientRpc {
            calls: AtomicUsize::new(0),
            authority,
        });
        let core = SolMeshCore::init(config_with_storage(dir.path()), online_adapters(rpc.clone()))
            .await
            .unwrap();

        assert_eq!(core.queue_sizes().retry, 1);

        // dedup survived: the same frames are dropped without resubmission
        feed_frames(&core, &tx_bytes);
        settle().await;
        assert_eq!(rpc.calls.load(Ordering::SeqCst), 0);
        assert!(core.metrics().duplicates_dropped > 0);

        core.shutdown().await;
    }
}

#[tokio::test]
async fn test_nonce_bundle_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let authority = Keypair::new().pubkey().to_string();
    let nonce_account = Keypair::new().pubkey().to_string();

    {
        let rpc = Arc::new(TransientRpc {
            calls: AtomicUsize::new(0),
            authority: authority.clone(),
        });
        let core = SolMeshCore::init(config_with_storage(dir.path()), online_adapters(rpc))
            .await
            .unwrap();

        assert_eq!(
            core.cache_nonce_accounts(&[nonce_account.clone()])
                .await
                .unwrap(),
            1
        );
        // consume it so the used flag has something to prove
        let picked = core.pick_available_nonce().unwrap();
        assert_eq!(picked.nonce_account, nonce_account);

        core.shutdown().await;
    }

    {
        let rpc = Arc::new(TransientRpc {
            calls: AtomicUsize::new(0),
            authority,
        });
        let core = SolMeshCore::init(config_with_storage(dir.path()), online_adapters(rpc))
            .await
            .unwrap();

        // the consumed flag survived the crash boundary: still nothing to pick
        assert_eq!(core.available_nonces(), 0);
        assert!(core.pick_available_nonce().is_err());

        core.shutdown().await;
    }
}

#[tokio::test]
async fn test_force_save_then_fresh_directory_is_independent() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    {
        let core = SolMeshCore::init(
            config_with_storage(dir_a.path()),
            Adapters::offline(),
        )
        .await
        .unwrap();
        feed_frames(&core, &vec![0x11u8; 150]);
        settle().await;
        core.force_save().await;
        core.shutdown().await;
    }

    // a different storage directory starts clean
    let core = SolMeshCore::init(config_with_storage(dir_b.path()), Adapters::offline())
        .await
        .unwrap();
    assert_eq!(core.metrics().duplicates_dropped, 0);
    let fresh = core.queue_sizes();
    assert_eq!(fresh.retry, 0);
    assert_eq!(fresh.received, 0);
    core.shutdown().await;
}
