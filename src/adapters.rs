//! External adapter contracts
//!
//! Narrow interfaces the core consumes: BLE transport, network sensor,
//! wallet signer, chain RPC, and clock. All adapters are injected at `init`;
//! the core owns no process-wide state beyond its own snapshot file.

use std::sync::Arc;

use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use thiserror::Error;

/// BLE transport errors
#[derive(Debug, Clone, Error)]
pub enum BleError {
    #[error("transient BLE failure: {0}")]
    Transient(String),

    #[error("permanent BLE failure: {0}")]
    Permanent(String),
}

/// Push-based BLE send path. Optional: hosts that drive their own GATT stack
/// pull encoded frames with `pop_next_frame` instead.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Transmit one encoded frame. Resolves once the peer acknowledged the
    /// write, so the caller can retire the item per-frame.
    async fn send(&self, frame: &[u8]) -> Result<(), BleError>;

    /// Current negotiated MTU
    fn mtu(&self) -> usize;
}

/// Connectivity signal
pub trait NetworkSensor: Send + Sync {
    fn is_online(&self) -> bool;
}

/// A sensor pinned to one answer. Useful for hosts without a connectivity
/// callback and for tests.
pub struct StaticNetworkSensor(pub bool);

impl NetworkSensor for StaticNetworkSensor {
    fn is_online(&self) -> bool {
        self.0
    }
}

/// Wallet signing errors
#[derive(Debug, Clone, Error)]
pub enum SignError {
    #[error("signing rejected: {0}")]
    Rejected(String),

    #[error("signer unavailable: {0}")]
    Unavailable(String),
}

/// Result of a wallet signing request. The explicit contract keeps wallet SDK
/// objects out of the core.
#[derive(Debug, Clone)]
pub struct SignerResult {
    pub pubkey: Pubkey,
    pub signature: Signature,
}

/// External wallet that signs message bytes one at a time, never in bulk
#[async_trait]
pub trait WalletSigner: Send + Sync {
    async fn sign(&self, message: &[u8], pubkey: &Pubkey) -> Result<SignerResult, SignError>;
}

/// Chain RPC errors, split by retryability
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// Timeouts, 5xx, rate limits: route to the retry queue
    #[error("transient RPC failure: {0}")]
    Transient(String),

    /// Bad signature, expired nonce, malformed transaction: drop with a
    /// failed confirmation
    #[error("permanent RPC failure: {0}")]
    Permanent(String),
}

/// On-chain state of a durable nonce account
#[derive(Debug, Clone)]
pub struct NonceState {
    pub authority: String,
    pub blockhash: String,
    pub lamports_per_signature: u64,
}

/// Chain access used for submission and nonce provisioning
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Submit fully signed transaction bytes (Solana wire format)
    async fn submit(&self, tx_bytes: &[u8]) -> Result<String, RpcError>;

    /// Read the current state of a durable nonce account
    async fn get_nonce(&self, nonce_account: &Pubkey) -> Result<NonceState, RpcError>;

    /// Latest blockhash, needed only while provisioning nonce accounts
    async fn latest_blockhash(&self) -> Result<String, RpcError>;

    /// Rent-exempt minimum for an account of the given size
    async fn rent_exempt_minimum(&self, data_len: usize) -> Result<u64, RpcError>;

    fn healthy(&self) -> bool {
        true
    }
}

/// Millisecond clock
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock in Unix epoch milliseconds. Persisted retry schedules and
/// dedup timestamps reference the same epoch.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// The full adapter set injected into the core
pub struct Adapters {
    pub ble: Option<Arc<dyn BleTransport>>,
    pub network: Arc<dyn NetworkSensor>,
    pub signer: Option<Arc<dyn WalletSigner>>,
    pub rpc: Option<Arc<dyn ChainRpc>>,
    pub clock: Arc<dyn Clock>,
}

impl Adapters {
    /// Minimal adapter set: system clock, reported offline, no BLE push path,
    /// no signer, no RPC. Everything the core does in this mode is queue,
    /// relay, and persist.
    pub fn offline() -> Self {
        Self {
            ble: None,
            network: Arc::new(StaticNetworkSensor(false)),
            signer: None,
            rpc: None,
            clock: Arc::new(SystemClock),
        }
    }
}

#[cfg(feature = "rpc-client")]
pub use solana_rpc::SolanaRpc;

#[cfg(feature = "rpc-client")]
mod solana_rpc {
    use super::*;

    use solana_client::client_error::{ClientError, ClientErrorKind};
    use solana_client::rpc_client::RpcClient;
    use solana_sdk::commitment_config::CommitmentConfig;
    use solana_sdk::transaction::Transaction;

    /// `ChainRpc` backed by `solana_client`. Each call builds a blocking
    /// client inside `spawn_blocking` so the async runtime never stalls.
    pub struct SolanaRpc {
        url: String,
    }

    impl SolanaRpc {
        pub fn new(url: impl Into<String>) -> Self {
            Self { url: url.into() }
        }

        fn client(url: &str) -> RpcClient {
            RpcClient::new_with_commitment(url.to_string(), CommitmentConfig::confirmed())
        }

        fn classify(err: ClientError) -> RpcError {
            match err.kind() {
                ClientErrorKind::Io(_) | ClientErrorKind::Reqwest(_) => {
                    RpcError::Transient(err.to_string())
                }
                ClientErrorKind::TransactionError(_) | ClientErrorKind::SigningError(_) => {
                    RpcError::Permanent(err.to_string())
                }
                _ => RpcError::Transient(err.to_string()),
            }
        }

        async fn blocking<T, F>(&self, op: F) -> Result<T, RpcError>
        where
            T: Send + 'static,
            F: FnOnce(RpcClient) -> Result<T, ClientError> + Send + 'static,
        {
            let url = self.url.clone();
            tokio::task::spawn_blocking(move || op(Self::client(&url)))
                .await
                .map_err(|e| RpcError::Transient(format!("rpc task join error: {e}")))?
                .map_err(Self::classify)
        }
    }

    #[async_trait]
    impl ChainRpc for SolanaRpc {
        async fn submit(&self, tx_bytes: &[u8]) -> Result<String, RpcError> {
            let tx: Transaction = bincode1::deserialize(tx_bytes)
                .map_err(|e| RpcError::Permanent(format!("transaction decode failed: {e}")))?;
            if tx.signatures.iter().all(|sig| *sig == Signature::default()) {
                return Err(RpcError::Permanent("transaction has no signatures".into()));
            }

            self.blocking(move |client| client.send_and_confirm_transaction(&tx))
                .await
                .map(|sig| sig.to_string())
        }

        async fn get_nonce(&self, nonce_account: &Pubkey) -> Result<NonceState, RpcError> {
            let pubkey = *nonce_account;
            let account = self
                .blocking(move |client| client.get_account(&pubkey))
                .await?;

            let versions: solana_sdk::nonce::state::Versions =
                bincode1::deserialize(&account.data).map_err(|e| {
                    RpcError::Permanent(format!("nonce account decode failed: {e}"))
                })?;

            match versions.state() {
                solana_sdk::nonce::State::Initialized(data) => Ok(NonceState {
                    authority: data.authority.to_string(),
                    blockhash: data.blockhash().to_string(),
                    lamports_per_signature: data.fee_calculator.lamports_per_signature,
                }),
                _ => Err(RpcError::Permanent("nonce account not initialized".into())),
            }
        }

        async fn latest_blockhash(&self) -> Result<String, RpcError> {
            self.blocking(|client| client.get_latest_blockhash())
                .await
                .map(|hash| hash.to_string())
        }

        async fn rent_exempt_minimum(&self, data_len: usize) -> Result<u64, RpcError> {
            self.blocking(move |client| client.get_minimum_balance_for_rent_exemption(data_len))
                .await
        }
    }
}
