//! Submit-or-relay policy
//!
//! Every reassembled transaction either goes to the chain (when this node is
//! online with a healthy RPC) or back out over the mesh at normal priority so
//! it keeps propagating toward a node that is. Submission is preferred
//! whenever both are possible.

use crate::adapters::{ChainRpc, NetworkSensor, RpcError};
use crate::util::lz;

/// What to do with a received transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDecision {
    /// Submit to the chain RPC
    Submit,
    /// Re-fragment into the outbound queue and keep flooding
    Relay,
}

/// Decide submit-vs-relay from current connectivity
pub fn decide(network: &dyn NetworkSensor, rpc: Option<&dyn ChainRpc>) -> RelayDecision {
    match rpc {
        Some(rpc) if network.is_online() && rpc.healthy() => RelayDecision::Submit,
        _ => RelayDecision::Relay,
    }
}

/// Outcome of one submission attempt
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Confirmed on chain; carries the signature
    Submitted(String),
    /// Worth retrying with backoff
    Transient(String),
    /// Drop with a failed confirmation
    Permanent(String),
}

/// Submit mesh bytes to the chain, undoing transport compression first.
pub async fn submit(rpc: &dyn ChainRpc, mesh_bytes: &[u8]) -> SubmitOutcome {
    let wire_bytes = match lz::decompress_if_needed(mesh_bytes) {
        Ok(bytes) => bytes,
        Err(e) => return SubmitOutcome::Permanent(format!("decompression failed: {e}")),
    };

    match rpc.submit(&wire_bytes).await {
        Ok(signature) => {
            tracing::info!("submitted transaction, signature {signature}");
            SubmitOutcome::Submitted(signature)
        }
        Err(RpcError::Transient(reason)) => {
            tracing::warn!("transient submit failure: {reason}");
            SubmitOutcome::Transient(reason)
        }
        Err(RpcError::Permanent(reason)) => {
            tracing::warn!("permanent submit failure: {reason}");
            SubmitOutcome::Permanent(reason)
        }
    }
}
