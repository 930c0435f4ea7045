//! Unsigned transaction composition
//!
//! Builds Solana messages from public keys and cached durable-nonce data so
//! signing can happen elsewhere (hardware wallet, MWA, keystore). The builder
//! never accepts a user private key; the only keypairs it touches are the
//! ephemeral nonce-account keypairs it generates and immediately exports.
//!
//! Every durable-nonce transaction starts with an advance-nonce instruction
//! and carries the nonce's stored blockhash, so it stays valid until the
//! nonce account advances.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use solana_program::instruction::{AccountMeta, Instruction};
use solana_sdk::{
    hash::Hash,
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    system_instruction,
    transaction::Transaction,
};
use spl_associated_token_account::instruction as ata_instruction;
use spl_token::instruction as spl_instruction;
use std::str::FromStr;
use thiserror::Error;

use crate::nonce::CachedNonce;

/// Governance program targeted by vote transactions
pub const GOVERNANCE_PROGRAM_ID: &str = "GovER5Lthms3bLBqWub97yVrMmEogzX7xNjdXpPPCVZw";

/// Instruction tag for a cast-vote, followed by the choice byte
const CAST_VOTE_TAG: u8 = 13;

/// Nonce accounts created per batched transaction. Keeps each batch within
/// one fee while staying under the transaction size limit.
pub const MAX_NONCE_ACCOUNTS_PER_TX: usize = 5;

/// One batched unsigned nonce-create transaction plus the ephemeral keypairs
/// that must co-sign it after the payer does
#[derive(Debug, Clone)]
pub struct UnsignedNonceBatch {
    pub unsigned_transaction_base64: String,
    /// Ephemeral account keypairs, base64 of the 64-byte secret
    pub nonce_keypairs_base64: Vec<String>,
    pub nonce_pubkeys: Vec<String>,
}

/// Builder errors
#[derive(Debug, Clone, Error)]
pub enum TransactionError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("nonce authority {expected} does not match {got}")]
    AuthorityMismatch { expected: String, got: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("instruction error: {0}")]
    Instruction(String),

    #[error("signer {0} is not required by this transaction")]
    SignerNotRequired(String),
}

fn parse_pubkey(label: &str, value: &str) -> Result<Pubkey, TransactionError> {
    Pubkey::from_str(value)
        .map_err(|e| TransactionError::InvalidPublicKey(format!("{label}: {e}")))
}

fn parse_blockhash(value: &str) -> Result<Hash, TransactionError> {
    Hash::from_str(value)
        .map_err(|e| TransactionError::InvalidPublicKey(format!("blockhash: {e}")))
}

fn decode_transaction(base64_tx: &str) -> Result<Transaction, TransactionError> {
    let bytes = BASE64
        .decode(base64_tx)
        .map_err(|e| TransactionError::Serialization(format!("base64 decode failed: {e}")))?;
    bincode1::deserialize(&bytes)
        .map_err(|e| TransactionError::Serialization(format!("transaction decode failed: {e}")))
}

fn encode_transaction(tx: &Transaction) -> Result<String, TransactionError> {
    let bytes =
        bincode1::serialize(tx).map_err(|e| TransactionError::Serialization(e.to_string()))?;
    Ok(BASE64.encode(bytes))
}

/// Pure message composition over public keys and cached nonce data
pub struct TransactionBuilder;

impl TransactionBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Validate that the nonce's on-chain authority matches the given signer
    fn check_authority(
        nonce: &CachedNonce,
        authority: &Pubkey,
    ) -> Result<Pubkey, TransactionError> {
        let cached = parse_pubkey("nonce authority", &nonce.authority)?;
        if cached != *authority {
            return Err(TransactionError::AuthorityMismatch {
                expected: nonce.authority.clone(),
                got: authority.to_string(),
            });
        }
        Ok(cached)
    }

    fn finalize(
        instructions: &[Instruction],
        fee_payer: &Pubkey,
        blockhash: Hash,
    ) -> Result<String, TransactionError> {
        let mut tx = Transaction::new_with_payer(instructions, Some(fee_payer));
        tx.message.recent_blockhash = blockhash;
        encode_transaction(&tx)
    }

    /// Unsigned SOL transfer against a cached durable nonce.
    ///
    /// The sender is the nonce authority. Returns base64 of the Solana wire
    /// encoding, ready for external signing.
    pub fn unsigned_sol_transfer(
        &self,
        sender: &str,
        recipient: &str,
        fee_payer: &str,
        lamports: u64,
        nonce: &CachedNonce,
    ) -> Result<String, TransactionError> {
        let sender_pubkey = parse_pubkey("sender", sender)?;
        let recipient_pubkey = parse_pubkey("recipient", recipient)?;
        let fee_payer_pubkey = parse_pubkey("fee payer", fee_payer)?;
        let nonce_account = parse_pubkey("nonce account", &nonce.nonce_account)?;
        let authority = Self::check_authority(nonce, &sender_pubkey)?;
        let blockhash = parse_blockhash(&nonce.blockhash)?;

        let advance_nonce_ix = system_instruction::advance_nonce_account(&nonce_account, &authority);
        let transfer_ix = system_instruction::transfer(&sender_pubkey, &recipient_pubkey, lamports);

        tracing::debug!(
            "built unsigned SOL transfer: {} lamports, nonce {}",
            lamports,
            nonce.nonce_account
        );

        Self::finalize(&[advance_nonce_ix, transfer_ix], &fee_payer_pubkey, blockhash)
    }

    /// Unsigned SPL token transfer against a cached durable nonce.
    ///
    /// Associated token accounts are derived from the wallet pubkeys and the
    /// mint; the recipient's ATA is created idempotently so the transfer is
    /// safe whether or not the account already exists.
    pub fn unsigned_spl_transfer(
        &self,
        sender_wallet: &str,
        recipient_wallet: &str,
        fee_payer: &str,
        mint_address: &str,
        amount: u64,
        nonce: &CachedNonce,
    ) -> Result<String, TransactionError> {
        let sender_pubkey = parse_pubkey("sender wallet", sender_wallet)?;
        let recipient_pubkey = parse_pubkey("recipient wallet", recipient_wallet)?;
        let fee_payer_pubkey = parse_pubkey("fee payer", fee_payer)?;
        let mint_pubkey = parse_pubkey("mint", mint_address)?;
        let nonce_account = parse_pubkey("nonce account", &nonce.nonce_account)?;
        let authority = Self::check_authority(nonce, &sender_pubkey)?;
        let blockhash = parse_blockhash(&nonce.blockhash)?;

        let sender_token_account = spl_associated_token_account::get_associated_token_address(
            &sender_pubkey,
            &mint_pubkey,
        );
        let recipient_token_account = spl_associated_token_account::get_associated_token_address(
            &recipient_pubkey,
            &mint_pubkey,
        );

        let advance_nonce_ix = system_instruction::advance_nonce_account(&nonce_account, &authority);
        let create_ata_ix = ata_instruction::create_associated_token_account_idempotent(
            &fee_payer_pubkey,
            &recipient_pubkey,
            &mint_pubkey,
            &spl_token::id(),
        );
        let spl_transfer_ix = spl_instruction::transfer(
            &spl_token::id(),
            &sender_token_account,
            &recipient_token_account,
            &sender_pubkey,
            &[],
            amount,
        )
        .map_err(|e| TransactionError::Instruction(e.to_string()))?;

        tracing::debug!(
            "built unsigned SPL transfer: {} units of {}, sender ATA {}, recipient ATA {}",
            amount,
            mint_pubkey,
            sender_token_account,
            recipient_token_account
        );

        Self::finalize(
            &[advance_nonce_ix, create_ata_ix, spl_transfer_ix],
            &fee_payer_pubkey,
            blockhash,
        )
    }

    /// Unsigned governance vote against a cached durable nonce.
    ///
    /// The voter is the nonce authority. The vote instruction carries the
    /// choice byte verbatim after the cast-vote tag.
    pub fn unsigned_vote(
        &self,
        voter: &str,
        proposal: &str,
        vote_account: &str,
        choice: u8,
        fee_payer: &str,
        nonce: &CachedNonce,
    ) -> Result<String, TransactionError> {
        let voter_pubkey = parse_pubkey("voter", voter)?;
        let proposal_pubkey = parse_pubkey("proposal", proposal)?;
        let vote_account_pubkey = parse_pubkey("vote account", vote_account)?;
        let fee_payer_pubkey = parse_pubkey("fee payer", fee_payer)?;
        let nonce_account = parse_pubkey("nonce account", &nonce.nonce_account)?;
        let authority = Self::check_authority(nonce, &voter_pubkey)?;
        let blockhash = parse_blockhash(&nonce.blockhash)?;

        let governance_program = parse_pubkey("governance program", GOVERNANCE_PROGRAM_ID)?;
        let advance_nonce_ix = system_instruction::advance_nonce_account(&nonce_account, &authority);
        let vote_ix = Instruction {
            program_id: governance_program,
            accounts: vec![
                AccountMeta::new(proposal_pubkey, false),
                AccountMeta::new(vote_account_pubkey, false),
                AccountMeta::new_readonly(voter_pubkey, true),
            ],
            data: vec![CAST_VOTE_TAG, choice],
        };

        tracing::debug!(
            "built unsigned vote: proposal {}, choice {}",
            proposal_pubkey,
            choice
        );

        Self::finalize(&[advance_nonce_ix, vote_ix], &fee_payer_pubkey, blockhash)
    }

    /// Unsigned nonce-account creation transactions, batched up to five
    /// accounts per transaction to amortize fees.
    ///
    /// Each account needs a fresh ephemeral keypair as co-signer; the
    /// keypairs are generated here and returned base64-encoded so the caller
    /// can attach their signatures with [`add_nonce_signatures`] after the
    /// payer signs. The payer becomes the nonce authority.
    ///
    /// [`add_nonce_signatures`]: TransactionBuilder::add_nonce_signatures
    pub fn unsigned_nonce_create(
        &self,
        payer: &str,
        count: usize,
        rent_lamports: u64,
        recent_blockhash: &str,
    ) -> Result<Vec<UnsignedNonceBatch>, TransactionError> {
        let payer_pubkey = parse_pubkey("payer", payer)?;
        let blockhash = parse_blockhash(recent_blockhash)?;

        let mut batches = Vec::new();
        let mut remaining = count;
        while remaining > 0 {
            let in_this_tx = remaining.min(MAX_NONCE_ACCOUNTS_PER_TX);
            remaining -= in_this_tx;

            let mut instructions = Vec::new();
            let mut keypairs_base64 = Vec::with_capacity(in_this_tx);
            let mut pubkeys = Vec::with_capacity(in_this_tx);

            for _ in 0..in_this_tx {
                let nonce_keypair = Keypair::new();
                let nonce_pubkey = nonce_keypair.pubkey();

                instructions.extend(system_instruction::create_nonce_account(
                    &payer_pubkey,
                    &nonce_pubkey,
                    &payer_pubkey,
                    rent_lamports,
                ));

                keypairs_base64.push(BASE64.encode(nonce_keypair.to_bytes()));
                pubkeys.push(nonce_pubkey.to_string());
            }

            let mut tx = Transaction::new_with_payer(&instructions, Some(&payer_pubkey));
            tx.message.recent_blockhash = blockhash;

            batches.push(UnsignedNonceBatch {
                unsigned_transaction_base64: encode_transaction(&tx)?,
                nonce_keypairs_base64: keypairs_base64,
                nonce_pubkeys: pubkeys,
            });
        }

        tracing::info!(
            "prepared {} nonce-create transactions for {} accounts",
            batches.len(),
            count
        );

        Ok(batches)
    }

    /// Attach an externally produced signature to an unsigned transaction.
    ///
    /// The signature is placed at every required-signer position held by
    /// `signer_pubkey`, so a signer acting as both nonce authority and sender
    /// is covered in one call.
    pub fn add_signature(
        &self,
        base64_tx: &str,
        signer_pubkey: &Pubkey,
        signature: &Signature,
    ) -> Result<String, TransactionError> {
        let mut tx = decode_transaction(base64_tx)?;

        let required = tx.message.header.num_required_signatures as usize;
        let positions: Vec<usize> = tx.message.account_keys[..required]
            .iter()
            .enumerate()
            .filter(|(_, key)| *key == signer_pubkey)
            .map(|(i, _)| i)
            .collect();

        if positions.is_empty() {
            return Err(TransactionError::SignerNotRequired(
                signer_pubkey.to_string(),
            ));
        }

        for position in positions {
            tx.signatures[position] = *signature;
        }

        let valid = tx
            .signatures
            .iter()
            .filter(|sig| **sig != Signature::default())
            .count();
        tracing::debug!(
            "attached signature for {}, transaction now has {}/{} signatures",
            signer_pubkey,
            valid,
            tx.signatures.len()
        );

        encode_transaction(&tx)
    }

    /// Co-sign with the ephemeral nonce-account keypairs from
    /// [`unsigned_nonce_create`], leaving other signature slots untouched.
    ///
    /// [`unsigned_nonce_create`]: TransactionBuilder::unsigned_nonce_create
    pub fn add_nonce_signatures(
        &self,
        base64_tx: &str,
        keypairs: &[Keypair],
    ) -> Result<String, TransactionError> {
        let mut tx = decode_transaction(base64_tx)?;
        let blockhash = tx.message.recent_blockhash;

        let signers: Vec<&Keypair> = keypairs.iter().collect();
        tx.partial_sign(&signers, blockhash);

        encode_transaction(&tx)
    }

    /// Exact bytes an external signer must sign for this transaction
    pub fn message_to_sign(&self, base64_tx: &str) -> Result<Vec<u8>, TransactionError> {
        let tx = decode_transaction(base64_tx)?;
        Ok(tx.message_data())
    }

    /// Required signer pubkeys in protocol order (base58)
    pub fn required_signers(&self, base64_tx: &str) -> Result<Vec<String>, TransactionError> {
        let tx = decode_transaction(base64_tx)?;
        let required = tx.message.header.num_required_signatures as usize;
        Ok(tx.message.account_keys[..required]
            .iter()
            .map(|key| key.to_string())
            .collect())
    }

    /// Rewrite an unsigned transaction's nonce blockhash, used right before
    /// signing to minimize expiry risk. Any existing signatures are cleared
    /// since they no longer match the message.
    pub fn refresh_nonce_blockhash(
        &self,
        base64_tx: &str,
        blockhash: &str,
    ) -> Result<String, TransactionError> {
        let mut tx = decode_transaction(base64_tx)?;
        tx.message.recent_blockhash = parse_blockhash(blockhash)?;
        tx.signatures = vec![Signature::default(); tx.signatures.len()];
        encode_transaction(&tx)
    }

    /// Parse ephemeral keypairs exported by [`unsigned_nonce_create`]
    ///
    /// [`unsigned_nonce_create`]: TransactionBuilder::unsigned_nonce_create
    pub fn decode_nonce_keypairs(
        &self,
        keypairs_base64: &[String],
    ) -> Result<Vec<Keypair>, TransactionError> {
        keypairs_base64
            .iter()
            .map(|encoded| {
                let bytes = BASE64.decode(encoded).map_err(|e| {
                    TransactionError::Serialization(format!("keypair decode failed: {e}"))
                })?;
                Keypair::from_bytes(&bytes).map_err(|e| {
                    TransactionError::Serialization(format!("invalid keypair bytes: {e}"))
                })
            })
            .collect()
    }
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::system_program;

    fn cached_nonce(authority: &Pubkey) -> CachedNonce {
        CachedNonce {
            nonce_account: Keypair::new().pubkey().to_string(),
            authority: authority.to_string(),
            blockhash: Hash::new_unique().to_string(),
            lamports_per_signature: 5_000,
            cached_at_ms: 0,
            used: false,
        }
    }

    fn decode(base64_tx: &str) -> Transaction {
        let bytes = BASE64.decode(base64_tx).unwrap();
        bincode1::deserialize(&bytes).unwrap()
    }

    #[test]
    fn test_sol_transfer_structure() {
        let builder = TransactionBuilder::new();
        let sender = Keypair::new().pubkey();
        let recipient = Keypair::new().pubkey();
        let nonce = cached_nonce(&sender);

        let tx = builder
            .unsigned_sol_transfer(
                &sender.to_string(),
                &recipient.to_string(),
                &sender.to_string(),
                1_000_000,
                &nonce,
            )
            .unwrap();

        let tx = decode(&tx);
        assert_eq!(tx.message.instructions.len(), 2);
        // advance nonce first, against the system program
        let first = &tx.message.instructions[0];
        assert_eq!(
            tx.message.account_keys[first.program_id_index as usize],
            system_program::id()
        );
        assert_eq!(
            tx.message.recent_blockhash,
            Hash::from_str(&nonce.blockhash).unwrap()
        );
        // unsigned: every slot is the default signature
        assert!(tx.signatures.iter().all(|s| *s == Signature::default()));
    }

    #[test]
    fn test_sol_transfer_authority_mismatch() {
        let builder = TransactionBuilder::new();
        let sender = Keypair::new().pubkey();
        let other = Keypair::new().pubkey();
        let nonce = cached_nonce(&other);

        let result = builder.unsigned_sol_transfer(
            &sender.to_string(),
            &Keypair::new().pubkey().to_string(),
            &sender.to_string(),
            1,
            &nonce,
        );
        assert!(matches!(
            result,
            Err(TransactionError::AuthorityMismatch { .. })
        ));
    }

    #[test]
    fn test_spl_transfer_structure() {
        let builder = TransactionBuilder::new();
        let sender = Keypair::new().pubkey();
        let nonce = cached_nonce(&sender);

        let tx = builder
            .unsigned_spl_transfer(
                &sender.to_string(),
                &Keypair::new().pubkey().to_string(),
                &sender.to_string(),
                &Keypair::new().pubkey().to_string(),
                250,
                &nonce,
            )
            .unwrap();

        let tx = decode(&tx);
        // advance nonce, create ATA, token transfer
        assert_eq!(tx.message.instructions.len(), 3);
        let token_program_present = tx
            .message
            .account_keys
            .iter()
            .any(|key| *key == spl_token::id());
        assert!(token_program_present);
    }

    #[test]
    fn test_vote_carries_choice_byte() {
        let builder = TransactionBuilder::new();
        let voter = Keypair::new().pubkey();
        let nonce = cached_nonce(&voter);

        let tx = builder
            .unsigned_vote(
                &voter.to_string(),
                &Keypair::new().pubkey().to_string(),
                &Keypair::new().pubkey().to_string(),
                2,
                &voter.to_string(),
                &nonce,
            )
            .unwrap();

        let tx = decode(&tx);
        assert_eq!(tx.message.instructions.len(), 2);
        assert_eq!(tx.message.instructions[1].data, vec![CAST_VOTE_TAG, 2]);
    }

    #[test]
    fn test_nonce_create_batches_of_five() {
        let builder = TransactionBuilder::new();
        let payer = Keypair::new().pubkey();

        let batches = builder
            .unsigned_nonce_create(
                &payer.to_string(),
                12,
                1_500_000,
                &Hash::new_unique().to_string(),
            )
            .unwrap();

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].nonce_pubkeys.len(), 5);
        assert_eq!(batches[1].nonce_pubkeys.len(), 5);
        assert_eq!(batches[2].nonce_pubkeys.len(), 2);

        for batch in &batches {
            assert_eq!(batch.nonce_keypairs_base64.len(), batch.nonce_pubkeys.len());
            let tx = decode(&batch.unsigned_transaction_base64);
            // payer plus one ephemeral signer per account
            assert_eq!(
                tx.message.header.num_required_signatures as usize,
                1 + batch.nonce_pubkeys.len()
            );
        }
    }

    #[test]
    fn test_add_signature_roundtrip() {
        let builder = TransactionBuilder::new();
        let sender_keypair = Keypair::new();
        let sender = sender_keypair.pubkey();
        let nonce = cached_nonce(&sender);

        let unsigned = builder
            .unsigned_sol_transfer(
                &sender.to_string(),
                &Keypair::new().pubkey().to_string(),
                &sender.to_string(),
                42,
                &nonce,
            )
            .unwrap();

        let message = builder.message_to_sign(&unsigned).unwrap();
        assert!(!message.is_empty());

        let signature = sender_keypair.sign_message(&message);
        let signed = builder
            .add_signature(&unsigned, &sender, &signature)
            .unwrap();

        let tx = decode(&signed);
        assert!(tx.signatures.iter().any(|s| *s == signature));
        assert!(tx.verify().is_ok());
    }

    #[test]
    fn test_add_signature_rejects_stranger() {
        let builder = TransactionBuilder::new();
        let sender = Keypair::new().pubkey();
        let nonce = cached_nonce(&sender);

        let unsigned = builder
            .unsigned_sol_transfer(
                &sender.to_string(),
                &Keypair::new().pubkey().to_string(),
                &sender.to_string(),
                42,
                &nonce,
            )
            .unwrap();

        let stranger = Keypair::new();
        let result = builder.add_signature(
            &unsigned,
            &stranger.pubkey(),
            &stranger.sign_message(b"whatever"),
        );
        assert!(matches!(
            result,
            Err(TransactionError::SignerNotRequired(_))
        ));
    }

    #[test]
    fn test_required_signers_order() {
        let builder = TransactionBuilder::new();
        let sender = Keypair::new().pubkey();
        let fee_payer = Keypair::new().pubkey();
        let nonce = cached_nonce(&sender);

        let unsigned = builder
            .unsigned_sol_transfer(
                &sender.to_string(),
                &Keypair::new().pubkey().to_string(),
                &fee_payer.to_string(),
                42,
                &nonce,
            )
            .unwrap();

        let signers = builder.required_signers(&unsigned).unwrap();
        assert_eq!(signers[0], fee_payer.to_string());
        assert!(signers.contains(&sender.to_string()));
    }

    #[test]
    fn test_nonce_signatures_attach() {
        let builder = TransactionBuilder::new();
        let payer = Keypair::new().pubkey();

        let batches = builder
            .unsigned_nonce_create(&payer.to_string(), 2, 1_000_000, &Hash::new_unique().to_string())
            .unwrap();
        let batch = &batches[0];

        let keypairs = builder
            .decode_nonce_keypairs(&batch.nonce_keypairs_base64)
            .unwrap();
        let signed = builder
            .add_nonce_signatures(&batch.unsigned_transaction_base64, &keypairs)
            .unwrap();

        let tx = decode(&signed);
        let attached = tx
            .signatures
            .iter()
            .filter(|s| **s != Signature::default())
            .count();
        assert_eq!(attached, 2);
    }

    #[test]
    fn test_refresh_nonce_blockhash_clears_signatures() {
        let builder = TransactionBuilder::new();
        let sender_keypair = Keypair::new();
        let sender = sender_keypair.pubkey();
        let nonce = cached_nonce(&sender);

        let unsigned = builder
            .unsigned_sol_transfer(
                &sender.to_string(),
                &Keypair::new().pubkey().to_string(),
                &sender.to_string(),
                42,
                &nonce,
            )
            .unwrap();
        let message = builder.message_to_sign(&unsigned).unwrap();
        let signed = builder
            .add_signature(&unsigned, &sender, &sender_keypair.sign_message(&message))
            .unwrap();

        let new_hash = Hash::new_unique().to_string();
        let refreshed = builder
            .refresh_nonce_blockhash(&signed, &new_hash)
            .unwrap();

        let tx = decode(&refreshed);
        assert_eq!(tx.message.recent_blockhash, Hash::from_str(&new_hash).unwrap());
        assert!(tx.signatures.iter().all(|s| *s == Signature::default()));
    }
}
