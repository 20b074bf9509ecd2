pub mod boltz;
pub mod service;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReverseSwapStatus {
    /// Created at the service, hold invoice not yet accepted.
    Initial,
    /// Hold invoice accepted, waiting for the lockup to confirm and be claimed.
    InProgress,
    Cancelled,
    /// Claim transaction broadcast.
    CompletedSeen,
    /// Claim transaction confirmed.
    CompletedConfirmed,
}

impl ReverseSwapStatus {
    pub fn is_monitored(self) -> bool {
        matches!(
            self,
            ReverseSwapStatus::Initial
                | ReverseSwapStatus::InProgress
                | ReverseSwapStatus::CompletedSeen
        )
    }

    /// Swaps still holding Lightning funds.
    pub fn is_blocking(self) -> bool {
        matches!(self, ReverseSwapStatus::Initial | ReverseSwapStatus::InProgress)
    }

    pub fn is_completed(self) -> bool {
        matches!(
            self,
            ReverseSwapStatus::CompletedSeen | ReverseSwapStatus::CompletedConfirmed
        )
    }
}

/// Everything needed to claim a reverse swap, persisted locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullReverseSwapInfo {
    pub id: String,
    pub created_at_block_height: u32,
    pub preimage: Vec<u8>,
    pub private_key: Vec<u8>,
    pub destination_address: String,
    pub timeout_block_height: u32,
    pub invoice: String,
    pub redeem_script: String,
    /// Amount locked by the service.
    pub onchain_amount_sat: u64,
    /// Amount the destination receives after the claim fee.
    pub receive_amount_sat: u64,
    pub sat_per_vbyte: u32,
    pub lockup_address: String,
    pub status: ReverseSwapStatus,
    pub lockup_txid: Option<String>,
    pub claim_txid: Option<String>,
}

impl FullReverseSwapInfo {
    pub fn claim_pubkey(&self) -> Result<PublicKey> {
        let sk = SecretKey::from_slice(&self.private_key).context("parse claim private key")?;
        Ok(sk.public_key(&Secp256k1::signing_only()))
    }

    pub fn info(&self) -> Result<ReverseSwapInfo> {
        Ok(ReverseSwapInfo {
            id: self.id.clone(),
            claim_pubkey: self.claim_pubkey()?.to_string(),
            destination_address: self.destination_address.clone(),
            lockup_txid: self.lockup_txid.clone(),
            claim_txid: self.claim_txid.clone(),
            onchain_amount_sat: self.onchain_amount_sat,
            status: self.status,
        })
    }
}

/// Public view of a reverse swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseSwapInfo {
    pub id: String,
    pub claim_pubkey: String,
    pub destination_address: String,
    pub lockup_txid: Option<String>,
    pub claim_txid: Option<String>,
    pub onchain_amount_sat: u64,
    pub status: ReverseSwapStatus,
}

/// Current BTC/BTC reverse swap terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseSwapPairInfo {
    pub min: u64,
    pub max: u64,
    pub fees_hash: String,
    pub fees_percentage: f64,
    pub fees_lockup: u64,
    pub fees_claim: u64,
    pub total_fees: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedReverseSwap {
    pub id: String,
    pub invoice: String,
    pub redeem_script: String,
    pub lockup_address: String,
    pub onchain_amount: u64,
    pub timeout_block_height: u32,
}

/// Status as reported by the reverse swap service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceSwapStatus {
    Created,
    /// Lockup transaction seen, optionally with its id.
    LockupMempool { txid: Option<String> },
    LockupConfirmed { txid: Option<String> },
    InvoiceSettled,
    /// Swap expired, lockup failed, or refunded by the service.
    Failed { reason: String },
    Unknown(String),
}

#[async_trait]
pub trait ReverseSwapServiceApi: Send + Sync {
    async fn fetch_pair_info(&self) -> Result<ReverseSwapPairInfo>;

    async fn create_reverse_swap(
        &self,
        send_amount_sat: u64,
        preimage_hash_hex: &str,
        claim_pubkey_hex: &str,
        pair_hash: &str,
    ) -> Result<CreatedReverseSwap>;

    async fn swap_status(&self, id: &str) -> Result<ServiceSwapStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapAmountType {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareOnchainPaymentRequest {
    pub amount_sat: u64,
    pub amount_type: SwapAmountType,
    pub claim_tx_feerate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepareOnchainPaymentResponse {
    pub fees_hash: String,
    pub fees_percentage: f64,
    pub fees_lockup: u64,
    pub fees_claim: u64,
    pub sender_amount_sat: u64,
    pub recipient_amount_sat: u64,
    pub total_fees: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayOnchainRequest {
    pub recipient_address: String,
    pub prepare_res: PrepareOnchainPaymentResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayOnchainResponse {
    pub reverse_swap_info: ReverseSwapInfo,
}

/// Bounds for the send amount of a reverse swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnchainPaymentLimitsResponse {
    pub min_sat: u64,
    pub max_sat: u64,
    /// What the node can actually pay right now, capped at `max_sat`.
    pub max_payable_sat: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxReverseSwapAmountResponse {
    pub total_sat: u64,
}
