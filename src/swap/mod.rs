pub mod script;
pub mod service;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::Transaction;
use serde::{Deserialize, Serialize};

use crate::chain::{AddressUtxos, confirmations};
use crate::lsp::OpeningFeeParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    WaitingDeposit,
    WaitingConfirmation,
    Redeemed,
    Refundable,
    Refunded,
    Expired,
}

impl SwapStatus {
    /// Statuses that still need chain monitoring.
    pub fn is_monitored(self) -> bool {
        matches!(
            self,
            SwapStatus::WaitingDeposit | SwapStatus::WaitingConfirmation | SwapStatus::Refundable
        )
    }
}

/// Submarine swap (on-chain deposit redeemed over Lightning), one per deposit address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapInfo {
    pub bitcoin_address: String,
    pub created_at: i64,
    pub created_at_height: u32,
    /// Relative timelock (blocks) of the refund path.
    pub lock_height: u32,
    pub payment_hash: Vec<u8>,
    pub preimage: Vec<u8>,
    pub private_key: Vec<u8>,
    pub public_key: Vec<u8>,
    pub swapper_public_key: Vec<u8>,
    pub script: Vec<u8>,
    pub bolt11: Option<String>,
    pub paid_msat: u64,
    pub confirmed_sats: u64,
    pub unconfirmed_sats: u64,
    pub total_incoming_txs: u64,
    pub status: SwapStatus,
    pub refund_tx_ids: Vec<String>,
    pub unconfirmed_tx_ids: Vec<String>,
    pub confirmed_tx_ids: Vec<String>,
    pub min_allowed_deposit: u64,
    pub max_allowed_deposit: u64,
    /// Upper bound offered by the swapper, before local liquidity caps it.
    #[serde(default)]
    pub max_swapper_payable: u64,
    pub last_redeem_error: Option<String>,
    pub channel_opening_fees: Option<OpeningFeeParams>,
    /// Height of the earliest confirmed deposit.
    pub confirmed_at: Option<u32>,
    /// Height of the latest confirmed deposit.
    pub last_deposit_height: Option<u32>,
}

/// Confirmation and timelock policy applied to every swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapPolicy {
    pub min_confirmations: u32,
    pub safety_margin_blocks: u32,
}

impl SwapInfo {
    pub fn deposit_within_bounds(&self) -> bool {
        (self.min_allowed_deposit..=self.max_allowed_deposit).contains(&self.confirmed_sats)
    }

    /// First height at which the unilateral refund can be mined.
    pub fn refund_height(&self) -> Option<u32> {
        self.confirmed_at.map(|h| h.saturating_add(self.lock_height))
    }

    /// Last height at which a redeem may still be started.
    pub fn redeem_deadline(&self, policy: &SwapPolicy) -> Option<u32> {
        self.refund_height()
            .map(|h| h.saturating_sub(policy.safety_margin_blocks))
    }

    /// Whether the address can still be handed out: nothing was sent to it and
    /// its timelock is further away than the safety margin.
    pub fn is_unused(&self, tip: u32, policy: &SwapPolicy) -> bool {
        self.status == SwapStatus::WaitingDeposit
            && self.total_incoming_txs == 0
            && self.paid_msat == 0
            && self.bolt11.is_none()
            && tip.saturating_add(policy.safety_margin_blocks)
                < self.created_at_height.saturating_add(self.lock_height)
    }

    /// Caps the swapper's limit by what the node can receive, unless an LSP
    /// can open a channel for the difference.
    pub fn apply_receive_limits(&mut self, max_receivable_sat: u64, has_lsp: bool) {
        let swapper_max = match self.max_swapper_payable {
            0 => self.max_allowed_deposit,
            max => max,
        };
        self.max_allowed_deposit = if has_lsp {
            swapper_max
        } else {
            swapper_max.min(max_receivable_sat)
        };
    }

    pub fn deposit_confirmations(&self, tip: u32) -> u32 {
        confirmations(self.last_deposit_height, tip)
    }

    /// Applies a fresh chain view and recomputes the status.
    pub fn refresh(
        &mut self,
        utxos: &AddressUtxos,
        total_incoming_txs: u64,
        tip: u32,
        policy: &SwapPolicy,
    ) {
        self.confirmed_sats = utxos.confirmed_sats();
        self.unconfirmed_sats = utxos.unconfirmed_sats();
        self.confirmed_tx_ids = utxos.confirmed_tx_ids();
        self.unconfirmed_tx_ids = utxos.unconfirmed_tx_ids();
        self.total_incoming_txs = total_incoming_txs;
        if let Some(first) = utxos.first_confirmed_height() {
            self.confirmed_at = Some(self.confirmed_at.map_or(first, |h| h.min(first)));
        }
        if let Some(last) = utxos.last_confirmed_height() {
            self.last_deposit_height = Some(last);
        }
        self.status = self.compute_status(tip, policy);
    }

    pub fn compute_status(&self, tip: u32, policy: &SwapPolicy) -> SwapStatus {
        if self.paid_msat > 0 {
            return SwapStatus::Redeemed;
        }
        let remaining = self.confirmed_sats + self.unconfirmed_sats;
        if self.total_incoming_txs == 0 {
            return if tip >= self.created_at_height.saturating_add(self.lock_height) {
                SwapStatus::Expired
            } else {
                SwapStatus::WaitingDeposit
            };
        }
        if remaining == 0 {
            return if self.refund_tx_ids.is_empty() {
                SwapStatus::Expired
            } else {
                SwapStatus::Refunded
            };
        }
        if self.confirmed_sats == 0 {
            return SwapStatus::WaitingConfirmation;
        }
        if !self.deposit_within_bounds() {
            return SwapStatus::Refundable;
        }
        match self.redeem_deadline(policy) {
            Some(deadline) if tip >= deadline => SwapStatus::Refundable,
            _ => SwapStatus::WaitingConfirmation,
        }
    }

    /// Whether the confirmed deposit should be redeemed now.
    pub fn is_redeemable(&self, tip: u32, policy: &SwapPolicy) -> bool {
        self.status == SwapStatus::WaitingConfirmation
            && self.paid_msat == 0
            && self.unconfirmed_sats == 0
            && self.confirmed_sats > 0
            && self.deposit_within_bounds()
            && self.deposit_confirmations(tip) >= policy.min_confirmations
            && self.redeem_deadline(policy).is_some_and(|d| tip < d)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapperResponse {
    pub bitcoin_address: String,
    pub swapper_pubkey: Vec<u8>,
    pub lock_height: u32,
    pub min_allowed_deposit: u64,
    pub max_allowed_deposit: u64,
}

/// Submarine swap counterparty.
#[async_trait]
pub trait SwapperApi: Send + Sync {
    async fn create_swap(
        &self,
        payment_hash: Vec<u8>,
        payer_pubkey: Vec<u8>,
        node_id: String,
    ) -> Result<SwapperResponse>;

    /// Hands the swapper an invoice to pay in exchange for the deposit.
    async fn complete_swap(&self, bolt11: String) -> Result<()>;

    /// Swapper signatures (DER + sighash byte) for each input of a cooperative refund.
    async fn sign_cooperative_refund(
        &self,
        swap_address: &str,
        tx: &Transaction,
    ) -> Result<Vec<Vec<u8>>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiveOnchainRequest {
    /// Channel opening terms applied if the redeem needs a new channel.
    pub opening_fee_params: Option<OpeningFeeParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRefundRequest {
    pub swap_address: String,
    pub to_address: String,
    pub sat_per_vbyte: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRefundResponse {
    pub refund_tx_vsize: u64,
    pub refund_tx_fee_sat: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub swap_address: String,
    pub to_address: String,
    pub sat_per_vbyte: u32,
    /// Spend through the swapper's key instead of waiting for the timelock.
    #[serde(default)]
    pub cooperative: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundResponse {
    pub refund_tx_id: String,
}
