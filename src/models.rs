use serde::{Deserialize, Serialize};

use crate::lnurl::pay::SuccessActionProcessed;
use crate::lsp::OpeningFeeParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Sent,
    Received,
    ClosedChannel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Complete,
    Failed,
}

impl PaymentStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub payment_type: PaymentType,
    pub payment_time: i64,
    pub amount_msat: u64,
    pub fee_msat: u64,
    pub status: PaymentStatus,
    pub error: Option<String>,
    pub description: Option<String>,
    pub details: PaymentDetails,
    /// Opaque caller-supplied JSON.
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentDetails {
    Ln { data: LnPaymentDetails },
    ClosedChannel { data: ClosedChannelPaymentDetails },
}

impl PaymentDetails {
    pub fn ln(&self) -> Option<&LnPaymentDetails> {
        match self {
            PaymentDetails::Ln { data } => Some(data),
            PaymentDetails::ClosedChannel { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LnPaymentDetails {
    pub payment_hash: String,
    pub label: String,
    pub destination_pubkey: String,
    pub payment_preimage: String,
    pub keysend: bool,
    pub bolt11: String,
    pub open_channel_bolt11: Option<String>,
    pub lnurl_success_action: Option<SuccessActionProcessed>,
    pub lnurl_pay_domain: Option<String>,
    pub ln_address: Option<String>,
    pub lnurl_metadata: Option<String>,
    pub lnurl_withdraw_endpoint: Option<String>,
    pub swap_address: Option<String>,
    pub reverse_swap_id: Option<String>,
    pub pending_expiration_block: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedChannelPaymentDetails {
    pub state: ChannelState,
    pub funding_txid: String,
    pub short_channel_id: Option<String>,
    pub closing_txid: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    PendingOpen,
    Opened,
    PendingClose,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub funding_txid: String,
    pub short_channel_id: Option<String>,
    pub state: ChannelState,
    pub spendable_msat: u64,
    pub receivable_msat: u64,
    pub closed_at: Option<u64>,
    pub closing_txid: Option<String>,
    pub alias_remote: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentTransactionOutput {
    pub txid: Vec<u8>,
    pub outnum: u32,
    pub amount_millisatoshi: u64,
    pub address: String,
    pub reserved: bool,
}

/// Aggregate view of the node, replaced wholesale on every sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub id: String,
    pub block_height: u32,
    pub channels_balance_msat: u64,
    pub onchain_balance_msat: u64,
    pub pending_onchain_balance_msat: u64,
    pub utxos: Vec<UnspentTransactionOutput>,
    pub max_payable_msat: u64,
    pub max_receivable_msat: u64,
    pub max_single_payment_amount_msat: u64,
    pub max_chan_reserve_msats: u64,
    pub connected_peers: Vec<String>,
    pub inbound_liquidity_msats: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentTypeFilter {
    #[default]
    All,
    Sent,
    Received,
    ClosedChannel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPaymentsRequest {
    pub filter: PaymentTypeFilter,
    pub from_timestamp: Option<i64>,
    pub to_timestamp: Option<i64>,
    pub include_failures: Option<bool>,
    pub offset: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendPaymentRequest {
    pub bolt11: String,
    pub amount_msat: Option<u64>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlvEntry {
    pub field_number: u64,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendSpontaneousPaymentRequest {
    pub node_id: String,
    pub amount_msat: u64,
    pub extra_tlvs: Option<Vec<TlvEntry>>,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceivePaymentRequest {
    pub amount_msat: u64,
    pub description: String,
    pub preimage: Option<Vec<u8>>,
    pub opening_fee_params: Option<OpeningFeeParams>,
    pub use_description_hash: Option<bool>,
    pub expiry: Option<u32>,
    pub cltv: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivePaymentResponse {
    pub ln_invoice: crate::lightning::invoice::LnInvoice,
    pub opening_fee_params: Option<OpeningFeeParams>,
    pub opening_fee_msat: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRedeemOnchainFundsRequest {
    pub to_address: String,
    pub sat_per_vbyte: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRedeemOnchainFundsResponse {
    pub tx_weight: u64,
    pub tx_fee_sat: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemOnchainFundsRequest {
    pub to_address: String,
    pub sat_per_vbyte: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeemOnchainFundsResponse {
    pub txid: String,
}

/// Opaque backend records, in backend order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticBackupResponse {
    pub backup: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignMessageRequest {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignMessageResponse {
    /// zbase32 recoverable signature.
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckMessageRequest {
    pub message: String,
    /// Hex-encoded compressed public key of the claimed signer.
    pub pubkey: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckMessageResponse {
    pub is_valid: bool,
}

pub(crate) fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
