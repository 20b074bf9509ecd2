use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::NodeCredentials;
use crate::models::{Channel, NodeState, Payment, TlvEntry};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("credentials rejected: {0}")]
    Credentials(String),

    #[error("route not found: {0}")]
    RouteNotFound(String),

    #[error("payment failed: {0}")]
    PaymentFailed(String),

    #[error("payment timed out: {0}")]
    PaymentTimeout(String),

    #[error("invalid invoice: {0}")]
    InvalidInvoice(String),

    #[error("operation not supported by backend: {0}")]
    Unsupported(String),

    #[error("service connectivity: {0:#}")]
    ServiceConnectivity(anyhow::Error),

    #[error("{0:#}")]
    Generic(anyhow::Error),
}

pub type NodeResult<T> = Result<T, NodeError>;

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Identity pubkey derived from the caller's seed.
    pub identity_pubkey: String,
    pub credentials: Option<NodeCredentials>,
    pub restore_only: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectResponse {
    pub node_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct SyncResponse {
    pub node_state: NodeState,
    pub payments: Vec<Payment>,
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateInvoiceRequest {
    pub amount_msat: u64,
    pub description: String,
    pub payer_amount_msat: Option<u64>,
    pub preimage: Option<Vec<u8>>,
    pub use_description_hash: Option<bool>,
    pub expiry: Option<u32>,
    pub cltv: Option<u32>,
}

/// Outcome of a settled outgoing payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub payment_hash: String,
    pub payment_preimage: String,
    pub amount_msat: u64,
    pub fee_msat: u64,
}

#[derive(Debug, Clone)]
pub struct SpontaneousPayment {
    pub node_id: String,
    pub amount_msat: u64,
    pub preimage: [u8; 32],
    /// Sorted by field number.
    pub extra_tlvs: Vec<TlvEntry>,
}

/// The Lightning backend the engine drives.
#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn connect(&self, req: ConnectRequest) -> NodeResult<ConnectResponse>;

    /// Full node state plus payments updated after `since_timestamp`.
    async fn pull_changed(&self, since_timestamp: i64) -> NodeResult<SyncResponse>;

    async fn create_invoice(&self, req: CreateInvoiceRequest) -> NodeResult<String>;

    async fn send_payment(
        &self,
        bolt11: String,
        amount_msat: Option<u64>,
        max_fee_msat: u64,
    ) -> NodeResult<PaymentOutcome>;

    async fn send_spontaneous_payment(&self, req: SpontaneousPayment) -> NodeResult<PaymentOutcome>;

    async fn redeem_onchain_funds(
        &self,
        to_address: String,
        sat_per_vbyte: u32,
    ) -> NodeResult<String>;

    async fn static_backup(&self) -> NodeResult<Vec<String>>;
}
