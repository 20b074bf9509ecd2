use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One entry of an LSP fee schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningFeeParams {
    pub min_msat: u64,
    /// Parts per million of the payment amount.
    pub proportional: u32,
    /// RFC 3339 timestamp.
    pub valid_until: String,
    pub max_idle_time: u32,
    pub max_client_to_self_delay: u32,
    pub promise: String,
}

impl OpeningFeeParams {
    pub fn valid_until_secs(&self) -> Result<i64> {
        let ts = chrono::DateTime::parse_from_rfc3339(&self.valid_until)
            .with_context(|| format!("parse valid_until {}", self.valid_until))?;
        Ok(ts.timestamp())
    }

    /// Whether the params are still valid `expiry_secs` after `now_secs`.
    pub fn valid_for(&self, now_secs: i64, expiry_secs: u32) -> bool {
        self.valid_until_secs()
            .map(|until| until >= now_secs + i64::from(expiry_secs))
            .unwrap_or(false)
    }

    /// Opening fee for a payment, rounded up to a whole sat.
    pub fn fee_msat(&self, amount_msat: u64) -> u64 {
        let proportional =
            (u128::from(amount_msat) * u128::from(self.proportional)).div_ceil(1_000_000);
        let rounded = proportional.div_ceil(1000) * 1000;
        let rounded = u64::try_from(rounded).unwrap_or(u64::MAX);
        rounded.max(self.min_msat)
    }
}

/// Fee schedule offered by an LSP, sorted cheapest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpeningFeeParamsMenu {
    pub values: Vec<OpeningFeeParams>,
}

impl OpeningFeeParamsMenu {
    pub fn new(mut values: Vec<OpeningFeeParams>) -> Self {
        values.sort_by_key(|p| (p.proportional, p.min_msat));
        Self { values }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LspInformation {
    pub id: String,
    pub name: String,
    pub widget_url: String,
    pub pubkey: String,
    pub host: String,
    pub base_fee_msat: i64,
    pub fee_rate: f64,
    pub time_lock_delta: u32,
    pub min_htlc_msat: i64,
    pub opening_fee_params_list: OpeningFeeParamsMenu,
}

/// Registration of an incoming payment that needs a new channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInformation {
    pub payment_hash: String,
    pub payment_secret: String,
    pub destination: String,
    pub incoming_amount_msat: u64,
    pub outgoing_amount_msat: u64,
    pub opening_fee_params: Option<OpeningFeeParams>,
}

#[async_trait]
pub trait LspApi: Send + Sync {
    async fn list_lsps(&self, node_pubkey: &str) -> Result<Vec<LspInformation>>;
    async fn register_payment(&self, lsp_id: &str, info: PaymentInformation) -> Result<()>;
}
