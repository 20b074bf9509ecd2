use std::collections::HashMap;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{CreatedReverseSwap, ReverseSwapPairInfo, ReverseSwapServiceApi, ServiceSwapStatus};

const PAIR_ID: &str = "BTC/BTC";

#[derive(Debug, Deserialize)]
struct Pairs {
    pairs: HashMap<String, Pair>,
}

#[derive(Debug, Deserialize)]
struct Pair {
    hash: String,
    limits: Limits,
    fees: Fees,
}

#[derive(Debug, Deserialize)]
struct Limits {
    maximal: u64,
    minimal: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Fees {
    percentage: f64,
    miner_fees: MinerFees,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MinerFees {
    base_asset: FeesAsset,
}

#[derive(Debug, Deserialize)]
struct FeesAsset {
    reverse: ReverseFees,
}

#[derive(Debug, Deserialize)]
struct ReverseFees {
    lockup: u64,
    claim: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateReverseSwapRequest<'a> {
    #[serde(rename = "type")]
    swap_type: &'a str,
    pair_id: &'a str,
    order_side: &'a str,
    invoice_amount: u64,
    preimage_hash: &'a str,
    claim_public_key: &'a str,
    pair_hash: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateReverseSwapResponse {
    id: String,
    invoice: String,
    redeem_script: String,
    lockup_address: String,
    onchain_amount: u64,
    timeout_block_height: u32,
}

#[derive(Debug, Deserialize)]
struct SwapStatusResponse {
    status: String,
    #[serde(default)]
    transaction: Option<StatusTransaction>,
    #[serde(default, rename = "failureReason")]
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusTransaction {
    id: Option<String>,
}

/// Boltz v1 REST client for BTC/BTC reverse submarine swaps.
#[derive(Debug, Clone)]
pub struct BoltzApi {
    base_url: String,
    http: reqwest::Client,
}

impl BoltzApi {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        self.http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?
            .json()
            .await
            .with_context(|| format!("decode {url}"))
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        let status = resp.status();
        let text = resp.text().await.with_context(|| format!("read body of {url}"))?;
        anyhow::ensure!(status.is_success(), "POST {url} failed ({status}): {text}");
        serde_json::from_str(&text).with_context(|| format!("decode {url}"))
    }
}

#[async_trait]
impl ReverseSwapServiceApi for BoltzApi {
    async fn fetch_pair_info(&self) -> Result<ReverseSwapPairInfo> {
        let pairs: Pairs = self.get_json("/getpairs").await?;
        let pair = pairs
            .pairs
            .get(PAIR_ID)
            .with_context(|| format!("pair {PAIR_ID} not offered"))?;
        Ok(ReverseSwapPairInfo {
            min: pair.limits.minimal,
            max: pair.limits.maximal,
            fees_hash: pair.hash.clone(),
            fees_percentage: pair.fees.percentage,
            fees_lockup: pair.fees.miner_fees.base_asset.reverse.lockup,
            fees_claim: pair.fees.miner_fees.base_asset.reverse.claim,
            total_fees: None,
        })
    }

    async fn create_reverse_swap(
        &self,
        send_amount_sat: u64,
        preimage_hash_hex: &str,
        claim_pubkey_hex: &str,
        pair_hash: &str,
    ) -> Result<CreatedReverseSwap> {
        let req = CreateReverseSwapRequest {
            swap_type: "reversesubmarine",
            pair_id: PAIR_ID,
            order_side: "buy",
            invoice_amount: send_amount_sat,
            preimage_hash: preimage_hash_hex,
            claim_public_key: claim_pubkey_hex,
            pair_hash,
        };
        let resp: CreateReverseSwapResponse = self.post_json("/createswap", &req).await?;
        tracing::info!(
            swap_id = %resp.id,
            lockup_address = %resp.lockup_address,
            "reverse swap created"
        );
        Ok(CreatedReverseSwap {
            id: resp.id,
            invoice: resp.invoice,
            redeem_script: resp.redeem_script,
            lockup_address: resp.lockup_address,
            onchain_amount: resp.onchain_amount,
            timeout_block_height: resp.timeout_block_height,
        })
    }

    async fn swap_status(&self, id: &str) -> Result<ServiceSwapStatus> {
        let resp: SwapStatusResponse = self
            .post_json("/swapstatus", &serde_json::json!({ "id": id }))
            .await?;
        Ok(map_status(resp))
    }
}

fn map_status(resp: SwapStatusResponse) -> ServiceSwapStatus {
    let txid = resp.transaction.and_then(|t| t.id);
    match resp.status.as_str() {
        "swap.created" => ServiceSwapStatus::Created,
        "transaction.mempool" => ServiceSwapStatus::LockupMempool { txid },
        "transaction.confirmed" => ServiceSwapStatus::LockupConfirmed { txid },
        "invoice.settled" => ServiceSwapStatus::InvoiceSettled,
        "swap.expired" | "invoice.expired" | "transaction.failed" | "transaction.refunded" => {
            ServiceSwapStatus::Failed {
                reason: resp.failure_reason.unwrap_or(resp.status),
            }
        }
        _ => ServiceSwapStatus::Unknown(resp.status),
    }
}
