//! JSON client for the LSP directory and the submarine swapper.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::Transaction;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::lsp::{LspApi, LspInformation, PaymentInformation};
use crate::swap::{SwapperApi, SwapperResponse};

#[derive(Debug, Serialize)]
struct ListLspsRequest<'a> {
    pubkey: &'a str,
}

#[derive(Debug, Deserialize)]
struct ListLspsResponse {
    lsps: Vec<LspInformation>,
}

#[derive(Debug, Serialize)]
struct RegisterPaymentRequest<'a> {
    lsp_id: &'a str,
    payment_info: &'a PaymentInformation,
}

#[derive(Debug, Serialize)]
struct CreateSwapRequest {
    hash: String,
    pubkey: String,
    node_id: String,
}

#[derive(Debug, Deserialize)]
struct CreateSwapResponse {
    address: String,
    pubkey: String,
    lock_height: u32,
    min_allowed_deposit: u64,
    max_allowed_deposit: u64,
}

#[derive(Debug, Serialize)]
struct CompleteSwapRequest {
    bolt11: String,
}

#[derive(Debug, Serialize)]
struct RefundSignRequest<'a> {
    address: &'a str,
    tx: String,
}

#[derive(Debug, Deserialize)]
struct RefundSignResponse {
    signatures: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Empty {}

#[derive(Debug, Clone)]
pub struct BreezServerClient {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl BreezServerClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            http,
        }
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let mut req = self.http.post(&url).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await.with_context(|| format!("POST {url}"))?;
        let status = resp.status();
        let text = resp.text().await.with_context(|| format!("read body of {url}"))?;
        anyhow::ensure!(status.is_success(), "POST {url} failed ({status}): {text}");
        serde_json::from_str(&text).with_context(|| format!("decode {url}"))
    }
}

#[async_trait]
impl LspApi for BreezServerClient {
    async fn list_lsps(&self, node_pubkey: &str) -> Result<Vec<LspInformation>> {
        let resp: ListLspsResponse = self
            .post_json("/v1/lsp/list", &ListLspsRequest { pubkey: node_pubkey })
            .await?;
        Ok(resp.lsps)
    }

    async fn register_payment(&self, lsp_id: &str, info: PaymentInformation) -> Result<()> {
        let _: Empty = self
            .post_json(
                "/v1/lsp/register_payment",
                &RegisterPaymentRequest {
                    lsp_id,
                    payment_info: &info,
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SwapperApi for BreezServerClient {
    async fn create_swap(
        &self,
        payment_hash: Vec<u8>,
        payer_pubkey: Vec<u8>,
        node_id: String,
    ) -> Result<SwapperResponse> {
        let resp: CreateSwapResponse = self
            .post_json(
                "/v1/swap/create",
                &CreateSwapRequest {
                    hash: hex::encode(payment_hash),
                    pubkey: hex::encode(payer_pubkey),
                    node_id,
                },
            )
            .await?;
        Ok(SwapperResponse {
            bitcoin_address: resp.address,
            swapper_pubkey: hex::decode(&resp.pubkey).context("decode swapper pubkey")?,
            lock_height: resp.lock_height,
            min_allowed_deposit: resp.min_allowed_deposit,
            max_allowed_deposit: resp.max_allowed_deposit,
        })
    }

    async fn complete_swap(&self, bolt11: String) -> Result<()> {
        let _: Empty = self
            .post_json("/v1/swap/complete", &CompleteSwapRequest { bolt11 })
            .await?;
        Ok(())
    }

    async fn sign_cooperative_refund(
        &self,
        swap_address: &str,
        tx: &Transaction,
    ) -> Result<Vec<Vec<u8>>> {
        let resp: RefundSignResponse = self
            .post_json(
                "/v1/swap/refund_sign",
                &RefundSignRequest {
                    address: swap_address,
                    tx: bitcoin::consensus::encode::serialize_hex(tx),
                },
            )
            .await?;
        resp.signatures
            .iter()
            .map(|sig| hex::decode(sig).with_context(|| format!("decode swapper signature {sig}")))
            .collect()
    }
}
