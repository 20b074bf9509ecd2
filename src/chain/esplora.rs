use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::Transaction;

use super::{ChainService, OnchainTx, RecommendedFees};

/// Esplora / mempool.space REST client.
#[derive(Debug, Clone)]
pub struct EsploraChainService {
    base_url: String,
    http: reqwest::Client,
}

impl EsploraChainService {
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        }
    }

    async fn get_text(&self, path: &str) -> Result<String> {
        let url = format!("{}{path}", self.base_url);
        self.http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?
            .text()
            .await
            .with_context(|| format!("read body of {url}"))
    }
}

#[async_trait]
impl ChainService for EsploraChainService {
    async fn recommended_fees(&self) -> Result<RecommendedFees> {
        let body = self.get_text("/api/v1/fees/recommended").await?;
        serde_json::from_str(&body).context("decode recommended fees")
    }

    async fn address_transactions(&self, address: &str) -> Result<Vec<OnchainTx>> {
        let body = self.get_text(&format!("/api/address/{address}/txs")).await?;
        serde_json::from_str(&body).with_context(|| format!("decode txs of {address}"))
    }

    async fn current_tip(&self) -> Result<u32> {
        let body = self.get_text("/api/blocks/tip/height").await?;
        body.trim()
            .parse()
            .with_context(|| format!("parse tip height {body:?}"))
    }

    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<String> {
        let url = format!("{}/api/tx", self.base_url);
        let resp = self
            .http
            .post(&url)
            .body(bitcoin::consensus::encode::serialize_hex(tx))
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        let status = resp.status();
        let body = resp.text().await.context("read broadcast response")?;
        anyhow::ensure!(status.is_success(), "broadcast rejected ({status}): {body}");
        tracing::info!(txid = %body.trim(), "broadcast transaction");
        Ok(body.trim().to_string())
    }
}
