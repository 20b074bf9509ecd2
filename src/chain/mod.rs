pub mod esplora;

use std::str::FromStr as _;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::{OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};

/// Chain-data provider: tip height, address history, fee estimates, broadcast.
#[async_trait]
pub trait ChainService: Send + Sync {
    async fn recommended_fees(&self) -> Result<RecommendedFees>;
    async fn address_transactions(&self, address: &str) -> Result<Vec<OnchainTx>>;
    async fn current_tip(&self) -> Result<u32>;
    /// Returns the txid reported by the provider.
    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecommendedFees {
    #[serde(rename = "fastestFee")]
    pub fastest_fee: u64,
    #[serde(rename = "halfHourFee")]
    pub half_hour_fee: u64,
    #[serde(rename = "hourFee")]
    pub hour_fee: u64,
    #[serde(rename = "economyFee")]
    pub economy_fee: u64,
    #[serde(rename = "minimumFee")]
    pub minimum_fee: u64,
}

/// Esplora transaction JSON, trimmed to the fields the engine reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnchainTx {
    pub txid: String,
    pub vin: Vec<Vin>,
    pub vout: Vec<Vout>,
    pub status: TxStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    pub block_height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vout {
    pub scriptpubkey: String,
    #[serde(default)]
    pub scriptpubkey_address: Option<String>,
    pub value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vin {
    pub txid: String,
    pub vout: u32,
    #[serde(default)]
    pub prevout: Option<Vout>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub out: OutPoint,
    pub value: u64,
    pub block_height: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressUtxos {
    pub unconfirmed: Vec<Utxo>,
    pub confirmed: Vec<Utxo>,
}

impl AddressUtxos {
    pub fn unconfirmed_sats(&self) -> u64 {
        self.unconfirmed.iter().map(|u| u.value).sum()
    }

    pub fn confirmed_sats(&self) -> u64 {
        self.confirmed.iter().map(|u| u.value).sum()
    }

    pub fn unconfirmed_tx_ids(&self) -> Vec<String> {
        self.unconfirmed.iter().map(|u| u.out.txid.to_string()).collect()
    }

    pub fn confirmed_tx_ids(&self) -> Vec<String> {
        self.confirmed.iter().map(|u| u.out.txid.to_string()).collect()
    }

    /// Height of the earliest confirmed deposit.
    pub fn first_confirmed_height(&self) -> Option<u32> {
        self.confirmed.iter().filter_map(|u| u.block_height).min()
    }

    /// Height of the most recent confirmed deposit.
    pub fn last_confirmed_height(&self) -> Option<u32> {
        self.confirmed.iter().filter_map(|u| u.block_height).max()
    }
}

/// Unspent outputs paying `address` in `transactions`.
pub fn get_utxos(address: &str, transactions: &[OnchainTx]) -> Result<AddressUtxos> {
    let mut spent = Vec::new();
    for tx in transactions {
        for vin in &tx.vin {
            if vin
                .prevout
                .as_ref()
                .and_then(|p| p.scriptpubkey_address.as_deref())
                == Some(address)
            {
                let txid = Txid::from_str(&vin.txid)
                    .with_context(|| format!("parse spent txid {}", vin.txid))?;
                spent.push(OutPoint::new(txid, vin.vout));
            }
        }
    }

    let mut utxos = AddressUtxos::default();
    for tx in transactions {
        let txid = Txid::from_str(&tx.txid).with_context(|| format!("parse txid {}", tx.txid))?;
        for (index, vout) in tx.vout.iter().enumerate() {
            if vout.scriptpubkey_address.as_deref() != Some(address) {
                continue;
            }
            let out = OutPoint::new(txid, index as u32);
            if spent.contains(&out) {
                continue;
            }
            let block_height = if tx.status.confirmed {
                tx.status.block_height
            } else {
                None
            };
            let utxo = Utxo {
                out,
                value: vout.value,
                block_height,
            };
            if block_height.is_some() {
                utxos.confirmed.push(utxo);
            } else {
                utxos.unconfirmed.push(utxo);
            }
        }
    }
    Ok(utxos)
}

/// Number of confirmations at `tip` of a transaction mined at `block_height`.
pub fn confirmations(block_height: Option<u32>, tip: u32) -> u32 {
    match block_height {
        Some(h) if tip >= h => tip - h + 1,
        _ => 0,
    }
}
