use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SdkError, SdkResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Bitcoin,
    Testnet,
    Signet,
    Regtest,
}

impl From<Network> for bitcoin::Network {
    fn from(network: Network) -> Self {
        match network {
            Network::Bitcoin => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

impl TryFrom<bitcoin::Network> for Network {
    type Error = SdkError;

    fn try_from(network: bitcoin::Network) -> SdkResult<Self> {
        match network {
            bitcoin::Network::Bitcoin => Ok(Network::Bitcoin),
            bitcoin::Network::Testnet => Ok(Network::Testnet),
            bitcoin::Network::Signet => Ok(Network::Signet),
            bitcoin::Network::Regtest => Ok(Network::Regtest),
            other => Err(SdkError::parse(format!("unsupported network: {other}"))),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Network::Bitcoin => "bitcoin",
            Network::Testnet => "testnet",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        };
        f.write_str(s)
    }
}

/// Partner-issued device credentials presented to the Lightning backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeCredentials {
    Partner {
        device_key: Vec<u8>,
        device_cert: Vec<u8>,
        invite_code: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub network: Network,
    pub working_dir: PathBuf,

    pub breez_server_url: String,
    pub esplora_url: String,
    pub boltz_url: String,
    pub ldk_rest_addr: String,
    pub api_key: Option<String>,
    pub default_lsp_id: Option<String>,
    pub credentials: Option<NodeCredentials>,

    pub payment_timeout_sec: u32,
    pub maxfee_percent: f64,
    pub exemptfee_msat: u64,

    pub min_confirmations: u32,
    pub swap_safety_margin_blocks: u32,
    pub sync_interval_sec: u32,
    pub max_backend_retries: u32,
}

impl NodeConfig {
    pub fn production(working_dir: PathBuf) -> Self {
        Self {
            network: Network::Bitcoin,
            working_dir,
            breez_server_url: "https://bs1.breez.technology:443".to_string(),
            esplora_url: "https://mempool.space".to_string(),
            boltz_url: "https://api.boltz.exchange".to_string(),
            ldk_rest_addr: "127.0.0.1:3002".to_string(),
            api_key: None,
            default_lsp_id: None,
            credentials: None,
            payment_timeout_sec: 60,
            maxfee_percent: 1.0,
            exemptfee_msat: 20_000,
            min_confirmations: 1,
            swap_safety_margin_blocks: 6,
            sync_interval_sec: 30,
            max_backend_retries: 5,
        }
    }

    pub fn regtest(working_dir: PathBuf) -> Self {
        Self {
            network: Network::Regtest,
            breez_server_url: "http://127.0.0.1:8088".to_string(),
            esplora_url: "http://127.0.0.1:3000".to_string(),
            boltz_url: "http://127.0.0.1:9001".to_string(),
            payment_timeout_sec: 30,
            sync_interval_sec: 5,
            ..Self::production(working_dir)
        }
    }

    pub fn validate(&self) -> SdkResult<()> {
        let invalid = |msg: &str| Err(SdkError::Generic(anyhow::anyhow!("invalid config: {msg}")));

        if self.payment_timeout_sec == 0 {
            return invalid("payment_timeout_sec must be > 0");
        }
        if !(0.0..=100.0).contains(&self.maxfee_percent) {
            return invalid("maxfee_percent must be within 0..=100");
        }
        if self.sync_interval_sec == 0 {
            return invalid("sync_interval_sec must be > 0");
        }
        if self.min_confirmations == 0 {
            return invalid("min_confirmations must be > 0");
        }
        if self.working_dir.as_os_str().is_empty() {
            return invalid("working_dir must be set");
        }
        Ok(())
    }

    pub fn payment_timeout(&self) -> Duration {
        Duration::from_secs(self.payment_timeout_sec.into())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_sec.into())
    }

    pub fn storage_path(&self) -> PathBuf {
        self.working_dir.join("storage.sql")
    }

    /// Routing fee ceiling for a payment of `amount_msat`.
    pub fn max_fee_msat(&self, amount_msat: u64) -> u64 {
        let pct = (amount_msat as f64 * self.maxfee_percent / 100.0) as u64;
        pct.max(self.exemptfee_msat)
    }
}
