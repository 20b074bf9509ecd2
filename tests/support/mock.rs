use std::collections::HashMap;
use std::str::FromStr as _;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{CompressedPublicKey, Transaction};
use lightning_invoice::Bolt11Invoice;

use ln_swap_sdk::chain::{ChainService, OnchainTx, RecommendedFees, TxStatus, Vin, Vout};
use ln_swap_sdk::fees::service_fee_sat;
use ln_swap_sdk::lightning::node_api::{
    ConnectRequest, ConnectResponse, CreateInvoiceRequest, NodeApi, NodeError, NodeResult,
    PaymentOutcome, SpontaneousPayment, SyncResponse,
};
use ln_swap_sdk::lsp::{
    LspApi, LspInformation, OpeningFeeParams, OpeningFeeParamsMenu, PaymentInformation,
};
use ln_swap_sdk::models::NodeState;
use ln_swap_sdk::reverse_swap::{
    CreatedReverseSwap, ReverseSwapPairInfo, ReverseSwapServiceApi, ServiceSwapStatus,
};
use ln_swap_sdk::swap::script::{ReverseSwapScript, SubmarineSwapScript};
use ln_swap_sdk::swap::{SwapperApi, SwapperResponse};
use ln_swap_sdk::{Backends, NodeConfig};

use super::invoice::{InvoiceSpec, now, regtest_invoice};

pub const NODE_KEY: [u8; 32] = [0x21; 32];
pub const SWAPPER_KEY: [u8; 32] = [0x33; 32];
pub const SERVICE_REFUND_KEY: [u8; 32] = [0x55; 32];
pub const PREIMAGE_HEX: &str = "4242424242424242424242424242424242424242424242424242424242424242";

fn pubkey(secret: &[u8; 32]) -> PublicKey {
    let key = SecretKey::from_slice(secret).expect("valid secret key");
    PublicKey::from_secret_key(&Secp256k1::new(), &key)
}

pub fn txid(n: u8) -> String {
    hex::encode([n; 32])
}

/// A fresh regtest P2WPKH address.
pub fn regtest_address(seed: u8) -> String {
    let key = CompressedPublicKey(pubkey(&[seed; 32]));
    bitcoin::Address::p2wpkh(&key, bitcoin::Network::Regtest).to_string()
}

pub fn deposit_tx(n: u8, address: &str, value: u64, height: Option<u32>) -> OnchainTx {
    OnchainTx {
        txid: txid(n),
        vin: vec![Vin {
            txid: txid(0xee),
            vout: 0,
            prevout: None,
        }],
        vout: vec![Vout {
            scriptpubkey: "0020".to_string(),
            scriptpubkey_address: Some(address.to_string()),
            value,
        }],
        status: TxStatus {
            confirmed: height.is_some(),
            block_height: height,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendBehavior {
    Succeed,
    RouteNotFound,
    /// The backend gives up without knowing whether the HTLC settled.
    Timeout,
    /// Succeeds after the delay.
    Delay(Duration),
    /// The backend answers with something the client cannot classify.
    Garbled,
}

pub struct MockNode {
    pub send_behavior: Mutex<SendBehavior>,
    pub reject_credentials: AtomicBool,
    pub sync_response: Mutex<SyncResponse>,
    pub connect_calls: AtomicUsize,
    pub connect_delay: Mutex<Option<Duration>>,
    pub pull_calls: AtomicUsize,
    pub send_calls: AtomicUsize,
    pub keysend_calls: AtomicUsize,
    pub create_invoice_calls: AtomicUsize,
    pub created_invoices: Mutex<Vec<CreateInvoiceRequest>>,
    pub fee_msat: u64,
}

impl Default for MockNode {
    fn default() -> Self {
        Self {
            send_behavior: Mutex::new(SendBehavior::Succeed),
            reject_credentials: AtomicBool::new(false),
            sync_response: Mutex::new(SyncResponse {
                node_state: node_state(10_000_000),
                payments: Vec::new(),
                channels: Vec::new(),
            }),
            connect_calls: AtomicUsize::new(0),
            connect_delay: Mutex::new(None),
            pull_calls: AtomicUsize::new(0),
            send_calls: AtomicUsize::new(0),
            keysend_calls: AtomicUsize::new(0),
            create_invoice_calls: AtomicUsize::new(0),
            created_invoices: Mutex::new(Vec::new()),
            fee_msat: 10,
        }
    }
}

pub fn node_id() -> String {
    pubkey(&NODE_KEY).to_string()
}

pub fn node_state(max_receivable_msat: u64) -> NodeState {
    NodeState {
        id: node_id(),
        block_height: 200,
        channels_balance_msat: 50_000_000,
        max_payable_msat: 50_000_000,
        max_receivable_msat,
        max_single_payment_amount_msat: 50_000_000,
        inbound_liquidity_msats: max_receivable_msat,
        ..NodeState::default()
    }
}

impl MockNode {
    pub fn set_send_behavior(&self, behavior: SendBehavior) {
        *self.send_behavior.lock().unwrap() = behavior;
    }

    fn outcome(&self, bolt11: &str, amount_msat: u64) -> PaymentOutcome {
        let payment_hash = Bolt11Invoice::from_str(bolt11)
            .map(|i| i.payment_hash().to_string())
            .unwrap_or_default();
        PaymentOutcome {
            payment_hash,
            payment_preimage: PREIMAGE_HEX.to_string(),
            amount_msat,
            fee_msat: self.fee_msat,
        }
    }
}

#[async_trait]
impl NodeApi for MockNode {
    async fn connect(&self, req: ConnectRequest) -> NodeResult<ConnectResponse> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.reject_credentials.load(Ordering::SeqCst) {
            return Err(NodeError::Credentials("invite code already used".to_string()));
        }
        Ok(ConnectResponse {
            node_id: req.identity_pubkey,
        })
    }

    async fn pull_changed(&self, _since_timestamp: i64) -> NodeResult<SyncResponse> {
        self.pull_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.sync_response.lock().unwrap().clone())
    }

    async fn create_invoice(&self, req: CreateInvoiceRequest) -> NodeResult<String> {
        self.create_invoice_calls.fetch_add(1, Ordering::SeqCst);
        let preimage: [u8; 32] = match &req.preimage {
            Some(p) => p
                .as_slice()
                .try_into()
                .map_err(|_| NodeError::InvalidInvoice("preimage must be 32 bytes".to_string()))?,
            None => rand::random(),
        };
        let bolt11 = regtest_invoice(InvoiceSpec {
            preimage,
            payment_hash: None,
            amount_msat: Some(req.amount_msat),
            description: req.description.clone(),
            description_hash: req
                .use_description_hash
                .unwrap_or(false)
                .then(|| sha256::Hash::hash(req.description.as_bytes())),
            created_at: now(),
            expiry: Duration::from_secs(req.expiry.unwrap_or(3600).into()),
            signer: NODE_KEY,
        })
        .map_err(NodeError::Generic)?;
        self.created_invoices.lock().unwrap().push(req);
        Ok(bolt11)
    }

    async fn send_payment(
        &self,
        bolt11: String,
        amount_msat: Option<u64>,
        _max_fee_msat: u64,
    ) -> NodeResult<PaymentOutcome> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = *self.send_behavior.lock().unwrap();
        let amount = amount_msat
            .or_else(|| {
                Bolt11Invoice::from_str(&bolt11)
                    .ok()
                    .and_then(|i| i.amount_milli_satoshis())
            })
            .unwrap_or_default();
        match behavior {
            SendBehavior::Succeed => Ok(self.outcome(&bolt11, amount)),
            SendBehavior::RouteNotFound => Err(NodeError::RouteNotFound("no path".to_string())),
            SendBehavior::Timeout => Err(NodeError::PaymentTimeout("htlc in flight".to_string())),
            SendBehavior::Garbled => Err(NodeError::Generic(anyhow::anyhow!(
                "payment succeeded without preimage"
            ))),
            SendBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(self.outcome(&bolt11, amount))
            }
        }
    }

    async fn send_spontaneous_payment(
        &self,
        req: SpontaneousPayment,
    ) -> NodeResult<PaymentOutcome> {
        self.keysend_calls.fetch_add(1, Ordering::SeqCst);
        Ok(PaymentOutcome {
            payment_hash: hex::encode(sha256::Hash::hash(&req.preimage).to_byte_array()),
            payment_preimage: hex::encode(req.preimage),
            amount_msat: req.amount_msat,
            fee_msat: self.fee_msat,
        })
    }

    async fn redeem_onchain_funds(
        &self,
        _to_address: String,
        _sat_per_vbyte: u32,
    ) -> NodeResult<String> {
        Ok(txid(0xaa))
    }

    async fn static_backup(&self) -> NodeResult<Vec<String>> {
        Ok(vec!["channel-backup-1".to_string()])
    }
}

#[derive(Default)]
pub struct MockChain {
    pub tip: AtomicU32,
    pub unavailable: AtomicBool,
    pub txs: Mutex<HashMap<String, Vec<OnchainTx>>>,
    pub broadcasts: Mutex<Vec<Transaction>>,
    pub tip_calls: AtomicUsize,
}

impl MockChain {
    pub fn with_tip(tip: u32) -> Self {
        let chain = Self::default();
        chain.tip.store(tip, Ordering::SeqCst);
        chain
    }

    pub fn set_txs(&self, address: &str, txs: Vec<OnchainTx>) {
        self.txs.lock().unwrap().insert(address.to_string(), txs);
    }

    pub fn add_tx(&self, address: &str, tx: OnchainTx) {
        self.txs
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .push(tx);
    }
}

#[async_trait]
impl ChainService for MockChain {
    async fn recommended_fees(&self) -> Result<RecommendedFees> {
        Ok(RecommendedFees {
            fastest_fee: 20,
            half_hour_fee: 10,
            hour_fee: 5,
            economy_fee: 2,
            minimum_fee: 1,
        })
    }

    async fn address_transactions(&self, address: &str) -> Result<Vec<OnchainTx>> {
        anyhow::ensure!(!self.unavailable.load(Ordering::SeqCst), "esplora unavailable");
        Ok(self
            .txs
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_default())
    }

    async fn current_tip(&self) -> Result<u32> {
        self.tip_calls.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(!self.unavailable.load(Ordering::SeqCst), "esplora unavailable");
        Ok(self.tip.load(Ordering::SeqCst))
    }

    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<String> {
        self.broadcasts.lock().unwrap().push(tx.clone());
        Ok(tx.compute_txid().to_string())
    }
}

pub fn fee_params(min_msat: u64, proportional: u32) -> OpeningFeeParams {
    OpeningFeeParams {
        min_msat,
        proportional,
        valid_until: "2099-01-01T00:00:00Z".to_string(),
        max_idle_time: 4320,
        max_client_to_self_delay: 2016,
        promise: format!("promise-{proportional}"),
    }
}

pub fn lsp(id: &str, menu: Vec<OpeningFeeParams>) -> LspInformation {
    LspInformation {
        id: id.to_string(),
        name: format!("LSP {id}"),
        widget_url: String::new(),
        pubkey: pubkey(&[0x77; 32]).to_string(),
        host: "127.0.0.1:9735".to_string(),
        base_fee_msat: 1000,
        fee_rate: 0.000001,
        time_lock_delta: 144,
        min_htlc_msat: 600,
        opening_fee_params_list: OpeningFeeParamsMenu::new(menu),
    }
}

#[derive(Default)]
pub struct MockLsp {
    pub lsps: Mutex<Vec<LspInformation>>,
    pub registered: Mutex<Vec<(String, PaymentInformation)>>,
}

impl MockLsp {
    pub fn with(lsps: Vec<LspInformation>) -> Self {
        Self {
            lsps: Mutex::new(lsps),
            registered: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LspApi for MockLsp {
    async fn list_lsps(&self, _node_pubkey: &str) -> Result<Vec<LspInformation>> {
        Ok(self.lsps.lock().unwrap().clone())
    }

    async fn register_payment(&self, lsp_id: &str, info: PaymentInformation) -> Result<()> {
        self.registered
            .lock()
            .unwrap()
            .push((lsp_id.to_string(), info));
        Ok(())
    }
}

pub struct MockSwapper {
    pub lock_height: u32,
    pub min_allowed_deposit: u64,
    pub max_allowed_deposit: u64,
    pub completed: Mutex<Vec<String>>,
    pub create_calls: AtomicUsize,
}

impl Default for MockSwapper {
    fn default() -> Self {
        Self {
            lock_height: 144,
            min_allowed_deposit: 1_000,
            max_allowed_deposit: 1_000_000,
            completed: Mutex::new(Vec::new()),
            create_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SwapperApi for MockSwapper {
    async fn create_swap(
        &self,
        payment_hash: Vec<u8>,
        payer_pubkey: Vec<u8>,
        _node_id: String,
    ) -> Result<SwapperResponse> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let hash: [u8; 32] = payment_hash
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("payment hash must be 32 bytes"))?;
        let script = SubmarineSwapScript::new(
            &hash,
            pubkey(&SWAPPER_KEY),
            PublicKey::from_slice(&payer_pubkey)?,
            self.lock_height,
        );
        Ok(SwapperResponse {
            bitcoin_address: script.p2wsh_address(bitcoin::Network::Regtest)?.to_string(),
            swapper_pubkey: pubkey(&SWAPPER_KEY).serialize().to_vec(),
            lock_height: self.lock_height,
            min_allowed_deposit: self.min_allowed_deposit,
            max_allowed_deposit: self.max_allowed_deposit,
        })
    }

    async fn complete_swap(&self, bolt11: String) -> Result<()> {
        self.completed.lock().unwrap().push(bolt11);
        Ok(())
    }

    async fn sign_cooperative_refund(
        &self,
        _swap_address: &str,
        _tx: &Transaction,
    ) -> Result<Vec<Vec<u8>>> {
        anyhow::bail!("cooperative refunds are not offered")
    }
}

pub struct MockReverseSwapper {
    pub pair: Mutex<ReverseSwapPairInfo>,
    pub status: Mutex<ServiceSwapStatus>,
    pub created: Mutex<Vec<CreatedReverseSwap>>,
    pub timeout_block_height: u32,
}

impl Default for MockReverseSwapper {
    fn default() -> Self {
        Self {
            pair: Mutex::new(ReverseSwapPairInfo {
                min: 50_000,
                max: 5_000_000,
                fees_hash: "fees-v1".to_string(),
                fees_percentage: 0.5,
                fees_lockup: 500,
                fees_claim: 276,
                total_fees: None,
            }),
            status: Mutex::new(ServiceSwapStatus::LockupMempool {
                txid: Some(txid(0x10)),
            }),
            created: Mutex::new(Vec::new()),
            timeout_block_height: 400,
        }
    }
}

#[async_trait]
impl ReverseSwapServiceApi for MockReverseSwapper {
    async fn fetch_pair_info(&self) -> Result<ReverseSwapPairInfo> {
        Ok(self.pair.lock().unwrap().clone())
    }

    async fn create_reverse_swap(
        &self,
        send_amount_sat: u64,
        preimage_hash_hex: &str,
        claim_pubkey_hex: &str,
        _pair_hash: &str,
    ) -> Result<CreatedReverseSwap> {
        let pair = self.pair.lock().unwrap().clone();
        let hash = sha256::Hash::from_str(preimage_hash_hex)?;
        let script = ReverseSwapScript {
            hash160: ReverseSwapScript::hash160_of(&hash.to_byte_array()),
            claim_pubkey: PublicKey::from_str(claim_pubkey_hex)?,
            refund_pubkey: pubkey(&SERVICE_REFUND_KEY),
            timeout_height: self.timeout_block_height,
        };
        let invoice = regtest_invoice(InvoiceSpec {
            payment_hash: Some(hash),
            amount_msat: Some(send_amount_sat * 1000),
            description: "reverse swap".to_string(),
            ..InvoiceSpec::default()
        })?;
        let created = CreatedReverseSwap {
            id: format!("rs-{}", &preimage_hash_hex[..8]),
            invoice,
            redeem_script: hex::encode(script.witness_script()?.as_bytes()),
            lockup_address: script.p2wsh_address(bitcoin::Network::Regtest)?.to_string(),
            onchain_amount: send_amount_sat
                - service_fee_sat(send_amount_sat, pair.fees_percentage)
                - pair.fees_lockup,
            timeout_block_height: self.timeout_block_height,
        };
        self.created.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn swap_status(&self, _id: &str) -> Result<ServiceSwapStatus> {
        Ok(self.status.lock().unwrap().clone())
    }
}

/// All mock backends, kept concrete so tests can steer and inspect them.
pub struct Mocks {
    pub node: Arc<MockNode>,
    pub chain: Arc<MockChain>,
    pub lsp: Arc<MockLsp>,
    pub swapper: Arc<MockSwapper>,
    pub reverse: Arc<MockReverseSwapper>,
}

impl Default for Mocks {
    fn default() -> Self {
        Self {
            node: Arc::new(MockNode::default()),
            chain: Arc::new(MockChain::with_tip(200)),
            lsp: Arc::new(MockLsp::with(vec![lsp(
                "lsp-1",
                vec![fee_params(2_000_000, 10_000), fee_params(1_000_000, 5_000)],
            )])),
            swapper: Arc::new(MockSwapper::default()),
            reverse: Arc::new(MockReverseSwapper::default()),
        }
    }
}

impl Mocks {
    pub fn backends(&self) -> Backends {
        Backends {
            node_api: self.node.clone(),
            chain: self.chain.clone(),
            lsp_api: self.lsp.clone(),
            swapper: self.swapper.clone(),
            reverse_swapper: self.reverse.clone(),
            http: reqwest::Client::new(),
        }
    }
}

/// Regtest config rooted in `dir`, with short timers.
pub fn test_config(dir: &std::path::Path) -> NodeConfig {
    NodeConfig {
        default_lsp_id: Some("lsp-1".to_string()),
        payment_timeout_sec: 5,
        sync_interval_sec: 1,
        max_backend_retries: 2,
        ..NodeConfig::regtest(dir.to_path_buf())
    }
}

pub const SEED: [u8; 32] = [0x07; 32];

/// A session connected without background loops and synced once.
pub async fn synced_session(mocks: &Mocks, config: NodeConfig) -> ln_swap_sdk::NodeSession {
    let session = ln_swap_sdk::NodeSession::new(config, mocks.backends()).expect("create session");
    session.connect(&SEED, true).await.expect("connect");
    session.sync().await.expect("initial sync");
    session
}

pub fn drain(
    rx: &mut tokio::sync::broadcast::Receiver<ln_swap_sdk::BreezEvent>,
) -> Vec<ln_swap_sdk::BreezEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
