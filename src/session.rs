//! Owned node session: connection lifecycle, state sync, background loops
//! and the operation surface that delegates to the engines.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::breez_server::BreezServerClient;
use crate::chain::esplora::EsploraChainService;
use crate::chain::{ChainService, RecommendedFees};
use crate::config::NodeConfig;
use crate::error::{SdkError, SdkResult};
use crate::events::{BackupFailedData, BreezEvent, EventBus};
use crate::fees::{
    OpenChannelFeeRequest, OpenChannelFeeResponse, ReverseSwapFeesRequest, open_channel_fee,
    parse_address, prepare_redeem_onchain_funds,
};
use crate::input::{InputParser, InputType};
use crate::keys::{NodeIdentity, check_message};
use crate::lightning::invoice::{LnInvoice, parse_invoice};
use crate::lightning::ldk::LdkNodeApi;
use crate::lightning::node_api::{ConnectRequest, NodeApi};
use crate::lnurl::LnUrlCallbackStatus;
use crate::lnurl::auth::LnUrlAuthRequestData;
use crate::lnurl::pay::{LnUrlPayRequest, LnUrlPayResult};
use crate::lnurl::withdraw::{LnUrlWithdrawRequest, LnUrlWithdrawResult};
use crate::lsp::{LspApi, LspInformation};
use crate::models::{
    Channel, ChannelState, CheckMessageRequest, CheckMessageResponse, ClosedChannelPaymentDetails,
    ListPaymentsRequest, NodeState, Payment, PaymentDetails, PaymentStatus, PaymentType,
    PrepareRedeemOnchainFundsRequest, PrepareRedeemOnchainFundsResponse, ReceivePaymentRequest,
    ReceivePaymentResponse, RedeemOnchainFundsRequest, RedeemOnchainFundsResponse,
    SendPaymentRequest, SendSpontaneousPaymentRequest, SignMessageRequest, SignMessageResponse,
    StaticBackupResponse, now_secs,
};
use crate::payments::PaymentEngine;
use crate::persist::SqliteStore;
use crate::persist::store::{KEY_LAST_SYNC, KEY_LSP_ID, KEY_NODE_STATE, KEY_STATIC_BACKUP};
use crate::reverse_swap::boltz::BoltzApi;
use crate::reverse_swap::service::BtcSendSwap;
use crate::reverse_swap::{
    MaxReverseSwapAmountResponse, OnchainPaymentLimitsResponse, PayOnchainRequest,
    PayOnchainResponse, PrepareOnchainPaymentRequest, PrepareOnchainPaymentResponse,
    ReverseSwapInfo, ReverseSwapPairInfo, ReverseSwapServiceApi,
};
use crate::swap::service::BtcReceiveSwap;
use crate::swap::{
    PrepareRefundRequest, PrepareRefundResponse, ReceiveOnchainRequest, RefundRequest,
    RefundResponse, SwapInfo, SwapPolicy, SwapStatus, SwapperApi,
};

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// The collaborators a session drives.
#[derive(Clone)]
pub struct Backends {
    pub node_api: Arc<dyn NodeApi>,
    pub chain: Arc<dyn ChainService>,
    pub lsp_api: Arc<dyn LspApi>,
    pub swapper: Arc<dyn SwapperApi>,
    pub reverse_swapper: Arc<dyn ReverseSwapServiceApi>,
    pub http: reqwest::Client,
}

impl Backends {
    /// Production adapters for the endpoints in `config`.
    pub fn from_config(config: &NodeConfig) -> SdkResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("build http client")
            .map_err(SdkError::Generic)?;
        let breez = Arc::new(BreezServerClient::new(
            config.breez_server_url.clone(),
            config.api_key.clone(),
            http.clone(),
        ));
        Ok(Self {
            node_api: Arc::new(LdkNodeApi::new(
                config.ldk_rest_addr.clone(),
                config.payment_timeout(),
            )),
            chain: Arc::new(EsploraChainService::new(config.esplora_url.clone(), http.clone())),
            lsp_api: breez.clone(),
            swapper: breez,
            reverse_swapper: Arc::new(BoltzApi::new(config.boltz_url.clone(), http.clone())),
            http,
        })
    }
}

struct Connected {
    identity: NodeIdentity,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// State shared with the background loops.
struct Inner {
    config: Arc<NodeConfig>,
    node_api: Arc<dyn NodeApi>,
    chain: Arc<dyn ChainService>,
    lsp_api: Arc<dyn LspApi>,
    store: Arc<Mutex<SqliteStore>>,
    events: EventBus,
    payments: PaymentEngine,
    swaps: BtcReceiveSwap,
    reverse_swaps: BtcSendSwap,
    node_state: Mutex<Option<NodeState>>,
    lsp: Mutex<Option<LspInformation>>,
    tip: AtomicU32,
    sync_lock: tokio::sync::Mutex<()>,
    live_tasks: Arc<AtomicUsize>,
}

pub struct NodeSession {
    inner: Arc<Inner>,
    parser: InputParser,
    lifecycle: tokio::sync::Mutex<Option<Connected>>,
}

impl NodeSession {
    pub fn new(config: NodeConfig, backends: Backends) -> SdkResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.working_dir)
            .with_context(|| format!("create working dir {}", config.working_dir.display()))
            .map_err(SdkError::Persistence)?;
        let store = SqliteStore::open(config.storage_path()).map_err(SdkError::Persistence)?;
        let node_state = store
            .get_json_setting::<NodeState>(KEY_NODE_STATE)
            .map_err(SdkError::Persistence)?;
        let store = Arc::new(Mutex::new(store));

        let config = Arc::new(config);
        let events = EventBus::new();
        let payments = PaymentEngine::new(
            config.clone(),
            backends.node_api.clone(),
            backends.lsp_api.clone(),
            store.clone(),
            events.clone(),
            backends.http.clone(),
        );
        let swaps = BtcReceiveSwap::new(
            config.network,
            SwapPolicy {
                min_confirmations: config.min_confirmations,
                safety_margin_blocks: config.swap_safety_margin_blocks,
            },
            backends.swapper.clone(),
            backends.chain.clone(),
            payments.clone(),
            store.clone(),
            events.clone(),
        );
        let reverse_swaps = BtcSendSwap::new(
            config.clone(),
            backends.reverse_swapper.clone(),
            backends.chain.clone(),
            payments.clone(),
            store.clone(),
            events.clone(),
        );

        Ok(Self {
            parser: InputParser::new(config.network, backends.http.clone()),
            inner: Arc::new(Inner {
                config,
                node_api: backends.node_api,
                chain: backends.chain,
                lsp_api: backends.lsp_api,
                store,
                events,
                payments,
                swaps,
                reverse_swaps,
                node_state: Mutex::new(node_state),
                lsp: Mutex::new(None),
                tip: AtomicU32::new(0),
                sync_lock: tokio::sync::Mutex::new(()),
                live_tasks: Arc::new(AtomicUsize::new(0)),
            }),
            lifecycle: tokio::sync::Mutex::new(None),
        })
    }

    /// Derives the node identity from `seed`, opens the backend session and,
    /// unless `restore_only`, starts the background sync and block loops.
    pub async fn connect(&self, seed: &[u8], restore_only: bool) -> SdkResult<()> {
        if self.lifecycle.lock().await.is_some() {
            return Err(SdkError::AlreadyConnected);
        }

        let identity = NodeIdentity::from_seed(seed, self.inner.config.network)
            .map_err(SdkError::Generic)?;
        let timeout = self.inner.config.payment_timeout();
        let request = ConnectRequest {
            identity_pubkey: identity.node_pubkey().to_string(),
            credentials: self.inner.config.credentials.clone(),
            restore_only,
        };
        // The lifecycle lock is not held here so a stalled backend cannot
        // block `is_connected` or `disconnect`.
        let resp = tokio::time::timeout(timeout, self.inner.node_api.connect(request))
            .await
            .map_err(|_| SdkError::Timeout(format!("node did not answer within {timeout:?}")))??;
        tracing::info!(node_id = %resp.node_id, restore_only, "connected");

        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(SdkError::AlreadyConnected);
        }
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        if !restore_only {
            tasks.push(tokio::spawn(run_sync_loop(
                self.inner.clone(),
                shutdown_rx.clone(),
            )));
            tasks.push(tokio::spawn(run_block_loop(self.inner.clone(), shutdown_rx)));
        }
        *lifecycle = Some(Connected {
            identity,
            shutdown,
            tasks,
        });
        Ok(())
    }

    /// Stops the background loops. Safe to call when not connected.
    pub async fn disconnect(&self) -> SdkResult<()> {
        let Some(connected) = self.lifecycle.lock().await.take() else {
            return Ok(());
        };
        let _ = connected.shutdown.send(true);
        for task in connected.tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "background task ended abnormally");
            }
        }
        tracing::info!("disconnected");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.lifecycle.lock().await.is_some()
    }

    /// Background loops currently alive.
    pub fn background_tasks(&self) -> usize {
        self.inner.live_tasks.load(Ordering::SeqCst)
    }

    async fn identity(&self) -> SdkResult<NodeIdentity> {
        self.lifecycle
            .lock()
            .await
            .as_ref()
            .map(|c| c.identity.clone())
            .ok_or(SdkError::NotConnected)
    }

    async fn ensure_connected(&self) -> SdkResult<()> {
        self.identity().await.map(|_| ())
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BreezEvent> {
        self.inner.events.subscribe()
    }

    pub async fn sync(&self) -> SdkResult<()> {
        self.ensure_connected().await?;
        self.inner.sync().await
    }

    pub fn node_info(&self) -> SdkResult<NodeState> {
        self.inner.node_state()
    }

    pub async fn parse_input(&self, input: &str) -> SdkResult<InputType> {
        self.parser.parse(input).await
    }

    pub fn parse_invoice(&self, bolt11: &str) -> SdkResult<LnInvoice> {
        parse_invoice(bolt11, self.inner.config.network)
    }

    pub async fn send_payment(&self, req: SendPaymentRequest) -> SdkResult<Payment> {
        self.ensure_connected().await?;
        self.inner.payments.send_payment(req).await
    }

    pub async fn send_spontaneous_payment(
        &self,
        req: SendSpontaneousPaymentRequest,
    ) -> SdkResult<Payment> {
        self.ensure_connected().await?;
        self.inner.payments.send_spontaneous_payment(req).await
    }

    pub async fn receive_payment(
        &self,
        req: ReceivePaymentRequest,
    ) -> SdkResult<ReceivePaymentResponse> {
        self.ensure_connected().await?;
        let node_state = self.inner.node_state()?;
        let lsp = self.inner.current_lsp(&node_state.id).await;
        self.inner
            .payments
            .receive_payment(req, &node_state, lsp.as_ref())
            .await
    }

    pub async fn lnurl_pay(&self, req: LnUrlPayRequest) -> SdkResult<LnUrlPayResult> {
        self.ensure_connected().await?;
        self.inner.payments.lnurl_pay(req).await
    }

    pub async fn lnurl_withdraw(
        &self,
        req: LnUrlWithdrawRequest,
    ) -> SdkResult<LnUrlWithdrawResult> {
        self.ensure_connected().await?;
        let node_state = self.inner.node_state()?;
        let lsp = self.inner.current_lsp(&node_state.id).await;
        self.inner
            .payments
            .lnurl_withdraw(req, &node_state, lsp.as_ref())
            .await
    }

    pub async fn lnurl_auth(&self, req: LnUrlAuthRequestData) -> SdkResult<LnUrlCallbackStatus> {
        let identity = self.identity().await?;
        self.inner.payments.lnurl_auth(&identity, &req).await
    }

    pub fn list_payments(&self, req: &ListPaymentsRequest) -> SdkResult<Vec<Payment>> {
        self.inner.payments.list_payments(req)
    }

    pub fn payment_by_hash(&self, payment_hash: &str) -> SdkResult<Option<Payment>> {
        self.inner.payments.payment_by_hash(payment_hash)
    }

    /// Attaches caller-defined JSON to a stored payment.
    pub fn set_payment_metadata(&self, payment_hash: &str, metadata: &str) -> SdkResult<()> {
        self.inner
            .payments
            .set_payment_metadata(payment_hash, metadata)
    }

    /// Signs `message` with the node key, zbase32-encoded.
    pub async fn sign_message(&self, req: SignMessageRequest) -> SdkResult<SignMessageResponse> {
        let signature = self
            .identity()
            .await?
            .sign_message(&req.message)
            .map_err(SdkError::Generic)?;
        Ok(SignMessageResponse { signature })
    }

    pub fn check_message(&self, req: CheckMessageRequest) -> SdkResult<CheckMessageResponse> {
        let is_valid = check_message(&req.message, &req.pubkey, &req.signature)
            .map_err(|e| SdkError::parse(format!("{e:#}")))?;
        Ok(CheckMessageResponse { is_valid })
    }

    pub async fn list_lsps(&self) -> SdkResult<Vec<LspInformation>> {
        self.ensure_connected().await?;
        let node_state = self.inner.node_state()?;
        self.inner
            .lsp_api
            .list_lsps(&node_state.id)
            .await
            .map_err(SdkError::BackendUnavailable)
    }

    pub async fn set_lsp_id(&self, lsp_id: &str) -> SdkResult<()> {
        let lsp = self
            .list_lsps()
            .await?
            .into_iter()
            .find(|lsp| lsp.id == lsp_id)
            .ok_or_else(|| SdkError::generic(format!("unknown LSP {lsp_id}")))?;
        self.inner
            .store
            .lock()
            .expect("store mutex poisoned")
            .set_setting(KEY_LSP_ID, lsp_id)
            .map_err(SdkError::Persistence)?;
        tracing::info!(lsp_id, name = %lsp.name, "selected LSP");
        *self.inner.lsp.lock().expect("lsp mutex poisoned") = Some(lsp);
        Ok(())
    }

    pub fn lsp_id(&self) -> SdkResult<Option<String>> {
        self.inner.lsp_id()
    }

    /// Details of the selected LSP, fetched fresh.
    pub async fn lsp_info(&self) -> SdkResult<LspInformation> {
        self.ensure_connected().await?;
        let node_state = self.inner.node_state()?;
        self.inner.refresh_lsp(&node_state.id).await?;
        self.inner
            .lsp
            .lock()
            .expect("lsp mutex poisoned")
            .clone()
            .ok_or_else(|| SdkError::generic("no LSP selected"))
    }

    pub async fn open_channel_fee(
        &self,
        req: OpenChannelFeeRequest,
    ) -> SdkResult<OpenChannelFeeResponse> {
        let lsp = self.lsp_info().await?;
        open_channel_fee(&lsp.opening_fee_params_list, req, now_secs())
    }

    pub async fn recommended_fees(&self) -> SdkResult<RecommendedFees> {
        self.inner
            .chain
            .recommended_fees()
            .await
            .map_err(SdkError::BackendUnavailable)
    }

    pub fn prepare_redeem_onchain_funds(
        &self,
        req: PrepareRedeemOnchainFundsRequest,
    ) -> SdkResult<PrepareRedeemOnchainFundsResponse> {
        prepare_redeem_onchain_funds(&self.inner.node_state()?, self.inner.config.network, &req)
    }

    pub async fn redeem_onchain_funds(
        &self,
        req: RedeemOnchainFundsRequest,
    ) -> SdkResult<RedeemOnchainFundsResponse> {
        self.ensure_connected().await?;
        parse_address(&req.to_address, self.inner.config.network)?;
        let txid = self
            .inner
            .node_api
            .redeem_onchain_funds(req.to_address, req.sat_per_vbyte)
            .await?;
        tracing::info!(%txid, "redeemed on-chain funds");
        Ok(RedeemOnchainFundsResponse { txid })
    }

    pub async fn receive_onchain(&self, req: ReceiveOnchainRequest) -> SdkResult<SwapInfo> {
        self.ensure_connected().await?;
        let _guard = self.inner.sync_lock.lock().await;
        let (tip, node_state, lsp) = self.inner.refresh_swaps().await?;
        self.inner
            .swaps
            .receive_onchain(req, &node_state, lsp.as_ref(), tip)
            .await
    }

    /// Swap whose deposit is waiting for confirmations, after refreshing
    /// every monitored swap against the chain.
    pub async fn in_progress_swap(&self) -> SdkResult<Option<SwapInfo>> {
        self.ensure_connected().await?;
        let _guard = self.inner.sync_lock.lock().await;
        self.inner.refresh_swaps().await?;
        self.inner.swaps.in_progress_swap()
    }

    /// Redeems the swap at `swap_address` without waiting for the monitor.
    pub async fn redeem_swap(&self, swap_address: &str) -> SdkResult<SwapInfo> {
        self.ensure_connected().await?;
        let _guard = self.inner.sync_lock.lock().await;
        let tip = self.inner.current_tip().await?;
        let node_state = self.inner.node_state()?;
        let lsp = self.inner.current_lsp(&node_state.id).await;
        self.inner
            .swaps
            .redeem_swap(swap_address, tip, &node_state, lsp.as_ref())
            .await
    }

    pub fn list_swaps(&self, statuses: &[SwapStatus]) -> SdkResult<Vec<SwapInfo>> {
        self.inner.swaps.list_swaps(statuses)
    }

    pub fn list_refundables(&self) -> SdkResult<Vec<SwapInfo>> {
        self.inner.swaps.list_refundables()
    }

    pub async fn prepare_refund(
        &self,
        req: PrepareRefundRequest,
    ) -> SdkResult<PrepareRefundResponse> {
        self.inner.swaps.prepare_refund(req).await
    }

    pub async fn refund(&self, req: RefundRequest) -> SdkResult<RefundResponse> {
        self.ensure_connected().await?;
        let tip = self.inner.current_tip().await?;
        self.inner.swaps.refund(req, tip).await
    }

    pub async fn rescan_swaps(&self) -> SdkResult<()> {
        let tip = self.inner.current_tip().await?;
        self.inner.swaps.rescan_swaps(tip).await
    }

    pub async fn fetch_reverse_swap_fees(
        &self,
        req: ReverseSwapFeesRequest,
    ) -> SdkResult<ReverseSwapPairInfo> {
        self.inner.reverse_swaps.fetch_reverse_swap_fees(req).await
    }

    pub async fn prepare_onchain_payment(
        &self,
        req: PrepareOnchainPaymentRequest,
    ) -> SdkResult<PrepareOnchainPaymentResponse> {
        self.inner.reverse_swaps.prepare_onchain_payment(req).await
    }

    pub async fn onchain_payment_limits(&self) -> SdkResult<OnchainPaymentLimitsResponse> {
        let node_state = self.inner.node_state()?;
        self.inner
            .reverse_swaps
            .onchain_payment_limits(&node_state)
            .await
    }

    pub fn max_reverse_swap_amount(&self) -> SdkResult<MaxReverseSwapAmountResponse> {
        let node_state = self.inner.node_state()?;
        Ok(self.inner.reverse_swaps.max_reverse_swap_amount(&node_state))
    }

    pub async fn pay_onchain(&self, req: PayOnchainRequest) -> SdkResult<PayOnchainResponse> {
        self.ensure_connected().await?;
        let tip = self.inner.current_tip().await?;
        self.inner.reverse_swaps.pay_onchain(req, tip).await
    }

    pub fn in_progress_reverse_swaps(&self) -> SdkResult<Vec<ReverseSwapInfo>> {
        self.inner.reverse_swaps.in_progress_reverse_swaps()
    }

    pub fn list_reverse_swaps(&self) -> SdkResult<Vec<ReverseSwapInfo>> {
        self.inner.reverse_swaps.list_reverse_swaps()
    }

    pub async fn claim_reverse_swap(&self, lockup_address: &str) -> SdkResult<()> {
        self.ensure_connected().await?;
        self.inner
            .reverse_swaps
            .claim_reverse_swap(lockup_address)
            .await
    }

    /// Fetches the backend's static channel backup and stores it locally.
    pub async fn backup(&self) -> SdkResult<()> {
        self.ensure_connected().await?;
        self.inner.events.emit(BreezEvent::BackupStarted);
        let result = async {
            let backup = self.inner.node_api.static_backup().await?;
            self.inner
                .store
                .lock()
                .expect("store mutex poisoned")
                .set_json_setting(KEY_STATIC_BACKUP, &backup)
                .map_err(SdkError::Persistence)
        }
        .await;
        match result {
            Ok(()) => {
                self.inner.events.emit(BreezEvent::BackupSucceeded);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(error = %err, "backup failed");
                self.inner.events.emit(BreezEvent::BackupFailed {
                    details: BackupFailedData {
                        error: err.to_string(),
                    },
                });
                Err(err)
            }
        }
    }

    pub fn static_backup(&self) -> SdkResult<StaticBackupResponse> {
        let backup = self
            .inner
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_json_setting::<Vec<String>>(KEY_STATIC_BACKUP)
            .map_err(SdkError::Persistence)?;
        Ok(StaticBackupResponse { backup })
    }
}

impl Inner {
    fn node_state(&self) -> SdkResult<NodeState> {
        self.node_state
            .lock()
            .expect("node state mutex poisoned")
            .clone()
            .ok_or_else(|| SdkError::generic("node state not synced yet"))
    }

    fn lsp_id(&self) -> SdkResult<Option<String>> {
        let stored = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_setting(KEY_LSP_ID)
            .map_err(SdkError::Persistence)?;
        Ok(stored.or_else(|| self.config.default_lsp_id.clone()))
    }

    async fn refresh_lsp(&self, node_pubkey: &str) -> SdkResult<()> {
        let Some(lsp_id) = self.lsp_id()? else {
            return Ok(());
        };
        let lsp = self
            .lsp_api
            .list_lsps(node_pubkey)
            .await
            .map_err(SdkError::BackendUnavailable)?
            .into_iter()
            .find(|lsp| lsp.id == lsp_id);
        if lsp.is_none() {
            tracing::warn!(%lsp_id, "selected LSP is no longer offered");
        }
        *self.lsp.lock().expect("lsp mutex poisoned") = lsp;
        Ok(())
    }

    /// Selected LSP, refreshed when possible and cached otherwise.
    async fn current_lsp(&self, node_pubkey: &str) -> Option<LspInformation> {
        if let Err(err) = self.refresh_lsp(node_pubkey).await {
            tracing::debug!(error = %err, "using cached LSP information");
        }
        self.lsp.lock().expect("lsp mutex poisoned").clone()
    }

    async fn current_tip(&self) -> SdkResult<u32> {
        let tip = self
            .chain
            .current_tip()
            .await
            .map_err(SdkError::BackendUnavailable)?;
        self.observe_tip(tip);
        Ok(tip)
    }

    /// Emits `NewBlock` the first time a height is seen.
    fn observe_tip(&self, tip: u32) -> bool {
        let previous = self.tip.fetch_max(tip, Ordering::SeqCst);
        if tip > previous {
            tracing::debug!(height = tip, "new block");
            self.events.emit(BreezEvent::NewBlock { block: tip });
            return true;
        }
        false
    }

    async fn sync(&self) -> SdkResult<()> {
        let _guard = self.sync_lock.lock().await;
        let started = now_secs();
        let since = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_setting(KEY_LAST_SYNC)
            .map_err(SdkError::Persistence)?
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);

        let resp = self.node_api.pull_changed(since).await?;
        let tip = self.current_tip().await?;

        self.store
            .lock()
            .expect("store mutex poisoned")
            .set_json_setting(KEY_NODE_STATE, &resp.node_state)
            .map_err(SdkError::Persistence)?;
        let node_state = resp.node_state;
        *self.node_state.lock().expect("node state mutex poisoned") = Some(node_state.clone());

        let mut remote = resp.payments;
        remote.extend(resp.channels.iter().filter_map(closed_channel_payment));
        let received = self.payments.reconcile(remote)?;
        for payment in &received {
            self.swaps.on_invoice_paid(payment, tip)?;
        }

        self.store
            .lock()
            .expect("store mutex poisoned")
            .set_setting(KEY_LAST_SYNC, &started.to_string())
            .map_err(SdkError::Persistence)?;

        self.monitor_swaps(tip, &node_state).await?;
        tracing::debug!(
            height = tip,
            channels_balance_msat = node_state.channels_balance_msat,
            received = received.len(),
            "synced"
        );
        Ok(())
    }

    /// Runs the receive-swap monitor once. Callers hold `sync_lock`.
    async fn refresh_swaps(&self) -> SdkResult<(u32, NodeState, Option<LspInformation>)> {
        let tip = self.current_tip().await?;
        let node_state = self.node_state()?;
        let lsp = self.current_lsp(&node_state.id).await;
        self.swaps
            .execute_pending_swaps(tip, &node_state, lsp.as_ref())
            .await?;
        Ok((tip, node_state, lsp))
    }

    async fn monitor_swaps(&self, tip: u32, node_state: &NodeState) -> SdkResult<()> {
        let lsp = self.current_lsp(&node_state.id).await;
        self.swaps
            .execute_pending_swaps(tip, node_state, lsp.as_ref())
            .await?;
        self.reverse_swaps.process_monitored_reverse_swaps(tip).await
    }

    /// Syncs, retrying transient failures with exponential backoff. Gives up
    /// with a `BackupFailed` event instead of an error.
    async fn sync_with_retries(&self) {
        let attempts = self.config.max_backend_retries.max(1);
        let mut delay = INITIAL_BACKOFF;
        for attempt in 1..=attempts {
            match self.sync().await {
                Ok(()) => return,
                Err(err) if err.is_transient() && attempt < attempts => {
                    tracing::warn!(attempt, error = %err, "sync failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
                Err(err) => {
                    tracing::error!(attempt, error = %err, "sync failed");
                    self.events.emit(BreezEvent::BackupFailed {
                        details: BackupFailedData {
                            error: err.to_string(),
                        },
                    });
                    return;
                }
            }
        }
    }

    async fn on_tick(&self) -> SdkResult<()> {
        let tip = self
            .chain
            .current_tip()
            .await
            .map_err(SdkError::BackendUnavailable)?;
        if self.observe_tip(tip) {
            let _guard = self.sync_lock.lock().await;
            let node_state = self.node_state.lock().expect("node state mutex poisoned").clone();
            if let Some(node_state) = node_state {
                self.monitor_swaps(tip, &node_state).await?;
            }
        }
        Ok(())
    }
}

/// Decrements the live task count when a background loop exits.
struct LiveTask(Arc<AtomicUsize>);

impl LiveTask {
    fn start(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for LiveTask {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run_sync_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let _live = LiveTask::start(&inner.live_tasks);
    let mut interval = tokio::time::interval(inner.config.sync_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = inner.sync_with_retries() => {}
                }
            }
        }
    }
    tracing::debug!("sync loop stopped");
}

async fn run_block_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let _live = LiveTask::start(&inner.live_tasks);
    let mut interval = tokio::time::interval(inner.config.sync_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    res = inner.on_tick() => {
                        if let Err(err) = res {
                            tracing::debug!(error = %err, "block poll failed");
                        }
                    }
                }
            }
        }
    }
    tracing::debug!("block loop stopped");
}

/// Closing channels surface as payments of the local balance.
fn closed_channel_payment(channel: &Channel) -> Option<Payment> {
    let status = match channel.state {
        ChannelState::PendingClose => PaymentStatus::Pending,
        ChannelState::Closed => PaymentStatus::Complete,
        ChannelState::PendingOpen | ChannelState::Opened => return None,
    };
    Some(Payment {
        id: channel.funding_txid.clone(),
        payment_type: PaymentType::ClosedChannel,
        payment_time: channel
            .closed_at
            .map(|t| t as i64)
            .unwrap_or_else(now_secs),
        amount_msat: channel.spendable_msat,
        fee_msat: 0,
        status,
        error: None,
        description: Some("Closed Channel".to_string()),
        details: PaymentDetails::ClosedChannel {
            data: ClosedChannelPaymentDetails {
                state: channel.state,
                funding_txid: channel.funding_txid.clone(),
                short_channel_id: channel.short_channel_id.clone(),
                closing_txid: channel.closing_txid.clone(),
            },
        },
        metadata: None,
    })
}
