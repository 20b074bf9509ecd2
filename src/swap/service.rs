use std::sync::{Arc, Mutex};

use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, ScriptBuf};

use crate::chain::{AddressUtxos, ChainService, OnchainTx, get_utxos};
use crate::config::Network;
use crate::error::{SdkError, SdkResult};
use crate::events::{BreezEvent, EventBus};
use crate::fees::{parse_address, select_opening_fee_params};
use crate::lsp::LspInformation;
use crate::models::{LnPaymentDetails, NodeState, Payment, ReceivePaymentRequest, now_secs};
use crate::payments::PaymentEngine;
use crate::persist::SqliteStore;
use crate::swap::script::{
    SpendInput, SubmarineSwapScript, cooperative_refund_unsigned, estimate_sweep_vsize,
    finalize_cooperative_refund, refund_tx,
};
use crate::swap::{
    PrepareRefundRequest, PrepareRefundResponse, ReceiveOnchainRequest, RefundRequest,
    RefundResponse, SwapInfo, SwapPolicy, SwapStatus, SwapperApi,
};

const MONITORED: [SwapStatus; 3] = [
    SwapStatus::WaitingDeposit,
    SwapStatus::WaitingConfirmation,
    SwapStatus::Refundable,
];

/// Receives on-chain bitcoin into the Lightning node through submarine swaps.
#[derive(Clone)]
pub struct BtcReceiveSwap {
    network: Network,
    policy: SwapPolicy,
    swapper: Arc<dyn SwapperApi>,
    chain: Arc<dyn ChainService>,
    payments: PaymentEngine,
    store: Arc<Mutex<SqliteStore>>,
    events: EventBus,
}

impl BtcReceiveSwap {
    pub fn new(
        network: Network,
        policy: SwapPolicy,
        swapper: Arc<dyn SwapperApi>,
        chain: Arc<dyn ChainService>,
        payments: PaymentEngine,
        store: Arc<Mutex<SqliteStore>>,
        events: EventBus,
    ) -> Self {
        Self {
            network,
            policy,
            swapper,
            chain,
            payments,
            store,
            events,
        }
    }

    /// Hands out a deposit address. An address nobody has used yet is
    /// returned again with limits and fees refreshed; otherwise a new swap is
    /// created with the swapper.
    pub async fn receive_onchain(
        &self,
        req: ReceiveOnchainRequest,
        node_state: &NodeState,
        lsp: Option<&LspInformation>,
        tip: u32,
    ) -> SdkResult<SwapInfo> {
        if let Some(swap) = self.in_progress_swap()? {
            return Err(SdkError::swap(format!(
                "swap {} is in progress, wait for it to complete",
                swap.bitcoin_address
            )));
        }

        let opening_fee_params = match req.opening_fee_params {
            Some(params) => Some(params),
            None => lsp.and_then(|lsp| {
                select_opening_fee_params(&lsp.opening_fee_params_list, None, None, now_secs())
                    .ok()
            }),
        };
        let max_receivable_sat = node_state.max_receivable_msat / 1000;

        if let Some(unused) = self.unused_swap(tip).await? {
            let mut reused = unused.clone();
            reused.apply_receive_limits(max_receivable_sat, lsp.is_some());
            reused.channel_opening_fees = opening_fee_params;
            self.save_if_changed(&unused, &reused)?;
            tracing::info!(address = %reused.bitcoin_address, "reusing unused swap address");
            return Ok(reused);
        }

        let secp = Secp256k1::new();
        let preimage: [u8; 32] = rand::random();
        let payment_hash = sha256::Hash::hash(&preimage).to_byte_array();
        let private_key = SecretKey::from_slice(&rand::random::<[u8; 32]>())
            .map_err(|e| SdkError::generic(format!("generate swap key: {e}")))?;
        let public_key = PublicKey::from_secret_key(&secp, &private_key);

        let resp = self
            .swapper
            .create_swap(
                payment_hash.to_vec(),
                public_key.serialize().to_vec(),
                node_state.id.clone(),
            )
            .await
            .map_err(SdkError::BackendUnavailable)?;

        let swapper_pubkey = PublicKey::from_slice(&resp.swapper_pubkey)
            .map_err(|e| SdkError::swap(format!("swapper returned an invalid pubkey: {e}")))?;
        let script =
            SubmarineSwapScript::new(&payment_hash, swapper_pubkey, public_key, resp.lock_height);
        let witness_script = script
            .witness_script()
            .map_err(|e| SdkError::swap(format!("{e:#}")))?;
        let address = script
            .p2wsh_address(self.network.into())
            .map_err(|e| SdkError::swap(format!("{e:#}")))?;
        if address.to_string() != resp.bitcoin_address {
            return Err(SdkError::swap(format!(
                "swapper address {} does not match the swap script address {address}",
                resp.bitcoin_address
            )));
        }

        let mut swap = SwapInfo {
            bitcoin_address: resp.bitcoin_address,
            created_at: now_secs(),
            created_at_height: tip,
            lock_height: resp.lock_height,
            payment_hash: payment_hash.to_vec(),
            preimage: preimage.to_vec(),
            private_key: private_key.secret_bytes().to_vec(),
            public_key: public_key.serialize().to_vec(),
            swapper_public_key: resp.swapper_pubkey,
            script: witness_script.to_bytes(),
            bolt11: None,
            paid_msat: 0,
            confirmed_sats: 0,
            unconfirmed_sats: 0,
            total_incoming_txs: 0,
            status: SwapStatus::WaitingDeposit,
            refund_tx_ids: Vec::new(),
            unconfirmed_tx_ids: Vec::new(),
            confirmed_tx_ids: Vec::new(),
            min_allowed_deposit: resp.min_allowed_deposit,
            max_allowed_deposit: resp.max_allowed_deposit,
            max_swapper_payable: resp.max_allowed_deposit,
            last_redeem_error: None,
            channel_opening_fees: opening_fee_params,
            confirmed_at: None,
            last_deposit_height: None,
        };
        swap.apply_receive_limits(max_receivable_sat, lsp.is_some());
        self.store
            .lock()
            .expect("store mutex poisoned")
            .insert_swap(&swap)
            .map_err(SdkError::Persistence)?;
        tracing::info!(
            address = %swap.bitcoin_address,
            lock_height = swap.lock_height,
            min_sat = swap.min_allowed_deposit,
            max_sat = swap.max_allowed_deposit,
            "created swap"
        );
        self.events.emit(BreezEvent::SwapUpdated {
            details: swap.clone(),
        });
        Ok(swap)
    }

    /// Oldest swap whose address is still unused on chain.
    async fn unused_swap(&self, tip: u32) -> SdkResult<Option<SwapInfo>> {
        let mut candidates = self.list_swaps(&[SwapStatus::WaitingDeposit])?;
        candidates.sort_by_key(|s| s.created_at);
        for candidate in candidates {
            if !candidate.is_unused(tip, &self.policy) {
                continue;
            }
            let refreshed = self.refresh_swap(&candidate, tip).await?;
            if refreshed.is_unused(tip, &self.policy) {
                return Ok(Some(refreshed));
            }
        }
        Ok(None)
    }

    /// The swap waiting for its deposit to confirm, as last refreshed.
    pub fn in_progress_swap(&self) -> SdkResult<Option<SwapInfo>> {
        Ok(self
            .list_swaps(&[SwapStatus::WaitingConfirmation])?
            .into_iter()
            .next())
    }

    pub fn list_refundables(&self) -> SdkResult<Vec<SwapInfo>> {
        self.list_swaps(&[SwapStatus::Refundable])
    }

    pub fn list_swaps(&self, statuses: &[SwapStatus]) -> SdkResult<Vec<SwapInfo>> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .list_swaps(statuses)
            .map_err(SdkError::Persistence)
    }

    fn get_swap(&self, bitcoin_address: &str) -> SdkResult<SwapInfo> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .get_swap(bitcoin_address)
            .map_err(SdkError::Persistence)?
            .ok_or_else(|| SdkError::swap(format!("no swap for address {bitcoin_address}")))
    }

    fn save(&self, swap: &SwapInfo) -> SdkResult<()> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .update_swap(swap)
            .map_err(SdkError::Persistence)
    }

    /// Persists `swap` and emits an update if it differs from `before`.
    fn save_if_changed(&self, before: &SwapInfo, swap: &SwapInfo) -> SdkResult<()> {
        if before == swap {
            return Ok(());
        }
        self.save(swap)?;
        if before.status != swap.status {
            tracing::info!(
                address = %swap.bitcoin_address,
                from = ?before.status,
                to = ?swap.status,
                "swap status changed"
            );
        }
        self.events.emit(BreezEvent::SwapUpdated {
            details: swap.clone(),
        });
        Ok(())
    }

    async fn fetch_utxos(&self, address: &str) -> SdkResult<(AddressUtxos, u64)> {
        let txs = self
            .chain
            .address_transactions(address)
            .await
            .map_err(SdkError::BackendUnavailable)?;
        let utxos = get_utxos(address, &txs).map_err(SdkError::BackendUnavailable)?;
        Ok((utxos, incoming_tx_count(address, &txs)))
    }

    async fn refresh_swap(&self, swap: &SwapInfo, tip: u32) -> SdkResult<SwapInfo> {
        let (utxos, total_incoming_txs) = self.fetch_utxos(&swap.bitcoin_address).await?;
        let mut updated = swap.clone();
        updated.refresh(&utxos, total_incoming_txs, tip, &self.policy);
        self.save_if_changed(swap, &updated)?;
        Ok(updated)
    }

    /// Refreshes every monitored swap and redeems the ones that are ready.
    pub async fn execute_pending_swaps(
        &self,
        tip: u32,
        node_state: &NodeState,
        lsp: Option<&LspInformation>,
    ) -> SdkResult<()> {
        for swap in self.list_swaps(&MONITORED)? {
            let swap = match self.refresh_swap(&swap, tip).await {
                Ok(swap) => swap,
                Err(err) => {
                    tracing::warn!(
                        address = %swap.bitcoin_address,
                        error = %err,
                        "failed to refresh swap"
                    );
                    continue;
                }
            };
            if !swap.is_redeemable(tip, &self.policy) {
                continue;
            }
            if let Err(err) = self.try_redeem(&swap, node_state, lsp).await {
                tracing::warn!(
                    address = %swap.bitcoin_address,
                    error = %err,
                    "failed to redeem swap"
                );
            }
        }
        Ok(())
    }

    /// Redeems one swap now instead of waiting for the next monitor pass.
    pub async fn redeem_swap(
        &self,
        bitcoin_address: &str,
        tip: u32,
        node_state: &NodeState,
        lsp: Option<&LspInformation>,
    ) -> SdkResult<SwapInfo> {
        let swap = self.get_swap(bitcoin_address)?;
        let swap = self.refresh_swap(&swap, tip).await?;
        if !swap.is_redeemable(tip, &self.policy) {
            return Err(SdkError::swap(format!(
                "swap {bitcoin_address} is {:?} with {} confirmed sat, nothing to redeem",
                swap.status, swap.confirmed_sats
            )));
        }
        self.try_redeem(&swap, node_state, lsp).await?;
        self.get_swap(bitcoin_address)
    }

    /// Requests the redeem, keeping the error on the swap when it fails.
    async fn try_redeem(
        &self,
        swap: &SwapInfo,
        node_state: &NodeState,
        lsp: Option<&LspInformation>,
    ) -> SdkResult<()> {
        let result = self.request_redeem(swap, node_state, lsp).await;
        if let Err(err) = &result {
            let latest = self.get_swap(&swap.bitcoin_address)?;
            let mut failed = latest.clone();
            failed.last_redeem_error = Some(err.to_string());
            self.save_if_changed(&latest, &failed)?;
        }
        result
    }

    /// Creates (or reuses) the swap invoice and hands it to the swapper.
    async fn request_redeem(
        &self,
        swap: &SwapInfo,
        node_state: &NodeState,
        lsp: Option<&LspInformation>,
    ) -> SdkResult<()> {
        let bolt11 = match &swap.bolt11 {
            Some(bolt11) => bolt11.clone(),
            None => {
                let amount_msat = swap.confirmed_sats * 1000;
                let opening_fee_params = swap
                    .channel_opening_fees
                    .clone()
                    .filter(|p| p.valid_for(now_secs(), 0));
                let received = self
                    .payments
                    .receive_payment(
                        ReceivePaymentRequest {
                            amount_msat,
                            description: format!("Bitcoin transfer to {}", swap.bitcoin_address),
                            preimage: Some(swap.preimage.clone()),
                            opening_fee_params,
                            ..ReceivePaymentRequest::default()
                        },
                        node_state,
                        lsp,
                    )
                    .await?;
                self.payments.track_incoming(
                    &received.ln_invoice,
                    amount_msat,
                    received.opening_fee_msat.unwrap_or(0),
                    LnPaymentDetails {
                        swap_address: Some(swap.bitcoin_address.clone()),
                        ..LnPaymentDetails::default()
                    },
                )?;
                let bolt11 = received.ln_invoice.bolt11;
                let mut with_invoice = swap.clone();
                with_invoice.bolt11 = Some(bolt11.clone());
                self.save_if_changed(swap, &with_invoice)?;
                bolt11
            }
        };

        self.swapper
            .complete_swap(bolt11.clone())
            .await
            .map_err(SdkError::BackendUnavailable)?;
        tracing::info!(
            address = %swap.bitcoin_address,
            sats = swap.confirmed_sats,
            "swap redeem requested"
        );

        let mut latest = self.get_swap(&swap.bitcoin_address)?;
        if latest.last_redeem_error.is_some() {
            let before = latest.clone();
            latest.last_redeem_error = None;
            self.save_if_changed(&before, &latest)?;
        }
        Ok(())
    }

    /// Marks the swap behind a paid invoice as redeemed.
    pub fn on_invoice_paid(&self, payment: &Payment, tip: u32) -> SdkResult<()> {
        let Ok(payment_hash) = hex::decode(&payment.id) else {
            return Ok(());
        };
        let swap = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .get_swap_by_hash(&payment_hash)
            .map_err(SdkError::Persistence)?;
        let Some(swap) = swap else {
            return Ok(());
        };
        if swap.paid_msat > 0 {
            return Ok(());
        }
        let mut paid = swap.clone();
        paid.paid_msat = payment.amount_msat;
        paid.status = paid.compute_status(tip, &self.policy);
        self.save_if_changed(&swap, &paid)
    }

    /// Re-reads the chain state of every swap, including finished ones.
    pub async fn rescan_swaps(&self, tip: u32) -> SdkResult<()> {
        for swap in self.list_swaps(&[])? {
            self.refresh_swap(&swap, tip).await?;
        }
        Ok(())
    }

    async fn refund_inputs(
        &self,
        swap: &SwapInfo,
        include_unconfirmed: bool,
    ) -> SdkResult<Vec<SpendInput>> {
        let (utxos, _) = self.fetch_utxos(&swap.bitcoin_address).await?;
        let mut outputs = utxos.confirmed;
        if include_unconfirmed {
            outputs.extend(utxos.unconfirmed);
        }
        if outputs.is_empty() {
            return Err(SdkError::swap(format!(
                "no funds to refund at {}",
                swap.bitcoin_address
            )));
        }
        Ok(outputs
            .into_iter()
            .map(|u| SpendInput {
                out: u.out,
                value: u.value,
            })
            .collect())
    }

    pub async fn prepare_refund(
        &self,
        req: PrepareRefundRequest,
    ) -> SdkResult<PrepareRefundResponse> {
        let swap = self.get_swap(&req.swap_address)?;
        let destination = parse_address(&req.to_address, self.network)?;
        let inputs = self.refund_inputs(&swap, false).await?;
        let witness_script = ScriptBuf::from_bytes(swap.script.clone());
        let refund_tx_vsize = estimate_sweep_vsize(&inputs, &destination, &witness_script, false)
            .map_err(|e| SdkError::InvalidAmount(format!("{e:#}")))?;
        Ok(PrepareRefundResponse {
            refund_tx_vsize,
            refund_tx_fee_sat: refund_tx_vsize * u64::from(req.sat_per_vbyte),
        })
    }

    /// Sends the deposit of a refundable swap to `to_address`.
    pub async fn refund(&self, req: RefundRequest, tip: u32) -> SdkResult<RefundResponse> {
        let swap = self.get_swap(&req.swap_address)?;
        if swap.status != SwapStatus::Refundable {
            return Err(SdkError::swap(format!(
                "swap {} is {:?}, not refundable",
                swap.bitcoin_address, swap.status
            )));
        }
        let destination = parse_address(&req.to_address, self.network)?;
        let script =
            SubmarineSwapScript::parse_witness_script(&ScriptBuf::from_bytes(swap.script.clone()))
                .map_err(|e| SdkError::swap(format!("stored swap script: {e:#}")))?;

        let tx = if req.cooperative {
            self.cooperative_refund(&swap, &script, &destination, req.sat_per_vbyte)
                .await?
        } else {
            let unlock_height = swap
                .last_deposit_height
                .map(|h| h.saturating_add(swap.lock_height))
                .ok_or_else(|| SdkError::swap("swap has no confirmed deposit"))?;
            if tip < unlock_height {
                return Err(SdkError::swap(format!(
                    "refund timelock expires at height {unlock_height}, tip is {tip}"
                )));
            }
            let inputs = self.refund_inputs(&swap, false).await?;
            let secret_key = SecretKey::from_slice(&swap.private_key)
                .map_err(|e| SdkError::swap(format!("stored swap key: {e}")))?;
            refund_tx(&script, &inputs, &destination, &secret_key, req.sat_per_vbyte)
                .map_err(|e| SdkError::InvalidAmount(format!("{e:#}")))?
        };

        let refund_tx_id = self
            .chain
            .broadcast_transaction(&tx)
            .await
            .map_err(SdkError::BackendUnavailable)?;
        tracing::info!(
            address = %swap.bitcoin_address,
            txid = %refund_tx_id,
            cooperative = req.cooperative,
            "broadcast swap refund"
        );

        let mut refunded = swap.clone();
        refunded.refund_tx_ids.push(refund_tx_id.clone());
        self.save_if_changed(&swap, &refunded)?;
        Ok(RefundResponse { refund_tx_id })
    }

    async fn cooperative_refund(
        &self,
        swap: &SwapInfo,
        script: &SubmarineSwapScript,
        destination: &Address,
        sat_per_vbyte: u32,
    ) -> SdkResult<bitcoin::Transaction> {
        let inputs = self.refund_inputs(swap, true).await?;
        let unsigned = cooperative_refund_unsigned(script, &inputs, destination, sat_per_vbyte)
            .map_err(|e| SdkError::InvalidAmount(format!("{e:#}")))?;
        let signatures = self
            .swapper
            .sign_cooperative_refund(&swap.bitcoin_address, &unsigned)
            .await
            .map_err(SdkError::BackendUnavailable)?;
        let preimage: [u8; 32] = swap
            .preimage
            .as_slice()
            .try_into()
            .map_err(|_| SdkError::swap("stored swap preimage is not 32 bytes"))?;
        finalize_cooperative_refund(script, unsigned, signatures, &preimage)
            .map_err(|e| SdkError::swap(format!("{e:#}")))
    }
}

/// Transactions with at least one output paying `address`.
fn incoming_tx_count(address: &str, txs: &[OnchainTx]) -> u64 {
    txs.iter()
        .filter(|tx| {
            tx.vout
                .iter()
                .any(|v| v.scriptpubkey_address.as_deref() == Some(address))
        })
        .count() as u64
}
