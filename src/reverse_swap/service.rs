use std::sync::{Arc, Mutex};
use std::time::Duration;

use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::ScriptBuf;

use crate::chain::{ChainService, get_utxos};
use crate::config::NodeConfig;
use crate::error::{SdkError, SdkResult};
use crate::events::{BreezEvent, EventBus};
use crate::fees::{
    ESTIMATED_CLAIM_TX_VSIZE, ReverseSwapFeesRequest, check_vsize_calibration, claim_output_sat,
    max_reverse_swap_amount, onchain_payment_limits, parse_address, prepare_onchain_payment,
    reverse_swap_fees,
};
use crate::lightning::invoice::parse_invoice;
use crate::payments::PaymentEngine;
use crate::persist::SqliteStore;
use crate::models::NodeState;
use crate::reverse_swap::{
    FullReverseSwapInfo, MaxReverseSwapAmountResponse, OnchainPaymentLimitsResponse,
    PayOnchainRequest, PayOnchainResponse, PrepareOnchainPaymentRequest,
    PrepareOnchainPaymentResponse, ReverseSwapInfo, ReverseSwapPairInfo, ReverseSwapServiceApi,
    ReverseSwapStatus, ServiceSwapStatus,
};
use crate::swap::script::{ReverseSwapScript, SpendInput, claim_tx};

const LOCKUP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Sends Lightning funds to an on-chain address through reverse submarine swaps.
#[derive(Clone)]
pub struct BtcSendSwap {
    config: Arc<NodeConfig>,
    service: Arc<dyn ReverseSwapServiceApi>,
    chain: Arc<dyn ChainService>,
    payments: PaymentEngine,
    store: Arc<Mutex<SqliteStore>>,
    events: EventBus,
}

impl BtcSendSwap {
    pub fn new(
        config: Arc<NodeConfig>,
        service: Arc<dyn ReverseSwapServiceApi>,
        chain: Arc<dyn ChainService>,
        payments: PaymentEngine,
        store: Arc<Mutex<SqliteStore>>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            service,
            chain,
            payments,
            store,
            events,
        }
    }

    async fn pair_info(&self) -> SdkResult<ReverseSwapPairInfo> {
        self.service
            .fetch_pair_info()
            .await
            .map_err(SdkError::BackendUnavailable)
    }

    pub async fn fetch_reverse_swap_fees(
        &self,
        req: ReverseSwapFeesRequest,
    ) -> SdkResult<ReverseSwapPairInfo> {
        Ok(reverse_swap_fees(self.pair_info().await?, req))
    }

    pub async fn prepare_onchain_payment(
        &self,
        req: PrepareOnchainPaymentRequest,
    ) -> SdkResult<PrepareOnchainPaymentResponse> {
        prepare_onchain_payment(&self.pair_info().await?, req)
    }

    pub async fn onchain_payment_limits(
        &self,
        node_state: &NodeState,
    ) -> SdkResult<OnchainPaymentLimitsResponse> {
        let pair = self.pair_info().await?;
        Ok(onchain_payment_limits(&pair, &self.config, node_state))
    }

    pub fn max_reverse_swap_amount(&self, node_state: &NodeState) -> MaxReverseSwapAmountResponse {
        max_reverse_swap_amount(&self.config, node_state)
    }

    /// Creates the reverse swap, pays its hold invoice and returns once the
    /// service has broadcast the lockup transaction.
    pub async fn pay_onchain(
        &self,
        req: PayOnchainRequest,
        tip: u32,
    ) -> SdkResult<PayOnchainResponse> {
        if let Some(active) = self.in_progress_reverse_swaps()?.first() {
            return Err(SdkError::swap(format!(
                "reverse swap {} is still in progress",
                active.id
            )));
        }
        parse_address(&req.recipient_address, self.config.network)?;

        let prepared = req.prepare_res;
        let pair = self.pair_info().await?;
        if pair.fees_hash != prepared.fees_hash {
            return Err(SdkError::swap(
                "reverse swap fees changed since the payment was prepared",
            ));
        }
        if !(pair.min..=pair.max).contains(&prepared.sender_amount_sat) {
            return Err(SdkError::InvalidAmount(format!(
                "send amount {} sat outside of [{}, {}]",
                prepared.sender_amount_sat, pair.min, pair.max
            )));
        }

        let secp = Secp256k1::new();
        let preimage: [u8; 32] = rand::random();
        let payment_hash = sha256::Hash::hash(&preimage).to_byte_array();
        let private_key = SecretKey::from_slice(&rand::random::<[u8; 32]>())
            .map_err(|e| SdkError::generic(format!("generate claim key: {e}")))?;
        let claim_pubkey = PublicKey::from_secret_key(&secp, &private_key);

        let created = self
            .service
            .create_reverse_swap(
                prepared.sender_amount_sat,
                &hex::encode(payment_hash),
                &claim_pubkey.to_string(),
                &prepared.fees_hash,
            )
            .await
            .map_err(SdkError::BackendUnavailable)?;

        let rsi = FullReverseSwapInfo {
            id: created.id.clone(),
            created_at_block_height: tip,
            preimage: preimage.to_vec(),
            private_key: private_key.secret_bytes().to_vec(),
            destination_address: req.recipient_address,
            timeout_block_height: created.timeout_block_height,
            invoice: created.invoice.clone(),
            redeem_script: created.redeem_script.clone(),
            onchain_amount_sat: created.onchain_amount,
            receive_amount_sat: prepared.recipient_amount_sat,
            sat_per_vbyte: prepared.fees_claim.div_ceil(ESTIMATED_CLAIM_TX_VSIZE) as u32,
            lockup_address: created.lockup_address.clone(),
            status: ReverseSwapStatus::Initial,
            lockup_txid: None,
            claim_txid: None,
        };
        self.validate_created(&rsi, &payment_hash, &claim_pubkey, &prepared)?;

        self.store
            .lock()
            .expect("store mutex poisoned")
            .insert_reverse_swap(&rsi)
            .map_err(SdkError::Persistence)?;
        tracing::info!(
            id = %rsi.id,
            send_sat = prepared.sender_amount_sat,
            onchain_sat = rsi.onchain_amount_sat,
            lockup_address = %rsi.lockup_address,
            "created reverse swap"
        );
        self.emit(&rsi)?;

        let rsi = self.pay_and_wait_for_lockup(rsi).await?;
        Ok(PayOnchainResponse {
            reverse_swap_info: rsi.info().map_err(SdkError::Generic)?,
        })
    }

    /// Checks the service's answer against what we asked for.
    fn validate_created(
        &self,
        rsi: &FullReverseSwapInfo,
        payment_hash: &[u8; 32],
        claim_pubkey: &PublicKey,
        prepared: &PrepareOnchainPaymentResponse,
    ) -> SdkResult<()> {
        let invoice = parse_invoice(&rsi.invoice, self.config.network)?;
        if invoice.payment_hash != hex::encode(payment_hash) {
            return Err(SdkError::swap("reverse swap invoice has an unexpected payment hash"));
        }
        if invoice.amount_msat != Some(prepared.sender_amount_sat * 1000) {
            return Err(SdkError::AmountMismatch(format!(
                "reverse swap invoice amount {:?} msat, expected {} sat",
                invoice.amount_msat, prepared.sender_amount_sat
            )));
        }

        let script_bytes = hex::decode(&rsi.redeem_script)
            .map_err(|e| SdkError::swap(format!("reverse swap redeem script: {e}")))?;
        let script = ReverseSwapScript::parse_witness_script(&ScriptBuf::from_bytes(script_bytes))
            .map_err(|e| SdkError::swap(format!("reverse swap redeem script: {e:#}")))?;
        if script.hash160 != ReverseSwapScript::hash160_of(payment_hash) {
            return Err(SdkError::swap("redeem script does not commit to our payment hash"));
        }
        if script.claim_pubkey != *claim_pubkey {
            return Err(SdkError::swap("redeem script does not pay to our claim key"));
        }
        if script.timeout_height != rsi.timeout_block_height {
            return Err(SdkError::swap(format!(
                "redeem script timeout {} differs from announced {}",
                script.timeout_height, rsi.timeout_block_height
            )));
        }
        let address = script
            .p2wsh_address(self.config.network.into())
            .map_err(|e| SdkError::swap(format!("{e:#}")))?;
        if address.to_string() != rsi.lockup_address {
            return Err(SdkError::swap(format!(
                "lockup address {} does not match the redeem script",
                rsi.lockup_address
            )));
        }
        if rsi.onchain_amount_sat < prepared.recipient_amount_sat + prepared.fees_claim {
            return Err(SdkError::AmountMismatch(format!(
                "service locks {} sat, below the {} sat needed",
                rsi.onchain_amount_sat,
                prepared.recipient_amount_sat + prepared.fees_claim
            )));
        }
        Ok(())
    }

    async fn pay_and_wait_for_lockup(
        &self,
        mut rsi: FullReverseSwapInfo,
    ) -> SdkResult<FullReverseSwapInfo> {
        let payments = self.payments.clone();
        let (bolt11, id, timeout_height) =
            (rsi.invoice.clone(), rsi.id.clone(), rsi.timeout_block_height);
        let mut payment = tokio::spawn(async move {
            payments
                .send_reverse_swap_payment(&bolt11, &id, timeout_height)
                .await
        });
        let mut payment_done = false;

        let deadline = tokio::time::sleep(self.config.payment_timeout());
        tokio::pin!(deadline);
        let mut poll = tokio::time::interval(LOCKUP_POLL_INTERVAL);

        loop {
            tokio::select! {
                res = &mut payment, if !payment_done => {
                    payment_done = true;
                    let res = res.map_err(|e| SdkError::generic(format!("payment task: {e}")))?;
                    match res {
                        Ok(_) => {}
                        Err(err) if err.is_transient() => {
                            tracing::debug!(
                                id = %rsi.id,
                                error = %err,
                                "hold invoice payment still pending"
                            );
                        }
                        Err(err) => {
                            tracing::warn!(
                                id = %rsi.id,
                                error = %err,
                                "reverse swap payment failed"
                            );
                            self.set_status(&mut rsi, ReverseSwapStatus::Cancelled)?;
                            return Err(err);
                        }
                    }
                }
                _ = poll.tick() => {
                    let status = match self.service.swap_status(&rsi.id).await {
                        Ok(status) => status,
                        Err(err) => {
                            tracing::debug!(
                                id = %rsi.id,
                                error = %format!("{err:#}"),
                                "reverse swap status unavailable"
                            );
                            continue;
                        }
                    };
                    match status {
                        ServiceSwapStatus::LockupMempool { txid }
                        | ServiceSwapStatus::LockupConfirmed { txid } => {
                            rsi.lockup_txid = txid.or(rsi.lockup_txid.take());
                            self.set_status(&mut rsi, ReverseSwapStatus::InProgress)?;
                            return Ok(rsi);
                        }
                        ServiceSwapStatus::Failed { reason } => {
                            self.set_status(&mut rsi, ReverseSwapStatus::Cancelled)?;
                            return Err(SdkError::swap(format!(
                                "reverse swap {} failed: {reason}",
                                rsi.id
                            )));
                        }
                        _ => {}
                    }
                }
                _ = &mut deadline => {
                    return Err(SdkError::Timeout(format!(
                        "no lockup for reverse swap {} yet, it keeps being monitored",
                        rsi.id
                    )));
                }
            }
        }
    }

    fn emit(&self, rsi: &FullReverseSwapInfo) -> SdkResult<()> {
        self.events.emit(BreezEvent::ReverseSwapUpdated {
            details: rsi.info().map_err(SdkError::Generic)?,
        });
        Ok(())
    }

    /// Persists `rsi` and emits an update.
    fn save(&self, rsi: &FullReverseSwapInfo) -> SdkResult<()> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .update_reverse_swap(rsi)
            .map_err(SdkError::Persistence)?;
        self.emit(rsi)
    }

    fn set_status(
        &self,
        rsi: &mut FullReverseSwapInfo,
        status: ReverseSwapStatus,
    ) -> SdkResult<()> {
        if rsi.status == status {
            return Ok(());
        }
        tracing::info!(
            id = %rsi.id,
            from = ?rsi.status,
            to = ?status,
            "reverse swap status changed"
        );
        rsi.status = status;
        self.save(rsi)
    }

    fn list_full(&self) -> SdkResult<Vec<FullReverseSwapInfo>> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .list_reverse_swaps()
            .map_err(SdkError::Persistence)
    }

    pub fn list_reverse_swaps(&self) -> SdkResult<Vec<ReverseSwapInfo>> {
        self.list_full()?
            .iter()
            .map(|rsi| rsi.info().map_err(SdkError::Generic))
            .collect()
    }

    /// Reverse swaps whose Lightning payment is still locked.
    pub fn in_progress_reverse_swaps(&self) -> SdkResult<Vec<ReverseSwapInfo>> {
        self.list_full()?
            .iter()
            .filter(|rsi| rsi.status.is_blocking())
            .map(|rsi| rsi.info().map_err(SdkError::Generic))
            .collect()
    }

    /// Advances every monitored reverse swap; failures are logged per swap.
    pub async fn process_monitored_reverse_swaps(&self, tip: u32) -> SdkResult<()> {
        for rsi in self.list_full()? {
            if !rsi.status.is_monitored() {
                continue;
            }
            let id = rsi.id.clone();
            if let Err(err) = self.process_reverse_swap(rsi, tip).await {
                tracing::warn!(id = %id, error = %err, "failed to process reverse swap");
            }
        }
        Ok(())
    }

    async fn process_reverse_swap(&self, mut rsi: FullReverseSwapInfo, tip: u32) -> SdkResult<()> {
        if rsi.status == ReverseSwapStatus::CompletedSeen {
            return self.check_claim_confirmed(rsi).await;
        }

        match self.service.swap_status(&rsi.id).await {
            Ok(
                ServiceSwapStatus::LockupMempool { txid }
                | ServiceSwapStatus::LockupConfirmed { txid },
            ) => {
                rsi.lockup_txid = txid.or(rsi.lockup_txid.take());
                self.set_status(&mut rsi, ReverseSwapStatus::InProgress)?;
            }
            Ok(ServiceSwapStatus::Failed { reason }) if rsi.claim_txid.is_none() => {
                tracing::warn!(id = %rsi.id, %reason, "reverse swap failed at the service");
                return self.set_status(&mut rsi, ReverseSwapStatus::Cancelled);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(
                    id = %rsi.id,
                    error = %format!("{err:#}"),
                    "reverse swap status unavailable"
                );
            }
        }

        if rsi.status == ReverseSwapStatus::Initial && tip >= rsi.timeout_block_height {
            return self.set_status(&mut rsi, ReverseSwapStatus::Cancelled);
        }
        if rsi.status == ReverseSwapStatus::InProgress {
            self.claim(rsi).await?;
        }
        Ok(())
    }

    /// Broadcasts the claim transaction once the lockup output is confirmed.
    async fn claim(&self, mut rsi: FullReverseSwapInfo) -> SdkResult<FullReverseSwapInfo> {
        let txs = self
            .chain
            .address_transactions(&rsi.lockup_address)
            .await
            .map_err(SdkError::BackendUnavailable)?;
        let utxos = get_utxos(&rsi.lockup_address, &txs).map_err(SdkError::BackendUnavailable)?;
        let Some(lockup) = utxos.confirmed.iter().max_by_key(|u| u.value) else {
            tracing::debug!(id = %rsi.id, "lockup not confirmed yet");
            return Ok(rsi);
        };

        let witness_script = ScriptBuf::from_bytes(
            hex::decode(&rsi.redeem_script)
                .map_err(|e| SdkError::swap(format!("stored redeem script: {e}")))?,
        );
        let destination = parse_address(&rsi.destination_address, self.config.network)?;
        let secret_key = SecretKey::from_slice(&rsi.private_key)
            .map_err(|e| SdkError::swap(format!("stored claim key: {e}")))?;
        let preimage: [u8; 32] = rsi
            .preimage
            .as_slice()
            .try_into()
            .map_err(|_| SdkError::swap("stored preimage is not 32 bytes"))?;
        let output_sat = claim_output_sat(lockup.value, rsi.sat_per_vbyte)?;
        if output_sat < rsi.receive_amount_sat {
            tracing::warn!(
                id = %rsi.id,
                output_sat,
                expected_sat = rsi.receive_amount_sat,
                "lockup is smaller than announced"
            );
        }

        let tx = claim_tx(
            &witness_script,
            SpendInput {
                out: lockup.out,
                value: lockup.value,
            },
            &destination,
            output_sat,
            &secret_key,
            &preimage,
        )
        .map_err(|e| SdkError::swap(format!("{e:#}")))?;
        check_vsize_calibration("claim", tx.vsize() as u64, ESTIMATED_CLAIM_TX_VSIZE)?;

        let claim_txid = self
            .chain
            .broadcast_transaction(&tx)
            .await
            .map_err(SdkError::BackendUnavailable)?;
        tracing::info!(
            id = %rsi.id,
            txid = %claim_txid,
            sats = output_sat,
            "broadcast reverse swap claim"
        );

        rsi.lockup_txid = Some(lockup.out.txid.to_string());
        rsi.claim_txid = Some(claim_txid);
        rsi.status = ReverseSwapStatus::CompletedSeen;
        self.save(&rsi)?;
        Ok(rsi)
    }

    async fn check_claim_confirmed(&self, mut rsi: FullReverseSwapInfo) -> SdkResult<()> {
        let Some(claim_txid) = rsi.claim_txid.clone() else {
            return Ok(());
        };
        let txs = self
            .chain
            .address_transactions(&rsi.destination_address)
            .await
            .map_err(SdkError::BackendUnavailable)?;
        let confirmed = txs
            .iter()
            .any(|tx| tx.txid == claim_txid && tx.status.confirmed);
        if confirmed {
            self.set_status(&mut rsi, ReverseSwapStatus::CompletedConfirmed)?;
        }
        Ok(())
    }

    /// Claims the reverse swap locked at `lockup_address` right away.
    /// Already completed swaps are left untouched.
    pub async fn claim_reverse_swap(&self, lockup_address: &str) -> SdkResult<()> {
        let rsi = self
            .list_full()?
            .into_iter()
            .find(|rsi| rsi.lockup_address == lockup_address)
            .ok_or_else(|| SdkError::swap(format!("no reverse swap locked at {lockup_address}")))?;
        match rsi.status {
            status if status.is_completed() => Ok(()),
            ReverseSwapStatus::Cancelled => Err(SdkError::swap(format!(
                "reverse swap {} was cancelled",
                rsi.id
            ))),
            _ => {
                let claimed = self.claim(rsi).await?;
                if claimed.status.is_completed() {
                    Ok(())
                } else {
                    Err(SdkError::swap(format!(
                        "lockup of reverse swap {} is not confirmed",
                        claimed.id
                    )))
                }
            }
        }
    }
}
