use std::str::FromStr as _;
use std::time::{Duration, Instant};

use anyhow::{Context as _, anyhow};
use async_trait::async_trait;
use ldk_server_client::client::LdkServerClient;
use ldk_server_protos::api::{
    Bolt11ReceiveRequest, Bolt11SendRequest, GetBalancesRequest, GetNodeInfoRequest,
    ListChannelsRequest, ListPaymentsRequest,
};
use ldk_server_protos::types::{
    Bolt11InvoiceDescription, PaymentDirection, RouteParametersConfig,
    bolt11_invoice_description, payment_kind,
};
use lightning_invoice::Bolt11Invoice;

use super::node_api::{
    ConnectRequest, ConnectResponse, CreateInvoiceRequest, NodeApi, NodeError, NodeResult,
    PaymentOutcome, SpontaneousPayment, SyncResponse,
};
use crate::models::{
    Channel, ChannelState, LnPaymentDetails, NodeState, Payment, PaymentDetails, PaymentStatus,
    PaymentType,
};

const DEFAULT_INVOICE_EXPIRY_SECS: u32 = 3600;
const PAYMENT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_MAX_TOTAL_CLTV_EXPIRY_DELTA: u32 = 1008;
const DEFAULT_MAX_PATH_COUNT: u32 = 10;
const DEFAULT_MAX_CHANNEL_SATURATION_POWER_OF_HALF: u32 = 2;

/// [`NodeApi`] backed by an ldk-server REST endpoint.
#[derive(Clone)]
pub struct LdkNodeApi {
    client: LdkServerClient,
    payment_timeout: Duration,
}

impl LdkNodeApi {
    pub fn new(rest_service_address: String, payment_timeout: Duration) -> Self {
        Self {
            client: LdkServerClient::new(rest_service_address),
            payment_timeout,
        }
    }

    async fn list_payments(&self) -> NodeResult<Vec<ldk_server_protos::types::Payment>> {
        let resp = self
            .client
            .list_payments(ListPaymentsRequest { page_token: None })
            .await
            .context("ListPayments")
            .map_err(NodeError::ServiceConnectivity)?;
        Ok(resp.payments)
    }

    async fn wait_outcome(&self, payment_id: &str) -> NodeResult<PaymentOutcome> {
        let deadline = Instant::now() + self.payment_timeout;
        loop {
            let found = self
                .list_payments()
                .await?
                .into_iter()
                .find(|p| p.id == payment_id);

            if let Some(outcome) = found.as_ref().and_then(|p| settled_outcome(p)) {
                return outcome;
            }

            if Instant::now() >= deadline {
                return Err(NodeError::PaymentTimeout(format!(
                    "timeout waiting for payment outcome: payment_id={payment_id}"
                )));
            }

            tokio::time::sleep(PAYMENT_POLL_INTERVAL).await;
        }
    }

    /// Decides what a rejected `Bolt11Send` means. The node may still have
    /// registered the attempt, in which case its outcome is awaited.
    async fn recover_send_error(
        &self,
        bolt11: &str,
        err: impl std::fmt::Display,
    ) -> NodeResult<PaymentOutcome> {
        let hash = Bolt11Invoice::from_str(bolt11)
            .map_err(|e| NodeError::InvalidInvoice(format!("{e}")))?
            .payment_hash()
            .to_string();
        let payments = self.list_payments().await.map_err(|list_err| {
            NodeError::ServiceConnectivity(anyhow!("Bolt11Send: {err}; {list_err}"))
        })?;
        match attempt_for_hash(&payments, &hash) {
            Some(payment_id) => {
                tracing::warn!(
                    %payment_id,
                    error = %err,
                    "Bolt11Send errored after registering the payment"
                );
                self.wait_outcome(&payment_id).await
            }
            None => Err(NodeError::PaymentFailed(format!("Bolt11Send: {err}"))),
        }
    }
}

#[async_trait]
impl NodeApi for LdkNodeApi {
    async fn connect(&self, req: ConnectRequest) -> NodeResult<ConnectResponse> {
        if req.credentials.is_some() {
            tracing::warn!("ldk-server does not authenticate clients; ignoring credentials");
        }
        let info = self
            .client
            .get_node_info(GetNodeInfoRequest {})
            .await
            .context("GetNodeInfo")
            .map_err(NodeError::ServiceConnectivity)?;
        tracing::info!(
            node_id = %info.node_id,
            identity = %req.identity_pubkey,
            "connected to ldk-server"
        );
        Ok(ConnectResponse {
            node_id: info.node_id,
        })
    }

    async fn pull_changed(&self, since_timestamp: i64) -> NodeResult<SyncResponse> {
        let info = self
            .client
            .get_node_info(GetNodeInfoRequest {})
            .await
            .context("GetNodeInfo")
            .map_err(NodeError::ServiceConnectivity)?;
        let balances = self
            .client
            .get_balances(GetBalancesRequest {})
            .await
            .context("GetBalances")
            .map_err(NodeError::ServiceConnectivity)?;
        let ldk_channels = self
            .client
            .list_channels(ListChannelsRequest {})
            .await
            .context("ListChannels")
            .map_err(NodeError::ServiceConnectivity)?
            .channels;

        let usable = ldk_channels.iter().filter(|c| c.is_usable);
        let max_payable_msat: u64 = usable.clone().map(|c| c.outbound_capacity_msat).sum();
        let max_receivable_msat: u64 = usable.clone().map(|c| c.inbound_capacity_msat).sum();
        let max_single_payment_amount_msat = usable
            .clone()
            .map(|c| c.outbound_capacity_msat)
            .max()
            .unwrap_or_default();
        let inbound_liquidity_msats = usable
            .clone()
            .map(|c| c.inbound_capacity_msat)
            .max()
            .unwrap_or_default();
        let mut connected_peers: Vec<String> =
            usable.map(|c| c.counterparty_node_id.clone()).collect();
        connected_peers.sort();
        connected_peers.dedup();

        let node_state = NodeState {
            id: info.node_id,
            block_height: info.current_best_block.map(|b| b.height).unwrap_or_default(),
            channels_balance_msat: balances.total_lightning_balance_sats * 1000,
            onchain_balance_msat: balances.spendable_onchain_balance_sats * 1000,
            pending_onchain_balance_msat: balances
                .total_onchain_balance_sats
                .saturating_sub(balances.spendable_onchain_balance_sats)
                * 1000,
            utxos: Vec::new(),
            max_payable_msat,
            max_receivable_msat,
            max_single_payment_amount_msat,
            max_chan_reserve_msats: 0,
            connected_peers,
            inbound_liquidity_msats,
        };

        let channels = ldk_channels
            .iter()
            .map(|c| Channel {
                funding_txid: c.channel_id.clone(),
                short_channel_id: None,
                state: if c.is_channel_ready {
                    ChannelState::Opened
                } else {
                    ChannelState::PendingOpen
                },
                spendable_msat: c.outbound_capacity_msat,
                receivable_msat: c.inbound_capacity_msat,
                closed_at: None,
                closing_txid: None,
                alias_remote: None,
            })
            .collect();

        let payments = self
            .list_payments()
            .await?
            .into_iter()
            .filter(|p| p.latest_update_timestamp as i64 >= since_timestamp)
            .filter_map(|p| map_payment(&p))
            .collect();

        Ok(SyncResponse {
            node_state,
            payments,
            channels,
        })
    }

    async fn create_invoice(&self, req: CreateInvoiceRequest) -> NodeResult<String> {
        if req.preimage.is_some() {
            return Err(NodeError::Unsupported(
                "ldk-server generates its own preimages".into(),
            ));
        }
        let kind = if req.use_description_hash.unwrap_or(false) {
            use bitcoin::hashes::{Hash as _, sha256};
            let hash = sha256::Hash::hash(req.description.as_bytes());
            bolt11_invoice_description::Kind::Hash(hex::encode(hash.to_byte_array()))
        } else {
            bolt11_invoice_description::Kind::Direct(req.description)
        };

        let resp = self
            .client
            .bolt11_receive(Bolt11ReceiveRequest {
                amount_msat: Some(req.payer_amount_msat.unwrap_or(req.amount_msat)),
                description: Some(Bolt11InvoiceDescription { kind: Some(kind) }),
                expiry_secs: req.expiry.unwrap_or(DEFAULT_INVOICE_EXPIRY_SECS),
            })
            .await
            .context("Bolt11Receive")
            .map_err(NodeError::ServiceConnectivity)?;
        Ok(resp.invoice)
    }

    async fn send_payment(
        &self,
        bolt11: String,
        amount_msat: Option<u64>,
        max_fee_msat: u64,
    ) -> NodeResult<PaymentOutcome> {
        let sent = self
            .client
            .bolt11_send(Bolt11SendRequest {
                invoice: bolt11.clone(),
                amount_msat,
                route_parameters: Some(route_parameters(max_fee_msat)),
            })
            .await;

        match sent {
            Ok(resp) => self.wait_outcome(&resp.payment_id).await,
            Err(e) => self.recover_send_error(&bolt11, e).await,
        }
    }

    async fn send_spontaneous_payment(
        &self,
        req: SpontaneousPayment,
    ) -> NodeResult<PaymentOutcome> {
        Err(NodeError::Unsupported(format!(
            "spontaneous payment to {} is not exposed by ldk-server",
            req.node_id
        )))
    }

    async fn redeem_onchain_funds(
        &self,
        to_address: String,
        _sat_per_vbyte: u32,
    ) -> NodeResult<String> {
        Err(NodeError::Unsupported(format!(
            "on-chain sweep to {to_address} is managed by ldk-server itself"
        )))
    }

    async fn static_backup(&self) -> NodeResult<Vec<String>> {
        // ldk-server persists channel monitors itself; nothing to export.
        Ok(Vec::new())
    }
}

fn route_parameters(max_fee_msat: u64) -> RouteParametersConfig {
    RouteParametersConfig {
        max_total_routing_fee_msat: Some(max_fee_msat),
        max_total_cltv_expiry_delta: DEFAULT_MAX_TOTAL_CLTV_EXPIRY_DELTA,
        max_path_count: DEFAULT_MAX_PATH_COUNT,
        max_channel_saturation_power_of_half: DEFAULT_MAX_CHANNEL_SATURATION_POWER_OF_HALF,
    }
}

/// Final outcome of an outbound payment, or `None` while it is still in
/// flight. A success without a preimage is not final yet.
fn settled_outcome(p: &ldk_server_protos::types::Payment) -> Option<NodeResult<PaymentOutcome>> {
    if p.direction != PaymentDirection::Outbound as i32 {
        return None;
    }
    match map_status(p.status) {
        PaymentStatus::Complete => {
            let (hash, preimage) = bolt11_hash_and_preimage(p);
            let Some(preimage) = preimage else {
                tracing::debug!(payment_id = %p.id, "payment succeeded without preimage yet");
                return None;
            };
            Some(Ok(PaymentOutcome {
                payment_hash: hash.unwrap_or_else(|| p.id.clone()),
                payment_preimage: preimage,
                amount_msat: p.amount_msat.unwrap_or_default(),
                fee_msat: 0,
            }))
        }
        PaymentStatus::Failed => Some(Err(NodeError::PaymentFailed(format!(
            "payment {} failed",
            p.id
        )))),
        PaymentStatus::Pending => None,
    }
}

fn attempt_for_hash(payments: &[ldk_server_protos::types::Payment], hash: &str) -> Option<String> {
    payments
        .iter()
        .filter(|p| p.direction == PaymentDirection::Outbound as i32)
        .find(|p| bolt11_hash_and_preimage(p).0.as_deref() == Some(hash))
        .map(|p| p.id.clone())
}

fn map_status(status: i32) -> PaymentStatus {
    use ldk_server_protos::types::PaymentStatus as LdkStatus;
    if status == LdkStatus::Succeeded as i32 {
        PaymentStatus::Complete
    } else if status == LdkStatus::Failed as i32 {
        PaymentStatus::Failed
    } else {
        PaymentStatus::Pending
    }
}

fn bolt11_hash_and_preimage(
    p: &ldk_server_protos::types::Payment,
) -> (Option<String>, Option<String>) {
    match p.kind.as_ref().and_then(|k| k.kind.as_ref()) {
        Some(payment_kind::Kind::Bolt11(b)) => (Some(b.hash.clone()), b.preimage.clone()),
        Some(payment_kind::Kind::Spontaneous(s)) => (Some(s.hash.clone()), s.preimage.clone()),
        _ => (None, None),
    }
}

fn map_payment(p: &ldk_server_protos::types::Payment) -> Option<Payment> {
    let (hash, preimage) = bolt11_hash_and_preimage(p);
    let hash = hash?;
    let keysend = matches!(
        p.kind.as_ref().and_then(|k| k.kind.as_ref()),
        Some(payment_kind::Kind::Spontaneous(_))
    );
    let payment_type = if p.direction == PaymentDirection::Outbound as i32 {
        PaymentType::Sent
    } else {
        PaymentType::Received
    };

    Some(Payment {
        id: hash.clone(),
        payment_type,
        payment_time: p.latest_update_timestamp as i64,
        amount_msat: p.amount_msat.unwrap_or_default(),
        fee_msat: 0,
        status: map_status(p.status),
        error: None,
        description: None,
        details: PaymentDetails::Ln {
            data: LnPaymentDetails {
                payment_hash: hash,
                payment_preimage: preimage.unwrap_or_default(),
                keysend,
                ..Default::default()
            },
        },
        metadata: None,
    })
}
