use std::future::Future;
use std::str::FromStr as _;
use std::sync::{Arc, Mutex};

use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::PublicKey;

use crate::config::NodeConfig;
use crate::error::{SdkError, SdkResult};
use crate::events::{BreezEvent, EventBus, InvoicePaidDetails, PaymentFailedData};
use crate::fees::select_opening_fee_params;
use crate::keys::NodeIdentity;
use crate::lightning::invoice::{LnInvoice, decode_invoice, parse_invoice};
use crate::lightning::node_api::{
    CreateInvoiceRequest, NodeApi, NodeError, PaymentOutcome, SpontaneousPayment,
};
use crate::lnurl::auth::{LnUrlAuthRequestData, build_auth_callback_url};
use crate::lnurl::pay::{
    LnUrlPayErrorData, LnUrlPayRequest, LnUrlPayResult, LnUrlPaySuccessData, SuccessAction,
    ValidatedCallbackResponse, build_pay_callback_url, parse_callback_response,
    validate_user_input,
};
use crate::lnurl::withdraw::{
    LnUrlWithdrawRequest, LnUrlWithdrawResult, build_withdraw_callback_url, validate_amount,
};
use crate::lnurl::{self, LnUrlCallbackStatus};
use crate::lsp::{LspApi, LspInformation, PaymentInformation};
use crate::models::{
    ListPaymentsRequest, LnPaymentDetails, NodeState, Payment, PaymentDetails, PaymentStatus,
    PaymentType, ReceivePaymentRequest, ReceivePaymentResponse, SendPaymentRequest,
    SendSpontaneousPaymentRequest, now_secs,
};
use crate::persist::SqliteStore;

/// Custom TLV records below this number are reserved by BOLT.
const MIN_CUSTOM_TLV: u64 = 65_536;
/// Validity window requested from the LSP when the caller gives no invoice expiry.
const DEFAULT_INVOICE_EXPIRY_SECS: u32 = 3600;

/// A prepared outgoing BOLT11 payment.
struct Bolt11Attempt {
    invoice: LnInvoice,
    /// Amount passed to the backend; only set for zero-amount invoices.
    requested_amount_msat: Option<u64>,
    amount_msat: u64,
    label: Option<String>,
    details: LnPaymentDetails,
    success_action: Option<SuccessAction>,
}

/// Drives Lightning payments and owns the payment records.
#[derive(Clone)]
pub struct PaymentEngine {
    config: Arc<NodeConfig>,
    node_api: Arc<dyn NodeApi>,
    lsp_api: Arc<dyn LspApi>,
    store: Arc<Mutex<SqliteStore>>,
    events: EventBus,
    http: reqwest::Client,
}

impl PaymentEngine {
    pub fn new(
        config: Arc<NodeConfig>,
        node_api: Arc<dyn NodeApi>,
        lsp_api: Arc<dyn LspApi>,
        store: Arc<Mutex<SqliteStore>>,
        events: EventBus,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            node_api,
            lsp_api,
            store,
            events,
            http,
        }
    }

    pub async fn send_payment(&self, req: SendPaymentRequest) -> SdkResult<Payment> {
        let attempt = self.prepare_bolt11(&req.bolt11, req.amount_msat, req.label)?;
        self.pay_bolt11(attempt).await
    }

    fn prepare_bolt11(
        &self,
        bolt11: &str,
        amount_msat: Option<u64>,
        label: Option<String>,
    ) -> SdkResult<Bolt11Attempt> {
        let invoice = parse_invoice(bolt11, self.config.network)?;
        if invoice.is_expired_at(now_secs().max(0) as u64) {
            return Err(SdkError::InvoiceExpired(format!(
                "invoice {} expired at {}",
                invoice.payment_hash,
                invoice.timestamp + invoice.expiry
            )));
        }

        let amount = match (invoice.amount_msat, amount_msat) {
            (Some(_), Some(_)) => {
                return Err(SdkError::AmountMismatch(
                    "amount must not be given for an invoice that carries one".to_string(),
                ));
            }
            (None, None) => {
                return Err(SdkError::AmountMismatch(
                    "amount is required for a zero-amount invoice".to_string(),
                ));
            }
            (Some(amount), None) | (None, Some(amount)) => amount,
        };
        if amount == 0 {
            return Err(SdkError::InvalidAmount("amount must be > 0".to_string()));
        }

        let details = LnPaymentDetails {
            payment_hash: invoice.payment_hash.clone(),
            label: label.clone().unwrap_or_default(),
            destination_pubkey: invoice.payee_pubkey.clone(),
            bolt11: invoice.bolt11.clone(),
            ..LnPaymentDetails::default()
        };
        Ok(Bolt11Attempt {
            requested_amount_msat: invoice.amount_msat.is_none().then_some(amount),
            amount_msat: amount,
            invoice,
            label,
            details,
            success_action: None,
        })
    }

    /// Pays the hold invoice of a reverse swap, tagging the record with the swap.
    pub(crate) async fn send_reverse_swap_payment(
        &self,
        bolt11: &str,
        reverse_swap_id: &str,
        timeout_block_height: u32,
    ) -> SdkResult<Payment> {
        let mut attempt = self.prepare_bolt11(bolt11, None, None)?;
        attempt.details.reverse_swap_id = Some(reverse_swap_id.to_string());
        attempt.details.pending_expiration_block = Some(timeout_block_height);
        self.pay_bolt11(attempt).await
    }

    async fn pay_bolt11(&self, attempt: Bolt11Attempt) -> SdkResult<Payment> {
        let payment = Payment {
            id: attempt.invoice.payment_hash.clone(),
            payment_type: PaymentType::Sent,
            payment_time: now_secs(),
            amount_msat: attempt.amount_msat,
            fee_msat: 0,
            status: PaymentStatus::Pending,
            error: None,
            description: attempt.invoice.description.clone(),
            details: PaymentDetails::Ln {
                data: attempt.details.clone(),
            },
            metadata: None,
        };
        self.start_attempt(&payment)?;
        tracing::info!(
            payment_hash = %payment.id,
            amount_msat = attempt.amount_msat,
            "sending payment"
        );

        let engine = self.clone();
        self.drive(async move {
            let max_fee_msat = engine.config.max_fee_msat(attempt.amount_msat);
            let result = engine
                .node_api
                .send_payment(
                    attempt.invoice.bolt11.clone(),
                    attempt.requested_amount_msat,
                    max_fee_msat,
                )
                .await;
            let failure = PaymentFailedData {
                error: String::new(),
                node_id: attempt.invoice.payee_pubkey.clone(),
                invoice: Some(attempt.invoice.clone()),
                label: attempt.label.clone(),
            };
            engine
                .finish_attempt(payment, result, failure, attempt.success_action)
                .await
        })
        .await
    }

    pub async fn send_spontaneous_payment(
        &self,
        req: SendSpontaneousPaymentRequest,
    ) -> SdkResult<Payment> {
        PublicKey::from_str(&req.node_id)
            .map_err(|e| SdkError::parse(format!("invalid node id {}: {e}", req.node_id)))?;
        if req.amount_msat == 0 {
            return Err(SdkError::InvalidAmount("amount must be > 0".to_string()));
        }

        let mut extra_tlvs = req.extra_tlvs.unwrap_or_default();
        if let Some(tlv) = extra_tlvs.iter().find(|t| t.field_number < MIN_CUSTOM_TLV) {
            return Err(SdkError::parse(format!(
                "custom TLV field number {} is below {MIN_CUSTOM_TLV}",
                tlv.field_number
            )));
        }
        extra_tlvs.sort_by_key(|t| t.field_number);
        if extra_tlvs
            .windows(2)
            .any(|w| w[0].field_number == w[1].field_number)
        {
            return Err(SdkError::parse("duplicate custom TLV field number"));
        }

        let preimage: [u8; 32] = rand::random();
        let payment_hash = hex::encode(sha256::Hash::hash(&preimage).to_byte_array());
        let payment = Payment {
            id: payment_hash.clone(),
            payment_type: PaymentType::Sent,
            payment_time: now_secs(),
            amount_msat: req.amount_msat,
            fee_msat: 0,
            status: PaymentStatus::Pending,
            error: None,
            description: None,
            details: PaymentDetails::Ln {
                data: LnPaymentDetails {
                    payment_hash,
                    label: req.label.clone().unwrap_or_default(),
                    destination_pubkey: req.node_id.clone(),
                    keysend: true,
                    ..LnPaymentDetails::default()
                },
            },
            metadata: None,
        };
        self.start_attempt(&payment)?;
        tracing::info!(
            payment_hash = %payment.id,
            node_id = %req.node_id,
            "sending keysend payment"
        );

        let engine = self.clone();
        self.drive(async move {
            let result = engine
                .node_api
                .send_spontaneous_payment(SpontaneousPayment {
                    node_id: req.node_id.clone(),
                    amount_msat: req.amount_msat,
                    preimage,
                    extra_tlvs,
                })
                .await;
            let failure = PaymentFailedData {
                error: String::new(),
                node_id: req.node_id,
                invoice: None,
                label: req.label,
            };
            engine.finish_attempt(payment, result, failure, None).await
        })
        .await
    }

    /// Runs `attempt` in its own task and waits at most the payment timeout.
    /// The task keeps going after a timeout and still records its outcome.
    async fn drive<F>(&self, attempt: F) -> SdkResult<Payment>
    where
        F: Future<Output = SdkResult<Payment>> + Send + 'static,
    {
        let timeout = self.config.payment_timeout();
        let handle = tokio::spawn(attempt);
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(SdkError::generic(format!("payment task: {join_err}"))),
            Err(_) => Err(SdkError::Timeout(format!(
                "payment still pending after {}s",
                timeout.as_secs()
            ))),
        }
    }

    fn start_attempt(&self, payment: &Payment) -> SdkResult<()> {
        let started = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .start_payment_attempt(payment)
            .map_err(SdkError::Persistence)?;
        if !started {
            return Err(SdkError::PaymentFailed(format!(
                "payment {} already completed or in flight",
                payment.id
            )));
        }
        Ok(())
    }

    async fn finish_attempt(
        &self,
        pending: Payment,
        result: Result<PaymentOutcome, NodeError>,
        mut failure: PaymentFailedData,
        success_action: Option<SuccessAction>,
    ) -> SdkResult<Payment> {
        match result {
            Ok(outcome) => {
                let mut payment = pending;
                payment.status = PaymentStatus::Complete;
                payment.fee_msat = outcome.fee_msat;
                if outcome.amount_msat > 0 {
                    payment.amount_msat = outcome.amount_msat;
                }
                if let PaymentDetails::Ln { data } = &mut payment.details {
                    data.payment_preimage = outcome.payment_preimage.clone();
                    data.lnurl_success_action =
                        success_action.map(|action| action.process_hex(&outcome.payment_preimage));
                }
                if self.transition(&payment)? {
                    tracing::info!(
                        payment_hash = %payment.id,
                        fee_msat = payment.fee_msat,
                        "payment succeeded"
                    );
                    self.events.emit(BreezEvent::PaymentSucceed {
                        details: payment.clone(),
                    });
                }
                Ok(payment)
            }
            Err(err) if is_terminal_failure(&err) => {
                let err = SdkError::from(err);
                let mut payment = pending;
                payment.status = PaymentStatus::Failed;
                payment.error = Some(err.to_string());
                if self.transition(&payment)? {
                    tracing::warn!(payment_hash = %payment.id, error = %err, "payment failed");
                    failure.error = err.to_string();
                    self.events
                        .emit(BreezEvent::PaymentFailed { details: failure });
                }
                Err(err)
            }
            Err(err) => {
                tracing::warn!(
                    payment_hash = %pending.id,
                    error = %err,
                    "payment outcome unknown, left pending"
                );
                Err(err.into())
            }
        }
    }

    /// Applies a terminal transition; false when the record already left Pending.
    fn transition(&self, payment: &Payment) -> SdkResult<bool> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .update_pending_payment(payment)
            .map_err(SdkError::Persistence)
    }

    pub async fn receive_payment(
        &self,
        req: ReceivePaymentRequest,
        node_state: &NodeState,
        lsp: Option<&LspInformation>,
    ) -> SdkResult<ReceivePaymentResponse> {
        if req.amount_msat == 0 {
            return Err(SdkError::InvalidAmount("amount must be > 0".to_string()));
        }

        let needs_channel = req.amount_msat > node_state.max_receivable_msat;
        let mut opening_fee_params = None;
        let mut opening_fee_msat = None;
        let mut invoice_amount_msat = req.amount_msat;

        if needs_channel {
            let lsp = lsp.ok_or_else(|| {
                SdkError::NoRouteFound(format!(
                    "{} msat exceeds inbound liquidity of {} msat and no LSP is selected",
                    req.amount_msat, node_state.max_receivable_msat
                ))
            })?;
            let expiry = req.expiry.unwrap_or(DEFAULT_INVOICE_EXPIRY_SECS);
            let params = match req.opening_fee_params.clone() {
                Some(params) => {
                    if !params.valid_for(now_secs(), expiry) {
                        return Err(SdkError::InvalidAmount(
                            "opening fee params expire before the invoice".to_string(),
                        ));
                    }
                    params
                }
                None => select_opening_fee_params(
                    &lsp.opening_fee_params_list,
                    Some(req.amount_msat),
                    Some(expiry),
                    now_secs(),
                )?,
            };
            let fee = params.fee_msat(req.amount_msat);
            if req.amount_msat <= fee {
                return Err(SdkError::InvalidAmount(format!(
                    "{} msat does not cover the channel opening fee of {fee} msat",
                    req.amount_msat
                )));
            }
            invoice_amount_msat = req.amount_msat - fee;
            opening_fee_msat = Some(fee);
            opening_fee_params = Some(params);
        }

        let bolt11 = self
            .node_api
            .create_invoice(CreateInvoiceRequest {
                amount_msat: invoice_amount_msat,
                description: req.description.clone(),
                payer_amount_msat: needs_channel.then_some(req.amount_msat),
                preimage: req.preimage.clone(),
                use_description_hash: req.use_description_hash,
                expiry: req.expiry,
                cltv: req.cltv,
            })
            .await?;
        let ln_invoice = parse_invoice(&bolt11, self.config.network)?;

        if let (Some(params), Some(fee), Some(lsp)) = (&opening_fee_params, opening_fee_msat, lsp) {
            let info = PaymentInformation {
                payment_hash: ln_invoice.payment_hash.clone(),
                payment_secret: hex::encode(&ln_invoice.payment_secret),
                destination: node_state.id.clone(),
                incoming_amount_msat: req.amount_msat,
                outgoing_amount_msat: invoice_amount_msat,
                opening_fee_params: Some(params.clone()),
            };
            self.lsp_api
                .register_payment(&lsp.id, info)
                .await
                .map_err(SdkError::BackendUnavailable)?;
            self.store
                .lock()
                .expect("store mutex poisoned")
                .set_open_channel_fee(&ln_invoice.payment_hash, fee)
                .map_err(SdkError::Persistence)?;
            tracing::info!(
                payment_hash = %ln_invoice.payment_hash,
                lsp_id = %lsp.id,
                fee_msat = fee,
                "registered payment requiring a new channel"
            );
        }

        Ok(ReceivePaymentResponse {
            ln_invoice,
            opening_fee_params,
            opening_fee_msat,
        })
    }

    pub async fn lnurl_pay(&self, req: LnUrlPayRequest) -> SdkResult<LnUrlPayResult> {
        validate_user_input(req.amount_msat, req.comment.as_deref(), &req.data)?;
        let url = build_pay_callback_url(req.amount_msat, req.comment.as_deref(), &req.data)?;
        let body = lnurl::fetch(&self.http, &url).await?;

        let (callback, invoice) =
            match parse_callback_response(&body, &req, self.config.network)? {
                ValidatedCallbackResponse::EndpointError { data } => {
                    tracing::info!(
                        domain = %req.data.domain,
                        reason = %data.reason,
                        "LNURL-pay endpoint error"
                    );
                    return Ok(LnUrlPayResult::EndpointError { data });
                }
                ValidatedCallbackResponse::EndpointSuccess { data, invoice } => (data, invoice),
            };

        let mut attempt = self.prepare_bolt11(&invoice.bolt11, None, req.payment_label.clone())?;
        attempt.details.lnurl_pay_domain = Some(req.data.domain.clone());
        attempt.details.ln_address = req.data.ln_address.clone();
        attempt.details.lnurl_metadata = Some(req.data.metadata_str.clone());
        attempt.success_action = callback.success_action;

        match self.pay_bolt11(attempt).await {
            Ok(payment) => {
                let success_action = payment
                    .details
                    .ln()
                    .and_then(|d| d.lnurl_success_action.clone());
                Ok(LnUrlPayResult::EndpointSuccess {
                    data: LnUrlPaySuccessData {
                        payment,
                        success_action,
                    },
                })
            }
            Err(
                err @ (SdkError::PaymentFailed(_)
                | SdkError::NoRouteFound(_)
                | SdkError::Invoice(_)),
            ) => {
                Ok(LnUrlPayResult::PayError {
                    data: LnUrlPayErrorData {
                        payment_hash: invoice.payment_hash,
                        reason: err.to_string(),
                    },
                })
            }
            Err(err) => Err(err),
        }
    }

    pub async fn lnurl_withdraw(
        &self,
        req: LnUrlWithdrawRequest,
        node_state: &NodeState,
        lsp: Option<&LspInformation>,
    ) -> SdkResult<LnUrlWithdrawResult> {
        validate_amount(req.amount_msat, &req.data)?;
        let description = req
            .description
            .clone()
            .unwrap_or_else(|| req.data.default_description.clone());
        let received = self
            .receive_payment(
                ReceivePaymentRequest {
                    amount_msat: req.amount_msat,
                    description,
                    ..ReceivePaymentRequest::default()
                },
                node_state,
                lsp,
            )
            .await?;
        let invoice = received.ln_invoice;
        self.track_incoming(
            &invoice,
            req.amount_msat,
            received.opening_fee_msat.unwrap_or(0),
            LnPaymentDetails {
                lnurl_withdraw_endpoint: Some(req.data.callback.clone()),
                ..LnPaymentDetails::default()
            },
        )?;

        let status = match self.withdraw_callback(&req, &invoice).await {
            Ok(status) => status,
            Err(err) => {
                self.untrack_incoming(&invoice.payment_hash)?;
                return Err(err);
            }
        };
        if let LnUrlCallbackStatus::ErrorStatus { data } = &status {
            tracing::info!(reason = %data.reason, "LNURL-withdraw refused by the service");
            self.untrack_incoming(&invoice.payment_hash)?;
        }
        Ok(LnUrlWithdrawResult::from_status(status, invoice))
    }

    async fn withdraw_callback(
        &self,
        req: &LnUrlWithdrawRequest,
        invoice: &LnInvoice,
    ) -> SdkResult<LnUrlCallbackStatus> {
        let url = build_withdraw_callback_url(&req.data, &invoice.bolt11)?;
        let body = lnurl::fetch(&self.http, &url).await?;
        lnurl::parse_callback_status(&body)
    }

    fn untrack_incoming(&self, payment_hash: &str) -> SdkResult<()> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .delete_pending_payment(payment_hash)
            .map_err(SdkError::Persistence)?;
        Ok(())
    }

    /// Records an invoice we expect to be paid, so the completed payment
    /// keeps `details` once the backend reports it.
    pub(crate) fn track_incoming(
        &self,
        invoice: &LnInvoice,
        amount_msat: u64,
        fee_msat: u64,
        details: LnPaymentDetails,
    ) -> SdkResult<()> {
        let payment = Payment {
            id: invoice.payment_hash.clone(),
            payment_type: PaymentType::Received,
            payment_time: now_secs(),
            amount_msat,
            fee_msat,
            status: PaymentStatus::Pending,
            error: None,
            description: invoice.description.clone(),
            details: PaymentDetails::Ln {
                data: LnPaymentDetails {
                    payment_hash: invoice.payment_hash.clone(),
                    destination_pubkey: invoice.payee_pubkey.clone(),
                    bolt11: invoice.bolt11.clone(),
                    ..details
                },
            },
            metadata: None,
        };
        self.store
            .lock()
            .expect("store mutex poisoned")
            .start_payment_attempt(&payment)
            .map_err(SdkError::Persistence)?;
        Ok(())
    }

    pub async fn lnurl_auth(
        &self,
        identity: &NodeIdentity,
        req: &LnUrlAuthRequestData,
    ) -> SdkResult<LnUrlCallbackStatus> {
        let url = build_auth_callback_url(identity.master(), req)?;
        let body = lnurl::fetch(&self.http, &url).await?;
        let status = lnurl::parse_callback_status(&body)?;
        tracing::info!(domain = %req.domain, ?status, "LNURL-auth callback");
        Ok(status)
    }

    pub fn list_payments(&self, req: &ListPaymentsRequest) -> SdkResult<Vec<Payment>> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .list_payments(req)
            .map_err(SdkError::Persistence)
    }

    /// Attaches caller-defined JSON to a stored payment.
    pub fn set_payment_metadata(&self, payment_hash: &str, metadata: &str) -> SdkResult<()> {
        serde_json::from_str::<serde_json::Value>(metadata)
            .map_err(|e| SdkError::parse(format!("payment metadata is not valid JSON: {e}")))?;
        let updated = self
            .store
            .lock()
            .expect("store mutex poisoned")
            .set_payment_metadata(payment_hash, metadata)
            .map_err(SdkError::Persistence)?;
        if !updated {
            return Err(SdkError::generic(format!("no payment with hash {payment_hash}")));
        }
        Ok(())
    }

    pub fn payment_by_hash(&self, payment_hash: &str) -> SdkResult<Option<Payment>> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .get_payment(payment_hash)
            .map_err(SdkError::Persistence)
    }

    /// Merges backend payment records into the local store, emitting one
    /// event per record that reached a terminal state. Returns the incoming
    /// payments that completed.
    pub fn reconcile(&self, remote: Vec<Payment>) -> SdkResult<Vec<Payment>> {
        let mut received = Vec::new();
        for remote in remote {
            let local = self.payment_by_hash(&remote.id)?;
            let payment = match local {
                None => {
                    let mut payment = remote;
                    if payment.payment_type == PaymentType::Received
                        && let Some(fee) = self.open_channel_fee(&payment.id)?
                    {
                        payment.fee_msat = fee;
                    }
                    self.store
                        .lock()
                        .expect("store mutex poisoned")
                        .insert_payment(&payment)
                        .map_err(SdkError::Persistence)?;
                    // Outgoing payments made elsewhere have no pending record to resolve.
                    if payment.payment_type != PaymentType::Received {
                        continue;
                    }
                    payment
                }
                Some(local)
                    if local.status == PaymentStatus::Pending && remote.status.is_terminal() =>
                {
                    let merged = merge(local, remote);
                    if !self.transition(&merged)? {
                        continue;
                    }
                    merged
                }
                Some(_) => continue,
            };

            match (payment.payment_type, payment.status) {
                (PaymentType::Received, PaymentStatus::Complete) => {
                    let bolt11 = payment.details.ln().map(|d| d.bolt11.clone()).unwrap_or_default();
                    tracing::info!(
                        payment_hash = %payment.id,
                        amount_msat = payment.amount_msat,
                        "invoice paid"
                    );
                    self.events.emit(BreezEvent::InvoicePaid {
                        details: InvoicePaidDetails {
                            payment_hash: payment.id.clone(),
                            bolt11,
                            payment: Some(payment.clone()),
                        },
                    });
                    received.push(payment);
                }
                (PaymentType::Sent, PaymentStatus::Complete) => {
                    self.events.emit(BreezEvent::PaymentSucceed { details: payment });
                }
                (PaymentType::Sent, PaymentStatus::Failed) => {
                    let details = payment.details.ln();
                    let invoice = details
                        .filter(|d| !d.bolt11.is_empty())
                        .and_then(|d| decode_invoice(&d.bolt11).ok());
                    self.events.emit(BreezEvent::PaymentFailed {
                        details: PaymentFailedData {
                            error: payment.error.clone().unwrap_or_default(),
                            node_id: details
                                .map(|d| d.destination_pubkey.clone())
                                .unwrap_or_default(),
                            invoice,
                            label: details.map(|d| d.label.clone()).filter(|l| !l.is_empty()),
                        },
                    });
                }
                _ => {}
            }
        }
        Ok(received)
    }

    fn open_channel_fee(&self, payment_hash: &str) -> SdkResult<Option<u64>> {
        self.store
            .lock()
            .expect("store mutex poisoned")
            .open_channel_fee(payment_hash)
            .map_err(SdkError::Persistence)
    }
}

/// Backend errors after which the HTLC is known not to be in flight.
/// Errors after which the payment can no longer succeed. Anything else leaves
/// the record pending for the next sync to settle.
fn is_terminal_failure(err: &NodeError) -> bool {
    matches!(
        err,
        NodeError::RouteNotFound(_)
            | NodeError::PaymentFailed(_)
            | NodeError::InvalidInvoice(_)
            | NodeError::Credentials(_)
            | NodeError::Unsupported(_)
    )
}

/// Local record enriched with the backend's terminal outcome.
fn merge(local: Payment, remote: Payment) -> Payment {
    let details = match (local.details, remote.details) {
        (PaymentDetails::Ln { data: mut local }, PaymentDetails::Ln { data: remote }) => {
            if local.payment_preimage.is_empty() {
                local.payment_preimage = remote.payment_preimage;
            }
            if local.bolt11.is_empty() {
                local.bolt11 = remote.bolt11;
            }
            if local.destination_pubkey.is_empty() {
                local.destination_pubkey = remote.destination_pubkey;
            }
            PaymentDetails::Ln { data: local }
        }
        (_, remote) => remote,
    };
    Payment {
        status: remote.status,
        fee_msat: local.fee_msat.max(remote.fee_msat),
        amount_msat: if remote.amount_msat > 0 {
            remote.amount_msat
        } else {
            local.amount_msat
        },
        error: remote.error.or(local.error),
        description: local.description.or(remote.description),
        details,
        ..local
    }
}
