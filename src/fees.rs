//! Channel-opening fees, reverse swap fees and on-chain payment limits.

use std::str::FromStr as _;

use bitcoin::Address;
use serde::{Deserialize, Serialize};

use crate::config::{Network, NodeConfig};
use crate::error::{SdkError, SdkResult};
use crate::lsp::{OpeningFeeParams, OpeningFeeParamsMenu};
use crate::models::{NodeState, PrepareRedeemOnchainFundsRequest, PrepareRedeemOnchainFundsResponse};
use crate::reverse_swap::{
    MaxReverseSwapAmountResponse, OnchainPaymentLimitsResponse, PrepareOnchainPaymentRequest,
    PrepareOnchainPaymentResponse, ReverseSwapPairInfo, SwapAmountType,
};

/// Virtual size of a reverse swap claim spending one P2WSH lockup output.
pub const ESTIMATED_CLAIM_TX_VSIZE: u64 = 138;
/// Virtual size of the service's lockup transaction.
pub const ESTIMATED_LOCKUP_TX_VSIZE: u64 = 153;
/// Allowed relative deviation from the estimated sizes, in percent.
pub const VSIZE_TOLERANCE_PERCENT: u64 = 10;

const P2WPKH_INPUT_WEIGHT: u64 = 41 * 4 + 108;
const TX_OVERHEAD_WEIGHT: u64 = (4 + 1 + 1 + 4) * 4 + 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelFeeRequest {
    pub amount_msat: Option<u64>,
    /// Seconds from now the params must remain valid for.
    pub expiry: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenChannelFeeResponse {
    /// Absent when no amount was given.
    pub fee_msat: Option<u64>,
    pub fee_params: OpeningFeeParams,
}

/// Cheapest params valid for the request: lowest `proportional`, then lowest `min_msat`.
pub fn select_opening_fee_params(
    menu: &OpeningFeeParamsMenu,
    amount_msat: Option<u64>,
    expiry: Option<u32>,
    now_secs: i64,
) -> SdkResult<OpeningFeeParams> {
    let expiry = expiry.unwrap_or(0);
    menu.values
        .iter()
        .filter(|p| p.valid_for(now_secs, expiry))
        .filter(|p| amount_msat.is_none_or(|amount| p.min_msat <= amount))
        .min_by_key(|p| (p.proportional, p.min_msat))
        .cloned()
        .ok_or_else(|| {
            SdkError::NoRouteFound(format!(
                "no opening fee params valid for {expiry}s \
                 (amount_msat={amount_msat:?}, {} offered)",
                menu.values.len()
            ))
        })
}

pub fn open_channel_fee(
    menu: &OpeningFeeParamsMenu,
    req: OpenChannelFeeRequest,
    now_secs: i64,
) -> SdkResult<OpenChannelFeeResponse> {
    let fee_params = select_opening_fee_params(menu, req.amount_msat, req.expiry, now_secs)?;
    Ok(OpenChannelFeeResponse {
        fee_msat: req.amount_msat.map(|amount| fee_params.fee_msat(amount)),
        fee_params,
    })
}

/// Service fee on a reverse swap invoice, rounded up.
pub fn service_fee_sat(invoice_amount_sat: u64, fees_percentage: f64) -> u64 {
    (invoice_amount_sat as f64 * fees_percentage / 100.0).ceil() as u64
}

/// Smallest invoice amount whose remainder after the service fee covers `onchain_amount_sat`.
pub fn invoice_amount_sat(onchain_amount_sat: u64, fees_percentage: f64) -> u64 {
    let estimate = (onchain_amount_sat as f64 * 100.0 / (100.0 - fees_percentage)).ceil() as u64;
    let mut amount = estimate.saturating_sub(1).max(onchain_amount_sat);
    while amount - service_fee_sat(amount, fees_percentage) < onchain_amount_sat {
        amount += 1;
    }
    amount
}

pub fn claim_tx_fee(sat_per_vbyte: u32) -> u64 {
    ESTIMATED_CLAIM_TX_VSIZE * u64::from(sat_per_vbyte)
}

/// What a claim of `lockup_sat` pays out at the feerate chosen when the swap was prepared.
pub fn claim_output_sat(lockup_sat: u64, sat_per_vbyte: u32) -> SdkResult<u64> {
    let fee = claim_tx_fee(sat_per_vbyte);
    lockup_sat
        .checked_sub(fee)
        .filter(|out| *out > 0)
        .ok_or_else(|| {
            SdkError::swap(format!(
                "lockup of {lockup_sat} sat does not cover the {fee} sat claim fee"
            ))
        })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseSwapFeesRequest {
    pub send_amount_sat: Option<u64>,
    pub claim_tx_feerate: Option<u32>,
}

/// Applies a fee request to the service's current pair terms.
///
/// Out-of-bounds amounts still yield the pair info; `total_fees` is only
/// filled when an amount was given.
pub fn reverse_swap_fees(
    mut pair: ReverseSwapPairInfo,
    req: ReverseSwapFeesRequest,
) -> ReverseSwapPairInfo {
    if let Some(rate) = req.claim_tx_feerate {
        pair.fees_claim = claim_tx_fee(rate);
    }
    pair.total_fees = req.send_amount_sat.map(|amount| {
        service_fee_sat(amount, pair.fees_percentage) + pair.fees_lockup + pair.fees_claim
    });
    pair
}

/// Largest hold invoice the node can pay, leaving room for the routing fee limit.
pub fn max_reverse_swap_amount(
    config: &NodeConfig,
    node_state: &NodeState,
) -> MaxReverseSwapAmountResponse {
    let payable_msat = node_state.max_payable_msat;
    let spendable_msat = payable_msat.saturating_sub(config.max_fee_msat(payable_msat));
    MaxReverseSwapAmountResponse {
        total_sat: spendable_msat / 1000,
    }
}

pub fn onchain_payment_limits(
    pair: &ReverseSwapPairInfo,
    config: &NodeConfig,
    node_state: &NodeState,
) -> OnchainPaymentLimitsResponse {
    OnchainPaymentLimitsResponse {
        min_sat: pair.min,
        max_sat: pair.max,
        max_payable_sat: max_reverse_swap_amount(config, node_state).total_sat.min(pair.max),
    }
}

pub fn prepare_onchain_payment(
    pair: &ReverseSwapPairInfo,
    req: PrepareOnchainPaymentRequest,
) -> SdkResult<PrepareOnchainPaymentResponse> {
    let fees_claim = claim_tx_fee(req.claim_tx_feerate);
    let miner_fees = pair.fees_lockup + fees_claim;

    let (sender_amount_sat, recipient_amount_sat) = match req.amount_type {
        SwapAmountType::Send => {
            let service_fee = service_fee_sat(req.amount_sat, pair.fees_percentage);
            let recipient = req
                .amount_sat
                .checked_sub(service_fee + miner_fees)
                .filter(|r| *r > 0)
                .ok_or_else(|| {
                    SdkError::InvalidAmount(format!(
                        "{} sat does not cover {} sat of fees",
                        req.amount_sat,
                        service_fee + miner_fees
                    ))
                })?;
            (req.amount_sat, recipient)
        }
        SwapAmountType::Receive => {
            if req.amount_sat == 0 {
                return Err(SdkError::InvalidAmount("amount must be > 0".to_string()));
            }
            let sender = invoice_amount_sat(req.amount_sat + miner_fees, pair.fees_percentage);
            (sender, req.amount_sat)
        }
    };

    if !(pair.min..=pair.max).contains(&sender_amount_sat) {
        return Err(SdkError::InvalidAmount(format!(
            "send amount {sender_amount_sat} sat outside of [{}, {}]",
            pair.min, pair.max
        )));
    }

    Ok(PrepareOnchainPaymentResponse {
        fees_hash: pair.fees_hash.clone(),
        fees_percentage: pair.fees_percentage,
        fees_lockup: pair.fees_lockup,
        fees_claim,
        sender_amount_sat,
        recipient_amount_sat,
        total_fees: sender_amount_sat - recipient_amount_sat,
    })
}

/// Fee for sweeping every node UTXO (P2WPKH) to `to_address`.
pub fn prepare_redeem_onchain_funds(
    node_state: &NodeState,
    network: Network,
    req: &PrepareRedeemOnchainFundsRequest,
) -> SdkResult<PrepareRedeemOnchainFundsResponse> {
    let destination = parse_address(&req.to_address, network)?;
    let inputs = node_state.utxos.iter().filter(|u| !u.reserved).count() as u64;
    if inputs == 0 {
        return Err(SdkError::InvalidAmount("no on-chain funds to redeem".to_string()));
    }
    let output_weight = (8 + 1 + destination.script_pubkey().len() as u64) * 4;
    let tx_weight = TX_OVERHEAD_WEIGHT + inputs * P2WPKH_INPUT_WEIGHT + output_weight;
    Ok(PrepareRedeemOnchainFundsResponse {
        tx_weight,
        tx_fee_sat: tx_weight.div_ceil(4) * u64::from(req.sat_per_vbyte),
    })
}

pub(crate) fn parse_address(address: &str, network: Network) -> SdkResult<Address> {
    Address::from_str(address)
        .map_err(|e| SdkError::parse(format!("invalid address {address}: {e}")))?
        .require_network(network.into())
        .map_err(|e| SdkError::parse(format!("address {address}: {e}")))
}

/// Rejects a built transaction whose size strays from its calibration constant.
pub fn check_vsize_calibration(
    kind: &str,
    actual_vsize: u64,
    expected_vsize: u64,
) -> SdkResult<()> {
    let deviation = actual_vsize.abs_diff(expected_vsize);
    if deviation * 100 > expected_vsize * VSIZE_TOLERANCE_PERCENT {
        tracing::warn!(
            kind,
            actual_vsize,
            expected_vsize,
            "transaction size deviates from estimate"
        );
        return Err(SdkError::swap(format!(
            "{kind} transaction is {actual_vsize} vB, expected about {expected_vsize} vB"
        )));
    }
    Ok(())
}
