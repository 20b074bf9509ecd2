use std::str::FromStr as _;

use bitcoin::hashes::Hash as _;
use lightning_invoice::{Bolt11Invoice, Currency};
use serde::{Deserialize, Serialize};

use crate::config::Network;
use crate::error::{SdkError, SdkResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHintHop {
    pub src_node_id: String,
    pub short_channel_id: u64,
    pub fees_base_msat: u32,
    pub fees_proportional_millionths: u32,
    pub cltv_expiry_delta: u64,
    pub htlc_minimum_msat: Option<u64>,
    pub htlc_maximum_msat: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHint {
    pub hops: Vec<RouteHintHop>,
}

/// Decoded BOLT11 fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LnInvoice {
    pub bolt11: String,
    pub network: Network,
    pub payee_pubkey: String,
    pub payment_hash: String,
    pub description: Option<String>,
    pub description_hash: Option<String>,
    pub amount_msat: Option<u64>,
    pub timestamp: u64,
    pub expiry: u64,
    pub routing_hints: Vec<RouteHint>,
    pub payment_secret: Vec<u8>,
    pub min_final_cltv_expiry_delta: u64,
}

impl LnInvoice {
    pub fn is_expired_at(&self, now_secs: u64) -> bool {
        now_secs >= self.timestamp.saturating_add(self.expiry)
    }
}

/// Decodes a BOLT11 string without checking it against a configured network.
pub fn decode_invoice(bolt11: &str) -> SdkResult<LnInvoice> {
    let trimmed = bolt11.trim();
    let stripped = strip_lightning_prefix(trimmed);

    let invoice = Bolt11Invoice::from_str(stripped)
        .map_err(|e| SdkError::Invoice(format!("parse BOLT11 invoice: {e}")))?;

    let network = match invoice.currency() {
        Currency::Bitcoin => Network::Bitcoin,
        Currency::BitcoinTestnet => Network::Testnet,
        Currency::Signet => Network::Signet,
        Currency::Regtest => Network::Regtest,
        Currency::Simnet => {
            return Err(SdkError::Invoice("simnet invoices are not supported".into()));
        }
    };

    let payee_pubkey = invoice
        .payee_pub_key()
        .copied()
        .unwrap_or_else(|| invoice.recover_payee_pub_key());

    let routing_hints = invoice
        .route_hints()
        .into_iter()
        .map(|hint| RouteHint {
            hops: hint
                .0
                .into_iter()
                .map(|hop| RouteHintHop {
                    src_node_id: hop.src_node_id.to_string(),
                    short_channel_id: hop.short_channel_id,
                    fees_base_msat: hop.fees.base_msat,
                    fees_proportional_millionths: hop.fees.proportional_millionths,
                    cltv_expiry_delta: u64::from(hop.cltv_expiry_delta),
                    htlc_minimum_msat: hop.htlc_minimum_msat,
                    htlc_maximum_msat: hop.htlc_maximum_msat,
                })
                .collect(),
        })
        .collect();

    let payment_hash = hex::encode(invoice.payment_hash().to_byte_array());
    let amount_msat = invoice.amount_milli_satoshis();
    let timestamp = invoice.duration_since_epoch().as_secs();
    let expiry = invoice.expiry_time().as_secs();
    let payment_secret = invoice.payment_secret().0.to_vec();
    let min_final_cltv_expiry_delta = invoice.min_final_cltv_expiry_delta();

    let signed = invoice.into_signed_raw();
    let raw = signed.raw_invoice();
    let description = raw.description().map(|d| d.to_string());
    let description_hash = raw
        .description_hash()
        .map(|h| hex::encode(h.0.to_byte_array()));

    Ok(LnInvoice {
        bolt11: stripped.to_string(),
        network,
        payee_pubkey: payee_pubkey.to_string(),
        payment_hash,
        description,
        description_hash,
        amount_msat,
        timestamp,
        expiry,
        routing_hints,
        payment_secret,
        min_final_cltv_expiry_delta,
    })
}

/// Decodes a BOLT11 string and rejects it unless it targets `network`.
pub fn parse_invoice(bolt11: &str, network: Network) -> SdkResult<LnInvoice> {
    let invoice = decode_invoice(bolt11)?;
    validate_network(&invoice, network)?;
    Ok(invoice)
}

pub fn validate_network(invoice: &LnInvoice, network: Network) -> SdkResult<()> {
    if invoice.network != network {
        return Err(SdkError::Invoice(format!(
            "invoice network {} does not match configured network {network}",
            invoice.network
        )));
    }
    Ok(())
}

fn strip_lightning_prefix(s: &str) -> &str {
    match s.get(..10) {
        Some(prefix) if prefix.eq_ignore_ascii_case("lightning:") => &s[10..],
        _ => s,
    }
}
