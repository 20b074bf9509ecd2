//! Classifies user input: invoices, on-chain addresses, LNURLs, node ids and URLs.

use std::str::FromStr as _;

use bitcoin::secp256k1::PublicKey;
use bitcoin::{Address, Amount, Denomination};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Network;
use crate::error::{SdkError, SdkResult};
use crate::lightning::invoice::{LnInvoice, decode_invoice, validate_network};
use crate::lnurl::auth::{LnUrlAuthRequestData, validate_request};
use crate::lnurl::pay::LnUrlPayRequestData;
use crate::lnurl::withdraw::LnUrlWithdrawRequestData;
use crate::lnurl::{self, LnUrlEndpoint, LnUrlErrorData};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitcoinAddressData {
    pub address: String,
    pub network: Network,
    pub amount_sat: Option<u64>,
    pub label: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputType {
    BitcoinAddress { address: BitcoinAddressData },
    /// Also produced for BIP21 URIs carrying a `lightning` parameter.
    Bolt11 { invoice: LnInvoice },
    NodeId { node_id: String },
    Url { url: String },
    LnUrlPay { data: LnUrlPayRequestData },
    LnUrlWithdraw { data: LnUrlWithdrawRequestData },
    LnUrlAuth { data: LnUrlAuthRequestData },
    LnUrlError { data: LnUrlErrorData },
}

#[derive(Debug, Clone)]
pub struct InputParser {
    network: Network,
    http: reqwest::Client,
}

impl InputParser {
    pub fn new(network: Network, http: reqwest::Client) -> Self {
        Self { network, http }
    }

    pub async fn parse(&self, input: &str) -> SdkResult<InputType> {
        let input = input.trim();
        if input.is_empty() {
            return Err(SdkError::parse("empty input"));
        }

        if let Ok(invoice) = decode_invoice(input) {
            validate_network(&invoice, self.network)?;
            return Ok(InputType::Bolt11 { invoice });
        }

        if let Some(parsed) = self.parse_onchain(input)? {
            return Ok(parsed);
        }

        if let Some(node_id) = parse_node_id(input) {
            return Ok(InputType::NodeId { node_id });
        }

        if let Ok(endpoint) = lnurl::decode(input) {
            return self.resolve_lnurl(endpoint).await;
        }

        if let Ok(url) = Url::parse(input)
            && matches!(url.scheme(), "http" | "https")
        {
            if let Some((_, lightning)) = url.query_pairs().find(|(k, _)| k == "lightning")
                && let Ok(endpoint) = lnurl::decode(&lightning)
            {
                return self.resolve_lnurl(endpoint).await;
            }
            return Ok(InputType::Url {
                url: input.to_string(),
            });
        }

        Err(SdkError::parse(format!("unrecognized input: {input}")))
    }

    fn parse_onchain(&self, input: &str) -> SdkResult<Option<InputType>> {
        let is_bip21 = input
            .get(..8)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("bitcoin:"));
        let Some(rest) = is_bip21.then(|| &input[8..]) else {
            return match Address::from_str(input) {
                Ok(address) => Ok(Some(self.address_input(address, None, None, None)?)),
                Err(_) => Ok(None),
            };
        };

        let (addr, query) = rest.split_once('?').unwrap_or((rest, ""));
        let mut amount_sat = None;
        let mut label = None;
        let mut message = None;
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.to_lowercase().as_str() {
                "amount" => {
                    let amount = Amount::from_str_in(&value, Denomination::Bitcoin)
                        .map_err(|e| SdkError::parse(format!("BIP21 amount {value}: {e}")))?;
                    amount_sat = Some(amount.to_sat());
                }
                "label" => label = Some(value.into_owned()),
                "message" => message = Some(value.into_owned()),
                "lightning" => {
                    let invoice = decode_invoice(&value)?;
                    validate_network(&invoice, self.network)?;
                    return Ok(Some(InputType::Bolt11 { invoice }));
                }
                other if other.starts_with("req-") => {
                    return Err(SdkError::parse(format!(
                        "unsupported required BIP21 param {other}"
                    )));
                }
                _ => {}
            }
        }

        let address = Address::from_str(addr)
            .map_err(|e| SdkError::parse(format!("invalid BIP21 address {addr}: {e}")))?;
        Ok(Some(self.address_input(address, amount_sat, label, message)?))
    }

    fn address_input(
        &self,
        address: Address<bitcoin::address::NetworkUnchecked>,
        amount_sat: Option<u64>,
        label: Option<String>,
        message: Option<String>,
    ) -> SdkResult<InputType> {
        let address = address
            .require_network(self.network.into())
            .map_err(|e| SdkError::parse(format!("address network mismatch: {e}")))?;
        Ok(InputType::BitcoinAddress {
            address: BitcoinAddressData {
                address: address.to_string(),
                network: self.network,
                amount_sat,
                label,
                message,
            },
        })
    }

    async fn resolve_lnurl(&self, endpoint: LnUrlEndpoint) -> SdkResult<InputType> {
        if endpoint.is_auth() {
            return Ok(InputType::LnUrlAuth {
                data: validate_request(endpoint.domain, &endpoint.url)?,
            });
        }
        let body = lnurl::fetch(&self.http, endpoint.url.as_str()).await?;
        classify_lnurl_response(&body, endpoint)
    }
}

/// Interprets the first-step LNURL response.
pub fn classify_lnurl_response(body: &str, endpoint: LnUrlEndpoint) -> SdkResult<InputType> {
    if let Some(data) = lnurl::error_status(body) {
        return Ok(InputType::LnUrlError { data });
    }
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| SdkError::parse(format!("malformed LNURL response: {e}")))?;
    let malformed =
        |e: serde_json::Error| SdkError::parse(format!("malformed LNURL response: {e}"));
    let tag = value.get("tag").and_then(|t| t.as_str()).map(str::to_string);
    match tag.as_deref() {
        Some("payRequest") => {
            let data: LnUrlPayRequestData = serde_json::from_value(value).map_err(malformed)?;
            Ok(InputType::LnUrlPay {
                data: LnUrlPayRequestData {
                    domain: endpoint.domain,
                    ln_address: endpoint.ln_address,
                    ..data
                },
            })
        }
        Some("withdrawRequest") => Ok(InputType::LnUrlWithdraw {
            data: serde_json::from_value(value).map_err(malformed)?,
        }),
        Some(other) => Err(SdkError::parse(format!("unsupported LNURL tag {other}"))),
        None => Err(SdkError::parse("LNURL response has no tag")),
    }
}

fn parse_node_id(input: &str) -> Option<String> {
    let (pubkey, host) = match input.split_once('@') {
        Some((pubkey, host)) => (pubkey, Some(host)),
        None => (input, None),
    };
    if pubkey.len() != 66 || PublicKey::from_str(pubkey).is_err() {
        return None;
    }
    if let Some(host) = host
        && host.is_empty()
    {
        return None;
    }
    Some(input.to_string())
}
