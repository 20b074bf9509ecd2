//! LNURL-pay (LUD-06) with success actions (LUD-09, LUD-10).

use aes::cipher::{
    BlockDecryptMut as _, BlockEncryptMut as _, KeyIvInit as _, block_padding::Pkcs7,
};
use anyhow::{Context as _, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bitcoin::hashes::{Hash as _, sha256};
use serde::{Deserialize, Serialize};
use url::Url;

use super::LnUrlErrorData;
use crate::config::Network;
use crate::error::{SdkError, SdkResult};
use crate::lightning::invoice::{LnInvoice, parse_invoice};
use crate::models::Payment;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const MAX_DESCRIPTION_LEN: usize = 144;
const MAX_CIPHERTEXT_LEN: usize = 4096;
const IV_B64_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LnUrlPayRequestData {
    pub callback: String,
    pub min_sendable: u64,
    pub max_sendable: u64,
    /// Raw metadata JSON string; the invoice description hash commits to it.
    #[serde(rename = "metadata")]
    pub metadata_str: String,
    #[serde(default)]
    pub comment_allowed: u16,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub ln_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LnUrlPayRequest {
    pub data: LnUrlPayRequestData,
    pub amount_msat: u64,
    pub comment: Option<String>,
    pub payment_label: Option<String>,
    /// Require a URL success action to share the callback's domain. Defaults to true.
    pub validate_success_action_url: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LnUrlPayResult {
    EndpointSuccess { data: LnUrlPaySuccessData },
    EndpointError { data: LnUrlErrorData },
    PayError { data: LnUrlPayErrorData },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LnUrlPaySuccessData {
    pub payment: Payment,
    pub success_action: Option<SuccessActionProcessed>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LnUrlPayErrorData {
    pub payment_hash: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    pub pr: String,
    #[serde(default)]
    pub success_action: Option<SuccessAction>,
}

pub enum ValidatedCallbackResponse {
    EndpointSuccess { data: CallbackResponse, invoice: LnInvoice },
    EndpointError { data: LnUrlErrorData },
}

#[derive(Debug, Clone, Deserialize)]
pub struct AesSuccessActionData {
    pub description: String,
    pub ciphertext: String,
    pub iv: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AesSuccessActionDataResult {
    Decrypted { data: AesSuccessActionDataDecrypted },
    ErrorStatus { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AesSuccessActionDataDecrypted {
    pub description: String,
    pub plaintext: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSuccessActionData {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlSuccessActionData {
    pub description: String,
    pub url: String,
    #[serde(default)]
    pub matches_callback_domain: bool,
}

/// Success action as received from the service.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "tag", rename_all = "camelCase")]
pub enum SuccessAction {
    Aes(AesSuccessActionData),
    Message(MessageSuccessActionData),
    Url(UrlSuccessActionData),
}

/// Success action ready for the caller; AES payloads are decrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SuccessActionProcessed {
    Aes { result: AesSuccessActionDataResult },
    Message { data: MessageSuccessActionData },
    Url { data: UrlSuccessActionData },
}

impl AesSuccessActionData {
    pub fn validate(&self) -> SdkResult<()> {
        if self.description.len() > MAX_DESCRIPTION_LEN {
            return Err(SdkError::parse("AES action description too long"));
        }
        if self.ciphertext.len() > MAX_CIPHERTEXT_LEN {
            return Err(SdkError::parse("AES action ciphertext too long"));
        }
        BASE64
            .decode(&self.ciphertext)
            .map_err(|e| SdkError::parse(format!("AES action ciphertext: {e}")))?;
        if self.iv.len() != IV_B64_LEN {
            return Err(SdkError::parse("AES action iv has unexpected length"));
        }
        BASE64
            .decode(&self.iv)
            .map_err(|e| SdkError::parse(format!("AES action iv: {e}")))?;
        Ok(())
    }

    /// AES-256-CBC decryption keyed by the payment preimage.
    pub fn decrypt(&self, key: &[u8; 32]) -> Result<String> {
        let iv = BASE64.decode(&self.iv).context("decode iv")?;
        let ciphertext = BASE64.decode(&self.ciphertext).context("decode ciphertext")?;
        let plaintext = Aes256CbcDec::new_from_slices(key, &iv)
            .map_err(|e| anyhow::anyhow!("init cipher: {e}"))?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|e| anyhow::anyhow!("decrypt: {e}"))?;
        String::from_utf8(plaintext).context("plaintext is not UTF-8")
    }

    pub fn encrypt(key: &[u8; 32], iv: &[u8; 16], plaintext: &str) -> Result<String> {
        let ciphertext = Aes256CbcEnc::new_from_slices(key, iv)
            .map_err(|e| anyhow::anyhow!("init cipher: {e}"))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
        Ok(BASE64.encode(ciphertext))
    }
}

impl SuccessAction {
    /// Checks field limits; URL actions get `matches_callback_domain` filled in.
    pub fn validate(self, req: &LnUrlPayRequestData, require_same_domain: bool) -> SdkResult<Self> {
        match self {
            SuccessAction::Aes(data) => {
                data.validate()?;
                Ok(SuccessAction::Aes(data))
            }
            SuccessAction::Message(data) => {
                if data.message.len() > MAX_DESCRIPTION_LEN {
                    return Err(SdkError::parse("success action message too long"));
                }
                Ok(SuccessAction::Message(data))
            }
            SuccessAction::Url(mut data) => {
                if data.description.len() > MAX_DESCRIPTION_LEN {
                    return Err(SdkError::parse("success action description too long"));
                }
                let callback_domain = url_domain(&req.callback)?;
                let action_domain = url_domain(&data.url)?;
                data.matches_callback_domain = callback_domain == action_domain;
                if require_same_domain && !data.matches_callback_domain {
                    return Err(SdkError::parse(
                        "success action URL domain differs from callback domain",
                    ));
                }
                Ok(SuccessAction::Url(data))
            }
        }
    }

    pub fn process(self, preimage: &[u8; 32]) -> SuccessActionProcessed {
        match self {
            SuccessAction::Aes(data) => {
                let result = match data.decrypt(preimage) {
                    Ok(plaintext) => AesSuccessActionDataResult::Decrypted {
                        data: AesSuccessActionDataDecrypted {
                            description: data.description,
                            plaintext,
                        },
                    },
                    Err(e) => AesSuccessActionDataResult::ErrorStatus {
                        reason: format!("{e:#}"),
                    },
                };
                SuccessActionProcessed::Aes { result }
            }
            SuccessAction::Message(data) => SuccessActionProcessed::Message { data },
            SuccessAction::Url(data) => SuccessActionProcessed::Url { data },
        }
    }

    /// [`Self::process`] for the hex preimage reported by the node. A malformed
    /// preimage only turns an AES action into an error status.
    pub fn process_hex(self, preimage_hex: &str) -> SuccessActionProcessed {
        let key = hex::decode(preimage_hex)
            .ok()
            .and_then(|b| <[u8; 32]>::try_from(b).ok());
        match (key, self) {
            (Some(key), action) => action.process(&key),
            (None, SuccessAction::Aes(_)) => SuccessActionProcessed::Aes {
                result: AesSuccessActionDataResult::ErrorStatus {
                    reason: format!("invalid payment preimage {preimage_hex}"),
                },
            },
            (None, SuccessAction::Message(data)) => SuccessActionProcessed::Message { data },
            (None, SuccessAction::Url(data)) => SuccessActionProcessed::Url { data },
        }
    }
}

fn url_domain(url: &str) -> SdkResult<String> {
    Url::parse(url)
        .map_err(|e| SdkError::parse(format!("invalid URL {url}: {e}")))?
        .domain()
        .map(str::to_string)
        .ok_or_else(|| SdkError::parse(format!("URL has no domain: {url}")))
}

pub fn validate_user_input(
    amount_msat: u64,
    comment: Option<&str>,
    data: &LnUrlPayRequestData,
) -> SdkResult<()> {
    if amount_msat < data.min_sendable {
        return Err(SdkError::InvalidAmount(format!(
            "{amount_msat} msat is below the minimum of {}",
            data.min_sendable
        )));
    }
    if amount_msat > data.max_sendable {
        return Err(SdkError::InvalidAmount(format!(
            "{amount_msat} msat is above the maximum of {}",
            data.max_sendable
        )));
    }
    if let Some(comment) = comment
        && comment.len() > usize::from(data.comment_allowed)
    {
        return Err(SdkError::parse(format!(
            "comment longer than the allowed {} characters",
            data.comment_allowed
        )));
    }
    Ok(())
}

pub fn build_pay_callback_url(
    amount_msat: u64,
    comment: Option<&str>,
    data: &LnUrlPayRequestData,
) -> SdkResult<String> {
    let mut url = Url::parse(&data.callback)
        .map_err(|e| SdkError::parse(format!("invalid LNURL-pay callback: {e}")))?;
    url.query_pairs_mut()
        .append_pair("amount", &amount_msat.to_string());
    if let Some(comment) = comment {
        url.query_pairs_mut().append_pair("comment", comment);
    }
    Ok(url.to_string())
}

/// Invoice returned by the callback must be on our network, for the chosen
/// amount, and commit to the request metadata.
pub fn validate_invoice(
    amount_msat: u64,
    bolt11: &str,
    metadata_str: &str,
    network: Network,
) -> SdkResult<LnInvoice> {
    let invoice = parse_invoice(bolt11, network)?;
    if invoice.amount_msat != Some(amount_msat) {
        return Err(SdkError::AmountMismatch(format!(
            "invoice amount {:?} msat differs from requested {amount_msat}",
            invoice.amount_msat
        )));
    }
    if let Some(hash) = &invoice.description_hash {
        let expected = hex::encode(sha256::Hash::hash(metadata_str.as_bytes()).to_byte_array());
        if *hash != expected {
            return Err(SdkError::Invoice(
                "description hash does not match LNURL metadata".to_string(),
            ));
        }
    }
    Ok(invoice)
}

/// Classifies the callback body and validates a successful response.
pub fn parse_callback_response(
    body: &str,
    req: &LnUrlPayRequest,
    network: Network,
) -> SdkResult<ValidatedCallbackResponse> {
    if let Some(data) = super::error_status(body) {
        return Ok(ValidatedCallbackResponse::EndpointError { data });
    }
    let mut resp: CallbackResponse = serde_json::from_str(body)
        .map_err(|e| SdkError::parse(format!("malformed LNURL-pay callback response: {e}")))?;
    if let Some(action) = resp.success_action.take() {
        resp.success_action = Some(
            action.validate(&req.data, req.validate_success_action_url.unwrap_or(true))?,
        );
    }
    let invoice = validate_invoice(req.amount_msat, &resp.pr, &req.data.metadata_str, network)?;
    Ok(ValidatedCallbackResponse::EndpointSuccess {
        data: resp,
        invoice,
    })
}
