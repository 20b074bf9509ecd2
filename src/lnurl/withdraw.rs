//! LNURL-withdraw (LUD-03).

use serde::{Deserialize, Serialize};
use url::Url;

use super::{LnUrlCallbackStatus, LnUrlErrorData};
use crate::error::{SdkError, SdkResult};
use crate::lightning::invoice::LnInvoice;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LnUrlWithdrawRequestData {
    pub callback: String,
    pub k1: String,
    pub default_description: String,
    pub min_withdrawable: u64,
    pub max_withdrawable: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LnUrlWithdrawRequest {
    pub data: LnUrlWithdrawRequestData,
    pub amount_msat: u64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LnUrlWithdrawResult {
    Ok { data: LnUrlWithdrawSuccessData },
    ErrorStatus { data: LnUrlErrorData },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LnUrlWithdrawSuccessData {
    pub invoice: LnInvoice,
}

impl LnUrlWithdrawResult {
    pub fn from_status(status: LnUrlCallbackStatus, invoice: LnInvoice) -> Self {
        match status {
            LnUrlCallbackStatus::Ok => LnUrlWithdrawResult::Ok {
                data: LnUrlWithdrawSuccessData { invoice },
            },
            LnUrlCallbackStatus::ErrorStatus { data } => LnUrlWithdrawResult::ErrorStatus { data },
        }
    }
}

pub fn validate_amount(amount_msat: u64, data: &LnUrlWithdrawRequestData) -> SdkResult<()> {
    if !(data.min_withdrawable..=data.max_withdrawable).contains(&amount_msat) {
        return Err(SdkError::InvalidAmount(format!(
            "{amount_msat} msat outside of [{}, {}]",
            data.min_withdrawable, data.max_withdrawable
        )));
    }
    Ok(())
}

pub fn build_withdraw_callback_url(
    data: &LnUrlWithdrawRequestData,
    bolt11: &str,
) -> SdkResult<String> {
    let mut url = Url::parse(&data.callback)
        .map_err(|e| SdkError::parse(format!("invalid LNURL-withdraw callback: {e}")))?;
    url.query_pairs_mut()
        .append_pair("k1", &data.k1)
        .append_pair("pr", bolt11);
    Ok(url.to_string())
}
