//! LNURL decoding and the shared callback plumbing of LUD-03/04/06.

pub mod auth;
pub mod pay;
pub mod withdraw;

use bech32::FromBase32 as _;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{SdkError, SdkResult};

const PREFIXES: [&str; 3] = ["lnurlp", "lnurlw", "keyauth"];

/// A decoded LNURL endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LnUrlEndpoint {
    pub domain: String,
    pub url: Url,
    /// Lowercased `user@domain` when decoded from a lightning address.
    pub ln_address: Option<String>,
}

impl LnUrlEndpoint {
    pub fn is_auth(&self) -> bool {
        self.url
            .query_pairs()
            .any(|(k, v)| k == "tag" && v == "login")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LnUrlErrorData {
    pub reason: String,
}

/// Outcome of a callback that carries no payload beyond its status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LnUrlCallbackStatus {
    Ok,
    ErrorStatus { data: LnUrlErrorData },
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

/// `{"status":"ERROR","reason":..}` payload, if `body` is one.
pub fn error_status(body: &str) -> Option<LnUrlErrorData> {
    let resp: StatusResponse = serde_json::from_str(body).ok()?;
    resp.status.eq_ignore_ascii_case("ERROR").then(|| LnUrlErrorData {
        reason: resp.reason.unwrap_or_default(),
    })
}

pub fn parse_callback_status(body: &str) -> SdkResult<LnUrlCallbackStatus> {
    if let Some(data) = error_status(body) {
        return Ok(LnUrlCallbackStatus::ErrorStatus { data });
    }
    let resp: StatusResponse = serde_json::from_str(body)
        .map_err(|e| SdkError::parse(format!("malformed LNURL callback response: {e}")))?;
    if resp.status.eq_ignore_ascii_case("OK") {
        Ok(LnUrlCallbackStatus::Ok)
    } else {
        Err(SdkError::parse(format!("unknown LNURL status {}", resp.status)))
    }
}

/// Decodes a LUD-01 bech32 LNURL, a LUD-17 prefixed URL or a LUD-16 lightning address.
pub fn decode(input: &str) -> SdkResult<LnUrlEndpoint> {
    let input = input.trim();
    let input = input
        .strip_prefix("lightning:")
        .or_else(|| input.strip_prefix("LIGHTNING:"))
        .unwrap_or(input);

    if let Some(endpoint) = decode_ln_address(input)? {
        return Ok(endpoint);
    }

    if input.to_lowercase().starts_with("lnurl1") {
        let (_hrp, data, _variant) = bech32::decode(input)
            .map_err(|e| SdkError::parse(format!("invalid LNURL bech32: {e}")))?;
        let bytes = Vec::<u8>::from_base32(&data)
            .map_err(|e| SdkError::parse(format!("invalid LNURL payload: {e}")))?;
        let decoded = String::from_utf8(bytes)
            .map_err(|e| SdkError::parse(format!("LNURL is not UTF-8: {e}")))?;
        let url = Url::parse(&decoded).map_err(|e| SdkError::parse(format!("invalid LNURL: {e}")))?;
        let domain = domain_of(&url)?;
        let onion = domain.ends_with(".onion");
        match url.scheme() {
            "http" if !onion => {
                return Err(SdkError::parse("HTTP scheme only allowed for onion domains"));
            }
            "https" if onion => {
                return Err(SdkError::parse("HTTPS scheme not allowed for onion domains"));
            }
            "http" | "https" => {}
            other => return Err(SdkError::parse(format!("unsupported LNURL scheme {other}"))),
        }
        return Ok(LnUrlEndpoint {
            domain,
            url,
            ln_address: None,
        });
    }

    let mut normalized = input.to_string();
    for prefix in PREFIXES {
        let simple = format!("{prefix}:");
        let authority = format!("{prefix}://");
        if normalized.starts_with(&simple) && !normalized.starts_with(&authority) {
            normalized = normalized.replacen(&simple, &authority, 1);
            break;
        }
    }
    let url = Url::parse(&normalized).map_err(|e| SdkError::parse(format!("not an LNURL: {e}")))?;
    if !PREFIXES.contains(&url.scheme()) {
        return Err(SdkError::parse(format!("not an LNURL scheme: {}", url.scheme())));
    }
    let domain = domain_of(&url)?;
    let scheme = if domain.ends_with(".onion") { "http" } else { "https" };
    let rewritten = normalized.replacen(url.scheme(), scheme, 1);
    let url = Url::parse(&rewritten).map_err(|e| SdkError::parse(format!("invalid LNURL: {e}")))?;
    Ok(LnUrlEndpoint {
        domain,
        url,
        ln_address: None,
    })
}

fn decode_ln_address(input: &str) -> SdkResult<Option<LnUrlEndpoint>> {
    let Some((user, domain)) = input.split_once('@') else {
        return Ok(None);
    };
    if user.is_empty() || domain.is_empty() || domain.contains('@') || input.contains("://") {
        return Ok(None);
    }
    let user = user.to_lowercase();
    let user = user.strip_prefix('₿').unwrap_or(&user).to_string();
    let domain = domain.to_lowercase();
    if !user
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || ['-', '_', '.', '+'].contains(&c))
    {
        return Ok(None);
    }
    let scheme = if domain.ends_with(".onion") { "http" } else { "https" };
    let url = Url::parse(&format!("{scheme}://{domain}/.well-known/lnurlp/{user}"))
        .map_err(|e| SdkError::parse(format!("invalid lightning address: {e}")))?;
    Ok(Some(LnUrlEndpoint {
        ln_address: Some(format!("{user}@{domain}")),
        domain,
        url,
    }))
}

fn domain_of(url: &Url) -> SdkResult<String> {
    url.domain()
        .map(str::to_string)
        .ok_or_else(|| SdkError::parse(format!("LNURL has no domain: {url}")))
}

/// GETs an LNURL endpoint and returns the body, whatever its status code.
pub(crate) async fn fetch(http: &reqwest::Client, url: &str) -> SdkResult<String> {
    tracing::debug!(url, "LNURL request");
    let resp = http
        .get(url)
        .send()
        .await
        .map_err(|e| SdkError::BackendUnavailable(anyhow::anyhow!("GET {url}: {e}")))?;
    resp.text()
        .await
        .map_err(|e| SdkError::BackendUnavailable(anyhow::anyhow!("read body of {url}: {e}")))
}
