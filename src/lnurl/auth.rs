//! LNURL-auth (LUD-04) with LUD-05 linking keys.

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::hashes::{Hash as _, HashEngine as _, hmac, sha256};
use bitcoin::secp256k1::{Message, Secp256k1};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{SdkError, SdkResult};

const ACTIONS: [&str; 4] = ["register", "login", "link", "auth"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LnUrlAuthRequestData {
    /// Hex-encoded 32-byte challenge.
    pub k1: String,
    pub action: Option<String>,
    pub domain: String,
    pub url: String,
}

pub fn validate_request(domain: String, url: &Url) -> SdkResult<LnUrlAuthRequestData> {
    let param = |name: &str| {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    };
    let k1 = param("k1").ok_or_else(|| SdkError::parse("LNURL-auth k1 missing"))?;
    let k1_bytes =
        hex::decode(&k1).map_err(|e| SdkError::parse(format!("LNURL-auth k1: {e}")))?;
    if k1_bytes.len() != 32 {
        return Err(SdkError::parse("LNURL-auth k1 must be 32 bytes"));
    }
    let action = param("action");
    if let Some(action) = &action
        && !ACTIONS.contains(&action.as_str())
    {
        return Err(SdkError::parse(format!("unknown LNURL-auth action {action}")));
    }
    Ok(LnUrlAuthRequestData {
        k1,
        action,
        domain,
        url: url.to_string(),
    })
}

/// `m/138'/<l1>/<l2>/<l3>/<l4>`, the longs taken from HMAC-SHA256(hashing key, domain).
pub fn linking_path(master: &Xpriv, domain: &str) -> SdkResult<DerivationPath> {
    let secp = Secp256k1::new();
    let hashing_path = DerivationPath::from(vec![
        hardened(138)?,
        ChildNumber::from_normal_idx(0).map_err(SdkError::generic)?,
    ]);
    let hashing_key = master
        .derive_priv(&secp, &hashing_path)
        .map_err(SdkError::generic)?;

    let mut engine = hmac::HmacEngine::<sha256::Hash>::new(&hashing_key.private_key.secret_bytes());
    engine.input(domain.as_bytes());
    let mac = hmac::Hmac::<sha256::Hash>::from_engine(engine).to_byte_array();

    let mut path = vec![hardened(138)?];
    for chunk in mac[..16].chunks_exact(4) {
        let long = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        path.push(ChildNumber::from(long));
    }
    Ok(DerivationPath::from(path))
}

fn hardened(index: u32) -> SdkResult<ChildNumber> {
    ChildNumber::from_hardened_idx(index).map_err(SdkError::generic)
}

/// Callback URL with `sig` (DER signature of k1) and `key` (linking pubkey) appended.
pub fn build_auth_callback_url(master: &Xpriv, req: &LnUrlAuthRequestData) -> SdkResult<String> {
    let secp = Secp256k1::new();
    let path = linking_path(master, &req.domain)?;
    let linking_key = master.derive_priv(&secp, &path).map_err(SdkError::generic)?;

    let k1: [u8; 32] = hex::decode(&req.k1)
        .map_err(|e| SdkError::parse(format!("LNURL-auth k1: {e}")))?
        .try_into()
        .map_err(|_| SdkError::parse("LNURL-auth k1 must be 32 bytes"))?;
    let sig = secp.sign_ecdsa(&Message::from_digest(k1), &linking_key.private_key);
    let pubkey = linking_key.private_key.public_key(&secp);

    let mut url = Url::parse(&req.url)
        .map_err(|e| SdkError::parse(format!("invalid LNURL-auth url: {e}")))?;
    url.query_pairs_mut()
        .append_pair("sig", &hex::encode(sig.serialize_der()))
        .append_pair("key", &pubkey.to_string());
    Ok(url.to_string())
}
