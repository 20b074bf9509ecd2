use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context as _, Result};
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};

pub const PAYEE_KEY: [u8; 32] = [0x11; 32];

pub struct InvoiceSpec {
    pub preimage: [u8; 32],
    /// Overrides the hash of `preimage`, for hold invoices.
    pub payment_hash: Option<sha256::Hash>,
    pub amount_msat: Option<u64>,
    pub description: String,
    /// Commits to a description instead of carrying `description`.
    pub description_hash: Option<sha256::Hash>,
    pub created_at: Duration,
    pub expiry: Duration,
    pub signer: [u8; 32],
}

impl Default for InvoiceSpec {
    fn default() -> Self {
        Self {
            preimage: [0x42; 32],
            payment_hash: None,
            amount_msat: Some(100_000),
            description: "coffee".to_string(),
            description_hash: None,
            created_at: now(),
            expiry: Duration::from_secs(3600),
            signer: PAYEE_KEY,
        }
    }
}

pub fn now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

pub fn payment_hash(preimage: &[u8; 32]) -> String {
    hex::encode(sha256::Hash::hash(preimage).to_byte_array())
}

pub fn pubkey_hex(secret: &[u8; 32]) -> String {
    let secp = Secp256k1::new();
    let key = SecretKey::from_slice(secret).expect("valid secret key");
    PublicKey::from_secret_key(&secp, &key).to_string()
}

/// Signed regtest BOLT11 invoice.
pub fn regtest_invoice(spec: InvoiceSpec) -> Result<String> {
    let secp = Secp256k1::new();
    let key = SecretKey::from_slice(&spec.signer).context("signer key")?;
    let builder = InvoiceBuilder::new(Currency::Regtest);
    let builder = match spec.description_hash {
        Some(hash) => builder.description_hash(hash),
        None => builder.description(spec.description),
    };
    let builder = builder
        .payment_hash(
            spec.payment_hash
                .unwrap_or_else(|| sha256::Hash::hash(&spec.preimage)),
        )
        .payment_secret(PaymentSecret([0x24; 32]))
        .duration_since_epoch(spec.created_at)
        .expiry_time(spec.expiry)
        .min_final_cltv_expiry_delta(144);
    let invoice = match spec.amount_msat {
        Some(amount) => builder
            .amount_milli_satoshis(amount)
            .build_signed(|hash| secp.sign_ecdsa_recoverable(hash, &key)),
        None => builder.build_signed(|hash| secp.sign_ecdsa_recoverable(hash, &key)),
    }
    .map_err(|e| anyhow::anyhow!("build invoice: {e:?}"))?;
    Ok(invoice.to_string())
}

pub fn invoice_for(amount_msat: Option<u64>, preimage: [u8; 32]) -> String {
    regtest_invoice(InvoiceSpec {
        preimage,
        amount_msat,
        ..InvoiceSpec::default()
    })
    .expect("build invoice")
}
