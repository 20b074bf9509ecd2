use anyhow::{Context as _, Result};
use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use lightning::util::message_signing;

use crate::config::Network;

const NODE_KEY_INDEX: u32 = 0;

/// Keys derived from the caller's seed.
#[derive(Clone)]
pub struct NodeIdentity {
    master: Xpriv,
    node_pubkey: PublicKey,
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_pubkey", &self.node_pubkey)
            .finish_non_exhaustive()
    }
}

impl NodeIdentity {
    pub fn from_seed(seed: &[u8], network: Network) -> Result<Self> {
        anyhow::ensure!(seed.len() >= 16, "seed must be at least 16 bytes");
        let master = Xpriv::new_master(bitcoin::Network::from(network), seed)
            .context("derive master key from seed")?;
        let node_key = derive_secret_key(&master, NODE_KEY_INDEX)?;
        let node_pubkey = PublicKey::from_secret_key(&Secp256k1::new(), &node_key);
        Ok(Self {
            master,
            node_pubkey,
        })
    }

    pub fn node_pubkey(&self) -> PublicKey {
        self.node_pubkey
    }

    pub fn master(&self) -> &Xpriv {
        &self.master
    }

    /// Signs `message` with the node key in the zbase32 format Lightning
    /// nodes use for signed messages.
    pub fn sign_message(&self, message: &str) -> Result<String> {
        let node_key = derive_secret_key(&self.master, NODE_KEY_INDEX)?;
        Ok(message_signing::sign(message.as_bytes(), &node_key))
    }

    pub fn derive(&self, path: &DerivationPath) -> Result<Xpriv> {
        self.master
            .derive_priv(&Secp256k1::new(), path)
            .with_context(|| format!("derive {path}"))
    }
}

pub fn derive_secret_key(master: &Xpriv, index: u32) -> Result<SecretKey> {
    let child = ChildNumber::from_hardened_idx(index).context("invalid derivation index")?;
    let path = DerivationPath::from(vec![child]);
    let xprv = master
        .derive_priv(&Secp256k1::new(), &path)
        .context("derive xprv")?;
    Ok(xprv.private_key)
}

/// Whether `signature` over `message` was made by the node key `pubkey`.
pub fn check_message(message: &str, pubkey: &str, signature: &str) -> Result<bool> {
    let pubkey = pubkey
        .parse::<PublicKey>()
        .with_context(|| format!("invalid public key {pubkey}"))?;
    Ok(message_signing::verify(message.as_bytes(), signature, &pubkey))
}
