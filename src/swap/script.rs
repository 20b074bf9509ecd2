use anyhow::{Context as _, Result, anyhow};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::{Hash as _, ripemd160};
use bitcoin::opcodes::all as op;
use bitcoin::script::{Builder, Instruction, PushBytes};
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Witness,
};

const DUMMY_SIGNATURE_LEN: usize = 73;
const DUST_LIMIT_SATS: u64 = 546;

/// Submarine swap lockup script:
/// `HASH160 <ripemd160(payment_hash)> EQUAL IF <swapper>
/// ELSE <lock> CSV DROP <payer> ENDIF CHECKSIG`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmarineSwapScript {
    pub hash160: [u8; 20],
    pub swapper_pubkey: PublicKey,
    pub payer_pubkey: PublicKey,
    pub lock_height: u32,
}

impl SubmarineSwapScript {
    pub fn new(
        payment_hash: &[u8; 32],
        swapper_pubkey: PublicKey,
        payer_pubkey: PublicKey,
        lock_height: u32,
    ) -> Self {
        Self {
            hash160: ripemd160::Hash::hash(payment_hash).to_byte_array(),
            swapper_pubkey,
            payer_pubkey,
            lock_height,
        }
    }

    pub fn witness_script(&self) -> Result<ScriptBuf> {
        Ok(Builder::new()
            .push_opcode(op::OP_HASH160)
            .push_slice(push_bytes(&self.hash160)?)
            .push_opcode(op::OP_EQUAL)
            .push_opcode(op::OP_IF)
            .push_key(&bitcoin::PublicKey::new(self.swapper_pubkey))
            .push_opcode(op::OP_ELSE)
            .push_int(i64::from(self.lock_height))
            .push_opcode(op::OP_CSV)
            .push_opcode(op::OP_DROP)
            .push_key(&bitcoin::PublicKey::new(self.payer_pubkey))
            .push_opcode(op::OP_ENDIF)
            .push_opcode(op::OP_CHECKSIG)
            .into_script())
    }

    pub fn p2wsh_address(&self, network: Network) -> Result<Address> {
        Ok(Address::p2wsh(&self.witness_script()?, network))
    }

    pub fn parse_witness_script(witness_script: &Script) -> Result<Self> {
        let mut iter = witness_script.instructions_minimal();

        expect_op(next_instruction(&mut iter)?, op::OP_HASH160)?;
        let hash160 = expect_push::<20>(next_instruction(&mut iter)?)?;
        expect_op(next_instruction(&mut iter)?, op::OP_EQUAL)?;
        expect_op(next_instruction(&mut iter)?, op::OP_IF)?;
        let swapper_pubkey = expect_pubkey(next_instruction(&mut iter)?)?;
        expect_op(next_instruction(&mut iter)?, op::OP_ELSE)?;
        let lock_height = parse_script_num(next_instruction(&mut iter)?)?;
        anyhow::ensure!(
            (1..=i64::from(u16::MAX)).contains(&lock_height),
            "relative lock out of range: {lock_height}"
        );
        expect_op(next_instruction(&mut iter)?, op::OP_CSV)?;
        expect_op(next_instruction(&mut iter)?, op::OP_DROP)?;
        let payer_pubkey = expect_pubkey(next_instruction(&mut iter)?)?;
        expect_op(next_instruction(&mut iter)?, op::OP_ENDIF)?;
        expect_op(next_instruction(&mut iter)?, op::OP_CHECKSIG)?;
        anyhow::ensure!(
            iter.next().is_none(),
            "unexpected trailing instructions in witness script"
        );

        Ok(Self {
            hash160,
            swapper_pubkey,
            payer_pubkey,
            lock_height: lock_height as u32,
        })
    }

    pub fn commits_to(&self, payment_hash: &[u8; 32]) -> bool {
        ripemd160::Hash::hash(payment_hash).to_byte_array() == self.hash160
    }
}

/// Reverse swap lockup script:
/// `SIZE 32 EQUAL IF HASH160 <ripemd160(hash)> EQUALVERIFY <claim>
/// ELSE DROP <timeout> CLTV DROP <refund> ENDIF CHECKSIG`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseSwapScript {
    pub hash160: [u8; 20],
    pub claim_pubkey: PublicKey,
    pub refund_pubkey: PublicKey,
    pub timeout_height: u32,
}

impl ReverseSwapScript {
    pub fn witness_script(&self) -> Result<ScriptBuf> {
        Ok(Builder::new()
            .push_opcode(op::OP_SIZE)
            .push_int(32)
            .push_opcode(op::OP_EQUAL)
            .push_opcode(op::OP_IF)
            .push_opcode(op::OP_HASH160)
            .push_slice(push_bytes(&self.hash160)?)
            .push_opcode(op::OP_EQUALVERIFY)
            .push_key(&bitcoin::PublicKey::new(self.claim_pubkey))
            .push_opcode(op::OP_ELSE)
            .push_opcode(op::OP_DROP)
            .push_int(i64::from(self.timeout_height))
            .push_opcode(op::OP_CLTV)
            .push_opcode(op::OP_DROP)
            .push_key(&bitcoin::PublicKey::new(self.refund_pubkey))
            .push_opcode(op::OP_ENDIF)
            .push_opcode(op::OP_CHECKSIG)
            .into_script())
    }

    pub fn p2wsh_address(&self, network: Network) -> Result<Address> {
        Ok(Address::p2wsh(&self.witness_script()?, network))
    }

    pub fn hash160_of(payment_hash: &[u8; 32]) -> [u8; 20] {
        ripemd160::Hash::hash(payment_hash).to_byte_array()
    }

    pub fn parse_witness_script(witness_script: &Script) -> Result<Self> {
        let mut iter = witness_script.instructions_minimal();

        expect_op(next_instruction(&mut iter)?, op::OP_SIZE)?;
        let size = parse_script_num(next_instruction(&mut iter)?)?;
        anyhow::ensure!(size == 32, "unexpected preimage size check: {size}");
        expect_op(next_instruction(&mut iter)?, op::OP_EQUAL)?;
        expect_op(next_instruction(&mut iter)?, op::OP_IF)?;
        expect_op(next_instruction(&mut iter)?, op::OP_HASH160)?;
        let hash160 = expect_push::<20>(next_instruction(&mut iter)?)?;
        expect_op(next_instruction(&mut iter)?, op::OP_EQUALVERIFY)?;
        let claim_pubkey = expect_pubkey(next_instruction(&mut iter)?)?;
        expect_op(next_instruction(&mut iter)?, op::OP_ELSE)?;
        expect_op(next_instruction(&mut iter)?, op::OP_DROP)?;
        let timeout_height = parse_script_num(next_instruction(&mut iter)?)?;
        anyhow::ensure!(
            timeout_height >= 0 && timeout_height <= i64::from(u32::MAX),
            "timeout height out of range: {timeout_height}"
        );
        expect_op(next_instruction(&mut iter)?, op::OP_CLTV)?;
        expect_op(next_instruction(&mut iter)?, op::OP_DROP)?;
        let refund_pubkey = expect_pubkey(next_instruction(&mut iter)?)?;
        expect_op(next_instruction(&mut iter)?, op::OP_ENDIF)?;
        expect_op(next_instruction(&mut iter)?, op::OP_CHECKSIG)?;
        anyhow::ensure!(
            iter.next().is_none(),
            "unexpected trailing instructions in witness script"
        );

        Ok(Self {
            hash160,
            claim_pubkey,
            refund_pubkey,
            timeout_height: timeout_height as u32,
        })
    }
}

/// A P2WSH output being spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendInput {
    pub out: OutPoint,
    pub value: u64,
}

/// How the lockup script is satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpendPath {
    /// `<sig> <preimage>`, no timelock.
    Preimage,
    /// `<sig> <empty>`, relative timelock in `sequence`.
    Timeout { sequence: Sequence },
}

/// Unsigned transaction sweeping `inputs` to `destination`, with the fee set from `sat_per_vbyte`.
fn build_sweep(
    inputs: &[SpendInput],
    destination: &Address,
    witness_script: &Script,
    path: SpendPath,
    sat_per_vbyte: u32,
) -> Result<(Transaction, u64)> {
    anyhow::ensure!(!inputs.is_empty(), "no outputs to spend");
    let total: u64 = inputs.iter().map(|i| i.value).sum();

    let sequence = match path {
        SpendPath::Preimage => Sequence::ENABLE_RBF_NO_LOCKTIME,
        SpendPath::Timeout { sequence } => sequence,
    };
    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|i| TxIn {
                previous_output: i.out,
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::new(),
            })
            .collect(),
        output: vec![TxOut {
            value: Amount::from_sat(total),
            script_pubkey: destination.script_pubkey(),
        }],
    };

    let second_item_len = match path {
        SpendPath::Preimage => 32,
        SpendPath::Timeout { .. } => 0,
    };
    for input in &mut tx.input {
        input.witness = Witness::from_slice(&[
            vec![0u8; DUMMY_SIGNATURE_LEN],
            vec![0u8; second_item_len],
            witness_script.to_bytes(),
        ]);
    }
    let vsize = tx.vsize() as u64;
    let fee = vsize * u64::from(sat_per_vbyte);
    anyhow::ensure!(
        total > fee + DUST_LIMIT_SATS,
        "amount {total} sat does not cover fee {fee} sat"
    );
    tx.output[0].value = Amount::from_sat(total - fee);
    for input in &mut tx.input {
        input.witness = Witness::new();
    }
    Ok((tx, vsize))
}

/// Virtual size of a refund or claim sweep, without signing.
pub fn estimate_sweep_vsize(
    inputs: &[SpendInput],
    destination: &Address,
    witness_script: &Script,
    with_preimage: bool,
) -> Result<u64> {
    let path = if with_preimage {
        SpendPath::Preimage
    } else {
        SpendPath::Timeout {
            sequence: Sequence::ZERO,
        }
    };
    let (_, vsize) = build_sweep(inputs, destination, witness_script, path, 0)?;
    Ok(vsize)
}

/// Unilateral refund of a submarine swap after its relative timelock.
pub fn refund_tx(
    script: &SubmarineSwapScript,
    inputs: &[SpendInput],
    destination: &Address,
    payer_secret_key: &SecretKey,
    sat_per_vbyte: u32,
) -> Result<Transaction> {
    let witness_script = script.witness_script()?;
    let lock = u16::try_from(script.lock_height).context("relative lock exceeds 16 bits")?;
    let (mut tx, _) = build_sweep(
        inputs,
        destination,
        &witness_script,
        SpendPath::Timeout {
            sequence: Sequence::from_height(lock),
        },
        sat_per_vbyte,
    )?;

    let secp = Secp256k1::new();
    let sigs = sign_inputs(&secp, &tx, inputs, &witness_script, payer_secret_key)?;
    for (input, sig) in tx.input.iter_mut().zip(sigs) {
        input.witness = Witness::from_slice(&[sig, Vec::new(), witness_script.to_bytes()]);
    }
    Ok(tx)
}

/// Refund of a submarine swap through the swapper's key; the swapper signs it.
pub fn cooperative_refund_unsigned(
    script: &SubmarineSwapScript,
    inputs: &[SpendInput],
    destination: &Address,
    sat_per_vbyte: u32,
) -> Result<Transaction> {
    let witness_script = script.witness_script()?;
    let (tx, _) = build_sweep(
        inputs,
        destination,
        &witness_script,
        SpendPath::Preimage,
        sat_per_vbyte,
    )?;
    Ok(tx)
}

/// Completes a cooperative refund with the swapper's signatures, one per input.
pub fn finalize_cooperative_refund(
    script: &SubmarineSwapScript,
    mut tx: Transaction,
    swapper_signatures: Vec<Vec<u8>>,
    preimage: &[u8; 32],
) -> Result<Transaction> {
    anyhow::ensure!(
        swapper_signatures.len() == tx.input.len(),
        "expected {} swapper signatures, got {}",
        tx.input.len(),
        swapper_signatures.len()
    );
    let witness_script = script.witness_script()?;
    for (input, sig) in tx.input.iter_mut().zip(swapper_signatures) {
        input.witness = Witness::from_slice(&[sig, preimage.to_vec(), witness_script.to_bytes()]);
    }
    Ok(tx)
}

/// Claim of a reverse swap lockup output with the preimage.
pub fn claim_tx(
    witness_script: &Script,
    lockup: SpendInput,
    destination: &Address,
    output_sats: u64,
    claim_secret_key: &SecretKey,
    preimage: &[u8; 32],
) -> Result<Transaction> {
    anyhow::ensure!(
        output_sats >= DUST_LIMIT_SATS && output_sats < lockup.value,
        "claim output {output_sats} sat invalid for lockup of {} sat",
        lockup.value
    );
    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: lockup.out,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(output_sats),
            script_pubkey: destination.script_pubkey(),
        }],
    };

    let secp = Secp256k1::new();
    let sigs = sign_inputs(&secp, &tx, &[lockup], witness_script, claim_secret_key)?;
    for (input, sig) in tx.input.iter_mut().zip(sigs) {
        input.witness = Witness::from_slice(&[sig, preimage.to_vec(), witness_script.to_bytes()]);
    }
    Ok(tx)
}

fn sign_inputs(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    inputs: &[SpendInput],
    witness_script: &Script,
    secret_key: &SecretKey,
) -> Result<Vec<Vec<u8>>> {
    let mut cache = SighashCache::new(tx);
    inputs
        .iter()
        .enumerate()
        .map(|(index, input)| {
            let sighash = cache
                .p2wsh_signature_hash(
                    index,
                    witness_script,
                    Amount::from_sat(input.value),
                    EcdsaSighashType::All,
                )
                .with_context(|| format!("sighash input {index}"))?;
            let msg = Message::from_digest(sighash.to_byte_array());
            let sig = secp.sign_ecdsa(&msg, secret_key);
            Ok(bitcoin::ecdsa::Signature::sighash_all(sig).to_vec())
        })
        .collect()
}

fn push_bytes(bytes: &[u8]) -> Result<&PushBytes> {
    <&PushBytes>::try_from(bytes).map_err(|e| anyhow!("script push too large: {e:?}"))
}

fn next_instruction<'a>(
    iter: &mut impl Iterator<Item = Result<Instruction<'a>, bitcoin::script::Error>>,
) -> Result<Instruction<'a>> {
    iter.next()
        .transpose()
        .map_err(|e| anyhow!("decode witness script instruction: {e:?}"))?
        .context("unexpected end of witness script")
}

fn expect_op(actual: Instruction<'_>, expected: bitcoin::Opcode) -> Result<()> {
    match actual {
        Instruction::Op(o) if o == expected => Ok(()),
        other => anyhow::bail!("unexpected instruction: expected {expected:?}, got {other:?}"),
    }
}

fn expect_push<const N: usize>(actual: Instruction<'_>) -> Result<[u8; N]> {
    match actual {
        Instruction::PushBytes(bytes) if bytes.len() == N => {
            let mut out = [0u8; N];
            out.copy_from_slice(bytes.as_bytes());
            Ok(out)
        }
        other => anyhow::bail!("unexpected instruction: expected push {N} bytes, got {other:?}"),
    }
}

fn expect_pubkey(actual: Instruction<'_>) -> Result<PublicKey> {
    let bytes = expect_push::<33>(actual)?;
    PublicKey::from_slice(&bytes).context("invalid public key in witness script")
}

fn parse_script_num(actual: Instruction<'_>) -> Result<i64> {
    match actual {
        Instruction::PushBytes(bytes) => decode_script_num(bytes.as_bytes()),
        Instruction::Op(o) => {
            let code = o.to_u8();
            if code == op::OP_PUSHNUM_NEG1.to_u8() {
                return Ok(-1);
            }
            let one = op::OP_PUSHNUM_1.to_u8();
            let sixteen = op::OP_PUSHNUM_16.to_u8();
            if (one..=sixteen).contains(&code) {
                return Ok(i64::from(code - one + 1));
            }
            anyhow::bail!("unexpected opcode where script number expected: {o:?}");
        }
    }
}

fn decode_script_num(bytes: &[u8]) -> Result<i64> {
    if bytes.is_empty() {
        return Ok(0);
    }
    anyhow::ensure!(bytes.len() <= 8, "script number too large: {} bytes", bytes.len());

    let mut magnitude = bytes.to_vec();
    let negative = magnitude.last().is_some_and(|b| (b & 0x80) != 0);
    if let Some(last) = magnitude.last_mut() {
        *last &= 0x7f;
    }

    let mut value: i64 = 0;
    for (i, b) in magnitude.iter().enumerate() {
        value |= i64::from(*b) << (8 * i);
    }
    Ok(if negative { -value } else { value })
}
