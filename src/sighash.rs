use crate::taproot::tagged_hash;
use crate::tx::{write_var_int, PrevOutputFetcher, Transaction, UtxoEntry};
use crate::TxScriptError;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

pub const SIG_HASH_DEFAULT: u8 = 0x00;
pub const SIG_HASH_ALL: u8 = 0x01;
pub const SIG_HASH_NONE: u8 = 0x02;
pub const SIG_HASH_SINGLE: u8 = 0x03;
pub const SIG_HASH_ANYONE_CAN_PAY: u8 = 0x80;

/// A validated tapscript sighash type. Only the BIP-341 set is accepted:
/// default, all, none, single, and the three anyone-can-pay combinations.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SigHashType(u8);

impl SigHashType {
    pub fn from_u8(value: u8) -> Result<Self, TxScriptError> {
        match value {
            SIG_HASH_DEFAULT | SIG_HASH_ALL | SIG_HASH_NONE | SIG_HASH_SINGLE => Ok(Self(value)),
            v if v & !SIG_HASH_ANYONE_CAN_PAY == SIG_HASH_ALL
                || v & !SIG_HASH_ANYONE_CAN_PAY == SIG_HASH_NONE
                || v & !SIG_HASH_ANYONE_CAN_PAY == SIG_HASH_SINGLE =>
            {
                Ok(Self(value))
            }
            _ => Err(TxScriptError::InvalidSigHashType(value)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self.0
    }

    pub fn is_anyone_can_pay(self) -> bool {
        self.0 & SIG_HASH_ANYONE_CAN_PAY != 0
    }

    /// The output commitment mode. Sighash-default is an alias for all.
    fn output_type(self) -> u8 {
        if self.0 == SIG_HASH_DEFAULT {
            SIG_HASH_ALL
        } else {
            self.0 & 0x03
        }
    }
}

/// Lazily computed intermediate hashes of the BIP-341 signature message.
///
/// One instance is built per transaction and may be shared by engines
/// validating different inputs of that transaction, including across
/// threads. Entries are computed once and reused; a cache hit and a miss
/// produce identical digests.
#[derive(Default)]
pub struct TxSigHashes {
    prevouts: OnceLock<[u8; 32]>,
    amounts: OnceLock<[u8; 32]>,
    script_pub_keys: OnceLock<[u8; 32]>,
    sequences: OnceLock<[u8; 32]>,
    outputs: OnceLock<[u8; 32]>,
}

impl TxSigHashes {
    pub fn new() -> Self {
        Self::default()
    }

    fn sha_prevouts(&self, tx: &Transaction) -> [u8; 32] {
        *self.prevouts.get_or_init(|| {
            let mut hasher = Sha256::new();
            for input in &tx.inputs {
                hasher.update(input.previous_outpoint.txid);
                hasher.update(input.previous_outpoint.index.to_le_bytes());
            }
            hasher.finalize().into()
        })
    }

    fn sha_amounts(&self, spent: &[&UtxoEntry]) -> [u8; 32] {
        *self.amounts.get_or_init(|| {
            let mut hasher = Sha256::new();
            for entry in spent {
                hasher.update(entry.amount.to_le_bytes());
            }
            hasher.finalize().into()
        })
    }

    fn sha_script_pub_keys(&self, spent: &[&UtxoEntry]) -> [u8; 32] {
        *self.script_pub_keys.get_or_init(|| {
            let mut hasher = Sha256::new();
            for entry in spent {
                let mut prefix = vec![];
                write_var_int(&mut prefix, entry.script_public_key.len() as u64);
                hasher.update(&prefix);
                hasher.update(&entry.script_public_key);
            }
            hasher.finalize().into()
        })
    }

    fn sha_sequences(&self, tx: &Transaction) -> [u8; 32] {
        *self.sequences.get_or_init(|| {
            let mut hasher = Sha256::new();
            for input in &tx.inputs {
                hasher.update(input.sequence.to_le_bytes());
            }
            hasher.finalize().into()
        })
    }

    fn sha_outputs(&self, tx: &Transaction) -> [u8; 32] {
        *self.outputs.get_or_init(|| {
            let mut hasher = Sha256::new();
            for output in &tx.outputs {
                hasher.update(serialize_output(&output.value, &output.script_public_key));
            }
            hasher.finalize().into()
        })
    }
}

fn serialize_output(value: &i64, script_public_key: &[u8]) -> Vec<u8> {
    let mut buf = vec![];
    buf.extend_from_slice(&value.to_le_bytes());
    write_var_int(&mut buf, script_public_key.len() as u64);
    buf.extend_from_slice(script_public_key);
    buf
}

fn spent_outputs<'a>(tx: &Transaction, prev_outs: &'a dyn PrevOutputFetcher) -> Result<Vec<&'a UtxoEntry>, TxScriptError> {
    tx.inputs
        .iter()
        .map(|input| {
            prev_outs.fetch_prev_output(&input.previous_outpoint).ok_or_else(|| {
                TxScriptError::InvalidState(format!(
                    "no spent output for outpoint {}:{}",
                    hex_txid(&input.previous_outpoint.txid),
                    input.previous_outpoint.index
                ))
            })
        })
        .collect()
}

fn hex_txid(txid: &[u8; 32]) -> String {
    txid.iter().map(|b| format!("{b:02x}")).collect()
}

/// Computes the BIP-341 signature message digest for the given input.
///
/// `tap_leaf` carries the tapscript message extension: the leaf hash and the
/// opcode position of the last executed code separator. `None` selects the
/// key-spend message.
pub fn calc_taproot_signature_hash(
    hash_cache: &TxSigHashes,
    hash_type: SigHashType,
    tx: &Transaction,
    input_index: usize,
    prev_outs: &dyn PrevOutputFetcher,
    annex: Option<&[u8]>,
    tap_leaf: Option<([u8; 32], u32)>,
) -> Result<[u8; 32], TxScriptError> {
    if input_index >= tx.inputs.len() {
        return Err(TxScriptError::InvalidIndex(input_index, tx.inputs.len()));
    }
    let spent = spent_outputs(tx, prev_outs)?;

    let mut msg = Vec::with_capacity(206);
    msg.push(hash_type.to_u8());
    msg.extend_from_slice(&tx.version.to_le_bytes());
    msg.extend_from_slice(&tx.lock_time.to_le_bytes());

    if !hash_type.is_anyone_can_pay() {
        msg.extend_from_slice(&hash_cache.sha_prevouts(tx));
        msg.extend_from_slice(&hash_cache.sha_amounts(&spent));
        msg.extend_from_slice(&hash_cache.sha_script_pub_keys(&spent));
        msg.extend_from_slice(&hash_cache.sha_sequences(tx));
    }
    if hash_type.output_type() == SIG_HASH_ALL {
        msg.extend_from_slice(&hash_cache.sha_outputs(tx));
    }

    let ext_flag: u8 = tap_leaf.is_some().into();
    let spend_type = ext_flag * 2 + u8::from(annex.is_some());
    msg.push(spend_type);

    if hash_type.is_anyone_can_pay() {
        let input = &tx.inputs[input_index];
        let entry = spent[input_index];
        msg.extend_from_slice(&input.previous_outpoint.txid);
        msg.extend_from_slice(&input.previous_outpoint.index.to_le_bytes());
        msg.extend_from_slice(&serialize_output(&entry.amount, &entry.script_public_key));
        msg.extend_from_slice(&input.sequence.to_le_bytes());
    } else {
        msg.extend_from_slice(&(input_index as u32).to_le_bytes());
    }

    if let Some(annex) = annex {
        let mut prefixed = vec![];
        write_var_int(&mut prefixed, annex.len() as u64);
        prefixed.extend_from_slice(annex);
        let sha_annex: [u8; 32] = Sha256::digest(&prefixed).into();
        msg.extend_from_slice(&sha_annex);
    }

    if hash_type.output_type() == SIG_HASH_SINGLE {
        let output =
            tx.outputs.get(input_index).ok_or(TxScriptError::InvalidOutputIndex(input_index as i64, tx.outputs.len()))?;
        let sha_single: [u8; 32] = Sha256::digest(serialize_output(&output.value, &output.script_public_key)).into();
        msg.extend_from_slice(&sha_single);
    }

    if let Some((leaf_hash, code_sep_pos)) = tap_leaf {
        msg.extend_from_slice(&leaf_hash);
        msg.push(0x00); // key version
        msg.extend_from_slice(&code_sep_pos.to_le_bytes());
    }

    // The message is committed under the TapSighash tag with a zero epoch.
    let mut tagged = Vec::with_capacity(1 + msg.len());
    tagged.push(0x00);
    tagged.extend_from_slice(&msg);
    Ok(tagged_hash(b"TapSighash", &tagged))
}
