use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Reference to an output of a previous transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct OutPoint {
    pub txid: [u8; 32],
    pub index: u32,
}

impl OutPoint {
    pub fn new(txid: [u8; 32], index: u32) -> Self {
        Self { txid, index }
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransactionInput {
    pub previous_outpoint: OutPoint,
    pub signature_script: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

impl TransactionInput {
    pub fn new(previous_outpoint: OutPoint, signature_script: Vec<u8>, sequence: u32) -> Self {
        Self { previous_outpoint, signature_script, sequence, witness: vec![] }
    }

    /// Serialized size of the witness stack: compact size of the element
    /// count followed by each element with a compact size length prefix.
    /// This feeds the tapscript signature operations budget.
    pub fn witness_serialized_size(&self) -> usize {
        var_int_size(self.witness.len() as u64)
            + self.witness.iter().map(|elem| var_int_size(elem.len() as u64) + elem.len()).sum::<usize>()
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TransactionOutput {
    pub value: i64,
    pub script_public_key: Vec<u8>,
}

impl TransactionOutput {
    pub fn new(value: i64, script_public_key: Vec<u8>) -> Self {
        Self { value, script_public_key }
    }
}

/// Immutable snapshot of the transaction under validation.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(version: i32, inputs: Vec<TransactionInput>, outputs: Vec<TransactionOutput>, lock_time: u32) -> Self {
        Self { version, inputs, outputs, lock_time }
    }

    /// Transaction id: double SHA-256 over the witness-less serialization.
    pub fn id(&self) -> [u8; 32] {
        let serialized = self.serialize_no_witness();
        let first = Sha256::digest(&serialized);
        Sha256::digest(first).into()
    }

    fn serialize_no_witness(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.base_size());
        buf.extend_from_slice(&self.version.to_le_bytes());
        write_var_int(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(&input.previous_outpoint.txid);
            buf.extend_from_slice(&input.previous_outpoint.index.to_le_bytes());
            write_var_int(&mut buf, input.signature_script.len() as u64);
            buf.extend_from_slice(&input.signature_script);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_var_int(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            write_var_int(&mut buf, output.script_public_key.len() as u64);
            buf.extend_from_slice(&output.script_public_key);
        }
        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        buf
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    /// Serialized size without witness data.
    pub fn base_size(&self) -> usize {
        let mut size = 4 + 4; // version + lock time
        size += var_int_size(self.inputs.len() as u64);
        for input in &self.inputs {
            size += 32 + 4 + var_int_size(input.signature_script.len() as u64) + input.signature_script.len() + 4;
        }
        size += var_int_size(self.outputs.len() as u64);
        for output in &self.outputs {
            size += 8 + var_int_size(output.script_public_key.len() as u64) + output.script_public_key.len();
        }
        size
    }

    /// Serialized size including witness data, marker and flag.
    pub fn total_size(&self) -> usize {
        if !self.has_witness() {
            return self.base_size();
        }
        self.base_size() + 2 + self.inputs.iter().map(|input| input.witness_serialized_size()).sum::<usize>()
    }

    /// BIP-141 transaction weight.
    pub fn weight(&self) -> u64 {
        (self.base_size() * 3 + self.total_size()) as u64
    }
}

pub(crate) fn write_var_int(buf: &mut Vec<u8>, value: u64) {
    if value < 0xfd {
        buf.push(value as u8);
    } else if value <= 0xffff {
        buf.push(0xfd);
        buf.extend_from_slice(&(value as u16).to_le_bytes());
    } else if value <= 0xffffffff {
        buf.push(0xfe);
        buf.extend_from_slice(&(value as u32).to_le_bytes());
    } else {
        buf.push(0xff);
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

pub(crate) fn var_int_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffffffff => 5,
        _ => 9,
    }
}

/// The previous output an input spends: its value and locking script.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UtxoEntry {
    pub amount: i64,
    pub script_public_key: Vec<u8>,
}

impl UtxoEntry {
    pub fn new(amount: i64, script_public_key: Vec<u8>) -> Self {
        Self { amount, script_public_key }
    }
}

/// Read-only resolver of the outputs referenced by the transaction's inputs.
/// The sighash algorithm commits to every spent output, so the fetcher must
/// cover all of them.
pub trait PrevOutputFetcher {
    fn fetch_prev_output(&self, outpoint: &OutPoint) -> Option<&UtxoEntry>;
}

/// Map-backed fetcher, convenient for callers that gathered the spent
/// outputs up front.
#[derive(Default)]
pub struct MultiPrevOutFetcher {
    entries: HashMap<OutPoint, UtxoEntry>,
}

impl MultiPrevOutFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, outpoint: OutPoint, entry: UtxoEntry) {
        self.entries.insert(outpoint, entry);
    }
}

impl PrevOutputFetcher for MultiPrevOutFetcher {
    fn fetch_prev_output(&self, outpoint: &OutPoint) -> Option<&UtxoEntry> {
        self.entries.get(outpoint)
    }
}

impl FromIterator<(OutPoint, UtxoEntry)> for MultiPrevOutFetcher {
    fn from_iter<T: IntoIterator<Item = (OutPoint, UtxoEntry)>>(iter: T) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_input_tx() -> Transaction {
        Transaction::new(1, vec![TransactionInput::new(OutPoint::default(), vec![], 0)], vec![], 0)
    }

    #[test]
    fn test_weight_no_witness() {
        // version(4) + in count(1) + outpoint(36) + empty sig script(1) +
        // sequence(4) + out count(1) + lock time(4) = 51 bytes base.
        let tx = single_input_tx();
        assert_eq!(tx.base_size(), 51);
        assert_eq!(tx.total_size(), 51);
        assert_eq!(tx.weight(), 204);
    }

    #[test]
    fn test_weight_counts_witness_once() {
        let mut tx = single_input_tx();
        tx.inputs[0].witness = vec![vec![0xab; 64]];
        // witness: count(1) + len(1) + 64, plus marker and flag.
        assert_eq!(tx.total_size(), 51 + 2 + 66);
        assert_eq!(tx.weight(), 51 * 3 + 119);
    }

    #[test]
    fn test_txid_ignores_witness() {
        let mut tx = single_input_tx();
        let id = tx.id();
        tx.inputs[0].witness = vec![vec![1, 2, 3]];
        assert_eq!(tx.id(), id);
    }

    #[test]
    fn test_var_int_boundaries() {
        for (value, size) in [(0u64, 1), (0xfc, 1), (0xfd, 3), (0xffff, 3), (0x10000, 5), (0xffffffff, 5), (0x100000000, 9)] {
            let mut buf = vec![];
            write_var_int(&mut buf, value);
            assert_eq!(buf.len(), size, "var int size mismatch for {value:#x}");
            assert_eq!(var_int_size(value), size);
        }
    }
}
