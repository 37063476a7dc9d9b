use crate::opcodes::codes;
use crate::parse_script;
use smallvec::SmallVec;
use std::iter::once;

/// Inline-allocated script buffer, sized for the common taproot script.
pub type ScriptVec = SmallVec<[u8; 36]>;

/// Creates the output script paying to a taproot output key:
/// `OP_1 OP_DATA_32 <output key>`.
pub fn pay_to_taproot_script(output_key: &[u8; 32]) -> ScriptVec {
    SmallVec::from_iter(once(codes::Op1).chain(once(codes::OpData32)).chain(output_key.iter().copied()))
}

/// Extracts the witness version and program from a script public key, if
/// it has the canonical witness program shape: a version opcode followed by
/// a single 2-40 byte direct push.
pub fn extract_witness_program_info(script: &[u8]) -> Option<(u8, &[u8])> {
    if script.len() < 4 || script.len() > 42 {
        return None;
    }
    let version = match script[0] {
        codes::OpFalse => 0,
        version @ codes::OpTrue..=codes::Op16 => version - codes::OpTrue + 1,
        _ => return None,
    };
    let push_len = script[1] as usize;
    // A direct push opcode byte equals its data length.
    if !(2..=40).contains(&push_len) || script.len() != push_len + 2 {
        return None;
    }
    Some((version, &script[2..]))
}

pub fn is_witness_program(script: &[u8]) -> bool {
    extract_witness_program_info(script).is_some()
}

/// A signature script may only contain data pushes (opcodes up to OP_16).
pub fn is_push_only_script(script: &[u8]) -> bool {
    parse_script(script).all(|opcode| opcode.map_or(false, |opcode| opcode.is_push_opcode()))
}

pub mod test_helpers {
    use super::*;
    use crate::tx::{MultiPrevOutFetcher, OutPoint, Transaction, TransactionInput, TransactionOutput, UtxoEntry};
    use secp256k1::{Keypair, SECP256K1};

    /// Value of the canonical taproot outpoint spent by the test fixtures.
    pub const CANONICAL_PREV_OUT_VALUE: i64 = 1_000_000_000;

    /// A transaction with one input spending the canonical taproot outpoint
    /// (all-zero txid, index 0) and three outputs, the first of which pays
    /// to the all-zero taproot program.
    pub fn canonical_spend_tx() -> Transaction {
        Transaction::new(
            1,
            vec![TransactionInput::new(OutPoint::new([0u8; 32], 0), vec![], 0)],
            vec![
                TransactionOutput::new(1_000_000, pay_to_taproot_script(&[0u8; 32]).to_vec()),
                TransactionOutput::new(500_000, vec![]),
                TransactionOutput::new(200_000, vec![]),
            ],
            0,
        )
    }

    /// Resolves the canonical taproot outpoint to a 10 KAS-ish value locked
    /// by the all-zero taproot program.
    pub fn canonical_prev_outs() -> MultiPrevOutFetcher {
        let mut fetcher = MultiPrevOutFetcher::new();
        fetcher.add(
            OutPoint::new([0u8; 32], 0),
            UtxoEntry::new(CANONICAL_PREV_OUT_VALUE, pay_to_taproot_script(&[0u8; 32]).to_vec()),
        );
        fetcher
    }

    /// Deterministic keypair for signing fixtures. The seed must be a valid
    /// non-zero scalar, so keep it small.
    pub fn keypair_from_seed(seed: u8) -> Keypair {
        assert!(seed > 0 && seed < 0x80, "seed outside the trivially-valid scalar range");
        Keypair::from_seckey_slice(SECP256K1, &[seed; 32]).expect("a repeated low byte is a valid scalar")
    }
}
