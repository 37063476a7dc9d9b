extern crate core;

pub mod asset;
pub mod caches;
pub(crate) mod data_stack;
pub(crate) mod midstate;
pub mod opcodes;
pub mod script_builder;
pub mod sighash;
pub mod standard;
pub mod taproot;
pub mod tx;

use crate::asset::AssetPacket;
use crate::data_stack::{DataStack, Stack};
use crate::opcodes::{codes, deserialize_next_opcode, OpCodeImplementation, OpCond};
use crate::sighash::{calc_taproot_signature_hash, SigHashType, TxSigHashes, SIG_HASH_DEFAULT};
use crate::standard::{extract_witness_program_info, is_push_only_script, is_witness_program};
use crate::taproot::{tap_leaf_hash, verify_taproot_leaf_commitment, ControlBlock, BASE_LEAF_VERSION, TAPROOT_ANNEX_TAG};
use crate::tx::{OutPoint, PrevOutputFetcher, Transaction, TransactionInput, UtxoEntry};
use secp256k1::{schnorr, Message, XOnlyPublicKey, SECP256K1};

pub use crate::caches::{SigCache, SigCacheKey};
pub use wren_txscript_errors::TxScriptError;

/// Combined limit on the data and alternate stacks.
pub const MAX_STACK_SIZE: usize = 1000;
/// Maximum size of a single script.
pub const MAX_SCRIPTS_SIZE: usize = 10_000;
/// Maximum size of an element pushed onto the stack.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Starting signature operations budget surplus, and the cost of each
/// executed signature check (BIP-342).
pub const SIG_OPS_DELTA: i32 = 50;

/// Lock times below this threshold are block heights, above it timestamps.
pub const LOCK_TIME_THRESHOLD: i64 = 500_000_000;
pub const MAX_TX_IN_SEQUENCE_NUM: u32 = u32::MAX;
pub const SEQUENCE_LOCK_TIME_DISABLED: i64 = 1 << 31;
pub const SEQUENCE_LOCK_TIME_TYPE_FLAG: i64 = 1 << 22;
pub const SEQUENCE_LOCK_TIME_MASK: i64 = 0x0000_ffff;

/// Context that only exists while validating a taproot spend: the annex,
/// the last code separator position, the committed leaf hash and the
/// signature operations budget.
pub(crate) struct TaprootContext {
    pub(crate) annex: Option<Vec<u8>>,
    pub(crate) code_sep_pos: u32,
    pub(crate) tap_leaf_hash: Option<[u8; 32]>,
    sig_ops_budget: i32,
    must_succeed: bool,
}

impl TaprootContext {
    fn new(input_witness_size: i32) -> Self {
        Self {
            annex: None,
            code_sep_pos: u32::MAX,
            tap_leaf_hash: None,
            sig_ops_budget: SIG_OPS_DELTA + input_witness_size,
            must_succeed: false,
        }
    }

    fn tally_sig_op(&mut self) -> Result<(), TxScriptError> {
        self.sig_ops_budget -= SIG_OPS_DELTA;
        if self.sig_ops_budget < 0 {
            return Err(TxScriptError::TaprootMaxSigOps);
        }
        Ok(())
    }
}

/// Snapshot of the VM state handed to the debug step callback.
#[derive(Clone, Debug)]
pub struct StepInfo {
    pub script_index: usize,
    pub opcode_index: usize,
    pub stack: Vec<Vec<u8>>,
    pub alt_stack: Vec<Vec<u8>>,
}

pub type StepCallback<'a> = Box<dyn Fn(&StepInfo) -> Result<(), TxScriptError> + 'a>;

/// The script virtual machine. It validates the spend of a single
/// transaction input: either a bare script public key, or a taproot
/// witness program resolved to a key spend or a committed leaf script.
pub struct TxScriptEngine<'a> {
    pub(crate) dstack: Stack,
    pub(crate) astack: Stack,
    pub(crate) cond_stack: Vec<OpCond>,

    pub(crate) tx: &'a Transaction,
    pub(crate) input_index: usize,
    input_amount: i64,
    pub(crate) prev_outs: &'a dyn PrevOutputFetcher,
    sig_cache: &'a SigCache,
    hash_cache: &'a TxSigHashes,
    asset_packet: Option<&'a AssetPacket>,

    scripts: Vec<Vec<u8>>,
    script_idx: usize,
    pub(crate) opcode_idx: usize,

    witness_program: Option<Vec<u8>>,
    pub(crate) taproot_ctx: Option<TaprootContext>,

    step_callback: Option<StepCallback<'a>>,
    verify_minimal_data: bool,
}

impl<'a> TxScriptEngine<'a> {
    /// Creates an engine for the given public key script, transaction and
    /// input index. The input's signature script must be push only, and a
    /// witness program other than taproot v1 is rejected outright.
    pub fn new(
        script_pub_key: &[u8],
        tx: &'a Transaction,
        input_index: usize,
        input_amount: i64,
        prev_outs: &'a dyn PrevOutputFetcher,
        sig_cache: &'a SigCache,
        hash_cache: &'a TxSigHashes,
    ) -> Result<Self, TxScriptError> {
        if input_index >= tx.inputs.len() {
            return Err(TxScriptError::InvalidIndex(input_index, tx.inputs.len()));
        }
        let sig_script = &tx.inputs[input_index].signature_script;

        // Both scripts empty would necessarily end with an empty stack,
        // which is equivalent to a false top element.
        if sig_script.is_empty() && script_pub_key.is_empty() {
            return Err(TxScriptError::EvalFalse);
        }

        let scripts = vec![sig_script.clone(), script_pub_key.to_vec()];
        for script in scripts.iter() {
            if script.len() > MAX_SCRIPTS_SIZE {
                return Err(TxScriptError::ScriptSize(script.len(), MAX_SCRIPTS_SIZE));
            }
            check_script_parses(script)?;
        }

        if !is_push_only_script(sig_script) {
            return Err(TxScriptError::SignatureScriptNotPushOnly);
        }

        let witness_program = if is_witness_program(script_pub_key) {
            // The signature script must be empty for witness programs,
            // otherwise the spend is malleable.
            if !sig_script.is_empty() {
                return Err(TxScriptError::WitnessMalleated);
            }
            let (version, program) = extract_witness_program_info(script_pub_key).expect("checked witness program");
            if version != 1 || program.len() != taproot::PAY_TO_TAPROOT_DATA_SIZE {
                return Err(TxScriptError::InvalidState("engine only supports taproot witness programs".to_string()));
            }
            Some(program.to_vec())
        } else {
            if !tx.inputs[input_index].witness.is_empty() {
                return Err(TxScriptError::WitnessUnexpected);
            }
            None
        };

        // Nothing to execute for an empty signature script.
        let script_idx = if sig_script.is_empty() { 1 } else { 0 };

        Ok(Self {
            dstack: Default::default(),
            astack: Default::default(),
            cond_stack: Default::default(),
            tx,
            input_index,
            input_amount,
            prev_outs,
            sig_cache,
            hash_cache,
            asset_packet: None,
            scripts,
            script_idx,
            opcode_idx: 0,
            witness_program,
            taproot_ctx: None,
            step_callback: None,
            verify_minimal_data: true,
        })
    }

    /// Attaches the asset packet the asset introspection opcodes read.
    pub fn set_asset_packet(&mut self, packet: &'a AssetPacket) {
        self.asset_packet = Some(packet);
    }

    /// Registers a debug callback invoked with the initial engine state and
    /// after every executed opcode. The callback sees cloned stacks and
    /// must not be used during regular operation.
    pub fn set_step_callback(&mut self, callback: StepCallback<'a>) {
        self.step_callback = Some(callback);
    }

    /// The value the spender claims for this input.
    pub fn input_amount(&self) -> i64 {
        self.input_amount
    }

    pub(crate) fn is_executing(&self) -> bool {
        self.cond_stack.is_empty() || *self.cond_stack.last().expect("checked non-empty") == OpCond::True
    }

    pub(crate) fn current_input(&self) -> &'a TransactionInput {
        &self.tx.inputs[self.input_index]
    }

    pub(crate) fn tx_input_at(&self, idx: i64) -> Result<&'a TransactionInput, TxScriptError> {
        usize::try_from(idx)
            .ok()
            .and_then(|idx| self.tx.inputs.get(idx))
            .ok_or(TxScriptError::InvalidInputIndex(idx, self.tx.inputs.len()))
    }

    pub(crate) fn tx_output_at(&self, idx: i64) -> Result<&'a tx::TransactionOutput, TxScriptError> {
        usize::try_from(idx)
            .ok()
            .and_then(|idx| self.tx.outputs.get(idx))
            .ok_or(TxScriptError::InvalidOutputIndex(idx, self.tx.outputs.len()))
    }

    pub(crate) fn fetch_prev_output(&self, outpoint: &OutPoint) -> Result<&'a UtxoEntry, TxScriptError> {
        self.prev_outs
            .fetch_prev_output(outpoint)
            .ok_or_else(|| TxScriptError::InvalidState(format!("no spent output for outpoint index {}", outpoint.index)))
    }

    pub(crate) fn packet(&self) -> Result<&'a AssetPacket, TxScriptError> {
        self.asset_packet.ok_or(TxScriptError::AssetPacketMissing)
    }

    /// Records the position of an executed OP_CODESEPARATOR for the
    /// tapscript sighash. Outside leaf execution this is a no-op.
    pub(crate) fn record_code_separator(&mut self) {
        let opcode_idx = self.opcode_idx as u32;
        if let Some(ctx) = self.taproot_ctx.as_mut() {
            ctx.code_sep_pos = opcode_idx;
        }
    }

    fn tally_sig_op(&mut self) -> Result<(), TxScriptError> {
        match self.taproot_ctx.as_mut() {
            Some(ctx) => ctx.tally_sig_op(),
            None => Ok(()),
        }
    }

    /// Applies the tapscript CHECKSIG rules to a signature/key pair popped
    /// from the stack and returns the verification outcome. A well-formed
    /// but invalid signature yields `false` rather than an error.
    pub(crate) fn check_tapscript_signature(&mut self, sig: &[u8], key: &[u8]) -> Result<bool, TxScriptError> {
        if key.is_empty() {
            return Err(TxScriptError::TaprootPubkeyIsEmpty);
        }
        if sig.is_empty() {
            return Ok(false);
        }
        // Only non-empty signatures count against the budget.
        self.tally_sig_op()?;
        if key.len() != 32 {
            return Err(TxScriptError::DiscourageUpgradeablePubKeyType(key.len()));
        }

        let (sig64, hash_type) = parse_taproot_sig(sig)?;
        let (annex, tap_leaf) = match &self.taproot_ctx {
            Some(ctx) => (ctx.annex.clone(), ctx.tap_leaf_hash.map(|leaf| (leaf, ctx.code_sep_pos))),
            None => (None, None),
        };
        let sig_hash = calc_taproot_signature_hash(
            self.hash_cache,
            hash_type,
            self.tx,
            self.input_index,
            self.prev_outs,
            annex.as_deref(),
            tap_leaf,
        )?;
        self.verify_schnorr_cached(sig_hash, sig, &sig64, key)
    }

    /// BIP-340 verification of a signature over a stack-provided 32-byte
    /// digest rather than a transaction sighash.
    pub(crate) fn check_sig_from_stack(&mut self, sig: &[u8], msg: &[u8], key: &[u8]) -> Result<bool, TxScriptError> {
        if key.is_empty() {
            return Err(TxScriptError::TaprootPubkeyIsEmpty);
        }
        if sig.is_empty() {
            return Ok(false);
        }
        self.tally_sig_op()?;
        if key.len() != 32 {
            return Err(TxScriptError::DiscourageUpgradeablePubKeyType(key.len()));
        }
        // There is no transaction sighash to select, so no sighash byte.
        let sig64: [u8; 64] = sig.try_into().map_err(|_| TxScriptError::InvalidTaprootSigLen(sig.len()))?;
        let digest: [u8; 32] =
            msg.try_into().map_err(|_| TxScriptError::InvalidState(format!("message must be a 32-byte digest, got {}", msg.len())))?;
        self.verify_schnorr_cached(digest, sig, &sig64, key)
    }

    fn verify_schnorr_cached(&self, sig_hash: [u8; 32], full_sig: &[u8], sig64: &[u8; 64], key: &[u8]) -> Result<bool, TxScriptError> {
        let cache_key = SigCacheKey::new(sig_hash, full_sig, key);
        if self.sig_cache.contains(&cache_key) {
            return Ok(true);
        }
        let signature = schnorr::Signature::from_slice(sig64).map_err(TxScriptError::InvalidSignature)?;
        let x_only = XOnlyPublicKey::from_slice(key).map_err(TxScriptError::InvalidSignature)?;
        match SECP256K1.verify_schnorr(&signature, &Message::from_digest(sig_hash), &x_only) {
            Ok(()) => {
                self.sig_cache.add(cache_key);
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Top-level schnorr verification of a key spend against the witness
    /// program. Failure is fatal, there is no script to fall back to.
    fn verify_taproot_key_spend(&self, program: &[u8], sig: &[u8]) -> Result<(), TxScriptError> {
        let (sig64, hash_type) = parse_taproot_sig(sig)?;
        let annex = self.taproot_ctx.as_ref().and_then(|ctx| ctx.annex.clone());
        let sig_hash = calc_taproot_signature_hash(
            self.hash_cache,
            hash_type,
            self.tx,
            self.input_index,
            self.prev_outs,
            annex.as_deref(),
            None,
        )?;

        let cache_key = SigCacheKey::new(sig_hash, sig, program);
        if self.sig_cache.contains(&cache_key) {
            return Ok(());
        }
        let signature = schnorr::Signature::from_slice(&sig64).map_err(TxScriptError::InvalidSignature)?;
        let output_key = XOnlyPublicKey::from_slice(program).map_err(TxScriptError::InvalidSignature)?;
        SECP256K1
            .verify_schnorr(&signature, &Message::from_digest(sig_hash), &output_key)
            .map_err(TxScriptError::InvalidSignature)?;
        self.sig_cache.add(cache_key);
        Ok(())
    }

    /// Validates the stored witness program against the input's witness:
    /// annex extraction, key spend, or control-block verified leaf setup.
    fn verify_witness_program(&mut self, witness: &[Vec<u8>]) -> Result<(), TxScriptError> {
        let program = self.witness_program.clone().expect("only called with a witness program");
        if witness.is_empty() {
            return Err(TxScriptError::WitnessProgramEmpty);
        }

        // The budget is seeded from the full serialized witness, before the
        // annex is snipped off.
        let witness_size = self.current_input().witness_serialized_size();
        let mut ctx = TaprootContext::new(witness_size as i32);

        let mut witness = witness;
        if is_annexed_witness(witness) {
            ctx.annex = Some(witness.last().expect("annexed witness is non-empty").clone());
            witness = &witness[..witness.len() - 1];
        }

        if witness.len() == 1 {
            // A single remaining element is the top-level signature.
            self.taproot_ctx = Some(ctx);
            self.verify_taproot_key_spend(&program, &witness[0])?;
            self.taproot_ctx.as_mut().expect("set above").must_succeed = true;
            return Ok(());
        }

        // Script path: the last element is the control block, the one
        // before it the revealed leaf script.
        let control_block = ControlBlock::parse(&witness[witness.len() - 1])?;
        let witness_script = &witness[witness.len() - 2];
        verify_taproot_leaf_commitment(&control_block, &program, witness_script)?;
        if control_block.leaf_version != BASE_LEAF_VERSION {
            return Err(TxScriptError::DiscourageUpgradeableTaprootVersion(control_block.leaf_version));
        }
        if witness_script.len() > MAX_SCRIPTS_SIZE {
            return Err(TxScriptError::ScriptSize(witness_script.len(), MAX_SCRIPTS_SIZE));
        }
        check_script_parses(witness_script)?;

        ctx.tap_leaf_hash = Some(tap_leaf_hash(control_block.leaf_version, witness_script));
        self.taproot_ctx = Some(ctx);
        self.scripts.push(witness_script.clone());
        self.set_stack(witness[..witness.len() - 2].to_vec());

        // Taproot also limits the starting stack, not just growth.
        if self.dstack.len() > MAX_STACK_SIZE {
            return Err(TxScriptError::StackSizeExceeded(self.dstack.len(), MAX_STACK_SIZE));
        }
        if let Some(element) = self.dstack.iter().find(|element| element.len() > MAX_SCRIPT_ELEMENT_SIZE) {
            return Err(TxScriptError::ElementTooBig(element.len(), MAX_SCRIPT_ELEMENT_SIZE));
        }
        Ok(())
    }

    fn execute_opcode(&mut self, opcode: Box<dyn OpCodeImplementation>) -> Result<(), TxScriptError> {
        // Illegal opcodes fail even when hidden inside a skipped branch.
        if opcode.always_illegal() {
            return Err(TxScriptError::OpcodeReserved(format!("{opcode:?}")));
        }

        // Taproot enforces element size limits instead of op count limits.
        if opcode.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(TxScriptError::ElementTooBig(opcode.len(), MAX_SCRIPT_ELEMENT_SIZE));
        }

        // Nothing to do for a non-conditional opcode in an inactive branch.
        if !self.is_executing() && !opcode.is_conditional() {
            return Ok(());
        }

        if self.verify_minimal_data && self.is_executing() && opcode.value() <= codes::OpPushData4 {
            opcode.check_minimal_data_push()?;
        }

        opcode.execute(self)
    }

    fn execute_script(&mut self, script: &[u8]) -> Result<(), TxScriptError> {
        let mut it = script.iter();
        while let Some(opcode) = deserialize_next_opcode(&mut it) {
            self.execute_opcode(opcode?)?;

            let combined_size = self.dstack.len() + self.astack.len();
            if combined_size > MAX_STACK_SIZE {
                return Err(TxScriptError::StackSizeExceeded(combined_size, MAX_STACK_SIZE));
            }

            self.opcode_idx += 1;
            if let Some(callback) = &self.step_callback {
                callback(&self.step_info())?;
            }
        }
        Ok(())
    }

    /// Runs all scripts to completion. Returns `Ok(())` only when the final
    /// stack holds exactly one truthy element, or when a key spend already
    /// verified the input.
    pub fn execute(&mut self) -> Result<(), TxScriptError> {
        if let Some(callback) = &self.step_callback {
            callback(&self.step_info())?;
        }

        while self.script_idx < self.scripts.len() {
            let script = self.scripts[self.script_idx].clone();
            if script.is_empty() {
                self.script_idx += 1;
                continue;
            }

            self.execute_script(&script)?;

            // A conditional may not straddle two scripts, and the alt stack
            // does not persist across them.
            if !self.cond_stack.is_empty() {
                return Err(TxScriptError::UnbalancedConditional);
            }
            self.astack.clear();
            self.opcode_idx = 0;
            self.script_idx += 1;

            if self.script_idx == 2 && self.witness_program.is_some() {
                let witness = self.current_input().witness.clone();
                self.verify_witness_program(&witness)?;
                if self.taproot_ctx.as_ref().is_some_and(|ctx| ctx.must_succeed) {
                    break;
                }
            }
        }

        self.check_error_condition()
    }

    fn check_error_condition(&mut self) -> Result<(), TxScriptError> {
        if self.taproot_ctx.as_ref().is_some_and(|ctx| ctx.must_succeed) {
            return Ok(());
        }
        if self.script_idx < self.scripts.len() {
            return Err(TxScriptError::InvalidProgramCounter(self.script_idx, self.scripts.len()));
        }
        if self.dstack.is_empty() {
            return Err(TxScriptError::EmptyStack);
        }
        if self.dstack.len() > 1 {
            return Err(TxScriptError::CleanStack(self.dstack.len() - 1));
        }
        let [result]: [bool; 1] = self.dstack.pop_items()?;
        match result {
            true => Ok(()),
            false => Err(TxScriptError::EvalFalse),
        }
    }

    fn step_info(&self) -> StepInfo {
        StepInfo {
            script_index: self.script_idx,
            opcode_index: self.opcode_idx,
            stack: self.dstack.clone(),
            alt_stack: self.astack.clone(),
        }
    }

    /// Replaces the contents of the data stack; the last element becomes
    /// the top of the stack.
    pub fn set_stack(&mut self, stack: Vec<Vec<u8>>) {
        self.dstack = stack;
    }

    pub fn get_stack(&self) -> Vec<Vec<u8>> {
        self.dstack.clone()
    }

    pub fn get_alt_stack(&self) -> Vec<Vec<u8>> {
        self.astack.clone()
    }
}

fn parse_taproot_sig(sig: &[u8]) -> Result<([u8; 64], SigHashType), TxScriptError> {
    match sig.len() {
        // A bare 64-byte signature implies the default sighash type.
        64 => Ok((sig.try_into().expect("length checked"), SigHashType::from_u8(SIG_HASH_DEFAULT).expect("default is valid"))),
        // 65 bytes carry an explicit, non-zero sighash byte.
        65 if sig[64] != 0 => Ok((sig[..64].try_into().expect("length checked"), SigHashType::from_u8(sig[64])?)),
        len => Err(TxScriptError::InvalidTaprootSigLen(len)),
    }
}

fn is_annexed_witness(witness: &[Vec<u8>]) -> bool {
    witness.len() >= 2 && witness.last().is_some_and(|last| !last.is_empty() && last[0] == TAPROOT_ANNEX_TAG)
}

pub(crate) fn parse_script(script: &[u8]) -> impl Iterator<Item = Result<Box<dyn OpCodeImplementation>, TxScriptError>> + '_ {
    let mut it = script.iter();
    std::iter::from_fn(move || deserialize_next_opcode(&mut it))
}

/// Walks the whole script through the tokenizer, surfacing any truncated
/// push or malformed length. Runs at construction and before leaf
/// execution.
pub fn check_script_parses(script: &[u8]) -> Result<(), TxScriptError> {
    parse_script(script).try_for_each(|opcode| opcode.map(|_| ()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{AssetGroup, AssetId, AssetOutput, AssetPacket};
    use crate::script_builder::ScriptBuilder;
    use crate::standard::pay_to_taproot_script;
    use crate::standard::test_helpers::{canonical_prev_outs, canonical_spend_tx, keypair_from_seed, CANONICAL_PREV_OUT_VALUE};
    use crate::taproot::compute_output_key;
    use crate::taproot::tagged_hash;
    use crate::tx::{MultiPrevOutFetcher, TransactionOutput};
    use secp256k1::Scalar;
    use std::cell::RefCell;

    fn run_bare_script(script: &[u8], packet: Option<&AssetPacket>) -> Result<(), TxScriptError> {
        let tx = canonical_spend_tx();
        let prev_outs = canonical_prev_outs();
        let sig_cache = SigCache::new(100);
        let hash_cache = TxSigHashes::new();
        let mut vm = TxScriptEngine::new(script, &tx, 0, CANONICAL_PREV_OUT_VALUE, &prev_outs, &sig_cache, &hash_cache)?;
        if let Some(packet) = packet {
            vm.set_asset_packet(packet);
        }
        vm.execute()
    }

    /// Assembles a taproot spend fixture for a single leaf script: the
    /// signed transaction, its spent output resolver and the leaf witness
    /// (script inputs get appended in front by the caller).
    struct LeafSpend {
        tx: Transaction,
        prev_outs: MultiPrevOutFetcher,
        script_pub_key: Vec<u8>,
        leaf_script: Vec<u8>,
        control_block: Vec<u8>,
    }

    fn leaf_spend(leaf_script: Vec<u8>, leaf_version: u8) -> LeafSpend {
        let internal = keypair_from_seed(7);
        let (internal_key, _) = internal.x_only_public_key();
        let leaf = taproot::tap_leaf_hash(leaf_version, &leaf_script);
        let (output_key, parity) = compute_output_key(&internal_key.serialize(), &leaf).unwrap();
        let script_pub_key = pay_to_taproot_script(&output_key).to_vec();

        let mut control_block = vec![leaf_version | parity];
        control_block.extend_from_slice(&internal_key.serialize());

        let mut prev_outs = MultiPrevOutFetcher::new();
        prev_outs.add(OutPoint::new([9u8; 32], 0), UtxoEntry::new(50_000, script_pub_key.clone()));
        let tx = Transaction::new(
            2,
            vec![TransactionInput::new(OutPoint::new([9u8; 32], 0), vec![], 0)],
            vec![TransactionOutput::new(49_000, vec![])],
            0,
        );

        LeafSpend { tx, prev_outs, script_pub_key, leaf_script, control_block }
    }

    fn execute_leaf_spend(spend: &mut LeafSpend, script_inputs: Vec<Vec<u8>>) -> Result<(), TxScriptError> {
        let mut witness = script_inputs;
        witness.push(spend.leaf_script.clone());
        witness.push(spend.control_block.clone());
        spend.tx.inputs[0].witness = witness;

        let sig_cache = SigCache::new(100);
        let hash_cache = TxSigHashes::new();
        let mut vm =
            TxScriptEngine::new(&spend.script_pub_key, &spend.tx, 0, 50_000, &spend.prev_outs, &sig_cache, &hash_cache)?;
        vm.execute()
    }

    #[test]
    fn test_xor_equal_accepts() {
        // S1
        let script = ScriptBuilder::new()
            .add_data(&[0x05])
            .add_data(&[0x03])
            .add_op(codes::OpXor)
            .add_data(&[0x06])
            .add_op(codes::OpEqual)
            .drain()
            .unwrap();
        run_bare_script(&script, None).unwrap();
    }

    #[test]
    fn test_divide_by_zero_rejects() {
        // S2
        let script =
            ScriptBuilder::new().add_i64(1).add_i64(0).add_op(codes::OpDiv).add_i64(3).add_op(codes::OpEqual).drain().unwrap();
        assert_eq!(run_bare_script(&script, None), Err(TxScriptError::DivideByZero));
    }

    #[test]
    fn test_cat_overflow_rejects() {
        // S3
        let script =
            ScriptBuilder::new().add_data(&[0xaa; 300]).add_data(&[0xbb; 300]).add_op(codes::OpCat).drain().unwrap();
        assert_eq!(run_bare_script(&script, None), Err(TxScriptError::ElementTooBig(600, MAX_SCRIPT_ELEMENT_SIZE)));
    }

    #[test]
    fn test_add64_overflow_restores_operands() {
        // S4
        let script = ScriptBuilder::new()
            .add_le64(i64::MAX as u64)
            .add_le64(1)
            .add_op(codes::OpAdd64)
            .add_op(codes::Op0)
            .add_op(codes::OpEqualVerify)
            .add_op(codes::Op2Drop)
            .add_op(codes::OpTrue)
            .drain()
            .unwrap();
        run_bare_script(&script, None).unwrap();
    }

    #[test]
    fn test_streaming_sha256_matches_reference_digest() {
        // S5
        let expected = hex::decode("7f83b1657ff1fc53b92dc18148a1d65dfc2d4b1fa3d677284addd200126d9069").unwrap();
        let script = ScriptBuilder::new()
            .add_data(b"Hello")
            .add_op(codes::OpSha256Initialize)
            .add_data(b" World")
            .add_op(codes::OpSha256Update)
            .add_data(b"!")
            .add_op(codes::OpSha256Finalize)
            .add_data(&expected)
            .add_op(codes::OpEqual)
            .drain()
            .unwrap();
        run_bare_script(&script, None).unwrap();
    }

    #[test]
    fn test_single_group_output_sum() {
        // S6
        let packet = AssetPacket::from_groups(vec![AssetGroup {
            id: AssetId::new([3u8; 32], 0),
            control: None,
            metadata_hash: [0u8; 32],
            inputs: vec![],
            outputs: vec![AssetOutput::Local { output_index: 0, amount: 1000 }],
        }])
        .unwrap();
        let script = ScriptBuilder::new()
            .add_i64(0)
            .add_i64(1)
            .add_op(codes::OpInspectAssetGroupSum)
            .add_le64(1000)
            .add_op(codes::OpEqual)
            .drain()
            .unwrap();
        run_bare_script(&script, Some(&packet)).unwrap();
    }

    #[test]
    fn test_fresh_issuance_resolves_to_tx_id() {
        // S7: a fresh issuance carries the id of the transaction under
        // validation with the group's own index.
        let tx = canonical_spend_tx();
        let packet = AssetPacket::from_groups(vec![AssetGroup {
            id: AssetId::new(tx.id(), 0),
            control: None,
            metadata_hash: [0u8; 32],
            inputs: vec![],
            outputs: vec![AssetOutput::Local { output_index: 0, amount: 1 }],
        }])
        .unwrap();
        let script = ScriptBuilder::new()
            .add_i64(0)
            .add_op(codes::OpInspectAssetGroupAssetId)
            .add_op(codes::Op0)
            .add_op(codes::OpEqualVerify)
            .add_data(&tx.id())
            .add_op(codes::OpEqual)
            .drain()
            .unwrap();
        run_bare_script(&script, Some(&packet)).unwrap();
    }

    #[test]
    fn test_missing_asset_packet_rejects() {
        // S8
        let script = ScriptBuilder::new().add_op(codes::OpInspectNumAssetGroups).drain().unwrap();
        assert_eq!(run_bare_script(&script, None), Err(TxScriptError::AssetPacketMissing));
    }

    fn keyspend_fixture() -> (Transaction, MultiPrevOutFetcher, Vec<u8>, secp256k1::Keypair) {
        let internal = keypair_from_seed(6);
        let (internal_key, _) = internal.x_only_public_key();
        // A key-path-only output commits to the internal key alone.
        let tweak = tagged_hash(b"TapTweak", &internal_key.serialize());
        let tweaked = internal.add_xonly_tweak(SECP256K1, &Scalar::from_be_bytes(tweak).unwrap()).unwrap();
        let (output_key, _) = tweaked.x_only_public_key();
        let script_pub_key = pay_to_taproot_script(&output_key.serialize()).to_vec();

        let mut prev_outs = MultiPrevOutFetcher::new();
        prev_outs.add(OutPoint::new([8u8; 32], 1), UtxoEntry::new(25_000, script_pub_key.clone()));
        let tx = Transaction::new(
            2,
            vec![TransactionInput::new(OutPoint::new([8u8; 32], 1), vec![], 0)],
            vec![TransactionOutput::new(24_000, vec![])],
            0,
        );
        (tx, prev_outs, script_pub_key, tweaked)
    }

    #[test]
    fn test_keyspend_accepts() {
        let (mut tx, prev_outs, script_pub_key, tweaked) = keyspend_fixture();
        let hash_cache = TxSigHashes::new();
        let sig_hash = calc_taproot_signature_hash(
            &hash_cache,
            SigHashType::from_u8(SIG_HASH_DEFAULT).unwrap(),
            &tx,
            0,
            &prev_outs,
            None,
            None,
        )
        .unwrap();
        let sig = SECP256K1.sign_schnorr_no_aux_rand(&Message::from_digest(sig_hash), &tweaked);
        tx.inputs[0].witness = vec![sig.serialize().to_vec()];

        let sig_cache = SigCache::new(100);
        let mut vm = TxScriptEngine::new(&script_pub_key, &tx, 0, 25_000, &prev_outs, &sig_cache, &hash_cache).unwrap();
        vm.execute().unwrap();

        // Determinism: a second run over the now-warm caches agrees.
        let mut vm = TxScriptEngine::new(&script_pub_key, &tx, 0, 25_000, &prev_outs, &sig_cache, &hash_cache).unwrap();
        vm.execute().unwrap();
    }

    #[test]
    fn test_keyspend_with_annex() {
        let (mut tx, prev_outs, script_pub_key, tweaked) = keyspend_fixture();
        let annex = vec![TAPROOT_ANNEX_TAG, 0xde, 0xad];
        let hash_cache = TxSigHashes::new();
        let sig_hash = calc_taproot_signature_hash(
            &hash_cache,
            SigHashType::from_u8(SIG_HASH_DEFAULT).unwrap(),
            &tx,
            0,
            &prev_outs,
            Some(&annex),
            None,
        )
        .unwrap();
        let sig = SECP256K1.sign_schnorr_no_aux_rand(&Message::from_digest(sig_hash), &tweaked);
        tx.inputs[0].witness = vec![sig.serialize().to_vec(), annex];

        let sig_cache = SigCache::new(100);
        let mut vm = TxScriptEngine::new(&script_pub_key, &tx, 0, 25_000, &prev_outs, &sig_cache, &hash_cache).unwrap();
        vm.execute().unwrap();
    }

    #[test]
    fn test_keyspend_rejects_bad_signature() {
        let (mut tx, prev_outs, script_pub_key, _) = keyspend_fixture();
        // Signed by an unrelated key.
        let other = keypair_from_seed(9);
        let hash_cache = TxSigHashes::new();
        let sig_hash = calc_taproot_signature_hash(
            &hash_cache,
            SigHashType::from_u8(SIG_HASH_DEFAULT).unwrap(),
            &tx,
            0,
            &prev_outs,
            None,
            None,
        )
        .unwrap();
        let sig = SECP256K1.sign_schnorr_no_aux_rand(&Message::from_digest(sig_hash), &other);
        tx.inputs[0].witness = vec![sig.serialize().to_vec()];

        let sig_cache = SigCache::new(100);
        let mut vm = TxScriptEngine::new(&script_pub_key, &tx, 0, 25_000, &prev_outs, &sig_cache, &hash_cache).unwrap();
        assert!(matches!(vm.execute(), Err(TxScriptError::InvalidSignature(_))));
    }

    #[test]
    fn test_scriptpath_true_leaf() {
        let mut spend = leaf_spend(vec![codes::OpTrue], BASE_LEAF_VERSION);
        execute_leaf_spend(&mut spend, vec![]).unwrap();
    }

    #[test]
    fn test_scriptpath_rejects_uncommitted_leaf() {
        let mut spend = leaf_spend(vec![codes::OpTrue], BASE_LEAF_VERSION);
        spend.leaf_script = vec![codes::Op2];
        assert_eq!(execute_leaf_spend(&mut spend, vec![]), Err(TxScriptError::TaprootCommitmentMismatch));
    }

    #[test]
    fn test_scriptpath_requires_clean_stack() {
        let mut spend = leaf_spend(vec![codes::OpTrue, codes::OpTrue], BASE_LEAF_VERSION);
        assert_eq!(execute_leaf_spend(&mut spend, vec![]), Err(TxScriptError::CleanStack(1)));
    }

    #[test]
    fn test_scriptpath_discourages_unknown_leaf_version() {
        let mut spend = leaf_spend(vec![codes::OpTrue], 0xc2);
        assert_eq!(execute_leaf_spend(&mut spend, vec![]), Err(TxScriptError::DiscourageUpgradeableTaprootVersion(0xc2)));
    }

    #[test]
    fn test_scriptpath_with_annex() {
        let mut spend = leaf_spend(vec![codes::OpTrue], BASE_LEAF_VERSION);
        let mut witness = vec![spend.leaf_script.clone(), spend.control_block.clone(), vec![TAPROOT_ANNEX_TAG, 0x01]];
        spend.tx.inputs[0].witness = std::mem::take(&mut witness);

        let sig_cache = SigCache::new(100);
        let hash_cache = TxSigHashes::new();
        let mut vm =
            TxScriptEngine::new(&spend.script_pub_key, &spend.tx, 0, 50_000, &spend.prev_outs, &sig_cache, &hash_cache).unwrap();
        vm.execute().unwrap();
    }

    #[test]
    fn test_scriptpath_checksig_leaf() {
        let script_key = keypair_from_seed(8);
        let (script_x, _) = script_key.x_only_public_key();
        let leaf_script =
            ScriptBuilder::new().add_data(&script_x.serialize()).add_op(codes::OpCheckSig).drain().unwrap();
        let mut spend = leaf_spend(leaf_script, BASE_LEAF_VERSION);

        let leaf_hash = taproot::tap_leaf_hash(BASE_LEAF_VERSION, &spend.leaf_script);
        let hash_cache = TxSigHashes::new();
        let sig_hash = calc_taproot_signature_hash(
            &hash_cache,
            SigHashType::from_u8(SIG_HASH_DEFAULT).unwrap(),
            &spend.tx,
            0,
            &spend.prev_outs,
            None,
            Some((leaf_hash, u32::MAX)),
        )
        .unwrap();
        let sig = SECP256K1.sign_schnorr_no_aux_rand(&Message::from_digest(sig_hash), &script_key);

        execute_leaf_spend(&mut spend, vec![sig.serialize().to_vec()]).unwrap();

        // An empty signature pushes false and fails the final stack check.
        assert_eq!(execute_leaf_spend(&mut spend, vec![vec![]]), Err(TxScriptError::EvalFalse));
    }

    #[test]
    fn test_scriptpath_checksigadd_leaf() {
        let script_key = keypair_from_seed(8);
        let (script_x, _) = script_key.x_only_public_key();
        // <sig> 0 <key> CHECKSIGADD 1 EQUAL
        let leaf_script = ScriptBuilder::new()
            .add_i64(0)
            .add_data(&script_x.serialize())
            .add_op(codes::OpCheckSigAdd)
            .add_op(codes::Op1)
            .add_op(codes::OpEqual)
            .drain()
            .unwrap();
        let mut spend = leaf_spend(leaf_script, BASE_LEAF_VERSION);

        let leaf_hash = taproot::tap_leaf_hash(BASE_LEAF_VERSION, &spend.leaf_script);
        let hash_cache = TxSigHashes::new();
        let sig_hash = calc_taproot_signature_hash(
            &hash_cache,
            SigHashType::from_u8(SIG_HASH_DEFAULT).unwrap(),
            &spend.tx,
            0,
            &spend.prev_outs,
            None,
            Some((leaf_hash, u32::MAX)),
        )
        .unwrap();
        let sig = SECP256K1.sign_schnorr_no_aux_rand(&Message::from_digest(sig_hash), &script_key);

        execute_leaf_spend(&mut spend, vec![sig.serialize().to_vec()]).unwrap();
    }

    #[test]
    fn test_sig_ops_budget_exhaustion() {
        // Each executed signature check costs 50 from a budget of
        // 50 + serialized witness size; enough repetitions must trip it.
        let key = keypair_from_seed(8);
        let (key_x, _) = key.x_only_public_key();
        let digest = [0x11u8; 32];
        let sig = SECP256K1.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &key);

        let build_leaf = |checks: usize| {
            let mut builder = ScriptBuilder::new();
            for _ in 0..checks {
                builder.add_op(codes::OpDup).add_data(&key_x.serialize()).add_op(codes::OpCheckSig).add_op(codes::OpDrop);
            }
            builder.add_op(codes::OpDrop).add_op(codes::OpTrue);
            builder.drain().unwrap()
        };

        let mut spend = leaf_spend(build_leaf(11), BASE_LEAF_VERSION);
        execute_leaf_spend(&mut spend, vec![sig.serialize().to_vec()]).unwrap();

        let mut spend = leaf_spend(build_leaf(12), BASE_LEAF_VERSION);
        assert_eq!(execute_leaf_spend(&mut spend, vec![sig.serialize().to_vec()]), Err(TxScriptError::TaprootMaxSigOps));
    }

    #[test]
    fn test_witness_structure_errors() {
        // A witness program cannot come with a signature script.
        let (mut tx, prev_outs, script_pub_key, _) = keyspend_fixture();
        tx.inputs[0].signature_script = vec![codes::Op1];
        tx.inputs[0].witness = vec![vec![0u8; 64]];
        let sig_cache = SigCache::new(100);
        let hash_cache = TxSigHashes::new();
        assert_eq!(
            TxScriptEngine::new(&script_pub_key, &tx, 0, 25_000, &prev_outs, &sig_cache, &hash_cache).err(),
            Some(TxScriptError::WitnessMalleated)
        );

        // A non-witness script cannot come with witness data.
        let mut tx = canonical_spend_tx();
        tx.inputs[0].witness = vec![vec![1]];
        assert_eq!(
            TxScriptEngine::new(&[codes::OpTrue], &tx, 0, 0, &prev_outs, &sig_cache, &hash_cache).err(),
            Some(TxScriptError::WitnessUnexpected)
        );

        // An empty witness cannot satisfy a witness program.
        let (tx, prev_outs, script_pub_key, _) = keyspend_fixture();
        let mut vm = TxScriptEngine::new(&script_pub_key, &tx, 0, 25_000, &prev_outs, &sig_cache, &hash_cache).unwrap();
        assert_eq!(vm.execute(), Err(TxScriptError::WitnessProgramEmpty));

        // Only taproot witness programs are supported.
        let mut v0 = vec![codes::OpFalse, 20];
        v0.extend_from_slice(&[2u8; 20]);
        let tx = canonical_spend_tx();
        assert!(matches!(
            TxScriptEngine::new(&v0, &tx, 0, 0, &prev_outs, &sig_cache, &hash_cache).err(),
            Some(TxScriptError::InvalidState(_))
        ));
    }

    #[test]
    fn test_construction_errors() {
        let tx = canonical_spend_tx();
        let prev_outs = canonical_prev_outs();
        let sig_cache = SigCache::new(100);
        let hash_cache = TxSigHashes::new();

        assert_eq!(
            TxScriptEngine::new(&[codes::OpTrue], &tx, 1, 0, &prev_outs, &sig_cache, &hash_cache).err(),
            Some(TxScriptError::InvalidIndex(1, 1))
        );
        assert_eq!(TxScriptEngine::new(&[], &tx, 0, 0, &prev_outs, &sig_cache, &hash_cache).err(), Some(TxScriptError::EvalFalse));
        assert_eq!(
            TxScriptEngine::new(&vec![codes::OpNop; MAX_SCRIPTS_SIZE + 1], &tx, 0, 0, &prev_outs, &sig_cache, &hash_cache).err(),
            Some(TxScriptError::ScriptSize(MAX_SCRIPTS_SIZE + 1, MAX_SCRIPTS_SIZE))
        );
        // Truncated pushes fail the parse check up front.
        assert_eq!(
            TxScriptEngine::new(&[codes::OpData2, 0x01], &tx, 0, 0, &prev_outs, &sig_cache, &hash_cache).err(),
            Some(TxScriptError::MalformedPush(2, 1))
        );

        // The signature script must be push only.
        let mut tx = canonical_spend_tx();
        tx.inputs[0].signature_script = vec![codes::OpDup];
        assert_eq!(
            TxScriptEngine::new(&[codes::OpTrue], &tx, 0, 0, &prev_outs, &sig_cache, &hash_cache).err(),
            Some(TxScriptError::SignatureScriptNotPushOnly)
        );
    }

    #[test]
    fn test_unbalanced_conditional() {
        let script = ScriptBuilder::new().add_op(codes::Op1).add_op(codes::OpIf).add_op(codes::Op1).drain().unwrap();
        assert_eq!(run_bare_script(&script, None), Err(TxScriptError::UnbalancedConditional));
    }

    #[test]
    fn test_stack_size_limit() {
        let mut builder = ScriptBuilder::new();
        for _ in 0..MAX_STACK_SIZE + 1 {
            builder.add_op(codes::Op1);
        }
        let script = builder.drain().unwrap();
        assert_eq!(run_bare_script(&script, None), Err(TxScriptError::StackSizeExceeded(MAX_STACK_SIZE + 1, MAX_STACK_SIZE)));
    }

    #[test]
    fn test_non_minimal_push_rejected() {
        // [OpPushData1 1 5] pushes the value 5, which must use Op5.
        let script = vec![codes::OpPushData1, 0x01, 0x05];
        assert!(matches!(run_bare_script(&script, None), Err(TxScriptError::NotMinimalData(_))));
    }

    #[test]
    fn test_signature_script_runs_before_pubkey_script() {
        // The (push only) signature script seeds the stack for the pubkey
        // script.
        let mut tx = canonical_spend_tx();
        tx.inputs[0].signature_script = ScriptBuilder::new().add_data(&[0x2a]).drain().unwrap();
        let script = ScriptBuilder::new().add_data(&[0x2a]).add_op(codes::OpEqual).drain().unwrap();

        let prev_outs = canonical_prev_outs();
        let sig_cache = SigCache::new(100);
        let hash_cache = TxSigHashes::new();
        let mut vm = TxScriptEngine::new(&script, &tx, 0, 0, &prev_outs, &sig_cache, &hash_cache).unwrap();
        vm.execute().unwrap();
    }

    #[test]
    fn test_step_callback_observes_execution() {
        let steps = RefCell::new(Vec::new());
        let tx = canonical_spend_tx();
        let prev_outs = canonical_prev_outs();
        let sig_cache = SigCache::new(100);
        let hash_cache = TxSigHashes::new();

        let script = ScriptBuilder::new().add_op(codes::Op1).add_op(codes::Op2).add_op(codes::OpDrop).drain().unwrap();
        let mut vm = TxScriptEngine::new(&script, &tx, 0, 0, &prev_outs, &sig_cache, &hash_cache).unwrap();
        vm.set_step_callback(Box::new(|info: &StepInfo| {
            steps.borrow_mut().push((info.opcode_index, info.stack.clone()));
            Ok(())
        }));
        vm.execute().unwrap();
        drop(vm);

        let steps = steps.into_inner();
        // Initial state plus one entry per executed opcode.
        assert_eq!(steps.len(), 4);
        assert_eq!(steps[0], (0, vec![]));
        assert_eq!(steps[1], (1, vec![vec![1]]));
        assert_eq!(steps[2], (2, vec![vec![1], vec![2]]));
        assert_eq!(steps[3], (3, vec![vec![1]]));
    }

    #[test]
    fn test_step_callback_error_aborts() {
        let tx = canonical_spend_tx();
        let prev_outs = canonical_prev_outs();
        let sig_cache = SigCache::new(100);
        let hash_cache = TxSigHashes::new();

        let script = ScriptBuilder::new().add_op(codes::Op1).drain().unwrap();
        let mut vm = TxScriptEngine::new(&script, &tx, 0, 0, &prev_outs, &sig_cache, &hash_cache).unwrap();
        vm.set_step_callback(Box::new(|_| Err(TxScriptError::EarlyReturn)));
        assert_eq!(vm.execute(), Err(TxScriptError::EarlyReturn));
    }

    #[test]
    fn test_code_separator_changes_sighash_commitment() {
        // A CHECKSIG after a code separator commits to its position; a
        // signature over the blank position must not verify.
        let script_key = keypair_from_seed(8);
        let (script_x, _) = script_key.x_only_public_key();
        let leaf_script = ScriptBuilder::new()
            .add_op(codes::OpCodeSeparator)
            .add_data(&script_x.serialize())
            .add_op(codes::OpCheckSig)
            .drain()
            .unwrap();
        let mut spend = leaf_spend(leaf_script, BASE_LEAF_VERSION);

        let leaf_hash = taproot::tap_leaf_hash(BASE_LEAF_VERSION, &spend.leaf_script);
        let hash_cache = TxSigHashes::new();
        // Signature committing to code separator position 0.
        let sig_hash = calc_taproot_signature_hash(
            &hash_cache,
            SigHashType::from_u8(SIG_HASH_DEFAULT).unwrap(),
            &spend.tx,
            0,
            &spend.prev_outs,
            None,
            Some((leaf_hash, 0)),
        )
        .unwrap();
        let sig = SECP256K1.sign_schnorr_no_aux_rand(&Message::from_digest(sig_hash), &script_key);
        execute_leaf_spend(&mut spend, vec![sig.serialize().to_vec()]).unwrap();

        // The same transaction signed with the blank position fails.
        let sig_hash = calc_taproot_signature_hash(
            &hash_cache,
            SigHashType::from_u8(SIG_HASH_DEFAULT).unwrap(),
            &spend.tx,
            0,
            &spend.prev_outs,
            None,
            Some((leaf_hash, u32::MAX)),
        )
        .unwrap();
        let sig = SECP256K1.sign_schnorr_no_aux_rand(&Message::from_digest(sig_hash), &script_key);
        assert_eq!(execute_leaf_spend(&mut spend, vec![sig.serialize().to_vec()]), Err(TxScriptError::EvalFalse));
    }
}
