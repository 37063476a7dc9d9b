use crate::tx::write_var_int;
use crate::TxScriptError;
use secp256k1::{Parity, Scalar, XOnlyPublicKey, SECP256K1};
use sha2::{Digest, Sha256};

/// Size of the witness program push for taproot spends: the serialized
/// x-coordinate of the taproot output key.
pub const PAY_TO_TAPROOT_DATA_SIZE: usize = 32;

/// First byte of an annex witness element.
pub const TAPROOT_ANNEX_TAG: u8 = 0x50;

/// The initial tapscript leaf version.
pub const BASE_LEAF_VERSION: u8 = 0xc0;

/// Mask selecting the leaf version bits of a control block's first byte.
const LEAF_VERSION_MASK: u8 = 0xfe;

const CONTROL_BLOCK_BASE_SIZE: usize = 33;
const CONTROL_BLOCK_NODE_SIZE: usize = 32;
const CONTROL_BLOCK_MAX_NODES: usize = 128;

/// BIP-340/341 tagged hash: SHA256(SHA256(tag) || SHA256(tag) || msg).
pub(crate) fn tagged_hash(tag: &[u8], msg: &[u8]) -> [u8; 32] {
    let tag_hash: [u8; 32] = Sha256::digest(tag).into();
    let mut hasher = Sha256::new();
    hasher.update(tag_hash);
    hasher.update(tag_hash);
    hasher.update(msg);
    hasher.finalize().into()
}

/// The parsed final witness element of a script-path spend: output key
/// parity, leaf version, internal key and the Merkle inclusion proof.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ControlBlock {
    pub internal_key: [u8; 32],
    pub output_key_parity: u8,
    pub leaf_version: u8,
    pub inclusion_proof: Vec<[u8; 32]>,
}

impl ControlBlock {
    /// Parses a raw control block: 33 bytes plus zero or more 32-byte proof
    /// nodes, at most 128 of them.
    pub fn parse(raw: &[u8]) -> Result<Self, TxScriptError> {
        if raw.len() < CONTROL_BLOCK_BASE_SIZE
            || (raw.len() - CONTROL_BLOCK_BASE_SIZE) % CONTROL_BLOCK_NODE_SIZE != 0
            || (raw.len() - CONTROL_BLOCK_BASE_SIZE) / CONTROL_BLOCK_NODE_SIZE > CONTROL_BLOCK_MAX_NODES
        {
            return Err(TxScriptError::ControlBlockSize(raw.len()));
        }

        let internal_key: [u8; 32] = raw[1..CONTROL_BLOCK_BASE_SIZE].try_into().expect("sliced 32 bytes");
        let inclusion_proof = raw[CONTROL_BLOCK_BASE_SIZE..]
            .chunks_exact(CONTROL_BLOCK_NODE_SIZE)
            .map(|chunk| chunk.try_into().expect("chunked 32 bytes"))
            .collect();

        Ok(Self {
            internal_key,
            output_key_parity: raw[0] & !LEAF_VERSION_MASK,
            leaf_version: raw[0] & LEAF_VERSION_MASK,
            inclusion_proof,
        })
    }

    /// Folds the leaf hash through the inclusion proof up to the tap tree
    /// root. Branch children are sorted before hashing.
    pub fn root_hash(&self, leaf_hash: [u8; 32]) -> [u8; 32] {
        self.inclusion_proof.iter().fold(leaf_hash, |node, sibling| {
            let mut msg = [0u8; 64];
            if node.as_slice() <= sibling.as_slice() {
                msg[..32].copy_from_slice(&node);
                msg[32..].copy_from_slice(sibling);
            } else {
                msg[..32].copy_from_slice(sibling);
                msg[32..].copy_from_slice(&node);
            }
            tagged_hash(b"TapBranch", &msg)
        })
    }
}

/// TapHash of a leaf: the leaf version followed by the compact-size
/// prefixed script, under the TapLeaf tag.
pub fn tap_leaf_hash(leaf_version: u8, script: &[u8]) -> [u8; 32] {
    let mut msg = Vec::with_capacity(2 + script.len());
    msg.push(leaf_version);
    write_var_int(&mut msg, script.len() as u64);
    msg.extend_from_slice(script);
    tagged_hash(b"TapLeaf", &msg)
}

/// Adds `tagged_hash(TapTweak, internal || commitment)` times G to the
/// lifted internal key, returning the tweaked x-only key and its parity.
pub(crate) fn compute_output_key(internal_key: &[u8], commitment: &[u8; 32]) -> Result<([u8; 32], u8), TxScriptError> {
    let mut msg = Vec::with_capacity(64);
    msg.extend_from_slice(internal_key);
    msg.extend_from_slice(commitment);
    let tweak = tagged_hash(b"TapTweak", &msg);
    tweak_add_x_only(internal_key, &tweak)
}

/// Raw x-only tweak-add: `lift_x(internal) + int(tweak)*G`, returning the
/// resulting x-only key and its parity. Shared with OP_TWEAKVERIFY, which
/// supplies the tweak scalar directly.
pub(crate) fn tweak_add_x_only(internal_key: &[u8], tweak: &[u8; 32]) -> Result<([u8; 32], u8), TxScriptError> {
    let internal = XOnlyPublicKey::from_slice(internal_key).map_err(|_| TxScriptError::PubKeyFormat)?;
    let scalar = Scalar::from_be_bytes(*tweak).map_err(|_| TxScriptError::InvalidState("tap tweak is out of range".to_string()))?;
    let (tweaked, parity) =
        internal.add_tweak(SECP256K1, &scalar).map_err(TxScriptError::InvalidSignature)?;
    let parity = match parity {
        Parity::Even => 0,
        Parity::Odd => 1,
    };
    Ok((tweaked.serialize(), parity))
}

/// Verifies that the control block proves inclusion of `script` in the tap
/// tree committed by the 32-byte witness program.
pub fn verify_taproot_leaf_commitment(
    control_block: &ControlBlock,
    witness_program: &[u8],
    script: &[u8],
) -> Result<(), TxScriptError> {
    let leaf_hash = tap_leaf_hash(control_block.leaf_version, script);
    let root = control_block.root_hash(leaf_hash);
    let (output_key, parity) = compute_output_key(&control_block.internal_key, &root)?;
    if output_key != witness_program || parity != control_block.output_key_parity {
        return Err(TxScriptError::TaprootCommitmentMismatch);
    }
    Ok(())
}
