use crate::asset::AssetId;
use crate::data_stack::StackEncoding;
use crate::opcodes::codes::*;
use crate::{MAX_SCRIPTS_SIZE, MAX_SCRIPT_ELEMENT_SIZE};
use thiserror::Error;

/// Default capacity of the backing array for a script being built. It
/// grows as needed, but this covers taproot leaves comfortably.
const DEFAULT_SCRIPT_ALLOC: usize = 512;

#[derive(Error, PartialEq, Eq, Debug, Clone, Copy)]
pub enum Error {
    #[error("script would exceed the maximum allowed script size of {MAX_SCRIPTS_SIZE} bytes")]
    ScriptTooLarge,

    #[error("pushing a data element of {0} bytes exceeds the maximum allowed element size of {MAX_SCRIPT_ELEMENT_SIZE}")]
    ElementExceedsMaxSize(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The canonical (minimal) opcode choice for pushing a given payload:
/// single-opcode folded forms for the values the small-integer opcodes
/// cover, a direct OpData# push where the opcode byte doubles as the
/// length, and the smallest OpPushData# prefix otherwise.
enum PushEncoding {
    Empty,
    SmallInt(u8),
    NegativeOne,
    Direct(u8),
    PushData1(u8),
    PushData2(u16),
    PushData4(u32),
}

impl PushEncoding {
    fn select(data: &[u8]) -> Self {
        match data {
            [] | [0] => PushEncoding::Empty,
            [value @ 1..=16] => PushEncoding::SmallInt(*value),
            [0x81] => PushEncoding::NegativeOne,
            _ if data.len() <= OpData75 as usize => PushEncoding::Direct(data.len() as u8),
            _ if data.len() <= u8::MAX as usize => PushEncoding::PushData1(data.len() as u8),
            _ if data.len() <= u16::MAX as usize => PushEncoding::PushData2(data.len() as u16),
            _ => PushEncoding::PushData4(data.len() as u32),
        }
    }

    /// Total script bytes the push occupies, payload included. Folded
    /// forms carry their value in the opcode itself.
    fn encoded_size(&self, payload_len: usize) -> usize {
        match self {
            PushEncoding::Empty | PushEncoding::SmallInt(_) | PushEncoding::NegativeOne => 1,
            PushEncoding::Direct(_) => 1 + payload_len,
            PushEncoding::PushData1(_) => 2 + payload_len,
            PushEncoding::PushData2(_) => 3 + payload_len,
            PushEncoding::PushData4(_) => 5 + payload_len,
        }
    }

    /// Writes the opcode and length prefix, returning whether the payload
    /// bytes follow.
    fn write_prefix(&self, script: &mut Vec<u8>) -> bool {
        match *self {
            PushEncoding::Empty => {
                script.push(Op0);
                false
            }
            PushEncoding::SmallInt(value) => {
                script.push(Op1 - 1 + value);
                false
            }
            PushEncoding::NegativeOne => {
                script.push(Op1Negate);
                false
            }
            // A direct push opcode byte equals its data length.
            PushEncoding::Direct(len) => {
                script.push(len);
                true
            }
            PushEncoding::PushData1(len) => {
                script.push(OpPushData1);
                script.push(len);
                true
            }
            PushEncoding::PushData2(len) => {
                script.push(OpPushData2);
                script.extend(len.to_le_bytes());
                true
            }
            PushEncoding::PushData4(len) => {
                script.push(OpPushData4);
                script.extend(len.to_le_bytes());
                true
            }
        }
    }
}

/// Builds scripts while keeping every push canonical. It does not ensure
/// the script will execute correctly, but pushes that would break the
/// engine limits are rejected up front, and the first rejection sticks
/// until the script is drained.
pub struct ScriptBuilder {
    script: Vec<u8>,
    error: Option<Error>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self { script: Vec::with_capacity(DEFAULT_SCRIPT_ALLOC), error: None }
    }

    pub fn script(&self) -> Result<&[u8]> {
        match self.error {
            None => Ok(&self.script),
            Some(ref err) => Err(*err),
        }
    }

    pub fn drain(&mut self) -> Result<Vec<u8>> {
        match self.error {
            None => Ok(std::mem::take(&mut self.script)),
            Some(err) => {
                self.script = vec![];
                self.error = None;
                Err(err)
            }
        }
    }

    /// Central growth guard: false when an error already stuck or when
    /// `additional` bytes would overflow the script size limit.
    fn fits(&mut self, additional: usize) -> bool {
        if self.error.is_some() {
            return false;
        }
        if self.script.len() + additional > MAX_SCRIPTS_SIZE {
            self.error = Some(Error::ScriptTooLarge);
            return false;
        }
        true
    }

    pub fn add_op(&mut self, opcode: u8) -> &mut Self {
        if self.fits(1) {
            self.script.push(opcode);
        }
        self
    }

    pub fn add_ops(&mut self, opcodes: &[u8]) -> &mut Self {
        if self.fits(opcodes.len()) {
            self.script.extend_from_slice(opcodes);
        }
        self
    }

    /// Script bytes the canonical push of `data` will take.
    pub fn canonical_data_size(data: &[u8]) -> usize {
        PushEncoding::select(data).encoded_size(data.len())
    }

    fn push_canonical(&mut self, data: &[u8]) -> &mut Self {
        let encoding = PushEncoding::select(data);
        if !self.fits(encoding.encoded_size(data.len())) {
            return self;
        }
        if encoding.write_prefix(&mut self.script) {
            self.script.extend_from_slice(data);
        }
        self
    }

    /// Pushes data with the canonical opcode for its length. Elements
    /// larger than the engine allows on the stack are rejected.
    pub fn add_data(&mut self, data: &[u8]) -> &mut Self {
        if self.error.is_some() {
            return self;
        }
        if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
            self.error = Some(Error::ElementExceedsMaxSize(data.len()));
            return self;
        }
        self.push_canonical(data)
    }

    /// Like [`Self::add_data`] without the element size check. Provided for
    /// tests that intentionally exceed the engine limits.
    pub fn add_data_unchecked(&mut self, data: &[u8]) -> &mut Self {
        if self.error.is_some() {
            return self;
        }
        self.push_canonical(data)
    }

    /// Pushes an integer as a canonical script number; the encoding's
    /// single-byte forms fold into the dedicated opcodes.
    pub fn add_i64(&mut self, value: i64) -> &mut Self {
        self.add_data(&value.encode())
    }

    /// Pushes a value as the fixed 8-byte little-endian operand the 64-bit
    /// arithmetic opcodes consume.
    pub fn add_le64(&mut self, value: u64) -> &mut Self {
        self.add_data(&value.to_le_bytes())
    }

    /// Pushes an asset id the way the asset introspection opcodes consume
    /// it: the 32-byte txid, then the group index as a script number.
    pub fn add_asset_id(&mut self, id: &AssetId) -> &mut Self {
        self.add_data(&id.txid).add_i64(id.group_index as i64)
    }
}

impl Default for ScriptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_op() {
        let mut builder = ScriptBuilder::new();
        builder.add_op(OpTrue).add_op(OpCheckSig);
        assert_eq!(builder.script().unwrap(), &[OpTrue, OpCheckSig]);

        let mut builder = ScriptBuilder::new();
        builder.add_ops(&[OpDup, OpSha256, OpEqual]);
        assert_eq!(builder.script().unwrap(), &[OpDup, OpSha256, OpEqual]);
    }

    #[test]
    fn test_small_integers_fold() {
        assert_eq!(ScriptBuilder::new().add_i64(0).drain().unwrap(), vec![Op0]);
        assert_eq!(ScriptBuilder::new().add_i64(1).drain().unwrap(), vec![Op1]);
        assert_eq!(ScriptBuilder::new().add_i64(16).drain().unwrap(), vec![Op16]);
        assert_eq!(ScriptBuilder::new().add_i64(-1).drain().unwrap(), vec![Op1Negate]);
        // The folded data forms behave identically.
        assert_eq!(ScriptBuilder::new().add_data(&[0x07]).drain().unwrap(), vec![Op7]);
        assert_eq!(ScriptBuilder::new().add_data(&[0x00]).drain().unwrap(), vec![Op0]);
    }

    #[test]
    fn test_numbers_use_direct_pushes() {
        // Beyond the folded range, a number is a direct push of its script
        // number encoding.
        for value in [17i64, -2, 1_000, 1_000_000, i64::MAX] {
            let script = ScriptBuilder::new().add_i64(value).drain().unwrap();
            let encoded = value.encode();
            assert_eq!(script[0] as usize, encoded.len(), "direct push length opcode for {value}");
            assert_eq!(&script[1..], encoded.as_slice(), "payload for {value}");
        }
    }

    #[test]
    fn test_le64_layout() {
        let script = ScriptBuilder::new().add_le64(1000).drain().unwrap();
        assert_eq!(script, vec![OpData8, 0xe8, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        // LE64 zero stays 8 bytes wide, unlike a script number zero.
        let script = ScriptBuilder::new().add_le64(0).drain().unwrap();
        assert_eq!(script, vec![OpData8, 0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_asset_id_layout() {
        let id = AssetId::new([0xab; 32], 2);
        let script = ScriptBuilder::new().add_asset_id(&id).drain().unwrap();
        assert_eq!(script[0], OpData32);
        assert_eq!(&script[1..33], &[0xab; 32]);
        assert_eq!(script[33], Op2);

        // Group indexes beyond the folded range fall back to data pushes.
        let id = AssetId::new([0xab; 32], 400);
        let script = ScriptBuilder::new().add_asset_id(&id).drain().unwrap();
        assert_eq!(&script[33..], &[OpData2, 0x90, 0x01]);
    }

    #[test]
    fn test_push_data_prefix_boundaries() {
        assert_eq!(ScriptBuilder::canonical_data_size(&[0x42]), 2);
        assert_eq!(ScriptBuilder::canonical_data_size(&[0u8; 75]), 76);
        assert_eq!(ScriptBuilder::canonical_data_size(&[0u8; 76]), 78); // OpPushData1
        assert_eq!(ScriptBuilder::canonical_data_size(&[0u8; 256]), 259); // OpPushData2
        assert_eq!(ScriptBuilder::canonical_data_size(&[0u8; MAX_SCRIPT_ELEMENT_SIZE]), MAX_SCRIPT_ELEMENT_SIZE + 3);

        let script = ScriptBuilder::new().add_data(&[0x5a; 400]).drain().unwrap();
        assert_eq!(&script[..3], &[OpPushData2, 0x90, 0x01]);
        assert_eq!(script.len(), 403);
    }

    #[test]
    fn test_element_size_limit() {
        let mut builder = ScriptBuilder::new();
        builder.add_data(&[0u8; MAX_SCRIPT_ELEMENT_SIZE + 1]);
        assert_eq!(builder.drain(), Err(Error::ElementExceedsMaxSize(MAX_SCRIPT_ELEMENT_SIZE + 1)));

        // The unchecked variant lets oversized elements through for limit
        // tests against the engine.
        let mut builder = ScriptBuilder::new();
        builder.add_data_unchecked(&[0u8; MAX_SCRIPT_ELEMENT_SIZE + 1]);
        assert!(builder.script().is_ok());
    }

    #[test]
    fn test_script_size_limit() {
        let mut builder = ScriptBuilder::new();
        builder.add_ops(&vec![OpNop; MAX_SCRIPTS_SIZE]);
        assert!(builder.script().is_ok());
        builder.add_op(OpTrue);
        assert_eq!(builder.drain(), Err(Error::ScriptTooLarge));
    }

    #[test]
    fn test_error_sticks_until_drain() {
        let mut builder = ScriptBuilder::new();
        builder.add_data(&[0u8; MAX_SCRIPT_ELEMENT_SIZE + 1]).add_op(OpTrue).add_i64(5);
        assert!(builder.script().is_err());
        assert!(builder.drain().is_err());
        // Drain resets the builder.
        builder.add_op(OpTrue);
        assert_eq!(builder.script().unwrap(), &[OpTrue]);
    }
}
