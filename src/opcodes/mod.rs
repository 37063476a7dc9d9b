use core::mem::size_of;

#[macro_use]
mod macros;

use crate::asset::AssetId;
use crate::data_stack::{DataStack, Le64, SizedEncodeInt, StackEncoding};
use crate::midstate::Sha256Ctx;
use crate::standard::extract_witness_program_info;
use crate::taproot::tweak_add_x_only;
use crate::{
    TxScriptEngine, TxScriptError, LOCK_TIME_THRESHOLD, MAX_SCRIPT_ELEMENT_SIZE, MAX_TX_IN_SEQUENCE_NUM,
    SEQUENCE_LOCK_TIME_DISABLED, SEQUENCE_LOCK_TIME_MASK, SEQUENCE_LOCK_TIME_TYPE_FLAG,
};
use core::cmp::{max, min};
use ripemd::Ripemd160;
use secp256k1::{Parity, PublicKey, Scalar, XOnlyPublicKey, SECP256K1};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt::{Debug, Formatter};

/// First value in the range formed by the "small integer" Op# opcodes
pub const OP_SMALL_INT_MIN_VAL: u8 = 1;
/// Last value in the range formed by the "small integer" Op# opcodes
pub const OP_SMALL_INT_MAX_VAL: u8 = 16;
/// Last value in the range formed by OpData# opcodes (where opcode == value)
pub const OP_DATA_MAX_VAL: u8 = self::codes::OpData75;
/// Minus 1 value
pub const OP_1_NEGATE_VAL: u8 = 0x81;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum OpCond {
    False,
    True,
    Skip,
}

impl OpCond {
    pub fn negate(&self) -> OpCond {
        match self {
            OpCond::True => OpCond::False,
            OpCond::False => OpCond::True,
            OpCond::Skip => OpCond::Skip,
        }
    }
}

type OpCodeResult = Result<(), TxScriptError>;

pub(crate) struct OpCode<const CODE: u8> {
    data: Vec<u8>,
}

impl<const CODE: u8> Debug for OpCode<CODE> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Opcode<{:#2x}>{{ data:{:?} }}", CODE, self.data)
    }
}

pub trait OpCodeMetadata: Debug {
    // Opcode number
    fn value(&self) -> u8;
    // Length of the immediate data
    fn len(&self) -> usize;
    // Conditionals execute for structure even in a skipped branch
    fn is_conditional(&self) -> bool;
    // For push data - check if we can use a shorter encoding
    fn check_minimal_data_push(&self) -> Result<(), TxScriptError>;

    fn is_disabled(&self) -> bool;
    fn always_illegal(&self) -> bool;
    fn is_push_opcode(&self) -> bool;
    fn get_data(&self) -> &[u8];

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait OpCodeExecution {
    fn empty() -> Result<Box<dyn OpCodeImplementation>, TxScriptError>
    where
        Self: Sized;
    #[allow(clippy::new_ret_no_self)]
    fn new(data: Vec<u8>) -> Result<Box<dyn OpCodeImplementation>, TxScriptError>
    where
        Self: Sized;

    fn execute(&self, vm: &mut TxScriptEngine) -> OpCodeResult;
}

pub trait OpcodeSerialization {
    fn serialize(&self) -> Vec<u8>;
    fn deserialize<'i, I: Iterator<Item = &'i u8>>(it: &mut I) -> Result<Box<dyn OpCodeImplementation>, TxScriptError>
    where
        Self: Sized;
}

pub trait OpCodeImplementation: OpCodeExecution + OpCodeMetadata + OpcodeSerialization {}

impl<const CODE: u8> OpCodeMetadata for OpCode<CODE> {
    fn value(&self) -> u8 {
        CODE
    }

    fn is_disabled(&self) -> bool {
        // Tapscript replaces the multisig opcodes with OpCheckSigAdd.
        matches!(CODE, codes::OpCheckMultiSig | codes::OpCheckMultiSigVerify)
    }

    fn always_illegal(&self) -> bool {
        matches!(CODE, codes::OpVerIf | codes::OpVerNotIf)
    }

    fn is_push_opcode(&self) -> bool {
        CODE <= codes::Op16
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn is_conditional(&self) -> bool {
        self.value() >= codes::OpIf && self.value() <= codes::OpEndIf
    }

    fn check_minimal_data_push(&self) -> Result<(), TxScriptError> {
        let data_len = self.len();
        let opcode = self.value();

        if data_len == 0 {
            if opcode != codes::OpFalse {
                return Err(TxScriptError::NotMinimalData(format!(
                    "zero length data push is encoded with opcode {self:?} instead of OpFalse"
                )));
            }
        } else if data_len == 1 && OP_SMALL_INT_MIN_VAL <= self.data[0] && self.data[0] <= OP_SMALL_INT_MAX_VAL {
            if opcode != codes::OpTrue + self.data[0] - 1 {
                return Err(TxScriptError::NotMinimalData(format!(
                    "data push of the value {} encoded with opcode {:?} instead of Op_{}",
                    self.data[0], self, self.data[0]
                )));
            }
        } else if data_len == 1 && self.data[0] == OP_1_NEGATE_VAL {
            if opcode != codes::Op1Negate {
                return Err(TxScriptError::NotMinimalData(format!(
                    "data push of the value -1 encoded \
                                    with opcode {self:?} instead of OP_1NEGATE"
                )));
            }
        } else if data_len <= OP_DATA_MAX_VAL as usize {
            if opcode as usize != data_len {
                return Err(TxScriptError::NotMinimalData(format!(
                    "data push of {data_len} bytes encoded \
                                    with opcode {self:?} instead of OP_DATA_{data_len}"
                )));
            }
        } else if data_len <= u8::MAX as usize {
            if opcode != codes::OpPushData1 {
                return Err(TxScriptError::NotMinimalData(format!(
                    "data push of {data_len} bytes encoded \
                                    with opcode {self:?} instead of OP_PUSHDATA1"
                )));
            }
        } else if data_len < u16::MAX as usize && opcode != codes::OpPushData2 {
            return Err(TxScriptError::NotMinimalData(format!(
                "data push of {data_len} bytes encoded \
                                with opcode {self:?} instead of OP_PUSHDATA2"
            )));
        }
        Ok(())
    }

    fn get_data(&self) -> &[u8] {
        &self.data
    }
}

// Helpers for some opcodes with shared data
#[inline]
fn push_data(data: Vec<u8>, vm: &mut TxScriptEngine) -> OpCodeResult {
    vm.dstack.push(data);
    Ok(())
}

#[inline]
fn push_number(number: i64, vm: &mut TxScriptEngine) -> OpCodeResult {
    vm.dstack.push_item(number);
    Ok(())
}

#[inline]
fn push_le64(value: u64, vm: &mut TxScriptEngine) -> OpCodeResult {
    vm.dstack.push(value.to_le_bytes().to_vec());
    Ok(())
}

#[inline]
fn push_le32(value: u32, vm: &mut TxScriptEngine) -> OpCodeResult {
    vm.dstack.push(value.to_le_bytes().to_vec());
    Ok(())
}

fn push_asset_id(id: &AssetId, vm: &mut TxScriptEngine) -> OpCodeResult {
    vm.dstack.push(id.txid.to_vec());
    push_number(id.group_index as i64, vm)
}

fn pop_asset_id(vm: &mut TxScriptEngine) -> Result<AssetId, TxScriptError> {
    let [gidx]: [i64; 1] = vm.dstack.pop_items()?;
    let [txid] = vm.dstack.pop_raw()?;
    let txid: [u8; 32] =
        txid.as_slice().try_into().map_err(|_| TxScriptError::InvalidState("asset id txid must be 32 bytes".to_string()))?;
    let group_index =
        u16::try_from(gidx).map_err(|_| TxScriptError::NumberTooBig(format!("asset group index {gidx} does not fit in u16")))?;
    Ok(AssetId::new(txid, group_index))
}

fn pop_point32(vm: &mut TxScriptEngine) -> Result<[u8; 32], TxScriptError> {
    let [raw] = vm.dstack.pop_raw()?;
    raw.as_slice().try_into().map_err(|_| TxScriptError::PubKeyFormat)
}

/// Pushes a script pubkey the way the introspection opcodes expose it: the
/// taproot witness program plus version 1 on top, or the raw script plus
/// the version sentinel 0 for everything else.
fn push_script_pub_key(script_public_key: &[u8], vm: &mut TxScriptEngine) -> OpCodeResult {
    match extract_witness_program_info(script_public_key) {
        Some((1, program)) if program.len() == 32 => {
            vm.dstack.push(program.to_vec());
            push_number(1, vm)
        }
        _ => {
            vm.dstack.push(script_public_key.to_vec());
            push_number(0, vm)
        }
    }
}

/// Left shift of a byte string interpreted MSB-first. The result keeps the
/// operand's length; shifted-out bits are dropped, vacated bits are zero.
fn shift_left(data: &[u8], shift: usize) -> Vec<u8> {
    let len = data.len();
    let mut out = vec![0u8; len];
    if shift >= len * 8 {
        return out;
    }
    let byte_shift = shift / 8;
    let bit_shift = (shift % 8) as u32;
    for i in 0..len - byte_shift {
        let mut value = data[i + byte_shift] << bit_shift;
        if bit_shift > 0 && i + byte_shift + 1 < len {
            value |= data[i + byte_shift + 1] >> (8 - bit_shift);
        }
        out[i] = value;
    }
    out
}

fn shift_right(data: &[u8], shift: usize) -> Vec<u8> {
    let len = data.len();
    let mut out = vec![0u8; len];
    if shift >= len * 8 {
        return out;
    }
    let byte_shift = shift / 8;
    let bit_shift = (shift % 8) as u32;
    for i in byte_shift..len {
        let mut value = data[i - byte_shift] >> bit_shift;
        if bit_shift > 0 && i > byte_shift {
            value |= data[i - byte_shift - 1] << (8 - bit_shift);
        }
        out[i] = value;
    }
    out
}

fn pop_shift_operands(vm: &mut TxScriptEngine) -> Result<(Vec<u8>, usize), TxScriptError> {
    let [shift]: [i64; 1] = vm.dstack.pop_items()?;
    let [data] = vm.dstack.pop_raw()?;
    if shift < 0 {
        return Err(TxScriptError::InvalidState(format!("negative shift count {shift}")));
    }
    Ok((data, shift as usize))
}

fn pop_equal_len_operands(vm: &mut TxScriptEngine) -> Result<(Vec<u8>, Vec<u8>), TxScriptError> {
    let [a, b] = vm.dstack.pop_raw()?;
    if a.len() != b.len() {
        return Err(TxScriptError::InvalidState(format!(
            "bitwise operands must have equal length ({} != {})",
            a.len(),
            b.len()
        )));
    }
    Ok((a, b))
}

/*
The following is the implementation and metadata of all opcodes. Each opcode
has a unique number (and the template system makes it impossible to use two
opcodes), a length specification, and execution code.

The syntax is as follows:
```
opcode OpCodeName<id, length>(self, vm) {
    code;
    output
}
// OR
opcode OpCodeName<id, length>(self, vm) statement

// in case of an opcode alias
opcode |OpCodeAlias| OpCodeName<id, length>(self, vm) statement
```

Length specification is either a number (for fixed length) or an unsigned
integer type (for var length). The execution code is implementing
OpCodeImplementation. You can access the engine using the `vm` variable.

Implementation details in `opcodes/macros.rs`.
*/
opcode_list! {

    // Data push opcodes.
    opcode |Op0| OpFalse<0x00, 1>(self, vm) {
        vm.dstack.push(vec![]);
        Ok(())
    }

    opcode OpData1<0x01, 2>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData2<0x02, 3>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData3<0x03, 4>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData4<0x04, 5>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData5<0x05, 6>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData6<0x06, 7>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData7<0x07, 8>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData8<0x08, 9>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData9<0x09, 10>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData10<0x0a, 11>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData11<0x0b, 12>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData12<0x0c, 13>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData13<0x0d, 14>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData14<0x0e, 15>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData15<0x0f, 16>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData16<0x10, 17>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData17<0x11, 18>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData18<0x12, 19>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData19<0x13, 20>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData20<0x14, 21>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData21<0x15, 22>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData22<0x16, 23>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData23<0x17, 24>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData24<0x18, 25>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData25<0x19, 26>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData26<0x1a, 27>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData27<0x1b, 28>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData28<0x1c, 29>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData29<0x1d, 30>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData30<0x1e, 31>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData31<0x1f, 32>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData32<0x20, 33>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData33<0x21, 34>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData34<0x22, 35>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData35<0x23, 36>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData36<0x24, 37>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData37<0x25, 38>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData38<0x26, 39>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData39<0x27, 40>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData40<0x28, 41>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData41<0x29, 42>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData42<0x2a, 43>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData43<0x2b, 44>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData44<0x2c, 45>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData45<0x2d, 46>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData46<0x2e, 47>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData47<0x2f, 48>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData48<0x30, 49>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData49<0x31, 50>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData50<0x32, 51>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData51<0x33, 52>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData52<0x34, 53>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData53<0x35, 54>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData54<0x36, 55>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData55<0x37, 56>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData56<0x38, 57>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData57<0x39, 58>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData58<0x3a, 59>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData59<0x3b, 60>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData60<0x3c, 61>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData61<0x3d, 62>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData62<0x3e, 63>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData63<0x3f, 64>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData64<0x40, 65>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData65<0x41, 66>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData66<0x42, 67>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData67<0x43, 68>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData68<0x44, 69>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData69<0x45, 70>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData70<0x46, 71>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData71<0x47, 72>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData72<0x48, 73>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData73<0x49, 74>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData74<0x4a, 75>(self, vm) push_data(self.data.clone(), vm)
    opcode OpData75<0x4b, 76>(self, vm) push_data(self.data.clone(), vm)
    opcode OpPushData1<0x4c, u8>(self, vm) push_data(self.data.clone(), vm)
    opcode OpPushData2<0x4d, u16>(self, vm) push_data(self.data.clone(), vm)
    opcode OpPushData4<0x4e, u32>(self, vm) push_data(self.data.clone(), vm)

    opcode Op1Negate<0x4f, 1>(self, vm) push_number(-1, vm)

    opcode OpReserved<0x50, 1>(self, vm) Err(TxScriptError::OpcodeReserved(format!("{self:?}")))

    opcode |Op1| OpTrue<0x51, 1>(self, vm) push_number(1, vm)
    opcode Op2<0x52, 1>(self, vm) push_number(2, vm)
    opcode Op3<0x53, 1>(self, vm) push_number(3, vm)
    opcode Op4<0x54, 1>(self, vm) push_number(4, vm)
    opcode Op5<0x55, 1>(self, vm) push_number(5, vm)
    opcode Op6<0x56, 1>(self, vm) push_number(6, vm)
    opcode Op7<0x57, 1>(self, vm) push_number(7, vm)
    opcode Op8<0x58, 1>(self, vm) push_number(8, vm)
    opcode Op9<0x59, 1>(self, vm) push_number(9, vm)
    opcode Op10<0x5a, 1>(self, vm) push_number(10, vm)
    opcode Op11<0x5b, 1>(self, vm) push_number(11, vm)
    opcode Op12<0x5c, 1>(self, vm) push_number(12, vm)
    opcode Op13<0x5d, 1>(self, vm) push_number(13, vm)
    opcode Op14<0x5e, 1>(self, vm) push_number(14, vm)
    opcode Op15<0x5f, 1>(self, vm) push_number(15, vm)
    opcode Op16<0x60, 1>(self, vm) push_number(16, vm)

    // Control opcodes.
    opcode OpNop<0x61, 1>(self, vm) Ok(())
    opcode OpVer<0x62, 1>(self, vm) Err(TxScriptError::OpcodeReserved(format!("{self:?}")))

    opcode OpIf<0x63, 1>(self, vm) {
        let mut cond = OpCond::Skip;
        if vm.is_executing() {
            // Tapscript requires the condition to be minimally encoded.
            let [cond_buf] = vm.dstack.pop_raw()?;
            cond = match cond_buf.as_slice() {
                [] => OpCond::False,
                [1] => OpCond::True,
                _ => return Err(TxScriptError::MinimalIf),
            };
        }
        vm.cond_stack.push(cond);
        Ok(())
    }

    opcode OpNotIf<0x64, 1>(self, vm) {
        let mut cond = OpCond::Skip;
        if vm.is_executing() {
            let [cond_buf] = vm.dstack.pop_raw()?;
            cond = match cond_buf.as_slice() {
                [] => OpCond::True,
                [1] => OpCond::False,
                _ => return Err(TxScriptError::MinimalIf),
            };
        }
        vm.cond_stack.push(cond);
        Ok(())
    }

    opcode OpVerIf<0x65, 1>(self, vm) Err(TxScriptError::OpcodeReserved(format!("{self:?}")))
    opcode OpVerNotIf<0x66, 1>(self, vm) Err(TxScriptError::OpcodeReserved(format!("{self:?}")))

    opcode OpElse<0x67, 1>(self, vm) {
        if let Some(cond) = vm.cond_stack.last_mut() {
            *cond = cond.negate();
            Ok(())
        } else {
            Err(TxScriptError::InvalidState("condition stack empty".to_string()))
        }
    }

    opcode OpEndIf<0x68, 1>(self, vm) {
        match vm.cond_stack.pop() {
            None => Err(TxScriptError::InvalidState("condition stack empty".to_string())),
            _ => Ok(())
        }
    }

    opcode OpVerify<0x69, 1>(self, vm) {
        let [result]: [bool; 1] = vm.dstack.pop_items()?;
        match result {
            true => Ok(()),
            false => Err(TxScriptError::EvalFalse)
        }
    }

    opcode OpReturn<0x6a, 1>(self, vm) Err(TxScriptError::EarlyReturn)

    // Stack opcodes.
    opcode OpToAltStack<0x6b, 1>(self, vm) {
        let [item] = vm.dstack.pop_raw()?;
        vm.astack.push(item);
        Ok(())
    }

    opcode OpFromAltStack<0x6c, 1>(self, vm) {
        match vm.astack.pop() {
            Some(last) => {
                vm.dstack.push(last);
                Ok(())
            },
            None => Err(TxScriptError::EmptyStack)
        }
    }

    opcode Op2Drop<0x6d, 1>(self, vm) vm.dstack.drop_items::<2>()
    opcode Op2Dup<0x6e, 1>(self, vm) vm.dstack.dup_items::<2>()
    opcode Op3Dup<0x6f, 1>(self, vm) vm.dstack.dup_items::<3>()
    opcode Op2Over<0x70, 1>(self, vm) vm.dstack.over_items::<2>()
    opcode Op2Rot<0x71, 1>(self, vm) vm.dstack.rot_items::<2>()
    opcode Op2Swap<0x72, 1>(self, vm) vm.dstack.swap_items::<2>()

    opcode OpIfDup<0x73, 1>(self, vm) {
        let [result] = vm.dstack.peek_raw()?;
        if bool::decode(&result)? {
            vm.dstack.push(result);
        }
        Ok(())
    }

    opcode OpDepth<0x74, 1>(self, vm) push_number(vm.dstack.len() as i64, vm)

    opcode OpDrop<0x75, 1>(self, vm) vm.dstack.drop_items::<1>()
    opcode OpDup<0x76, 1>(self, vm) vm.dstack.dup_items::<1>()

    opcode OpNip<0x77, 1>(self, vm) {
        match vm.dstack.len() >= 2 {
            true => {
                vm.dstack.remove(vm.dstack.len() - 2);
                Ok(())
            }
            false => Err(TxScriptError::InvalidStackOperation(2, vm.dstack.len())),
        }
    }

    opcode OpOver<0x78, 1>(self, vm) vm.dstack.over_items::<1>()

    opcode OpPick<0x79, 1>(self, vm) {
        let [loc]: [i32; 1] = vm.dstack.pop_items()?;
        if loc < 0 || loc as usize >= vm.dstack.len() {
            return Err(TxScriptError::InvalidState("pick at an invalid location".to_string()));
        }
        vm.dstack.push(vm.dstack[vm.dstack.len() - (loc as usize) - 1].clone());
        Ok(())
    }

    opcode OpRoll<0x7a, 1>(self, vm) {
        let [loc]: [i32; 1] = vm.dstack.pop_items()?;
        if loc < 0 || loc as usize >= vm.dstack.len() {
            return Err(TxScriptError::InvalidState("roll at an invalid location".to_string()));
        }
        let item = vm.dstack.remove(vm.dstack.len() - (loc as usize) - 1);
        vm.dstack.push(item);
        Ok(())
    }

    opcode OpRot<0x7b, 1>(self, vm) vm.dstack.rot_items::<1>()
    opcode OpSwap<0x7c, 1>(self, vm) vm.dstack.swap_items::<1>()

    opcode OpTuck<0x7d, 1>(self, vm) {
        match vm.dstack.len() >= 2 {
            true => {
                vm.dstack.insert(vm.dstack.len() - 2, vm.dstack.last().expect("We have at least two items").clone());
                Ok(())
            }
            false => Err(TxScriptError::InvalidStackOperation(2, vm.dstack.len()))
        }
    }

    // Splice opcodes, re-enabled in this fork.
    opcode OpCat<0x7e, 1>(self, vm) {
        let [mut a, b] = vm.dstack.pop_raw()?;
        if a.len() + b.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(TxScriptError::ElementTooBig(a.len() + b.len(), MAX_SCRIPT_ELEMENT_SIZE));
        }
        a.extend_from_slice(&b);
        vm.dstack.push(a);
        Ok(())
    }

    opcode OpSubStr<0x7f, 1>(self, vm) {
        let [idx, size]: [i64; 2] = vm.dstack.pop_items()?;
        let [data] = vm.dstack.pop_raw()?;
        if idx < 0 || size < 0 || (idx + size) as usize > data.len() {
            return Err(TxScriptError::InvalidState(format!(
                "substring [{idx}, {}) is out of bounds for {} bytes", idx + size, data.len()
            )));
        }
        vm.dstack.push(data[idx as usize..(idx + size) as usize].to_vec());
        Ok(())
    }

    opcode OpLeft<0x80, 1>(self, vm) {
        let [n]: [i64; 1] = vm.dstack.pop_items()?;
        let [data] = vm.dstack.pop_raw()?;
        if n < 0 || n as usize > data.len() {
            return Err(TxScriptError::InvalidState(format!("prefix of {n} bytes is out of bounds for {} bytes", data.len())));
        }
        vm.dstack.push(data[..n as usize].to_vec());
        Ok(())
    }

    opcode OpRight<0x81, 1>(self, vm) {
        let [n]: [i64; 1] = vm.dstack.pop_items()?;
        let [data] = vm.dstack.pop_raw()?;
        if n < 0 || n as usize > data.len() {
            return Err(TxScriptError::InvalidState(format!("suffix of {n} bytes is out of bounds for {} bytes", data.len())));
        }
        vm.dstack.push(data[data.len() - n as usize..].to_vec());
        Ok(())
    }

    opcode OpSize<0x82, 1>(self, vm) {
        match vm.dstack.last() {
            Some(last) => {
                vm.dstack.push_item(i64::try_from(last.len()).map_err(|e| TxScriptError::NumberTooBig(e.to_string()))?);
                Ok(())
            },
            None => Err(TxScriptError::InvalidStackOperation(1, 0))
        }
    }

    // Bitwise logic opcodes, re-enabled in this fork.
    opcode OpInvert<0x83, 1>(self, vm) {
        let [data] = vm.dstack.pop_raw()?;
        vm.dstack.push(data.iter().map(|b| !b).collect());
        Ok(())
    }

    opcode OpAnd<0x84, 1>(self, vm) {
        let (a, b) = pop_equal_len_operands(vm)?;
        vm.dstack.push(a.iter().zip(b.iter()).map(|(x, y)| x & y).collect());
        Ok(())
    }

    opcode OpOr<0x85, 1>(self, vm) {
        let (a, b) = pop_equal_len_operands(vm)?;
        vm.dstack.push(a.iter().zip(b.iter()).map(|(x, y)| x | y).collect());
        Ok(())
    }

    opcode OpXor<0x86, 1>(self, vm) {
        let (a, b) = pop_equal_len_operands(vm)?;
        vm.dstack.push(a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect());
        Ok(())
    }

    opcode OpEqual<0x87, 1>(self, vm) {
        match vm.dstack.len() >= 2 {
            true => {
                let pair = vm.dstack.split_off(vm.dstack.len() - 2);
                match pair[0] == pair[1] {
                    true => vm.dstack.push(vec![1]),
                    false => vm.dstack.push(vec![]),
                }
                Ok(())
            }
            false => Err(TxScriptError::InvalidStackOperation(2, vm.dstack.len()))
        }
    }

    opcode OpEqualVerify<0x88, 1>(self, vm) {
        match vm.dstack.len() >= 2 {
            true => {
                let pair = vm.dstack.split_off(vm.dstack.len() - 2);
                match pair[0] == pair[1] {
                    true => Ok(()),
                    false => Err(TxScriptError::EvalFalse),
                }
            }
            false => Err(TxScriptError::InvalidStackOperation(2, vm.dstack.len()))
        }
    }

    opcode OpReserved1<0x89, 1>(self, vm) Err(TxScriptError::OpcodeReserved(format!("{self:?}")))
    opcode OpReserved2<0x8a, 1>(self, vm) Err(TxScriptError::OpcodeReserved(format!("{self:?}")))

    // Numeric related opcodes.
    opcode Op1Add<0x8b, 1>(self, vm) {
        let [value]: [i64; 1] = vm.dstack.pop_items()?;
        vm.dstack.push_item(value + 1);
        Ok(())
    }

    opcode Op1Sub<0x8c, 1>(self, vm) {
        let [value]: [i64; 1] = vm.dstack.pop_items()?;
        vm.dstack.push_item(value - 1);
        Ok(())
    }

    opcode Op2Mul<0x8d, 1>(self, vm) {
        let [value]: [i64; 1] = vm.dstack.pop_items()?;
        vm.dstack.push_item(value * 2);
        Ok(())
    }

    opcode Op2Div<0x8e, 1>(self, vm) {
        let [value]: [i64; 1] = vm.dstack.pop_items()?;
        vm.dstack.push_item(value / 2);
        Ok(())
    }

    opcode OpNegate<0x8f, 1>(self, vm) {
        let [value]: [i64; 1] = vm.dstack.pop_items()?;
        vm.dstack.push_item(-value);
        Ok(())
    }

    opcode OpAbs<0x90, 1>(self, vm) {
        let [m]: [i64; 1] = vm.dstack.pop_items()?;
        vm.dstack.push_item(m.abs());
        Ok(())
    }

    opcode OpNot<0x91, 1>(self, vm) {
        let [m]: [i64; 1] = vm.dstack.pop_items()?;
        vm.dstack.push_item((m == 0) as i64);
        Ok(())
    }

    opcode Op0NotEqual<0x92, 1>(self, vm) {
        let [m]: [i64; 1] = vm.dstack.pop_items()?;
        vm.dstack.push_item((m != 0) as i64);
        Ok(())
    }

    opcode OpAdd<0x93, 1>(self, vm) {
        let [a, b]: [i64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item(a + b);
        Ok(())
    }

    opcode OpSub<0x94, 1>(self, vm) {
        let [a, b]: [i64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item(a - b);
        Ok(())
    }

    opcode OpMul<0x95, 1>(self, vm) {
        let [a, b]: [i64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item(a * b);
        Ok(())
    }

    opcode OpDiv<0x96, 1>(self, vm) {
        let [a, b]: [i64; 2] = vm.dstack.pop_items()?;
        if b == 0 {
            return Err(TxScriptError::DivideByZero);
        }
        vm.dstack.push_item(a / b);
        Ok(())
    }

    opcode OpMod<0x97, 1>(self, vm) {
        let [a, b]: [i64; 2] = vm.dstack.pop_items()?;
        if b == 0 {
            return Err(TxScriptError::DivideByZero);
        }
        vm.dstack.push_item(a % b);
        Ok(())
    }

    opcode OpLShift<0x98, 1>(self, vm) {
        let (data, shift) = pop_shift_operands(vm)?;
        vm.dstack.push(shift_left(&data, shift));
        Ok(())
    }

    opcode OpRShift<0x99, 1>(self, vm) {
        let (data, shift) = pop_shift_operands(vm)?;
        vm.dstack.push(shift_right(&data, shift));
        Ok(())
    }

    opcode OpBoolAnd<0x9a, 1>(self, vm) {
        let [a, b]: [i64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item(((a != 0) && (b != 0)) as i64);
        Ok(())
    }

    opcode OpBoolOr<0x9b, 1>(self, vm) {
        let [a, b]: [i64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item(((a != 0) || (b != 0)) as i64);
        Ok(())
    }

    opcode OpNumEqual<0x9c, 1>(self, vm) {
        let [a, b]: [i64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item((a == b) as i64);
        Ok(())
    }

    opcode OpNumEqualVerify<0x9d, 1>(self, vm) {
        let [a, b]: [i64; 2] = vm.dstack.pop_items()?;
        match a == b {
            true => Ok(()),
            false => Err(TxScriptError::EvalFalse)
        }
    }

    opcode OpNumNotEqual<0x9e, 1>(self, vm) {
        let [a, b]: [i64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item((a != b) as i64);
        Ok(())
    }

    opcode OpLessThan<0x9f, 1>(self, vm) {
        let [a, b]: [i64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item((a < b) as i64);
        Ok(())
    }

    opcode OpGreaterThan<0xa0, 1>(self, vm) {
        let [a, b]: [i64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item((a > b) as i64);
        Ok(())
    }

    opcode OpLessThanOrEqual<0xa1, 1>(self, vm) {
        let [a, b]: [i64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item((a <= b) as i64);
        Ok(())
    }

    opcode OpGreaterThanOrEqual<0xa2, 1>(self, vm) {
        let [a, b]: [i64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item((a >= b) as i64);
        Ok(())
    }

    opcode OpMin<0xa3, 1>(self, vm) {
        let [a, b]: [i64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item(min(a, b));
        Ok(())
    }

    opcode OpMax<0xa4, 1>(self, vm) {
        let [a, b]: [i64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item(max(a, b));
        Ok(())
    }

    opcode OpWithin<0xa5, 1>(self, vm) {
        let [x, l, u]: [i64; 3] = vm.dstack.pop_items()?;
        vm.dstack.push_item((x >= l && x < u) as i64);
        Ok(())
    }

    // Crypto opcodes.
    opcode OpRipeMd160<0xa6, 1>(self, vm) {
        let [last] = vm.dstack.pop_raw()?;
        vm.dstack.push(Ripemd160::digest(last).to_vec());
        Ok(())
    }

    opcode OpSha1<0xa7, 1>(self, vm) {
        let [last] = vm.dstack.pop_raw()?;
        vm.dstack.push(Sha1::digest(last).to_vec());
        Ok(())
    }

    opcode OpSha256<0xa8, 1>(self, vm) {
        let [last] = vm.dstack.pop_raw()?;
        vm.dstack.push(Sha256::digest(last).to_vec());
        Ok(())
    }

    opcode OpHash160<0xa9, 1>(self, vm) {
        let [last] = vm.dstack.pop_raw()?;
        vm.dstack.push(Ripemd160::digest(Sha256::digest(last)).to_vec());
        Ok(())
    }

    opcode OpHash256<0xaa, 1>(self, vm) {
        let [last] = vm.dstack.pop_raw()?;
        vm.dstack.push(Sha256::digest(Sha256::digest(last)).to_vec());
        Ok(())
    }

    opcode OpCodeSeparator<0xab, 1>(self, vm) {
        vm.record_code_separator();
        Ok(())
    }

    opcode OpCheckSig<0xac, 1>(self, vm) {
        let [sig, key] = vm.dstack.pop_raw()?;
        let valid = vm.check_tapscript_signature(&sig, &key)?;
        vm.dstack.push_item(valid);
        Ok(())
    }

    opcode OpCheckSigVerify<0xad, 1>(self, vm) {
        OpCheckSig { data: self.data.clone() }.execute(vm)?;
        let [valid]: [bool; 1] = vm.dstack.pop_items()?;
        match valid {
            true => Ok(()),
            false => Err(TxScriptError::EvalFalse)
        }
    }

    opcode OpCheckMultiSig<0xae, 1>(self, vm) Err(TxScriptError::OpcodeDisabled(format!("{self:?}")))
    opcode OpCheckMultiSigVerify<0xaf, 1>(self, vm) Err(TxScriptError::OpcodeDisabled(format!("{self:?}")))

    opcode OpNop1<0xb0, 1>(self, vm) Ok(())

    opcode OpCheckLockTimeVerify<0xb1, 1>(self, vm) {
        // The operand is peeked, not popped, and may be up to 5 bytes.
        let [raw] = vm.dstack.peek_raw()?;
        let lock_time = SizedEncodeInt::<5>::decode(&raw)?.0;
        if lock_time < 0 {
            return Err(TxScriptError::UnsatisfiedLockTime(format!("negative lock time {lock_time}")));
        }

        // The lock time field is either a block height or a timestamp
        // depending on which side of the threshold it falls; both operands
        // must agree on the interpretation.
        let tx_lock_time = vm.tx.lock_time as i64;
        if (lock_time < LOCK_TIME_THRESHOLD) != (tx_lock_time < LOCK_TIME_THRESHOLD) {
            return Err(TxScriptError::UnsatisfiedLockTime(format!(
                "mismatched lock time types -- tx lock time {tx_lock_time}, stack lock time {lock_time}"
            )));
        }
        if lock_time > tx_lock_time {
            return Err(TxScriptError::UnsatisfiedLockTime(format!(
                "lock time requirement not satisfied -- {lock_time} > {tx_lock_time}"
            )));
        }

        // A finalized input would bypass the lock time entirely, so reject it.
        if vm.current_input().sequence == MAX_TX_IN_SEQUENCE_NUM {
            return Err(TxScriptError::UnsatisfiedLockTime("transaction input is finalized".to_string()));
        }
        Ok(())
    }

    opcode OpCheckSequenceVerify<0xb2, 1>(self, vm) {
        let [raw] = vm.dstack.peek_raw()?;
        let sequence = SizedEncodeInt::<5>::decode(&raw)?.0;
        if sequence < 0 {
            return Err(TxScriptError::UnsatisfiedLockTime(format!("negative sequence {sequence}")));
        }

        // With the disable bit set in the operand, the opcode is a no-op.
        if sequence & SEQUENCE_LOCK_TIME_DISABLED != 0 {
            return Ok(());
        }

        if vm.tx.version < 2 {
            return Err(TxScriptError::UnsatisfiedLockTime(format!(
                "relative lock time requires a version 2+ transaction, got {}",
                vm.tx.version
            )));
        }
        let input_sequence = vm.current_input().sequence as i64;
        if input_sequence & SEQUENCE_LOCK_TIME_DISABLED != 0 {
            return Err(TxScriptError::UnsatisfiedLockTime(format!(
                "transaction sequence has the disable bit set: {input_sequence:#x}"
            )));
        }

        let mask = SEQUENCE_LOCK_TIME_TYPE_FLAG | SEQUENCE_LOCK_TIME_MASK;
        let stack_masked = sequence & mask;
        let input_masked = input_sequence & mask;
        if stack_masked & SEQUENCE_LOCK_TIME_TYPE_FLAG != input_masked & SEQUENCE_LOCK_TIME_TYPE_FLAG {
            return Err(TxScriptError::UnsatisfiedLockTime(format!(
                "mismatched relative lock time types -- {stack_masked:#x} vs {input_masked:#x}"
            )));
        }
        if stack_masked & SEQUENCE_LOCK_TIME_MASK > input_masked & SEQUENCE_LOCK_TIME_MASK {
            return Err(TxScriptError::UnsatisfiedLockTime(format!(
                "relative lock time requirement not satisfied -- {stack_masked:#x} > {input_masked:#x}"
            )));
        }
        Ok(())
    }

    opcode OpNop4<0xb3, 1>(self, vm) Ok(())
    opcode OpNop5<0xb4, 1>(self, vm) Ok(())
    opcode OpNop6<0xb5, 1>(self, vm) Ok(())
    opcode OpNop7<0xb6, 1>(self, vm) Ok(())
    opcode OpNop8<0xb7, 1>(self, vm) Ok(())
    opcode OpNop9<0xb8, 1>(self, vm) Ok(())
    opcode OpNop10<0xb9, 1>(self, vm) Ok(())

    opcode OpCheckSigAdd<0xba, 1>(self, vm) {
        let [key] = vm.dstack.pop_raw()?;
        let [n]: [i64; 1] = vm.dstack.pop_items()?;
        let [sig] = vm.dstack.pop_raw()?;
        let valid = vm.check_tapscript_signature(&sig, &key)?;
        vm.dstack.push_item(n + valid as i64);
        Ok(())
    }

    // Undefined opcodes.
    opcode OpUnknown187<0xbb, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
    opcode OpUnknown188<0xbc, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
    opcode OpUnknown189<0xbd, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
    opcode OpUnknown190<0xbe, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
    opcode OpUnknown191<0xbf, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
    opcode OpUnknown192<0xc0, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))

    // Signature over arbitrary stack data rather than a transaction sighash.
    opcode OpCheckSigFromStack<0xc1, 1>(self, vm) {
        let [sig, msg, key] = vm.dstack.pop_raw()?;
        let valid = vm.check_sig_from_stack(&sig, &msg, &key)?;
        vm.dstack.push_item(valid);
        Ok(())
    }

    opcode OpCheckSigFromStackVerify<0xc2, 1>(self, vm) {
        OpCheckSigFromStack { data: self.data.clone() }.execute(vm)?;
        let [valid]: [bool; 1] = vm.dstack.pop_items()?;
        match valid {
            true => Ok(()),
            false => Err(TxScriptError::EvalFalse)
        }
    }

    opcode OpUnknown195<0xc3, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))

    // Streaming SHA-256.
    opcode OpSha256Initialize<0xc4, 1>(self, vm) {
        let [data] = vm.dstack.pop_raw()?;
        let mut ctx = Sha256Ctx::new();
        ctx.write(&data);
        vm.dstack.push(ctx.save());
        Ok(())
    }

    opcode OpSha256Update<0xc5, 1>(self, vm) {
        let [raw_ctx, data] = vm.dstack.pop_raw()?;
        let mut ctx = Sha256Ctx::load(&raw_ctx)?;
        ctx.write(&data);
        vm.dstack.push(ctx.save());
        Ok(())
    }

    opcode OpSha256Finalize<0xc6, 1>(self, vm) {
        let [raw_ctx, tail] = vm.dstack.pop_raw()?;
        let mut ctx = Sha256Ctx::load(&raw_ctx)?;
        ctx.write(&tail);
        vm.dstack.push(ctx.finalize().to_vec());
        Ok(())
    }

    // Transaction introspection opcodes.
    opcode OpInspectInputOutpoint<0xc7, 1>(self, vm) {
        let [idx]: [i64; 1] = vm.dstack.pop_items()?;
        let input = vm.tx_input_at(idx)?;
        vm.dstack.push(input.previous_outpoint.txid.to_vec());
        push_number(input.previous_outpoint.index as i64, vm)
    }

    opcode OpInspectInputValue<0xc8, 1>(self, vm) {
        let [idx]: [i64; 1] = vm.dstack.pop_items()?;
        let input = vm.tx_input_at(idx)?;
        let entry = vm.fetch_prev_output(&input.previous_outpoint)?;
        push_le64(entry.amount as u64, vm)
    }

    opcode OpInspectInputScriptPubKey<0xc9, 1>(self, vm) {
        let [idx]: [i64; 1] = vm.dstack.pop_items()?;
        let input = vm.tx_input_at(idx)?;
        let entry = vm.fetch_prev_output(&input.previous_outpoint)?;
        push_script_pub_key(&entry.script_public_key.clone(), vm)
    }

    opcode OpInspectInputSequence<0xca, 1>(self, vm) {
        let [idx]: [i64; 1] = vm.dstack.pop_items()?;
        let sequence = vm.tx_input_at(idx)?.sequence;
        push_le32(sequence, vm)
    }

    opcode OpPushCurrentInputIndex<0xcb, 1>(self, vm) push_number(vm.input_index as i64, vm)

    opcode OpInspectOutputValue<0xcc, 1>(self, vm) {
        let [idx]: [i64; 1] = vm.dstack.pop_items()?;
        let value = vm.tx_output_at(idx)?.value;
        push_le64(value as u64, vm)
    }

    opcode OpInspectOutputScriptPubKey<0xcd, 1>(self, vm) {
        let [idx]: [i64; 1] = vm.dstack.pop_items()?;
        let script_public_key = vm.tx_output_at(idx)?.script_public_key.clone();
        push_script_pub_key(&script_public_key, vm)
    }

    opcode OpInspectVersion<0xce, 1>(self, vm) push_le32(vm.tx.version as u32, vm)
    opcode OpInspectLockTime<0xcf, 1>(self, vm) push_le32(vm.tx.lock_time, vm)
    opcode OpInspectNumInputs<0xd0, 1>(self, vm) push_number(vm.tx.inputs.len() as i64, vm)
    opcode OpInspectNumOutputs<0xd1, 1>(self, vm) push_number(vm.tx.outputs.len() as i64, vm)
    opcode OpTxWeight<0xd2, 1>(self, vm) push_le32(vm.tx.weight() as u32, vm)

    // Undefined opcodes.
    opcode OpUnknown211<0xd3, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
    opcode OpUnknown212<0xd4, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
    opcode OpUnknown213<0xd5, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
    opcode OpUnknown214<0xd6, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))

    // 64-bit little-endian arithmetic. Overflow is not an error: the
    // operands are restored in their original order and a zero flag is
    // pushed so the script can recover.
    opcode OpAdd64<0xd7, 1>(self, vm) {
        let [Le64(a), Le64(b)]: [Le64; 2] = vm.dstack.pop_items()?;
        match a.checked_add(b) {
            Some(result) => {
                vm.dstack.push_item(Le64(result));
                vm.dstack.push_item(true);
            }
            None => {
                vm.dstack.push_item(Le64(a));
                vm.dstack.push_item(Le64(b));
                vm.dstack.push_item(false);
            }
        }
        Ok(())
    }

    opcode OpSub64<0xd8, 1>(self, vm) {
        let [Le64(a), Le64(b)]: [Le64; 2] = vm.dstack.pop_items()?;
        match a.checked_sub(b) {
            Some(result) => {
                vm.dstack.push_item(Le64(result));
                vm.dstack.push_item(true);
            }
            None => {
                vm.dstack.push_item(Le64(a));
                vm.dstack.push_item(Le64(b));
                vm.dstack.push_item(false);
            }
        }
        Ok(())
    }

    opcode OpMul64<0xd9, 1>(self, vm) {
        let [Le64(a), Le64(b)]: [Le64; 2] = vm.dstack.pop_items()?;
        match a.checked_mul(b) {
            Some(result) => {
                vm.dstack.push_item(Le64(result));
                vm.dstack.push_item(true);
            }
            None => {
                vm.dstack.push_item(Le64(a));
                vm.dstack.push_item(Le64(b));
                vm.dstack.push_item(false);
            }
        }
        Ok(())
    }

    opcode OpDiv64<0xda, 1>(self, vm) {
        let [Le64(a), Le64(b)]: [Le64; 2] = vm.dstack.pop_items()?;
        if b == 0 || (a == i64::MIN && b == -1) {
            vm.dstack.push_item(Le64(a));
            vm.dstack.push_item(Le64(b));
            vm.dstack.push_item(false);
        } else {
            // Euclidean semantics: the remainder is always non-negative.
            vm.dstack.push_item(Le64(a.rem_euclid(b)));
            vm.dstack.push_item(Le64(a.div_euclid(b)));
            vm.dstack.push_item(true);
        }
        Ok(())
    }

    opcode OpNeg64<0xdb, 1>(self, vm) {
        let [Le64(a)]: [Le64; 1] = vm.dstack.pop_items()?;
        match a.checked_neg() {
            Some(result) => {
                vm.dstack.push_item(Le64(result));
                vm.dstack.push_item(true);
            }
            None => {
                vm.dstack.push_item(Le64(a));
                vm.dstack.push_item(false);
            }
        }
        Ok(())
    }

    opcode OpLessThan64<0xdc, 1>(self, vm) {
        let [Le64(a), Le64(b)]: [Le64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item(a < b);
        Ok(())
    }

    opcode OpLessThanOrEqual64<0xdd, 1>(self, vm) {
        let [Le64(a), Le64(b)]: [Le64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item(a <= b);
        Ok(())
    }

    opcode OpGreaterThan64<0xde, 1>(self, vm) {
        let [Le64(a), Le64(b)]: [Le64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item(a > b);
        Ok(())
    }

    opcode OpGreaterThanOrEqual64<0xdf, 1>(self, vm) {
        let [Le64(a), Le64(b)]: [Le64; 2] = vm.dstack.pop_items()?;
        vm.dstack.push_item(a >= b);
        Ok(())
    }

    // Conversions between the numeric representations.
    opcode OpScriptNumToLe64<0xe0, 1>(self, vm) {
        let [value]: [i64; 1] = vm.dstack.pop_items()?;
        vm.dstack.push_item(Le64(value));
        Ok(())
    }

    opcode OpLe64ToScriptNum<0xe1, 1>(self, vm) {
        let [Le64(value)]: [Le64; 1] = vm.dstack.pop_items()?;
        if value > i32::MAX as i64 || value < -(i32::MAX as i64) {
            return Err(TxScriptError::NumberTooBig(format!("{value} does not fit in a 4-byte script number")));
        }
        vm.dstack.push_item(value);
        Ok(())
    }

    opcode OpLe32ToLe64<0xe2, 1>(self, vm) {
        let [raw] = vm.dstack.pop_raw()?;
        let bytes: [u8; 4] = raw.as_slice().try_into()
            .map_err(|_| TxScriptError::InvalidState(format!("expected a 4-byte little-endian operand, got {} bytes", raw.len())))?;
        vm.dstack.push_item(Le64(u32::from_le_bytes(bytes) as i64));
        Ok(())
    }

    // Curve helpers.
    opcode OpEcMulScalarVerify<0xe3, 1>(self, vm) {
        let [scalar] = vm.dstack.pop_raw()?;
        let p = pop_point32(vm)?;
        let q = pop_point32(vm)?;
        let scalar: [u8; 32] = scalar.as_slice().try_into()
            .map_err(|_| TxScriptError::InvalidState(format!("expected a 32-byte scalar, got {} bytes", scalar.len())))?;
        let scalar = Scalar::from_be_bytes(scalar)
            .map_err(|_| TxScriptError::InvalidState("scalar is out of range".to_string()))?;
        let point = PublicKey::from_x_only_public_key(
            XOnlyPublicKey::from_slice(&p).map_err(|_| TxScriptError::PubKeyFormat)?,
            Parity::Even,
        );
        let result = point.mul_tweak(SECP256K1, &scalar).map_err(TxScriptError::InvalidSignature)?;
        match result.x_only_public_key().0.serialize() == q {
            true => Ok(()),
            false => Err(TxScriptError::EvalFalse),
        }
    }

    opcode OpTweakVerify<0xe4, 1>(self, vm) {
        let q = pop_point32(vm)?;
        let [tweak] = vm.dstack.pop_raw()?;
        let p = pop_point32(vm)?;
        let tweak: [u8; 32] = tweak.as_slice().try_into()
            .map_err(|_| TxScriptError::InvalidState(format!("expected a 32-byte tweak, got {} bytes", tweak.len())))?;
        let (tweaked, _) = tweak_add_x_only(&p, &tweak)?;
        match tweaked == q {
            true => Ok(()),
            false => Err(TxScriptError::EvalFalse),
        }
    }

    // Asset packet introspection opcodes.
    opcode OpInspectNumAssetGroups<0xe5, 1>(self, vm) {
        let count = vm.packet()?.groups.len();
        push_number(count as i64, vm)
    }

    opcode OpInspectAssetGroupAssetId<0xe6, 1>(self, vm) {
        let packet = vm.packet()?;
        let [k]: [i64; 1] = vm.dstack.pop_items()?;
        let id = packet.group(k)?.id;
        push_asset_id(&id, vm)
    }

    opcode OpInspectAssetGroupCtrl<0xe7, 1>(self, vm) {
        let packet = vm.packet()?;
        let [k]: [i64; 1] = vm.dstack.pop_items()?;
        match packet.group(k)?.control {
            Some(control) => push_asset_id(&control, vm),
            None => push_number(-1, vm),
        }
    }

    opcode OpFindAssetGroupByAssetId<0xe8, 1>(self, vm) {
        let packet = vm.packet()?;
        let id = pop_asset_id(vm)?;
        match packet.find_group(&id) {
            Some(k) => push_number(k as i64, vm),
            None => push_number(-1, vm),
        }
    }

    opcode OpInspectAssetGroupMetadataHash<0xe9, 1>(self, vm) {
        let packet = vm.packet()?;
        let [k]: [i64; 1] = vm.dstack.pop_items()?;
        let hash = packet.group(k)?.metadata_hash;
        vm.dstack.push(hash.to_vec());
        Ok(())
    }

    opcode OpInspectAssetGroupNum<0xea, 1>(self, vm) {
        let packet = vm.packet()?;
        let [k, source]: [i64; 2] = vm.dstack.pop_items()?;
        let group = packet.group(k)?;
        match source {
            0 => push_number(group.inputs.len() as i64, vm),
            1 => push_number(group.outputs.len() as i64, vm),
            2 => {
                push_number(group.inputs.len() as i64, vm)?;
                push_number(group.outputs.len() as i64, vm)
            }
            _ => Err(TxScriptError::InvalidAssetSource(source)),
        }
    }

    opcode OpInspectAssetGroup<0xeb, 1>(self, vm) {
        let packet = vm.packet()?;
        let [k, j, source]: [i64; 3] = vm.dstack.pop_items()?;
        let group = packet.group(k)?;
        match source {
            0 => {
                let input = *usize::try_from(j).ok().and_then(|j| group.inputs.get(j))
                    .ok_or(TxScriptError::AssetIndexOutOfRange(j, group.inputs.len()))?;
                push_number(input.type_code(), vm)?;
                match input {
                    crate::asset::AssetInput::Local { input_index, .. } => push_number(input_index as i64, vm)?,
                    crate::asset::AssetInput::Intent { txid, output_index, .. } => {
                        vm.dstack.push(txid.to_vec());
                        push_number(output_index as i64, vm)?;
                    }
                }
                push_le64(input.amount(), vm)
            }
            1 => {
                let output = *usize::try_from(j).ok().and_then(|j| group.outputs.get(j))
                    .ok_or(TxScriptError::AssetIndexOutOfRange(j, group.outputs.len()))?;
                push_number(output.type_code(), vm)?;
                push_number(output.output_index() as i64, vm)?;
                push_le64(output.amount(), vm)
            }
            _ => Err(TxScriptError::InvalidAssetSource(source)),
        }
    }

    opcode OpInspectAssetGroupSum<0xec, 1>(self, vm) {
        let packet = vm.packet()?;
        let [k, source]: [i64; 2] = vm.dstack.pop_items()?;
        let group = packet.group(k)?;
        match source {
            0 => push_le64(group.input_sum()?, vm),
            1 => push_le64(group.output_sum()?, vm),
            2 => {
                push_le64(group.input_sum()?, vm)?;
                push_le64(group.output_sum()?, vm)
            }
            _ => Err(TxScriptError::InvalidAssetSource(source)),
        }
    }

    opcode OpInspectOutAssetCount<0xed, 1>(self, vm) {
        let packet = vm.packet()?;
        let [o]: [i64; 1] = vm.dstack.pop_items()?;
        let count = packet.output_entries(o).len();
        push_number(count as i64, vm)
    }

    opcode OpInspectOutAssetAt<0xee, 1>(self, vm) {
        let packet = vm.packet()?;
        let [o, t]: [i64; 2] = vm.dstack.pop_items()?;
        let entries = packet.output_entries(o);
        let entry = *usize::try_from(t).ok().and_then(|t| entries.get(t))
            .ok_or(TxScriptError::AssetIndexOutOfRange(t, entries.len()))?;
        push_asset_id(&entry.id, vm)?;
        push_le64(entry.amount, vm)
    }

    opcode OpInspectOutAssetLookup<0xef, 1>(self, vm) {
        let packet = vm.packet()?;
        let id = pop_asset_id(vm)?;
        let [o]: [i64; 1] = vm.dstack.pop_items()?;
        match packet.output_entries(o).iter().find(|entry| entry.id == id) {
            Some(entry) => push_le64(entry.amount, vm),
            None => push_number(-1, vm),
        }
    }

    opcode OpInspectInAssetCount<0xf0, 1>(self, vm) {
        let packet = vm.packet()?;
        let [i]: [i64; 1] = vm.dstack.pop_items()?;
        let count = packet.input_entries(i).len();
        push_number(count as i64, vm)
    }

    opcode OpInspectInAssetAt<0xf1, 1>(self, vm) {
        let packet = vm.packet()?;
        let [i, t]: [i64; 2] = vm.dstack.pop_items()?;
        let entries = packet.input_entries(i);
        let entry = *usize::try_from(t).ok().and_then(|t| entries.get(t))
            .ok_or(TxScriptError::AssetIndexOutOfRange(t, entries.len()))?;
        push_asset_id(&entry.id, vm)?;
        push_le64(entry.amount, vm)
    }

    opcode OpInspectInAssetLookup<0xf2, 1>(self, vm) {
        let packet = vm.packet()?;
        let id = pop_asset_id(vm)?;
        let [i]: [i64; 1] = vm.dstack.pop_items()?;
        match packet.input_entries(i).iter().find(|entry| entry.id == id) {
            Some(entry) => push_le64(entry.amount, vm),
            None => push_number(-1, vm),
        }
    }

    // Intent-typed sub-enumerations of a group's inputs and outputs.
    opcode OpInspectGroupIntentOutCount<0xf3, 1>(self, vm) {
        let packet = vm.packet()?;
        let [k]: [i64; 1] = vm.dstack.pop_items()?;
        let count = packet.group(k)?.intent_outputs().count();
        push_number(count as i64, vm)
    }

    opcode OpInspectGroupIntentOut<0xf4, 1>(self, vm) {
        let packet = vm.packet()?;
        let [k, j]: [i64; 2] = vm.dstack.pop_items()?;
        let group = packet.group(k)?;
        let output = *usize::try_from(j).ok().and_then(|j| group.intent_outputs().nth(j))
            .ok_or_else(|| TxScriptError::AssetIndexOutOfRange(j, group.intent_outputs().count()))?;
        push_number(output.output_index() as i64, vm)?;
        push_le64(output.amount(), vm)
    }

    opcode OpInspectGroupIntentInCount<0xf5, 1>(self, vm) {
        let packet = vm.packet()?;
        let [k]: [i64; 1] = vm.dstack.pop_items()?;
        let count = packet.group(k)?.intent_inputs().count();
        push_number(count as i64, vm)
    }

    opcode OpInspectGroupIntentIn<0xf6, 1>(self, vm) {
        let packet = vm.packet()?;
        let [k, j]: [i64; 2] = vm.dstack.pop_items()?;
        let group = packet.group(k)?;
        let input = *usize::try_from(j).ok().and_then(|j| group.intent_inputs().nth(j))
            .ok_or_else(|| TxScriptError::AssetIndexOutOfRange(j, group.intent_inputs().count()))?;
        match input {
            crate::asset::AssetInput::Intent { txid, output_index, amount } => {
                vm.dstack.push(txid.to_vec());
                push_number(output_index as i64, vm)?;
                push_le64(amount, vm)
            }
            crate::asset::AssetInput::Local { .. } => unreachable!("intent_inputs only yields intent entries"),
        }
    }

    // Undefined opcodes.
    opcode OpUnknown247<0xf7, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
    opcode OpUnknown248<0xf8, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
    opcode OpUnknown249<0xf9, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
    opcode OpUnknown250<0xfa, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
    opcode OpUnknown251<0xfb, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
    opcode OpUnknown252<0xfc, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
    opcode OpUnknown253<0xfd, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
    opcode OpUnknown254<0xfe, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
    opcode OpInvalidOpCode<0xff, 1>(self, vm) Err(TxScriptError::InvalidOpcode(format!("{self:?}")))
}
