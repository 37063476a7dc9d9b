use crate::TxScriptError;
use core::fmt::Debug;
use core::mem::size_of;

/// Script numbers popped by ordinary opcodes may span at most this many
/// bytes.
const DEFAULT_SCRIPT_NUM_LEN: usize = 4;

pub(crate) type Stack = Vec<Vec<u8>>;

/// A value that can cross between the byte stack and an opcode.
///
/// Two numeric wire formats coexist on the stack and both are first-class
/// here: minimally-encoded little-endian sign-magnitude script numbers of
/// bounded width (`i64`, `i32`, [`SizedEncodeInt`]), and the exact 8-byte
/// little-endian two's-complement operands of the 64-bit opcode family
/// ([`Le64`]). Booleans are a view over raw bytes where any set bit other
/// than a lone sign bit counts as true.
pub(crate) trait StackEncoding: Sized {
    fn decode(bytes: &[u8]) -> Result<Self, TxScriptError>;
    fn encode(&self) -> Vec<u8>;
}

/// Script number with a caller-chosen width bound. The lock-time opcodes
/// accept 5-byte operands.
#[derive(PartialEq, Eq, Debug, Default)]
pub(crate) struct SizedEncodeInt<const LEN: usize>(pub(crate) i64);

/// Fixed 8-byte little-endian two's-complement integer. Unlike script
/// numbers this encoding is never minimized: anything but exactly 8 bytes
/// is rejected.
#[derive(PartialEq, Eq, Debug, Default, Clone, Copy)]
pub(crate) struct Le64(pub(crate) i64);

fn check_minimal_encoding(bytes: &[u8]) -> Result<(), TxScriptError> {
    let Some((&msb, rest)) = bytes.split_last() else {
        return Ok(());
    };
    // A most significant byte carrying nothing but the sign bit is only
    // allowed when the byte below already occupies its high bit (e.g. the
    // magnitude 255); a lone [0x80] is the rejected negative zero.
    if msb & 0x7f == 0 && rest.last().map_or(true, |&below| below & 0x80 == 0) {
        return Err(TxScriptError::NotMinimalData(format!("numeric value encoded as {bytes:x?} is not minimally encoded")));
    }
    Ok(())
}

fn decode_script_num(bytes: &[u8], max_len: usize) -> Result<i64, TxScriptError> {
    if bytes.len() > max_len {
        return Err(TxScriptError::NumberTooBig(format!(
            "numeric value encoded as {bytes:x?} is {} bytes which exceeds the max allowed of {max_len}",
            bytes.len()
        )));
    }
    if bytes.len() > size_of::<i64>() {
        return Err(TxScriptError::NotMinimalData(format!("numeric value encoded as {bytes:x?} is longer than 8 bytes")));
    }
    check_minimal_encoding(bytes)?;

    let Some((&msb, rest)) = bytes.split_last() else {
        return Ok(0);
    };
    let mut magnitude = (msb & 0x7f) as i64;
    for &byte in rest.iter().rev() {
        magnitude = (magnitude << 8) | byte as i64;
    }
    Ok(if msb & 0x80 != 0 { -magnitude } else { magnitude })
}

fn encode_script_num(value: i64) -> Vec<u8> {
    if value == 0 {
        return vec![];
    }
    let mut magnitude = value.unsigned_abs();
    let mut bytes = vec![];
    while magnitude > 0 {
        bytes.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }
    // The top bit of the final byte is the sign; spill into an extra byte
    // when the magnitude already occupies it.
    if bytes.last().expect("value is non-zero") & 0x80 != 0 {
        bytes.push(0);
    }
    if value < 0 {
        *bytes.last_mut().expect("value is non-zero") |= 0x80;
    }
    bytes
}

impl StackEncoding for i64 {
    #[inline]
    fn decode(bytes: &[u8]) -> Result<Self, TxScriptError> {
        decode_script_num(bytes, DEFAULT_SCRIPT_NUM_LEN)
    }

    #[inline]
    fn encode(&self) -> Vec<u8> {
        encode_script_num(*self)
    }
}

impl StackEncoding for i32 {
    #[inline]
    fn decode(bytes: &[u8]) -> Result<Self, TxScriptError> {
        let value = i64::decode(bytes)?;
        i32::try_from(value.clamp(i32::MIN as i64, i32::MAX as i64))
            .map_err(|e| TxScriptError::InvalidState(format!("data is too big for `i32`: {e}")))
    }

    #[inline]
    fn encode(&self) -> Vec<u8> {
        encode_script_num(*self as i64)
    }
}

impl<const LEN: usize> StackEncoding for SizedEncodeInt<LEN> {
    #[inline]
    fn decode(bytes: &[u8]) -> Result<Self, TxScriptError> {
        decode_script_num(bytes, LEN).map(SizedEncodeInt::<LEN>)
    }

    #[inline]
    fn encode(&self) -> Vec<u8> {
        encode_script_num(self.0)
    }
}

impl StackEncoding for Le64 {
    #[inline]
    fn decode(bytes: &[u8]) -> Result<Self, TxScriptError> {
        let bytes: [u8; 8] = bytes.try_into().map_err(|_| TxScriptError::ExpectedLe64(bytes.len()))?;
        Ok(Le64(i64::from_le_bytes(bytes)))
    }

    #[inline]
    fn encode(&self) -> Vec<u8> {
        self.0.to_le_bytes().to_vec()
    }
}

impl StackEncoding for bool {
    #[inline]
    fn decode(bytes: &[u8]) -> Result<Self, TxScriptError> {
        match bytes.split_last() {
            None => Ok(false),
            // The final byte may only carry the sign bit of a negative
            // zero; any other set bit makes the value true.
            Some((&last, rest)) => Ok(last & 0x7f != 0 || rest.iter().any(|&byte| byte != 0)),
        }
    }

    #[inline]
    fn encode(&self) -> Vec<u8> {
        match self {
            true => vec![1],
            false => vec![],
        }
    }
}

pub(crate) trait DataStack {
    fn pop_items<const SIZE: usize, T: Debug + StackEncoding>(&mut self) -> Result<[T; SIZE], TxScriptError>;
    fn pop_raw<const SIZE: usize>(&mut self) -> Result<[Vec<u8>; SIZE], TxScriptError>;
    fn peek_raw<const SIZE: usize>(&self) -> Result<[Vec<u8>; SIZE], TxScriptError>;
    fn push_item<T: Debug + StackEncoding>(&mut self, item: T);
    fn drop_items<const SIZE: usize>(&mut self) -> Result<(), TxScriptError>;
    fn dup_items<const SIZE: usize>(&mut self) -> Result<(), TxScriptError>;
    fn over_items<const SIZE: usize>(&mut self) -> Result<(), TxScriptError>;
    fn rot_items<const SIZE: usize>(&mut self) -> Result<(), TxScriptError>;
    fn swap_items<const SIZE: usize>(&mut self) -> Result<(), TxScriptError>;
}

impl DataStack for Stack {
    #[inline]
    fn pop_items<const SIZE: usize, T: Debug + StackEncoding>(&mut self) -> Result<[T; SIZE], TxScriptError> {
        if self.len() < SIZE {
            return Err(TxScriptError::InvalidStackOperation(SIZE, self.len()));
        }
        let raw = self.split_off(self.len() - SIZE);
        let items = raw.iter().map(|bytes| T::decode(bytes)).collect::<Result<Vec<T>, TxScriptError>>()?;
        Ok(<[T; SIZE]>::try_from(items).expect("exactly SIZE items were split off"))
    }

    #[inline]
    fn pop_raw<const SIZE: usize>(&mut self) -> Result<[Vec<u8>; SIZE], TxScriptError> {
        if self.len() < SIZE {
            return Err(TxScriptError::InvalidStackOperation(SIZE, self.len()));
        }
        Ok(<[Vec<u8>; SIZE]>::try_from(self.split_off(self.len() - SIZE)).expect("exactly SIZE items were split off"))
    }

    #[inline]
    fn peek_raw<const SIZE: usize>(&self) -> Result<[Vec<u8>; SIZE], TxScriptError> {
        if self.len() < SIZE {
            return Err(TxScriptError::InvalidStackOperation(SIZE, self.len()));
        }
        Ok(<[Vec<u8>; SIZE]>::try_from(self[self.len() - SIZE..].to_vec()).expect("exactly SIZE items were sliced"))
    }

    #[inline]
    fn push_item<T: Debug + StackEncoding>(&mut self, item: T) {
        self.push(item.encode());
    }

    #[inline]
    fn drop_items<const SIZE: usize>(&mut self) -> Result<(), TxScriptError> {
        if self.len() < SIZE {
            return Err(TxScriptError::InvalidStackOperation(SIZE, self.len()));
        }
        self.truncate(self.len() - SIZE);
        Ok(())
    }

    #[inline]
    fn dup_items<const SIZE: usize>(&mut self) -> Result<(), TxScriptError> {
        if self.len() < SIZE {
            return Err(TxScriptError::InvalidStackOperation(SIZE, self.len()));
        }
        self.extend_from_within(self.len() - SIZE..);
        Ok(())
    }

    #[inline]
    fn over_items<const SIZE: usize>(&mut self) -> Result<(), TxScriptError> {
        if self.len() < 2 * SIZE {
            return Err(TxScriptError::InvalidStackOperation(2 * SIZE, self.len()));
        }
        self.extend_from_within(self.len() - 2 * SIZE..self.len() - SIZE);
        Ok(())
    }

    #[inline]
    fn rot_items<const SIZE: usize>(&mut self) -> Result<(), TxScriptError> {
        if self.len() < 3 * SIZE {
            return Err(TxScriptError::InvalidStackOperation(3 * SIZE, self.len()));
        }
        let at = self.len() - 3 * SIZE;
        self[at..].rotate_left(SIZE);
        Ok(())
    }

    #[inline]
    fn swap_items<const SIZE: usize>(&mut self) -> Result<(), TxScriptError> {
        if self.len() < 2 * SIZE {
            return Err(TxScriptError::InvalidStackOperation(2 * SIZE, self.len()));
        }
        let at = self.len() - 2 * SIZE;
        self[at..].rotate_left(SIZE);
        Ok(())
    }
}
