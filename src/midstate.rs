use crate::TxScriptError;
use sha2::compress256;
use sha2::digest::generic_array::GenericArray;

const SHA256_BLOCK_SIZE: usize = 64;

/// Fixed part of a saved context: 32-byte midstate plus the 8-byte length
/// counter. The partial block tail sits between the two, so a saved context
/// is `40 + (total % 64)` bytes.
const SAVED_FIXED_SIZE: usize = 40;

const SHA256_IV: [u32; 8] =
    [0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19];

/// Resumable SHA-256 state backing the SHA256INITIALIZE/UPDATE/FINALIZE
/// opcodes. The save/load wire format is midstate words (big-endian),
/// the unprocessed tail of the current block, and the total byte count
/// (little-endian).
pub(crate) struct Sha256Ctx {
    state: [u32; 8],
    tail: Vec<u8>,
    total: u64,
}

impl Sha256Ctx {
    pub(crate) fn new() -> Self {
        Self { state: SHA256_IV, tail: vec![], total: 0 }
    }

    pub(crate) fn write(&mut self, data: &[u8]) {
        self.total = self.total.wrapping_add(data.len() as u64);
        if self.tail.len() + data.len() < SHA256_BLOCK_SIZE {
            self.tail.extend_from_slice(data);
            return;
        }

        let mut buf = std::mem::take(&mut self.tail);
        buf.extend_from_slice(data);
        let mut chunks = buf.chunks_exact(SHA256_BLOCK_SIZE);
        for chunk in &mut chunks {
            compress256(&mut self.state, core::slice::from_ref(GenericArray::from_slice(chunk)));
        }
        self.tail = chunks.remainder().to_vec();
    }

    pub(crate) fn save(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SAVED_FIXED_SIZE + self.tail.len());
        for word in self.state {
            out.extend_from_slice(&word.to_be_bytes());
        }
        out.extend_from_slice(&self.tail);
        out.extend_from_slice(&self.total.to_le_bytes());
        out
    }

    pub(crate) fn load(raw: &[u8]) -> Result<Self, TxScriptError> {
        if raw.len() < SAVED_FIXED_SIZE {
            return Err(TxScriptError::InvalidSha256Context(format!("context of {} bytes is too short", raw.len())));
        }
        let total = u64::from_le_bytes(raw[raw.len() - 8..].try_into().expect("sliced 8 bytes"));
        let tail = &raw[32..raw.len() - 8];
        if tail.len() as u64 != total % SHA256_BLOCK_SIZE as u64 {
            return Err(TxScriptError::InvalidSha256Context(format!(
                "length counter {} does not match a {}-byte tail",
                total,
                tail.len()
            )));
        }
        let mut state = [0u32; 8];
        for (word, bytes) in state.iter_mut().zip(raw[..32].chunks_exact(4)) {
            *word = u32::from_be_bytes(bytes.try_into().expect("chunked 4 bytes"));
        }
        Ok(Self { state, tail: tail.to_vec(), total })
    }

    pub(crate) fn finalize(mut self) -> [u8; 32] {
        let bit_len = self.total.wrapping_mul(8);
        let mut padding = vec![0x80u8];
        while (self.tail.len() + padding.len()) % SHA256_BLOCK_SIZE != SHA256_BLOCK_SIZE - 8 {
            padding.push(0x00);
        }
        padding.extend_from_slice(&bit_len.to_be_bytes());

        // Padding never changes the recorded message length.
        let total = self.total;
        self.write(&padding);
        self.total = total;
        debug_assert!(self.tail.is_empty());

        let mut out = [0u8; 32];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.state) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn streaming_digest(parts: &[&[u8]]) -> [u8; 32] {
        let mut ctx = Sha256Ctx::new();
        ctx.write(parts[0]);
        for part in &parts[1..parts.len() - 1] {
            let saved = ctx.save();
            ctx = Sha256Ctx::load(&saved).unwrap();
            ctx.write(part);
        }
        let saved = ctx.save();
        let mut ctx = Sha256Ctx::load(&saved).unwrap();
        ctx.write(parts[parts.len() - 1]);
        ctx.finalize()
    }

    #[test]
    fn test_matches_one_shot_sha256() {
        let message = b"The quick brown fox jumps over the lazy dog";
        let expected: [u8; 32] = Sha256::digest(message).into();

        // Every split point of the message must produce the same digest.
        for i in 0..message.len() {
            for j in i..message.len() {
                let digest = streaming_digest(&[&message[..i], &message[i..j], &message[j..]]);
                assert_eq!(digest, expected, "split at ({i}, {j}) diverged");
            }
        }
    }

    #[test]
    fn test_long_input_crosses_blocks() {
        let message = vec![0x5au8; 520];
        let expected: [u8; 32] = Sha256::digest(&message).into();
        assert_eq!(streaming_digest(&[&message[..100], &message[100..400], &message[400..]]), expected);
    }

    #[test]
    fn test_saved_context_size() {
        let mut ctx = Sha256Ctx::new();
        ctx.write(&[0xaa; 64]);
        assert_eq!(ctx.save().len(), SAVED_FIXED_SIZE); // block boundary, no tail
        ctx.write(&[0xbb; 5]);
        assert_eq!(ctx.save().len(), SAVED_FIXED_SIZE + 5);
    }

    #[test]
    fn test_load_rejects_malformed_contexts() {
        assert!(Sha256Ctx::load(&[0u8; 39]).is_err());

        // Tail length inconsistent with the recorded total.
        let mut ctx = Sha256Ctx::new();
        ctx.write(b"hello");
        let mut saved = ctx.save();
        saved.insert(32, 0xff);
        assert!(Sha256Ctx::load(&saved).is_err());
    }
}
