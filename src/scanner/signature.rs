//! Locating and decoding Salsa20 key blocks in raw memory.
//!
//! The client keeps its cipher state as the 16-byte sigma constant followed
//! by twelve 32-bit words. Key and IV words are stored interleaved; the
//! index tables below put them back in cipher order.

use crate::keys::{IV_WORDS, KEY_WORDS};

/// Salsa20 sigma constant that precedes every key block.
pub const SIGNATURE: &[u8; 16] = b"expand 32-byte k";

/// Words following the signature.
pub const BLOCK_WORDS: usize = 12;
/// Bytes following the signature.
pub const BLOCK_LEN: usize = BLOCK_WORDS * 4;

/// The signature always starts on a 16-byte boundary.
const ALIGN: usize = 16;

const KEY_ORDER: [usize; KEY_WORDS] = [9, 6, 3, 0, 11, 8, 5, 2];
const IV_ORDER: [usize; IV_WORDS] = [10, 7];

/// One signature hit with its decoded block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBlock {
    /// Offset of the signature in the scanned buffer.
    pub offset: usize,
    pub key:    [u32; KEY_WORDS],
    pub iv:     [u32; IV_WORDS],
}

impl KeyBlock {
    /// Slots the client has wiped read back with key words 0, 3 and 7 zero.
    pub fn is_zeroed(&self) -> bool {
        self.key[0] == 0 && self.key[3] == 0 && self.key[7] == 0
    }
}

/// Decodes the `BLOCK_LEN` bytes after a signature into key and IV.
/// Returns `None` if `block` is too short.
pub fn decode_block(block: &[u8]) -> Option<([u32; KEY_WORDS], [u32; IV_WORDS])> {
    if block.len() < BLOCK_LEN {
        return None;
    }
    let word = |i: usize| {
        let mut le = [0u8; 4];
        le.copy_from_slice(&block[i * 4..i * 4 + 4]);
        u32::from_le_bytes(le)
    };
    Some((KEY_ORDER.map(word), IV_ORDER.map(word)))
}

/// All key blocks in `buf` whose signature sits on a 16-byte boundary and
/// whose twelve words fit inside `buf`.
pub fn find_key_blocks(buf: &[u8]) -> impl Iterator<Item = KeyBlock> + '_ {
    let last = buf.len().checked_sub(SIGNATURE.len() + BLOCK_LEN);
    (0..=last.unwrap_or(0))
        .step_by(ALIGN)
        .take_while(move |_| last.is_some())
        .filter(move |&off| &buf[off..off + SIGNATURE.len()] == SIGNATURE)
        .filter_map(move |off| {
            let (key, iv) = decode_block(&buf[off + SIGNATURE.len()..])?;
            Some(KeyBlock { offset: off, key, iv })
        })
}

/// Lays out `key` and `iv` the way the client stores them, signature
/// included. Used to build fixtures and synthetic images.
pub fn encode_block(key: &[u32; KEY_WORDS], iv: &[u32; IV_WORDS]) -> Vec<u8> {
    let mut words = [0u32; BLOCK_WORDS];
    for (k, &raw) in KEY_ORDER.iter().enumerate() {
        words[raw] = key[k];
    }
    for (v, &raw) in IV_ORDER.iter().enumerate() {
        words[raw] = iv[v];
    }
    let mut out = Vec::with_capacity(SIGNATURE.len() + BLOCK_LEN);
    out.extend_from_slice(SIGNATURE);
    for w in words {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}
