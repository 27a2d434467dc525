//! Recovered Salsa20 key material.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of 32-bit words in a Salsa20 key.
pub const KEY_WORDS: usize = 8;
/// Number of 32-bit words in a Salsa20 nonce/IV.
pub const IV_WORDS: usize = 2;

/// Where a piece of key material came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyOrigin {
    /// Found by scanning client memory at this address.
    Memory { address: usize },
    /// Observed in packet content rather than memory.
    Traffic,
}

/// Which half of a network stream a key is tested against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Receive,
    Send,
}

/// Cipher state recovered from a client. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    key:        [u32; KEY_WORDS],
    iv:         [u32; IV_WORDS],
    origin:     KeyOrigin,
    source_pid: u32,
    found_at:   DateTime<Utc>,
}

impl KeyMaterial {
    pub fn new(key: [u32; KEY_WORDS], iv: [u32; IV_WORDS], origin: KeyOrigin, source_pid: u32) -> Self {
        Self { key, iv, origin, source_pid, found_at: Utc::now() }
    }

    /// Material found in client memory at `address`.
    pub fn from_memory(key: [u32; KEY_WORDS], iv: [u32; IV_WORDS], address: usize, source_pid: u32) -> Self {
        Self::new(key, iv, KeyOrigin::Memory { address }, source_pid)
    }

    pub fn key(&self) -> &[u32; KEY_WORDS] {
        &self.key
    }

    pub fn iv(&self) -> &[u32; IV_WORDS] {
        &self.iv
    }

    pub fn origin(&self) -> KeyOrigin {
        self.origin
    }

    /// Address the material was scanned from; `None` for traffic-sourced keys.
    pub fn found_address(&self) -> Option<usize> {
        match self.origin {
            KeyOrigin::Memory { address } => Some(address),
            KeyOrigin::Traffic => None,
        }
    }

    pub fn source_pid(&self) -> u32 {
        self.source_pid
    }

    pub fn found_at(&self) -> DateTime<Utc> {
        self.found_at
    }

    pub fn is_from_traffic(&self) -> bool {
        self.origin == KeyOrigin::Traffic
    }

    /// Key as the 32 little-endian bytes the cipher consumes.
    pub fn key_bytes(&self) -> [u8; KEY_WORDS * 4] {
        words_to_bytes(&self.key)
    }

    /// IV as 8 little-endian bytes.
    pub fn iv_bytes(&self) -> [u8; IV_WORDS * 4] {
        words_to_bytes(&self.iv)
    }

    /// Same discovery: same origin and identical IV.
    pub fn same_discovery(&self, other: &KeyMaterial) -> bool {
        self.origin == other.origin && self.iv == other.iv
    }

    pub(crate) fn into_traffic(mut self) -> Self {
        self.origin = KeyOrigin::Traffic;
        self
    }
}

impl std::fmt::Display for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KEY: {} IV: {}", hex::encode(self.key_bytes()), hex::encode(self.iv_bytes()))
    }
}

fn words_to_bytes<const W: usize, const B: usize>(words: &[u32; W]) -> [u8; B] {
    let mut out = [0u8; B];
    for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    out
}
